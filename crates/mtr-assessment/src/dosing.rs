//! 剂量检查
//!
//! 从用法中的剂量文本解析出数值剂量（mg），与知识库阈值比较。
//! 无法解析的剂量（如 "as directed"、"1 tablet"）直接跳过，不视为错误。

use crate::knowledge::KnowledgeBase;
use mtr_core::{
    DrugTherapyProblem, EvidenceLevel, MedicationEntry, ProblemCategory, ProblemType, Severity,
};
use regex::Regex;
use std::sync::LazyLock;

static DOSE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)^\s*(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)\s*([^\s\d/]*)(?:/[[:alpha:]]\S*)?(?:\s.*)?$",
    )
    .expect("dose pattern is valid")
});

/// 解析剂量文本为毫克数
///
/// 无单位时按 mg 处理；支持 mg、mcg/µg/μg/ug、g，允许千位逗号。
/// 范围（"10-20 mg"）、分数（"1/2 tablet"）和其他单位（片、单位、喷）返回 None。
pub fn parse_dose_mg(dose: &str) -> Option<f64> {
    let captures = DOSE_PATTERN.captures(dose)?;
    let value: f64 = captures.get(1)?.as_str().replace(',', "").parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    let unit = captures
        .get(2)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();

    match unit.as_str() {
        "" | "mg" => Some(value),
        "mcg" | "µg" | "μg" | "ug" => Some(value / 1000.0),
        "g" => Some(value * 1000.0),
        _ => None,
    }
}

/// 剂量过高 / 过低检查
pub fn check_dosing(kb: &KnowledgeBase, medications: &[MedicationEntry]) -> Vec<DrugTherapyProblem> {
    let mut problems = Vec::new();

    for medication in medications {
        let Some(limit) = kb.dose_limit_for(medication) else {
            continue;
        };
        let Some(dose_mg) = parse_dose_mg(&medication.instructions.dose) else {
            tracing::debug!(
                "Skipping dose check for {}: non-numeric dose '{}'",
                medication.drug_name,
                medication.instructions.dose
            );
            continue;
        };

        if dose_mg > limit.high_mg {
            problems.push(DrugTherapyProblem::automated(
                ProblemCategory::Safety,
                ProblemType::DoseTooHigh,
                Severity::Major,
                EvidenceLevel::Probable,
                format!(
                    "{} dose of {} mg exceeds the usual maximum of {} mg",
                    medication.drug_name, dose_mg, limit.high_mg
                ),
                "Increased risk of dose-related adverse effects",
                vec![medication.drug_name.clone()],
            ));
        } else if dose_mg < limit.low_mg {
            problems.push(DrugTherapyProblem::automated(
                ProblemCategory::Effectiveness,
                ProblemType::DoseTooLow,
                Severity::Moderate,
                EvidenceLevel::Possible,
                format!(
                    "{} dose of {} mg is below the usual minimum of {} mg",
                    medication.drug_name, dose_mg, limit.low_mg
                ),
                "Therapy may not achieve its intended effect",
                vec![medication.drug_name.clone()],
            ));
        }
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dose_units() {
        assert_eq!(parse_dose_mg("80"), Some(80.0));
        assert_eq!(parse_dose_mg(" 2.5 mg"), Some(2.5));
        assert_eq!(parse_dose_mg("500mcg"), Some(0.5));
        assert_eq!(parse_dose_mg("1 g twice daily"), Some(1000.0));
        assert_eq!(parse_dose_mg("1,000 mg"), Some(1000.0));
        assert_eq!(parse_dose_mg("5 μg"), Some(0.005));
        assert_eq!(parse_dose_mg("5 µg"), Some(0.005));
        assert_eq!(parse_dose_mg("10mg/day"), Some(10.0));
        assert_eq!(parse_dose_mg("1/2 tablet"), None);
        assert_eq!(parse_dose_mg("10-20 mg"), None);
        assert_eq!(parse_dose_mg("1,5 mg"), None);
        assert_eq!(parse_dose_mg("1 tablet"), None);
        assert_eq!(parse_dose_mg("10 units"), None);
        assert_eq!(parse_dose_mg("as directed"), None);
        assert_eq!(parse_dose_mg(""), None);
    }

    #[test]
    fn test_lisinopril_high_dose() {
        let kb = KnowledgeBase::standard();
        let problems = check_dosing(&kb, &[MedicationEntry::prescribed("Lisinopril", "80")]);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].problem_type, ProblemType::DoseTooHigh);
        assert_eq!(problems[0].severity, Severity::Major);
        assert_eq!(problems[0].evidence_level, EvidenceLevel::Probable);
    }

    #[test]
    fn test_lisinopril_low_dose() {
        let kb = KnowledgeBase::standard();
        let problems = check_dosing(&kb, &[MedicationEntry::prescribed("Lisinopril", "2")]);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].problem_type, ProblemType::DoseTooLow);
        assert_eq!(problems[0].severity, Severity::Moderate);
        assert_eq!(problems[0].evidence_level, EvidenceLevel::Possible);
    }

    #[test]
    fn test_in_range_and_unparseable_doses_are_silent() {
        let kb = KnowledgeBase::standard();
        let meds = vec![
            MedicationEntry::prescribed("Lisinopril", "20"),
            MedicationEntry::prescribed("Lisinopril", "1 tablet"),
            MedicationEntry::prescribed("Lisinopril", "as directed"),
            MedicationEntry::prescribed("Lisinopril", "1/2 tablet"),
            MedicationEntry::prescribed("Lisinopril", "10-20 mg"),
            MedicationEntry::prescribed("Metformin", "1,000 mg"),
            MedicationEntry::prescribed("Unlisted drug", "9999"),
        ];
        assert!(check_dosing(&kb, &meds).is_empty());
    }

    #[test]
    fn test_threshold_boundaries_are_inclusive() {
        let kb = KnowledgeBase::standard();
        let meds = vec![
            MedicationEntry::prescribed("Lisinopril", "40"),
            MedicationEntry::prescribed("Lisinopril", "2.5"),
        ];
        assert!(check_dosing(&kb, &meds).is_empty());
    }
}
