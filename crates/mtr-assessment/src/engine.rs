//! 规则评估引擎
//!
//! 汇总四项检查（相互作用、重复用药、禁忌症、剂量）并按检查类别分组输出。
//! 依从性检查单独触发。

use crate::checks::{check_adherence, check_contraindications, check_duplications, check_interactions};
use crate::dosing::check_dosing;
use crate::knowledge::KnowledgeBase;
use chrono::{DateTime, Utc};
use mtr_core::{
    DrugTherapyProblem, MedicationEntry, MtrError, PatientContext, ProblemType, Result,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 四项常规检查可能产生的问题类型
pub const ASSESSMENT_SCOPE: &[ProblemType] = &[
    ProblemType::Interaction,
    ProblemType::Duplication,
    ProblemType::Contraindication,
    ProblemType::DoseTooHigh,
    ProblemType::DoseTooLow,
];

/// 依从性检查可能产生的问题类型
pub const ADHERENCE_SCOPE: &[ProblemType] = &[ProblemType::Nonadherence];

/// 引擎输入；`medications` 缺失视为调用错误
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssessmentRequest {
    #[serde(default)]
    pub medications: Option<Vec<MedicationEntry>>,
    #[serde(default)]
    pub patient: PatientContext,
}

/// 因形状异常被跳过的条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEntry {
    pub index: usize,
    pub drug_name: String,
    pub reason: String,
}

/// 评估结果，按检查类别分组
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentReport {
    pub run_id: Uuid,
    pub assessed_at: DateTime<Utc>,
    pub interactions: Vec<DrugTherapyProblem>,
    pub duplications: Vec<DrugTherapyProblem>,
    pub contraindications: Vec<DrugTherapyProblem>,
    pub dosing: Vec<DrugTherapyProblem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adherence: Vec<DrugTherapyProblem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedEntry>,
}

impl AssessmentReport {
    pub fn total(&self) -> usize {
        self.interactions.len()
            + self.duplications.len()
            + self.contraindications.len()
            + self.dosing.len()
            + self.adherence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn problems(&self) -> impl Iterator<Item = &DrugTherapyProblem> {
        self.interactions
            .iter()
            .chain(&self.duplications)
            .chain(&self.contraindications)
            .chain(&self.dosing)
            .chain(&self.adherence)
    }

    pub fn into_problems(self) -> Vec<DrugTherapyProblem> {
        let mut problems = self.interactions;
        problems.extend(self.duplications);
        problems.extend(self.contraindications);
        problems.extend(self.dosing);
        problems.extend(self.adherence);
        problems
    }
}

/// 规则评估引擎
#[derive(Debug, Clone, Default)]
pub struct AssessmentEngine {
    knowledge: KnowledgeBase,
}

impl AssessmentEngine {
    /// 使用内置知识库创建引擎
    pub fn new() -> Self {
        Self {
            knowledge: KnowledgeBase::standard(),
        }
    }

    pub fn with_knowledge(knowledge: KnowledgeBase) -> Self {
        Self { knowledge }
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    /// 运行四项常规检查
    pub fn assess(&self, medications: &[MedicationEntry], patient: &PatientContext) -> AssessmentReport {
        let (usable, skipped) = Self::usable_entries(medications);

        let report = AssessmentReport {
            run_id: Uuid::new_v4(),
            assessed_at: Utc::now(),
            interactions: check_interactions(&self.knowledge, &usable),
            duplications: check_duplications(&self.knowledge, &usable),
            contraindications: check_contraindications(&self.knowledge, &usable, patient),
            dosing: check_dosing(&self.knowledge, &usable),
            adherence: Vec::new(),
            skipped,
        };

        tracing::info!(
            "Assessment {} found {} problems across {} medications ({} skipped)",
            report.run_id,
            report.total(),
            usable.len(),
            report.skipped.len()
        );
        report
    }

    /// 按请求运行检查，可选附带依从性检查
    pub fn assess_request(&self, request: &AssessmentRequest, include_adherence: bool) -> Result<AssessmentReport> {
        let medications = request.medications.as_deref().ok_or_else(|| {
            MtrError::RuleEngine("medication list is required for assessment".to_string())
        })?;

        let mut report = self.assess(medications, &request.patient);
        if include_adherence {
            report.adherence = self.assess_adherence(medications);
        }
        Ok(report)
    }

    /// 依从性检查
    pub fn assess_adherence(&self, medications: &[MedicationEntry]) -> Vec<DrugTherapyProblem> {
        let (usable, _) = Self::usable_entries(medications);
        let problems = check_adherence(&usable);
        tracing::info!("Adherence check found {} problems", problems.len());
        problems
    }

    /// 过滤掉形状异常的条目，异常条目只影响自身
    fn usable_entries(medications: &[MedicationEntry]) -> (Vec<MedicationEntry>, Vec<SkippedEntry>) {
        let mut usable = Vec::with_capacity(medications.len());
        let mut skipped = Vec::new();

        for (index, medication) in medications.iter().enumerate() {
            match medication.validate() {
                Ok(()) => usable.push(medication.clone()),
                Err(e) => {
                    let err = MtrError::RuleEngine(format!("entry {} skipped: {}", index, e));
                    tracing::warn!("{}", err);
                    skipped.push(SkippedEntry {
                        index,
                        drug_name: medication.drug_name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        (usable, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_core::{ProblemFingerprint, Severity};

    fn signature(report: &AssessmentReport) -> Vec<(ProblemFingerprint, Severity)> {
        let mut sig: Vec<_> = report
            .problems()
            .map(|p| (p.fingerprint(), p.severity))
            .collect();
        sig.sort();
        sig
    }

    fn sample_medications() -> Vec<MedicationEntry> {
        vec![
            MedicationEntry::prescribed("Warfarin", "5"),
            MedicationEntry::prescribed("Aspirin", "81"),
            MedicationEntry::prescribed("Metformin 500mg", "500"),
            MedicationEntry::prescribed("Insulin 10 units", "10 units"),
            MedicationEntry::prescribed("Lisinopril", "80"),
            MedicationEntry::prescribed("Amoxicillin 500mg", "500"),
        ]
    }

    fn sample_patient() -> PatientContext {
        PatientContext {
            allergies: vec!["Penicillin".into()],
            conditions: vec!["renal impairment".into()],
        }
    }

    #[test]
    fn test_runs_are_deterministic_up_to_id() {
        let engine = AssessmentEngine::new();
        let first = engine.assess(&sample_medications(), &sample_patient());
        let second = engine.assess(&sample_medications(), &sample_patient());

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(signature(&first), signature(&second));
    }

    #[test]
    fn test_report_groups_by_check() {
        let engine = AssessmentEngine::new();
        let report = engine.assess(&sample_medications(), &sample_patient());

        assert_eq!(report.interactions.len(), 1);
        assert_eq!(report.duplications.len(), 1);
        // amoxicillin allergy + metformin with renal impairment
        assert_eq!(report.contraindications.len(), 2);
        assert_eq!(report.dosing.len(), 1);
        assert_eq!(report.total(), 5);
        assert!(report.adherence.is_empty());
    }

    #[test]
    fn test_malformed_entry_is_skipped_not_fatal() {
        let engine = AssessmentEngine::new();
        let mut medications = sample_medications();
        medications.insert(1, MedicationEntry::prescribed("", "10"));

        let report = engine.assess(&medications, &sample_patient());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].index, 1);
        assert_eq!(report.total(), 5);
    }

    #[test]
    fn test_missing_medication_list_is_an_error() {
        let engine = AssessmentEngine::new();
        let result = engine.assess_request(&AssessmentRequest::default(), false);
        assert!(matches!(result, Err(MtrError::RuleEngine(_))));
    }

    #[test]
    fn test_request_from_json() {
        let json = r#"{
            "medications": [
                {
                    "drugName": "Lisinopril",
                    "strength": {"value": 10.0, "unit": "mg"},
                    "dosageForm": "tablet",
                    "instructions": {"dose": "2", "frequency": "once daily", "route": "oral"},
                    "category": "prescribed",
                    "startDate": "2024-01-15",
                    "adherenceScore": 5
                }
            ],
            "patient": {"allergies": [], "conditions": []}
        }"#;
        let request: AssessmentRequest = serde_json::from_str(json).unwrap();
        let report = AssessmentEngine::new().assess_request(&request, true).unwrap();

        assert_eq!(report.dosing.len(), 1);
        assert_eq!(report.dosing[0].problem_type, ProblemType::DoseTooLow);
        assert_eq!(report.adherence.len(), 1);
        assert_eq!(report.adherence[0].severity, Severity::Moderate);
    }
}
