//! 相互作用、重复用药、禁忌症与依从性检查
//!
//! 每个检查都是纯函数：输入相同，输出的问题集合（忽略 id）相同。

use crate::knowledge::{KnowledgeBase, OTHER_CLASS};
use mtr_core::utils::terms_overlap;
use mtr_core::{
    DrugTherapyProblem, EvidenceLevel, MedicationEntry, PatientContext, ProblemCategory,
    ProblemType, Severity,
};
use std::collections::BTreeMap;

/// 未记录依从性评分时的默认值
pub const DEFAULT_ADHERENCE_SCORE: u8 = 8;
/// 低于该分数视为依从性问题
pub const ADHERENCE_CONCERN_THRESHOLD: u8 = 7;
/// 低于该分数视为严重依从性问题
pub const ADHERENCE_MAJOR_THRESHOLD: u8 = 4;

/// 两两比对所有药物，命中相互作用表即报告
pub fn check_interactions(
    kb: &KnowledgeBase,
    medications: &[MedicationEntry],
) -> Vec<DrugTherapyProblem> {
    let mut problems = Vec::new();

    for (i, first) in medications.iter().enumerate() {
        for second in &medications[i + 1..] {
            if let Some(rule) = kb.find_interaction(first, second) {
                problems.push(DrugTherapyProblem::automated(
                    ProblemCategory::Safety,
                    ProblemType::Interaction,
                    Severity::Moderate,
                    EvidenceLevel::Probable,
                    format!(
                        "Potential interaction between {} and {}: {}",
                        first.drug_name, second.drug_name, rule.description
                    ),
                    rule.clinical_significance,
                    vec![first.drug_name.clone(), second.drug_name.clone()],
                ));
            }
        }
    }

    problems
}

/// 同一治疗类别出现两种及以上药物时，每个类别报告一次
pub fn check_duplications(
    kb: &KnowledgeBase,
    medications: &[MedicationEntry],
) -> Vec<DrugTherapyProblem> {
    let mut by_class: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for medication in medications {
        by_class
            .entry(kb.therapeutic_class(medication))
            .or_default()
            .push(medication.drug_name.clone());
    }

    by_class
        .into_iter()
        .filter(|(class, members)| *class != OTHER_CLASS && members.len() >= 2)
        .map(|(class, members)| {
            DrugTherapyProblem::automated(
                ProblemCategory::Indication,
                ProblemType::Duplication,
                Severity::Minor,
                EvidenceLevel::Definite,
                format!(
                    "Therapeutic duplication in class {}: {}",
                    class,
                    members.join(", ")
                ),
                "Multiple agents from the same therapeutic class may be unnecessary",
                members,
            )
        })
        .collect()
}

/// 过敏与疾病禁忌检查
pub fn check_contraindications(
    kb: &KnowledgeBase,
    medications: &[MedicationEntry],
    patient: &PatientContext,
) -> Vec<DrugTherapyProblem> {
    let mut problems = Vec::new();

    for medication in medications {
        let allergies: Vec<String> = patient
            .allergies
            .iter()
            .filter(|allergy| kb.allergy_matches(allergy, medication))
            .cloned()
            .collect();

        if !allergies.is_empty() {
            problems.push(
                DrugTherapyProblem::automated(
                    ProblemCategory::Safety,
                    ProblemType::Contraindication,
                    Severity::Critical,
                    EvidenceLevel::Definite,
                    format!(
                        "{} conflicts with documented allergy: {}",
                        medication.drug_name,
                        allergies.join(", ")
                    ),
                    "Risk of allergic reaction including anaphylaxis",
                    vec![medication.drug_name.clone()],
                )
                .with_risk_factors(allergies),
            );
        }

        if let Some(rule) = kb.contraindication_for(medication) {
            let conditions: Vec<String> = patient
                .conditions
                .iter()
                .filter(|condition| {
                    rule.conditions
                        .iter()
                        .any(|listed| terms_overlap(condition, listed))
                })
                .cloned()
                .collect();

            if !conditions.is_empty() {
                problems.push(
                    DrugTherapyProblem::automated(
                        ProblemCategory::Safety,
                        ProblemType::Contraindication,
                        Severity::Major,
                        EvidenceLevel::Probable,
                        format!(
                            "{} is contraindicated with {}",
                            medication.drug_name,
                            conditions.join(", ")
                        ),
                        rule.rationale,
                        vec![medication.drug_name.clone()],
                    )
                    .with_risk_factors(conditions),
                );
            }
        }
    }

    problems
}

/// 依从性检查：评分低于 7 报告，低于 4 为严重
pub fn check_adherence(medications: &[MedicationEntry]) -> Vec<DrugTherapyProblem> {
    medications
        .iter()
        .filter_map(|medication| {
            let score = medication
                .adherence_score
                .unwrap_or(DEFAULT_ADHERENCE_SCORE);
            if score >= ADHERENCE_CONCERN_THRESHOLD {
                return None;
            }

            let severity = if score < ADHERENCE_MAJOR_THRESHOLD {
                Severity::Major
            } else {
                Severity::Moderate
            };

            Some(
                DrugTherapyProblem::automated(
                    ProblemCategory::Adherence,
                    ProblemType::Nonadherence,
                    severity,
                    EvidenceLevel::Probable,
                    format!(
                        "Poor adherence to {} (score {}/10)",
                        medication.drug_name, score
                    ),
                    "Non-adherence may lead to therapeutic failure",
                    vec![medication.drug_name.clone()],
                )
                .with_risk_factors(medication.adherence_barriers.clone()),
            )
        })
        .collect()
}
