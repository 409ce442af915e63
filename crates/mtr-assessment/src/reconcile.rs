//! 重复评估的结果对账
//!
//! 引擎每次运行都会生成新的问题 id。对账按指纹把新结果与已有的未处理问题配对，
//! 调用方只追加真正的新问题。

use mtr_core::{DrugTherapyProblem, ProblemFingerprint, ProblemSource, ProblemType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

/// 对账后的单条结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciledProblem {
    /// 首次发现
    New(DrugTherapyProblem),
    /// 已存在同指纹的未处理问题
    AlreadyOpen {
        id: Uuid,
        fingerprint: ProblemFingerprint,
    },
    /// 此前自动识别、本次未再检出
    NoLongerDetected {
        id: Uuid,
        fingerprint: ProblemFingerprint,
    },
}

/// 对账结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reconciliation {
    pub entries: Vec<ReconciledProblem>,
}

impl Reconciliation {
    pub fn new_problems(&self) -> impl Iterator<Item = &DrugTherapyProblem> {
        self.entries.iter().filter_map(|entry| match entry {
            ReconciledProblem::New(problem) => Some(problem),
            _ => None,
        })
    }

    pub fn into_new_problems(self) -> Vec<DrugTherapyProblem> {
        self.entries
            .into_iter()
            .filter_map(|entry| match entry {
                ReconciledProblem::New(problem) => Some(problem),
                _ => None,
            })
            .collect()
    }

    pub fn new_count(&self) -> usize {
        self.new_problems().count()
    }

    pub fn already_open_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ReconciledProblem::AlreadyOpen { .. }))
            .count()
    }

    pub fn no_longer_detected(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                ReconciledProblem::NoLongerDetected { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// 将本次检出结果与已有问题对账
///
/// 指纹相同的问题按多重集合配对，因此同一药物同时命中过敏与疾病禁忌时两条都能保留。
/// `scope` 限定本次检查覆盖的问题类型，范围外的已有问题不会被标记为未再检出。
pub fn reconcile(
    existing: &[DrugTherapyProblem],
    fresh: Vec<DrugTherapyProblem>,
    scope: &[ProblemType],
) -> Reconciliation {
    let mut open: BTreeMap<ProblemFingerprint, VecDeque<&DrugTherapyProblem>> = BTreeMap::new();
    for problem in existing.iter().filter(|p| p.is_open()) {
        open.entry(problem.fingerprint()).or_default().push_back(problem);
    }

    let mut entries = Vec::with_capacity(fresh.len());
    for problem in fresh {
        let fingerprint = problem.fingerprint();
        match open.get_mut(&fingerprint).and_then(VecDeque::pop_front) {
            Some(matched) => entries.push(ReconciledProblem::AlreadyOpen {
                id: matched.id,
                fingerprint,
            }),
            None => entries.push(ReconciledProblem::New(problem)),
        }
    }

    for (fingerprint, leftovers) in open {
        for problem in leftovers {
            if problem.source == ProblemSource::Automated && scope.contains(&problem.problem_type) {
                entries.push(ReconciledProblem::NoLongerDetected {
                    id: problem.id,
                    fingerprint: fingerprint.clone(),
                });
            }
        }
    }

    tracing::debug!(
        "Reconciled assessment: {} entries against {} existing problems",
        entries.len(),
        existing.len()
    );

    Reconciliation { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AssessmentEngine, ADHERENCE_SCOPE, ASSESSMENT_SCOPE};
    use mtr_core::{MedicationEntry, PatientContext, ProblemStatus};

    fn run(medications: &[MedicationEntry], patient: &PatientContext) -> Vec<DrugTherapyProblem> {
        AssessmentEngine::new().assess(medications, patient).into_problems()
    }

    #[test]
    fn test_rerun_produces_no_new_problems() {
        let meds = vec![
            MedicationEntry::prescribed("Warfarin", "5"),
            MedicationEntry::prescribed("Aspirin", "81"),
        ];
        let patient = PatientContext::default();
        let existing = run(&meds, &patient);
        assert_eq!(existing.len(), 1);

        let result = reconcile(&existing, run(&meds, &patient), ASSESSMENT_SCOPE);
        assert_eq!(result.new_count(), 0);
        assert_eq!(result.already_open_count(), 1);
        assert!(result.no_longer_detected().is_empty());
    }

    #[test]
    fn test_same_fingerprint_twice_is_matched_as_multiset() {
        let meds = vec![MedicationEntry::prescribed("Metformin", "500")];
        let patient = PatientContext {
            allergies: vec!["metformin".into()],
            conditions: vec!["kidney disease".into()],
        };
        let existing = run(&meds, &patient);
        assert_eq!(existing.len(), 2);

        let result = reconcile(&existing[..1], run(&meds, &patient), ASSESSMENT_SCOPE);
        assert_eq!(result.new_count(), 1);
        assert_eq!(result.already_open_count(), 1);
    }

    #[test]
    fn test_resolved_problem_is_reported_once_stopped() {
        let patient = PatientContext::default();
        let existing = run(
            &[
                MedicationEntry::prescribed("Warfarin", "5"),
                MedicationEntry::prescribed("Aspirin", "81"),
            ],
            &patient,
        );
        let fresh = run(&[MedicationEntry::prescribed("Warfarin", "5")], &patient);

        let result = reconcile(&existing, fresh, ASSESSMENT_SCOPE);
        assert_eq!(result.no_longer_detected(), vec![existing[0].id]);
    }

    #[test]
    fn test_out_of_scope_and_addressed_problems_are_ignored() {
        let patient = PatientContext::default();
        let mut existing = run(
            &[
                MedicationEntry::prescribed("Warfarin", "5"),
                MedicationEntry::prescribed("Aspirin", "81"),
            ],
            &patient,
        );

        let result = reconcile(&existing, Vec::new(), ADHERENCE_SCOPE);
        assert!(result.entries.is_empty());

        existing[0].status = ProblemStatus::Addressed;
        let fresh = run(
            &[
                MedicationEntry::prescribed("Warfarin", "5"),
                MedicationEntry::prescribed("Aspirin", "81"),
            ],
            &patient,
        );
        let result = reconcile(&existing, fresh, ASSESSMENT_SCOPE);
        assert_eq!(result.new_count(), 1);
    }
}
