//! 问题 / 干预 / 随访台账
//!
//! 三个按 id 索引、只追加不删除的集合，每条记录有各自的小型状态生命周期。

use crate::error::{MtrError, Result};
use crate::models::{
    DrugTherapyProblem, FollowUp, FollowUpStatus, Intervention, InterventionOutcome, NewFollowUp,
    NewIntervention, NewProblem, ProblemSource, ProblemStatus, Severity,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 评估台账
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewLedger {
    #[serde(default)]
    pub problems: Vec<DrugTherapyProblem>,
    #[serde(default)]
    pub interventions: Vec<Intervention>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUp>,
}

/// 台账统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub total_problems: usize,
    pub open_problems: usize,
    pub problems_by_severity: BTreeMap<Severity, usize>,
    pub problems_by_status: BTreeMap<ProblemStatus, usize>,
    pub total_interventions: usize,
    pub interventions_by_outcome: BTreeMap<InterventionOutcome, usize>,
    pub pending_follow_ups: usize,
    pub overdue_follow_ups: usize,
}

impl ReviewLedger {
    /// 追加一条问题记录
    pub fn record_problem(&mut self, problem: DrugTherapyProblem) -> Uuid {
        let id = problem.id;
        tracing::debug!(
            "Recording {:?} problem {} ({})",
            problem.source,
            id,
            problem.fingerprint()
        );
        self.problems.push(problem);
        id
    }

    /// 记录药师手工识别的问题
    pub fn record_manual_problem(&mut self, input: NewProblem) -> Result<Uuid> {
        if input.description.trim().is_empty() {
            return Err(MtrError::Validation(
                "problem description cannot be empty".to_string(),
            ));
        }

        let problem = DrugTherapyProblem {
            id: Uuid::new_v4(),
            category: input.category,
            problem_type: input.problem_type,
            severity: input.severity,
            evidence_level: input.evidence_level,
            description: input.description,
            clinical_significance: input.clinical_significance,
            affected_medications: input.affected_medications,
            risk_factors: input.risk_factors,
            status: ProblemStatus::Identified,
            source: ProblemSource::Manual,
            identified_at: Utc::now(),
            addressed_at: None,
        };

        Ok(self.record_problem(problem))
    }

    pub fn problem(&self, id: Uuid) -> Option<&DrugTherapyProblem> {
        self.problems.iter().find(|p| p.id == id)
    }

    pub fn open_problems(&self) -> impl Iterator<Item = &DrugTherapyProblem> {
        self.problems.iter().filter(|p| p.is_open())
    }

    /// 更新问题状态
    pub fn update_problem_status(&mut self, id: Uuid, status: ProblemStatus) -> Result<()> {
        let problem = self
            .problems
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| MtrError::NotFound(format!("Problem {} not found", id)))?;

        if problem.status == status {
            return Ok(());
        }

        let allowed = matches!(
            (problem.status, status),
            (ProblemStatus::Identified, ProblemStatus::Monitoring)
                | (ProblemStatus::Identified, ProblemStatus::Addressed)
                | (ProblemStatus::Monitoring, ProblemStatus::Addressed)
                | (ProblemStatus::Monitoring, ProblemStatus::Identified)
        );
        if !allowed {
            return Err(MtrError::InvalidStateTransition {
                from: format!("{:?}", problem.status),
                event: format!("{:?}", status),
            });
        }

        problem.status = status;
        if status == ProblemStatus::Addressed {
            problem.addressed_at = Some(Utc::now());
        }
        tracing::info!("Problem {} moved to {:?}", id, status);
        Ok(())
    }

    pub fn intervention(&self, id: Uuid) -> Option<&Intervention> {
        self.interventions.iter().find(|i| i.id == id)
    }

    /// 记录干预，结果初始为 pending
    pub fn record_intervention(&mut self, input: NewIntervention) -> Result<Uuid> {
        if input.description.trim().is_empty() {
            return Err(MtrError::Validation(
                "intervention description cannot be empty".to_string(),
            ));
        }
        if let Some(problem_id) = input.problem_id {
            if self.problem(problem_id).is_none() {
                return Err(MtrError::NotFound(format!("Problem {} not found", problem_id)));
            }
        }

        let intervention = Intervention {
            id: Uuid::new_v4(),
            problem_id: input.problem_id,
            intervention_type: input.intervention_type,
            category: input.category,
            description: input.description,
            rationale: input.rationale,
            outcome: InterventionOutcome::Pending,
            outcome_notes: None,
            outcome_recorded_at: None,
            follow_up_required: input.follow_up_required,
            follow_up_completed: false,
            priority: input.priority,
            urgency: input.urgency,
            created_at: Utc::now(),
        };

        let id = intervention.id;
        self.interventions.push(intervention);
        tracing::info!("Intervention {} recorded", id);
        Ok(id)
    }

    /// 记录干预结果，只允许从 pending 转换一次
    pub fn record_intervention_outcome(
        &mut self,
        id: Uuid,
        outcome: InterventionOutcome,
        notes: Option<String>,
    ) -> Result<()> {
        if outcome == InterventionOutcome::Pending {
            return Err(MtrError::Validation(
                "an intervention outcome cannot be reset to pending".to_string(),
            ));
        }

        let intervention = self
            .interventions
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| MtrError::NotFound(format!("Intervention {} not found", id)))?;

        if intervention.outcome != InterventionOutcome::Pending {
            return Err(MtrError::InvalidStateTransition {
                from: format!("{:?}", intervention.outcome),
                event: format!("{:?}", outcome),
            });
        }

        intervention.outcome = outcome;
        intervention.outcome_notes = notes;
        intervention.outcome_recorded_at = Some(Utc::now());
        let problem_id = intervention.problem_id;

        tracing::info!("Intervention {} outcome recorded as {:?}", id, outcome);

        if matches!(outcome, InterventionOutcome::Accepted | InterventionOutcome::Modified) {
            if let Some(problem_id) = problem_id {
                let still_open = self.problem(problem_id).is_some_and(|p| p.is_open());
                if still_open {
                    self.update_problem_status(problem_id, ProblemStatus::Addressed)?;
                }
            }
        }

        Ok(())
    }

    pub fn follow_up(&self, id: Uuid) -> Option<&FollowUp> {
        self.follow_ups.iter().find(|f| f.id == id)
    }

    /// 安排随访
    pub fn schedule_follow_up(&mut self, input: NewFollowUp) -> Result<Uuid> {
        if let Some(intervention_id) = input.intervention_id {
            if self.intervention(intervention_id).is_none() {
                return Err(MtrError::NotFound(format!(
                    "Intervention {} not found",
                    intervention_id
                )));
            }
        }

        let follow_up = FollowUp {
            id: Uuid::new_v4(),
            intervention_id: input.intervention_id,
            follow_up_type: input.follow_up_type,
            priority: input.priority,
            status: FollowUpStatus::Scheduled,
            scheduled_date: input.scheduled_date,
            description: input.description,
            outcome: None,
            reason: None,
            completed_at: None,
        };

        let id = follow_up.id;
        self.follow_ups.push(follow_up);
        tracing::info!("Follow-up {} scheduled for {}", id, input.scheduled_date);
        Ok(id)
    }

    /// 完成随访，并回写关联干预的随访完成标记
    pub fn complete_follow_up(&mut self, id: Uuid, outcome: String) -> Result<()> {
        let follow_up = self.pending_follow_up_mut(id, FollowUpStatus::Completed)?;
        follow_up.status = FollowUpStatus::Completed;
        follow_up.outcome = Some(outcome);
        follow_up.completed_at = Some(Utc::now());
        let intervention_id = follow_up.intervention_id;

        if let Some(intervention_id) = intervention_id {
            if let Some(intervention) = self
                .interventions
                .iter_mut()
                .find(|i| i.id == intervention_id)
            {
                intervention.follow_up_completed = true;
            }
        }

        tracing::info!("Follow-up {} completed", id);
        Ok(())
    }

    pub fn mark_follow_up_missed(&mut self, id: Uuid) -> Result<()> {
        let follow_up = self.pending_follow_up_mut(id, FollowUpStatus::Missed)?;
        follow_up.status = FollowUpStatus::Missed;
        tracing::warn!("Follow-up {} missed", id);
        Ok(())
    }

    pub fn cancel_follow_up(&mut self, id: Uuid, reason: Option<String>) -> Result<()> {
        let follow_up = self.pending_follow_up_mut(id, FollowUpStatus::Cancelled)?;
        follow_up.status = FollowUpStatus::Cancelled;
        if reason.is_some() {
            follow_up.reason = reason;
        }
        tracing::info!("Follow-up {} cancelled", id);
        Ok(())
    }

    /// 改期：就地更新日期，原定日期写入 reason 字段，不产生新记录
    pub fn reschedule_follow_up(
        &mut self,
        id: Uuid,
        new_date: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<()> {
        let follow_up = self.pending_follow_up_mut(id, FollowUpStatus::Rescheduled)?;
        let prior = follow_up.scheduled_date;

        follow_up.reason = Some(match reason {
            Some(reason) if !reason.trim().is_empty() => {
                format!("rescheduled from {}: {}", prior.to_rfc3339(), reason.trim())
            }
            _ => format!("rescheduled from {}", prior.to_rfc3339()),
        });
        follow_up.scheduled_date = new_date;
        follow_up.status = FollowUpStatus::Rescheduled;

        tracing::info!("Follow-up {} rescheduled from {} to {}", id, prior, new_date);
        Ok(())
    }

    fn pending_follow_up_mut(&mut self, id: Uuid, target: FollowUpStatus) -> Result<&mut FollowUp> {
        let follow_up = self
            .follow_ups
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| MtrError::NotFound(format!("Follow-up {} not found", id)))?;

        if !follow_up.status.is_pending() {
            return Err(MtrError::InvalidStateTransition {
                from: format!("{:?}", follow_up.status),
                event: format!("{:?}", target),
            });
        }

        Ok(follow_up)
    }

    /// 汇总台账
    pub fn summary(&self, now: DateTime<Utc>) -> LedgerSummary {
        let mut summary = LedgerSummary {
            total_problems: self.problems.len(),
            total_interventions: self.interventions.len(),
            ..LedgerSummary::default()
        };

        for problem in &self.problems {
            *summary.problems_by_severity.entry(problem.severity).or_insert(0) += 1;
            *summary.problems_by_status.entry(problem.status).or_insert(0) += 1;
            if problem.is_open() {
                summary.open_problems += 1;
            }
        }

        for intervention in &self.interventions {
            *summary
                .interventions_by_outcome
                .entry(intervention.outcome)
                .or_insert(0) += 1;
        }

        for follow_up in self.follow_ups.iter().filter(|f| f.status.is_pending()) {
            summary.pending_follow_ups += 1;
            if follow_up.scheduled_date < now {
                summary.overdue_follow_ups += 1;
            }
        }

        summary
    }
}
