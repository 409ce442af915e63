//! 核心数据模型定义

use crate::error::{MtrError, Result};
use crate::ledger::ReviewLedger;
use crate::utils::{contains_term, normalize_term};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// 评估会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress, // 进行中
    Completed,  // 已完成
    Cancelled,  // 已取消
    OnHold,     // 暂停
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::OnHold => "on_hold",
        };
        f.write_str(label)
    }
}

/// 评估流程的六个固定步骤，声明顺序即流程顺序
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ReviewStep {
    PatientSelection,
    MedicationHistory,
    TherapyAssessment,
    PlanDevelopment,
    Interventions,
    FollowUp,
}

impl ReviewStep {
    pub const ALL: [ReviewStep; 6] = [
        ReviewStep::PatientSelection,
        ReviewStep::MedicationHistory,
        ReviewStep::TherapyAssessment,
        ReviewStep::PlanDevelopment,
        ReviewStep::Interventions,
        ReviewStep::FollowUp,
    ];

    pub const COUNT: usize = 6;
    pub const LAST_INDEX: usize = Self::COUNT - 1;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn key(self) -> &'static str {
        match self {
            ReviewStep::PatientSelection => "patientSelection",
            ReviewStep::MedicationHistory => "medicationHistory",
            ReviewStep::TherapyAssessment => "therapyAssessment",
            ReviewStep::PlanDevelopment => "planDevelopment",
            ReviewStep::Interventions => "interventions",
            ReviewStep::FollowUp => "followUp",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ReviewStep::PatientSelection => "Patient Selection",
            ReviewStep::MedicationHistory => "Medication History",
            ReviewStep::TherapyAssessment => "Therapy Assessment",
            ReviewStep::PlanDevelopment => "Plan Development",
            ReviewStep::Interventions => "Interventions",
            ReviewStep::FollowUp => "Follow-Up",
        }
    }

    /// 前四个步骤必须完成后才能结束评估
    pub fn requires_validation(self) -> bool {
        self.index() <= ReviewStep::PlanDevelopment.index()
    }
}

impl fmt::Display for ReviewStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// 单个步骤的完成情况
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// 六个步骤的有序进度表
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub patient_selection: StepState,
    pub medication_history: StepState,
    pub therapy_assessment: StepState,
    pub plan_development: StepState,
    pub interventions: StepState,
    pub follow_up: StepState,
}

impl StepProgress {
    pub fn get(&self, step: ReviewStep) -> &StepState {
        match step {
            ReviewStep::PatientSelection => &self.patient_selection,
            ReviewStep::MedicationHistory => &self.medication_history,
            ReviewStep::TherapyAssessment => &self.therapy_assessment,
            ReviewStep::PlanDevelopment => &self.plan_development,
            ReviewStep::Interventions => &self.interventions,
            ReviewStep::FollowUp => &self.follow_up,
        }
    }

    pub fn get_mut(&mut self, step: ReviewStep) -> &mut StepState {
        match step {
            ReviewStep::PatientSelection => &mut self.patient_selection,
            ReviewStep::MedicationHistory => &mut self.medication_history,
            ReviewStep::TherapyAssessment => &mut self.therapy_assessment,
            ReviewStep::PlanDevelopment => &mut self.plan_development,
            ReviewStep::Interventions => &mut self.interventions,
            ReviewStep::FollowUp => &mut self.follow_up,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReviewStep, &StepState)> + '_ {
        ReviewStep::ALL.into_iter().map(move |step| (step, self.get(step)))
    }

    pub fn completed_count(&self) -> usize {
        self.iter().filter(|(_, state)| state.completed).count()
    }

    /// 第一个未完成的步骤；全部完成时返回 None
    pub fn first_incomplete(&self) -> Option<ReviewStep> {
        self.iter()
            .find(|(_, state)| !state.completed)
            .map(|(step, _)| step)
    }
}

/// 药物类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MedicationCategory {
    Prescribed, // 处方药
    Otc,        // 非处方药
    Herbal,     // 草药
    Supplement, // 保健品
}

/// 药物规格
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Strength {
    pub value: f64,
    pub unit: String,
}

/// 用法用量
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DosingInstructions {
    pub dose: String,
    pub frequency: String,
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// 患者用药记录条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MedicationEntry {
    pub drug_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_name: Option<String>,
    pub strength: Strength,
    pub dosage_form: String,
    pub instructions: DosingInstructions,
    pub category: MedicationCategory,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    /// 依从性评分 0-10
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adherence_score: Option<u8>,
    /// 已记录的不依从原因
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adherence_barriers: Vec<String>,
}

impl MedicationEntry {
    pub const MAX_ADHERENCE_SCORE: u8 = 10;

    /// 以常见默认值创建一条口服处方药记录
    pub fn prescribed(drug_name: impl Into<String>, dose: impl Into<String>) -> Self {
        Self {
            drug_name: drug_name.into(),
            generic_name: None,
            strength: Strength {
                value: 0.0,
                unit: "mg".to_string(),
            },
            dosage_form: "tablet".to_string(),
            instructions: DosingInstructions {
                dose: dose.into(),
                frequency: "once daily".to_string(),
                route: "oral".to_string(),
                duration: None,
            },
            category: MedicationCategory::Prescribed,
            start_date: Utc::now().date_naive(),
            end_date: None,
            adherence_score: None,
            adherence_barriers: Vec::new(),
        }
    }

    pub fn with_generic_name(mut self, generic_name: impl Into<String>) -> Self {
        self.generic_name = Some(generic_name.into());
        self
    }

    pub fn with_strength(mut self, value: f64, unit: impl Into<String>) -> Self {
        self.strength = Strength {
            value,
            unit: unit.into(),
        };
        self
    }

    pub fn with_category(mut self, category: MedicationCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_adherence(mut self, score: u8, barriers: Vec<String>) -> Self {
        self.adherence_score = Some(score);
        self.adherence_barriers = barriers;
        self
    }

    /// 检查条目的基本形状
    pub fn validate(&self) -> Result<()> {
        if self.drug_name.trim().is_empty() {
            return Err(MtrError::Validation("drug name cannot be empty".to_string()));
        }

        if let Some(score) = self.adherence_score {
            if score > Self::MAX_ADHERENCE_SCORE {
                return Err(MtrError::Validation(format!(
                    "adherence score {} for {} is outside 0-{}",
                    score,
                    self.drug_name,
                    Self::MAX_ADHERENCE_SCORE
                )));
            }
        }

        if !self.strength.value.is_finite() || self.strength.value < 0.0 {
            return Err(MtrError::Validation(format!(
                "strength of {} must be a non-negative number",
                self.drug_name
            )));
        }

        Ok(())
    }

    /// 药名或通用名是否包含指定关键字
    pub fn matches(&self, key: &str) -> bool {
        contains_term(&self.drug_name, key)
            || self
                .generic_name
                .as_deref()
                .is_some_and(|generic| contains_term(generic, key))
    }

    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && self.end_date.map_or(true, |end| date <= end)
    }
}

/// 患者临床背景，由外部协作方提供
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientContext {
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

/// 药物治疗问题类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProblemCategory {
    Indication,    // 适应症
    Effectiveness, // 有效性
    Safety,        // 安全性
    Adherence,     // 依从性
}

/// 药物治疗问题类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ProblemType {
    Unnecessary,
    Untreated,
    WrongDrug,
    DoseTooLow,
    DoseTooHigh,
    AdverseReaction,
    Interaction,
    Duplication,
    Contraindication,
    Nonadherence,
    Monitoring,
}

/// 严重程度，按声明顺序由轻到重
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Moderate,
    Major,
    Critical,
}

/// 证据等级，按声明顺序由弱到强
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceLevel {
    Unlikely,
    Possible,
    Probable,
    Definite,
}

/// 问题状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProblemStatus {
    Identified, // 已识别
    Monitoring, // 监测中
    Addressed,  // 已处理
}

/// 问题来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProblemSource {
    Automated,
    Manual,
}

/// 药物治疗问题
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrugTherapyProblem {
    pub id: Uuid,
    pub category: ProblemCategory,
    #[serde(rename = "type")]
    pub problem_type: ProblemType,
    pub severity: Severity,
    pub evidence_level: EvidenceLevel,
    pub description: String,
    pub clinical_significance: String,
    pub affected_medications: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_factors: Vec<String>,
    pub status: ProblemStatus,
    pub source: ProblemSource,
    pub identified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressed_at: Option<DateTime<Utc>>,
}

impl DrugTherapyProblem {
    /// 创建一条由规则引擎识别的问题
    pub fn automated(
        category: ProblemCategory,
        problem_type: ProblemType,
        severity: Severity,
        evidence_level: EvidenceLevel,
        description: impl Into<String>,
        clinical_significance: impl Into<String>,
        affected_medications: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            problem_type,
            severity,
            evidence_level,
            description: description.into(),
            clinical_significance: clinical_significance.into(),
            affected_medications,
            risk_factors: Vec::new(),
            status: ProblemStatus::Identified,
            source: ProblemSource::Automated,
            identified_at: Utc::now(),
            addressed_at: None,
        }
    }

    pub fn with_risk_factors(mut self, risk_factors: Vec<String>) -> Self {
        self.risk_factors = risk_factors;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status != ProblemStatus::Addressed
    }

    pub fn fingerprint(&self) -> ProblemFingerprint {
        ProblemFingerprint::new(self.category, self.problem_type, &self.affected_medications)
    }
}

/// 问题指纹：类别 + 类型 + 排序后的受影响药物集合
///
/// 与问题 id 无关，重复评估时用它区分新问题与已存在的问题。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProblemFingerprint {
    pub category: ProblemCategory,
    pub problem_type: ProblemType,
    pub medications: BTreeSet<String>,
}

impl ProblemFingerprint {
    pub fn new(category: ProblemCategory, problem_type: ProblemType, medications: &[String]) -> Self {
        Self {
            category,
            problem_type,
            medications: medications.iter().map(|m| normalize_term(m)).collect(),
        }
    }
}

impl fmt::Display for ProblemFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meds: Vec<&str> = self.medications.iter().map(String::as_str).collect();
        write!(f, "{:?}/{:?}/[{}]", self.category, self.problem_type, meds.join(","))
    }
}

/// 手工记录问题时的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProblem {
    pub category: ProblemCategory,
    #[serde(rename = "type")]
    pub problem_type: ProblemType,
    pub severity: Severity,
    pub evidence_level: EvidenceLevel,
    pub description: String,
    #[serde(default)]
    pub clinical_significance: String,
    pub affected_medications: Vec<String>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
}

/// 干预类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    Recommendation,   // 向处方者建议
    PrescriberContact, // 联系处方者
    Counseling,       // 患者咨询
    Monitoring,       // 监测
    Education,        // 用药教育
}

/// 干预类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterventionCategory {
    DoseAdjustment,
    Discontinuation,
    Addition,
    Substitution,
    AdherenceSupport,
    PatientEducation,
    LabMonitoring,
}

/// 干预结果
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InterventionOutcome {
    Pending,
    Accepted,
    Rejected,
    Modified,
}

/// 优先级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// 紧急程度
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Urgency {
    #[serde(rename = "routine")]
    Routine,
    #[serde(rename = "within_week")]
    WithinWeek,
    #[serde(rename = "within_24h")]
    Within24Hours,
    #[serde(rename = "immediate")]
    Immediate,
}

/// 药师干预
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub intervention_type: InterventionType,
    pub category: InterventionCategory,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub outcome: InterventionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_recorded_at: Option<DateTime<Utc>>,
    pub follow_up_required: bool,
    pub follow_up_completed: bool,
    pub priority: Priority,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
}

/// 记录干预时的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIntervention {
    #[serde(default)]
    pub problem_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub intervention_type: InterventionType,
    pub category: InterventionCategory,
    pub description: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub follow_up_required: bool,
    pub priority: Priority,
    pub urgency: Urgency,
}

/// 随访类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpType {
    PhoneCall,
    Appointment,
    LabReview,
    AdherenceCheck,
    OutcomeAssessment,
}

/// 随访状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Scheduled,
    Completed,
    Missed,
    Cancelled,
    Rescheduled,
}

impl FollowUpStatus {
    /// 仍等待执行的随访
    pub fn is_pending(self) -> bool {
        matches!(self, FollowUpStatus::Scheduled | FollowUpStatus::Rescheduled)
    }
}

/// 随访计划
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowUp {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervention_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub follow_up_type: FollowUpType,
    pub priority: Priority,
    pub status: FollowUpStatus,
    pub scheduled_date: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// 改期时记录原定日期与原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// 安排随访时的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFollowUp {
    #[serde(default)]
    pub intervention_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub follow_up_type: FollowUpType,
    pub priority: Priority,
    pub scheduled_date: DateTime<Utc>,
    pub description: String,
}

/// 药物治疗评估会话
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MtrSession {
    /// 持久化网关首次保存成功后分配
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<Uuid>,
    pub status: SessionStatus,
    pub steps: StepProgress,
    pub current_step_index: usize,
    #[serde(default)]
    pub medications: Vec<MedicationEntry>,
    #[serde(default)]
    pub patient_context: PatientContext,
    #[serde(default)]
    pub ledger: ReviewLedger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MtrSession {
    /// 为选定患者创建尚未持久化的新会话
    pub fn new(patient_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            patient_id: Some(patient_id),
            status: SessionStatus::InProgress,
            steps: StepProgress::default(),
            current_step_index: 0,
            medications: Vec::new(),
            patient_context: PatientContext::default(),
            ledger: ReviewLedger::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn current_step(&self) -> ReviewStep {
        ReviewStep::from_index(self.current_step_index).unwrap_or(ReviewStep::FollowUp)
    }

    pub fn has_durable_id(&self) -> bool {
        self.id.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_order_matches_indices() {
        for (i, step) in ReviewStep::ALL.iter().enumerate() {
            assert_eq!(step.index(), i);
            assert_eq!(ReviewStep::from_index(i), Some(*step));
        }
        assert_eq!(ReviewStep::from_index(6), None);
        assert_eq!(ReviewStep::LAST_INDEX, 5);
    }

    #[test]
    fn test_only_first_four_steps_require_validation() {
        let required: Vec<_> = ReviewStep::ALL
            .iter()
            .filter(|s| s.requires_validation())
            .collect();
        assert_eq!(required.len(), 4);
        assert!(!ReviewStep::Interventions.requires_validation());
        assert!(!ReviewStep::FollowUp.requires_validation());
    }

    #[test]
    fn test_steps_serialize_in_workflow_order() {
        let json = serde_json::to_string(&StepProgress::default()).unwrap();
        let positions: Vec<usize> = ReviewStep::ALL
            .iter()
            .map(|s| json.find(s.key()).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_first_incomplete_step() {
        let mut steps = StepProgress::default();
        assert_eq!(steps.first_incomplete(), Some(ReviewStep::PatientSelection));
        steps.get_mut(ReviewStep::PatientSelection).completed = true;
        steps.get_mut(ReviewStep::MedicationHistory).completed = true;
        assert_eq!(steps.first_incomplete(), Some(ReviewStep::TherapyAssessment));
        assert_eq!(steps.completed_count(), 2);
    }

    #[test]
    fn test_medication_validation() {
        assert!(MedicationEntry::prescribed("Metformin", "500").validate().is_ok());
        assert!(MedicationEntry::prescribed("  ", "500").validate().is_err());
        assert!(MedicationEntry::prescribed("Metformin", "500")
            .with_adherence(11, vec![])
            .validate()
            .is_err());
        assert!(MedicationEntry::prescribed("Metformin", "500")
            .with_strength(f64::NAN, "mg")
            .validate()
            .is_err());
    }

    #[test]
    fn test_medication_matches_generic_name() {
        let med = MedicationEntry::prescribed("Glucophage XR", "500").with_generic_name("Metformin");
        assert!(med.matches("metformin"));
        assert!(med.matches("glucophage"));
        assert!(!med.matches("insulin"));
    }

    #[test]
    fn test_fingerprint_ignores_order_and_case() {
        let a = ProblemFingerprint::new(
            ProblemCategory::Safety,
            ProblemType::Interaction,
            &["Warfarin".to_string(), "Aspirin".to_string()],
        );
        let b = ProblemFingerprint::new(
            ProblemCategory::Safety,
            ProblemType::Interaction,
            &["aspirin".to_string(), "WARFARIN".to_string()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_round_trips_through_json() {
        let session = MtrSession::new(Uuid::new_v4());
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "in_progress");
        assert!(json.get("id").is_none());
        let back: MtrSession = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
    }
}
