//! # 药物治疗问题评估
//!
//! 对患者用药清单及过敏/疾病背景运行规则检查，输出结构化的药物治疗问题：
//! - 药物相互作用：两两比对静态相互作用表
//! - 重复用药：同一治疗类别出现多种药物
//! - 禁忌症：过敏（含交叉过敏）与疾病禁忌
//! - 剂量：数值剂量超出阈值
//! - 依从性：单独触发，基于依从性评分

pub mod checks;
pub mod dosing;
pub mod engine;
pub mod knowledge;
pub mod reconcile;

// 重新导出主要类型
pub use checks::{check_adherence, check_contraindications, check_duplications, check_interactions};
pub use dosing::{check_dosing, parse_dose_mg};
pub use engine::{
    AssessmentEngine, AssessmentReport, AssessmentRequest, SkippedEntry, ADHERENCE_SCOPE,
    ASSESSMENT_SCOPE,
};
pub use knowledge::KnowledgeBase;
pub use reconcile::{reconcile, ReconciledProblem, Reconciliation};
