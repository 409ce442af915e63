//! # MTR工作流模块
//!
//! 提供药物治疗评估会话的完整流程管理，包括：
//! - 会话状态机：六步流程的推进与会话状态生命周期
//! - 评估流程编排：身份确认、评估对账、台账操作与完成/取消
//! - 自动保存：固定间隔保存，与手动保存互斥
//! - 持久化网关：异步保存接口及内存、JSON 文件两种实现

pub mod autosave;
pub mod gateway;
pub mod session;
pub mod state_machine;

// 重新导出主要类型
pub use autosave::{AutosaveHandle, AutosaveOutcome, AutosaveSettings, SkipReason};
pub use gateway::{InMemoryGateway, JsonFileGateway, PersistenceGateway};
pub use session::{ReviewSummary, ReviewWorkflow};
pub use state_machine::{ReviewStateMachine, SessionEvent, StepStatus};
