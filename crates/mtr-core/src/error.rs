//! 错误定义模块

use thiserror::Error;
use uuid::Uuid;

/// 药物治疗评估系统统一错误类型
#[derive(Error, Debug)]
pub enum MtrError {
    /// 步骤转换守卫失败，状态不变
    #[error("验证错误: {0}")]
    Validation(String),

    /// 患者已存在进行中的评估，调用方应恢复该会话
    /// 冲突会话尚未持久化时 `session_id` 为空
    #[error(
        "冲突: 患者 {patient_id} 已有进行中的评估{}",
        .session_id.map(|id| format!(" {}", id)).unwrap_or_default()
    )]
    Conflict {
        patient_id: Uuid,
        session_id: Option<Uuid>,
    },

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("前置条件不满足: {0}")]
    Precondition(String),

    /// 所有恢复手段均失败后仍无法确定会话标识
    #[error("会话标识恢复失败: {0}")]
    IdentityRecovery(String),

    #[error("规则引擎错误: {0}")]
    RuleEngine(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl MtrError {
    /// 是否为可由用户修正后重试的错误
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MtrError::IdentityRecovery(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, MtrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_recovery_is_fatal() {
        assert!(!MtrError::IdentityRecovery("no id".into()).is_recoverable());
        assert!(MtrError::Precondition("steps".into()).is_recoverable());
        assert!(MtrError::Persistence("down".into()).is_recoverable());
    }

    #[test]
    fn test_conflict_message_names_session() {
        let patient_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let err = MtrError::Conflict {
            patient_id,
            session_id: Some(session_id),
        };
        assert!(err.to_string().contains(&session_id.to_string()));
    }

    #[test]
    fn test_conflict_with_local_session_names_no_id() {
        let err = MtrError::Conflict {
            patient_id: Uuid::new_v4(),
            session_id: None,
        };
        assert!(!err.to_string().contains(&Uuid::nil().to_string()));
    }
}
