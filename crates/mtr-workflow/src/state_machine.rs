//! 评估会话状态机
//!
//! 两个正交维度：六步流程的当前步骤与完成情况，以及会话整体状态。
//! 所有操作都显式接收会话，不读取任何全局状态。

use chrono::Utc;
use mtr_core::{MtrError, MtrSession, Result, ReviewStep, SessionStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// 会话状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Complete,
    Cancel,
    Hold,
    Resume,
}

/// 供界面渲染的步骤状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
}

/// 评估会话状态机
#[derive(Debug)]
pub struct ReviewStateMachine {
    transitions: HashMap<(SessionStatus, SessionEvent), SessionStatus>,
}

impl ReviewStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        // 定义状态转换规则
        transitions.insert((SessionStatus::InProgress, SessionEvent::Complete), SessionStatus::Completed);
        transitions.insert((SessionStatus::InProgress, SessionEvent::Cancel), SessionStatus::Cancelled);
        transitions.insert((SessionStatus::InProgress, SessionEvent::Hold), SessionStatus::OnHold);
        transitions.insert((SessionStatus::OnHold, SessionEvent::Resume), SessionStatus::InProgress);
        transitions.insert((SessionStatus::OnHold, SessionEvent::Cancel), SessionStatus::Cancelled);
        transitions.insert((SessionStatus::Cancelled, SessionEvent::Cancel), SessionStatus::Cancelled);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: SessionStatus, event: SessionEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 计算状态转换结果
    pub fn transition(&self, from: SessionStatus, event: SessionEvent) -> Result<SessionStatus> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(MtrError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 对会话应用状态转换
    pub fn apply(&self, session: &mut MtrSession, event: SessionEvent) -> Result<SessionStatus> {
        let to = self.transition(session.status, event)?;
        if to == SessionStatus::Completed {
            session.completed_at.get_or_insert_with(Utc::now);
        }
        if to != session.status {
            tracing::info!(
                "Review session {:?} status {} -> {}",
                session.id,
                session.status,
                to
            );
        }
        session.status = to;
        session.touch();
        Ok(to)
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current: SessionStatus) -> Vec<SessionEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect()
    }

    /// 为患者创建新会话；患者已有进行中的会话时返回冲突
    pub fn create_session(&self, patient_id: Uuid, existing: Option<&MtrSession>) -> Result<MtrSession> {
        if let Some(existing) = existing {
            if existing.status == SessionStatus::InProgress && existing.patient_id == Some(patient_id) {
                return Err(MtrError::Conflict {
                    patient_id,
                    session_id: existing.id,
                });
            }
        }

        tracing::info!("Creating review session for patient {}", patient_id);
        Ok(MtrSession::new(patient_id))
    }

    /// 跳转到指定步骤
    ///
    /// 可以随时后退，向前最多到第一个未完成的步骤。只改变查看位置，
    /// 因此暂停、已完成和已取消的会话同样可以浏览。
    pub fn go_to_step(&self, session: &mut MtrSession, index: usize) -> Result<ReviewStep> {
        let step = Self::step_at(index)?;

        if let Some(first_incomplete) = session.steps.first_incomplete() {
            if step > first_incomplete {
                return Err(MtrError::Validation(format!(
                    "cannot jump to {} before completing {}",
                    step.title(),
                    first_incomplete.title()
                )));
            }
        }

        session.current_step_index = index;
        session.touch();
        tracing::debug!("Review session {:?} moved to step {}", session.id, step);
        Ok(step)
    }

    /// 完成指定步骤并保存步骤数据
    ///
    /// 只有患者选择步骤有硬性守卫（必须已选定患者）；其余步骤的内容校验由各自的界面负责。
    pub fn complete_step(
        &self,
        session: &mut MtrSession,
        index: usize,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        Self::ensure_in_progress(session)?;
        let step = Self::step_at(index)?;

        let selected_patient = if step == ReviewStep::PatientSelection {
            Some(Self::selected_patient(session, payload.as_ref())?)
        } else {
            None
        };

        if let Some(patient_id) = selected_patient {
            session.patient_id = Some(patient_id);
        }

        let state = session.steps.get_mut(step);
        state.completed = true;
        state.completed_at = Some(Utc::now());
        if payload.is_some() {
            state.data = payload;
        }
        session.touch();

        tracing::info!("Review session {:?} completed step {}", session.id, step);
        Ok(())
    }

    /// 前进一步；已在最后一步时不做任何事
    pub fn advance(&self, session: &mut MtrSession) -> Result<usize> {
        Self::ensure_in_progress(session)?;
        if session.current_step_index >= ReviewStep::LAST_INDEX {
            return Ok(session.current_step_index);
        }

        if session.current_step() == ReviewStep::PatientSelection && session.patient_id.is_none() {
            return Err(MtrError::Validation(
                "a patient must be selected before continuing".to_string(),
            ));
        }

        session.current_step_index += 1;
        session.touch();
        Ok(session.current_step_index)
    }

    /// 需要验证的步骤（前四步）是否全部完成
    pub fn can_complete(&self, session: &MtrSession) -> bool {
        session
            .steps
            .iter()
            .filter(|(step, _)| step.requires_validation())
            .all(|(_, state)| state.completed)
    }

    /// 已完成步骤所占百分比，四舍五入
    pub fn completion_percentage(&self, session: &MtrSession) -> u8 {
        let completed = session.steps.completed_count() as f64;
        (completed * 100.0 / ReviewStep::COUNT as f64).round() as u8
    }

    /// 步骤渲染状态；当前步骤总是 active
    pub fn step_status(&self, session: &MtrSession, index: usize) -> Option<StepStatus> {
        let step = ReviewStep::from_index(index)?;
        let status = if index == session.current_step_index {
            StepStatus::Active
        } else if session.steps.get(step).completed {
            StepStatus::Completed
        } else {
            StepStatus::Pending
        };
        Some(status)
    }

    fn step_at(index: usize) -> Result<ReviewStep> {
        ReviewStep::from_index(index).ok_or_else(|| {
            MtrError::Validation(format!(
                "step index {} is outside 0-{}",
                index,
                ReviewStep::LAST_INDEX
            ))
        })
    }

    /// 只有进行中的会话允许修改步骤与用药记录
    pub fn ensure_in_progress(session: &MtrSession) -> Result<()> {
        if session.status != SessionStatus::InProgress {
            return Err(MtrError::Validation(format!(
                "review session is {} and cannot be modified",
                session.status
            )));
        }
        Ok(())
    }

    /// 步骤数据中的 patientId 优先，其次是会话已有的患者
    fn selected_patient(session: &MtrSession, payload: Option<&serde_json::Value>) -> Result<Uuid> {
        let from_payload = match payload.and_then(|p| p.get("patientId")) {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => {
                let id = value
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| MtrError::Validation(format!("invalid patientId: {}", value)))?;
                Some(id)
            }
        };

        match (from_payload, session.patient_id) {
            (Some(selected), Some(current)) if selected != current => Err(MtrError::Validation(
                "selected patient does not match the review session".to_string(),
            )),
            (Some(selected), _) => Ok(selected),
            (None, Some(current)) => Ok(current),
            (None, None) => Err(MtrError::Validation(
                "a patient must be selected before completing patient selection".to_string(),
            )),
        }
    }
}

impl Default for ReviewStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
