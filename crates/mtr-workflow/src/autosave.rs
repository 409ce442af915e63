//! 自动保存
//!
//! 固定间隔把活动会话的完整快照写入网关。失败只记录日志，下一次触发时自然重试。

use crate::session::ReviewWorkflow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 默认保存间隔（秒）
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// 自动保存设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveSettings {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
        }
    }
}

/// 跳过本次保存的原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoSession,
    Disabled,
    SaveInFlight,
    NoDurableId,
}

/// 单次触发的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AutosaveOutcome {
    Skipped(SkipReason),
    Saved(DateTime<Utc>),
    Failed(String),
}

/// 后台自动保存任务句柄，停止或丢弃时终止任务
#[derive(Debug)]
pub struct AutosaveHandle {
    task: JoinHandle<()>,
}

impl AutosaveHandle {
    pub fn stop(&self) {
        if !self.task.is_finished() {
            info!("Stopping auto-save task");
        }
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AutosaveHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ReviewWorkflow {
    /// 执行一次自动保存
    pub async fn autosave_tick(&self) -> AutosaveOutcome {
        if self.active.read().await.is_none() {
            return AutosaveOutcome::Skipped(SkipReason::NoSession);
        }
        if !self.autosave_enabled.load(Ordering::SeqCst) {
            return AutosaveOutcome::Skipped(SkipReason::Disabled);
        }

        let Ok(_guard) = self.save_guard.try_lock() else {
            debug!("Auto-save skipped: a save is already in flight");
            return AutosaveOutcome::Skipped(SkipReason::SaveInFlight);
        };

        let snapshot = match self.active.read().await.clone() {
            Some(session) if session.has_durable_id() => session,
            Some(_) => return AutosaveOutcome::Skipped(SkipReason::NoDurableId),
            None => return AutosaveOutcome::Skipped(SkipReason::NoSession),
        };

        match self.gateway.upsert(&snapshot).await {
            Ok(_) => {
                let saved_at = Utc::now();
                *self.last_saved_at.write().await = Some(saved_at);
                debug!("Auto-saved review {:?}", snapshot.id);
                AutosaveOutcome::Saved(saved_at)
            }
            Err(e) => {
                warn!("Auto-save of review {:?} failed, retrying next tick: {}", snapshot.id, e);
                AutosaveOutcome::Failed(e.to_string())
            }
        }
    }

    /// 启动后台自动保存任务
    pub fn spawn_autosave(self: &Arc<Self>) -> AutosaveHandle {
        let workflow = Arc::clone(self);
        let period = if self.autosave_interval.is_zero() {
            warn!("Auto-save interval is zero, using the default");
            AutosaveSettings::default().interval
        } else {
            self.autosave_interval
        };

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let outcome = workflow.autosave_tick().await;
                debug!("Auto-save tick: {:?}", outcome);
            }
        });

        info!("Auto-save task started with interval {:?}", period);
        AutosaveHandle { task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use uuid::Uuid;

    fn workflow(gateway: Arc<InMemoryGateway>) -> Arc<ReviewWorkflow> {
        Arc::new(ReviewWorkflow::new(gateway, AutosaveSettings::default()))
    }

    #[tokio::test]
    async fn test_skip_rules() {
        let gateway = Arc::new(InMemoryGateway::new());
        let wf = workflow(gateway.clone());
        assert_eq!(
            wf.autosave_tick().await,
            AutosaveOutcome::Skipped(SkipReason::NoSession)
        );

        gateway.set_available(false);
        wf.start_review(Uuid::new_v4()).await.unwrap();
        gateway.set_available(true);
        assert_eq!(
            wf.autosave_tick().await,
            AutosaveOutcome::Skipped(SkipReason::NoDurableId)
        );

        wf.set_autosave_enabled(false);
        assert_eq!(
            wf.autosave_tick().await,
            AutosaveOutcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(gateway.upsert_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_absorbed_and_retried() {
        let gateway = Arc::new(InMemoryGateway::new());
        let wf = workflow(gateway.clone());
        wf.start_review(Uuid::new_v4()).await.unwrap();

        gateway.set_available(false);
        assert!(matches!(wf.autosave_tick().await, AutosaveOutcome::Failed(_)));
        assert!(wf.last_saved_at().await.is_none());

        gateway.set_available(true);
        assert!(matches!(wf.autosave_tick().await, AutosaveOutcome::Saved(_)));
        assert!(wf.last_saved_at().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_save_waits_for_autosave_in_flight() {
        let gateway = Arc::new(InMemoryGateway::with_latency(Duration::from_secs(5)));
        let wf = workflow(gateway.clone());
        wf.start_review(Uuid::new_v4()).await.unwrap();

        let background = Arc::clone(&wf);
        let autosave = tokio::spawn(async move { background.autosave_tick().await });
        while !wf.save_in_flight() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            wf.autosave_tick().await,
            AutosaveOutcome::Skipped(SkipReason::SaveInFlight)
        );

        wf.save().await.unwrap();
        assert!(matches!(autosave.await.unwrap(), AutosaveOutcome::Saved(_)));
        assert_eq!(gateway.upsert_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_saves_on_interval() {
        let gateway = Arc::new(InMemoryGateway::new());
        let wf = workflow(gateway.clone());
        wf.start_review(Uuid::new_v4()).await.unwrap();

        let handle = wf.spawn_autosave();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.upsert_count(), 0);

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(gateway.upsert_count() >= 2);
        assert!(wf.last_saved_at().await.is_some());

        handle.stop();
        tokio::task::yield_now().await;
        let after_stop = gateway.upsert_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(gateway.upsert_count(), after_stop);
    }
}
