//! 评估流程编排
//!
//! `ReviewWorkflow` 持有唯一的活动会话，所有修改都经由状态机完成。
//! 与持久化网关的写交互（确认身份、保存、完成、取消）共用一把保存锁，
//! 自动保存与手动保存因此互斥。

use crate::autosave::AutosaveSettings;
use crate::gateway::PersistenceGateway;
use crate::state_machine::{ReviewStateMachine, SessionEvent, StepStatus};
use chrono::{DateTime, Utc};
use mtr_assessment::{reconcile, AssessmentEngine, Reconciliation, ADHERENCE_SCOPE, ASSESSMENT_SCOPE};
use mtr_core::{
    DrugTherapyProblem, InterventionOutcome, LedgerSummary, MedicationEntry, MtrError, MtrSession,
    NewFollowUp, NewIntervention, NewProblem, PatientContext, ProblemStatus, ProblemType, Result,
    ReviewLedger, ReviewStep, SessionStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 评估概要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSummary {
    pub session_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub status: SessionStatus,
    pub current_step: ReviewStep,
    pub current_step_index: usize,
    pub completion_percentage: u8,
    pub can_complete: bool,
    pub medication_count: usize,
    pub ledger: LedgerSummary,
    pub last_saved_at: Option<DateTime<Utc>>,
}

/// 评估流程
pub struct ReviewWorkflow {
    pub(crate) gateway: Arc<dyn PersistenceGateway>,
    state_machine: ReviewStateMachine,
    engine: AssessmentEngine,
    pub(crate) autosave_enabled: AtomicBool,
    pub(crate) autosave_interval: Duration,
    pub(crate) active: RwLock<Option<MtrSession>>,
    identity_hint: RwLock<Option<Uuid>>,
    pub(crate) save_guard: Mutex<()>,
    pub(crate) last_saved_at: RwLock<Option<DateTime<Utc>>>,
}

fn no_active_session() -> MtrError {
    MtrError::NotFound("no active review session".to_string())
}

impl ReviewWorkflow {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, settings: AutosaveSettings) -> Self {
        Self {
            gateway,
            state_machine: ReviewStateMachine::new(),
            engine: AssessmentEngine::new(),
            autosave_enabled: AtomicBool::new(settings.enabled),
            autosave_interval: settings.interval,
            active: RwLock::new(None),
            identity_hint: RwLock::new(None),
            save_guard: Mutex::new(()),
            last_saved_at: RwLock::new(None),
        }
    }

    pub fn with_engine(mut self, engine: AssessmentEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn state_machine(&self) -> &ReviewStateMachine {
        &self.state_machine
    }

    // ---- 会话入口 ----

    /// 为患者开始新的评估
    ///
    /// 网关中已有进行中的会话时返回冲突，调用方应改为恢复该会话。
    /// 网关创建失败不阻止本地会话，身份在完成患者选择步骤时再确认。
    pub async fn start_review(&self, patient_id: Uuid) -> Result<MtrSession> {
        let existing = match self.gateway.load_in_progress(patient_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Could not check for an in-progress review of patient {}: {}", patient_id, e);
                None
            }
        };

        let mut session = {
            let active = self.active.read().await;
            let local = active
                .as_ref()
                .filter(|s| s.patient_id == Some(patient_id));
            self.state_machine
                .create_session(patient_id, existing.as_ref().or(local))?
        };

        match self.gateway.create(patient_id).await {
            Ok(stored) => {
                session.id = stored.id;
                session.created_at = stored.created_at;
            }
            Err(e @ MtrError::Conflict { .. }) => return Err(e),
            Err(e) => warn!(
                "Review for patient {} started without a durable id: {}",
                patient_id, e
            ),
        }

        info!("Started review {:?} for patient {}", session.id, patient_id);
        *self.identity_hint.write().await = None;
        *self.last_saved_at.write().await = None;
        *self.active.write().await = Some(session.clone());
        Ok(session)
    }

    /// 按 id 恢复会话，并记住该 id 作为身份线索
    pub async fn resume_review(&self, id: Uuid) -> Result<MtrSession> {
        let session = self.gateway.load(id).await?;
        info!("Resumed review {} ({})", id, session.status);
        *self.identity_hint.write().await = Some(id);
        *self.active.write().await = Some(session.clone());
        Ok(session)
    }

    /// 恢复患者进行中的会话
    pub async fn resume_for_patient(&self, patient_id: Uuid) -> Result<MtrSession> {
        let session = self
            .gateway
            .load_in_progress(patient_id)
            .await?
            .ok_or_else(|| {
                MtrError::NotFound(format!("no in-progress review for patient {}", patient_id))
            })?;

        if let Some(id) = session.id {
            *self.identity_hint.write().await = Some(id);
        }
        info!("Resumed review {:?} for patient {}", session.id, patient_id);
        *self.active.write().await = Some(session.clone());
        Ok(session)
    }

    /// 载入本地会话快照，不访问网关
    pub async fn restore(&self, session: MtrSession) {
        debug!("Restoring review {:?} from a local snapshot", session.id);
        *self.active.write().await = Some(session);
    }

    /// 外部提供的会话 id 线索，供身份恢复使用
    pub async fn set_identity_hint(&self, id: Uuid) {
        *self.identity_hint.write().await = Some(id);
    }

    // ---- 步骤 ----

    pub async fn go_to_step(&self, index: usize) -> Result<ReviewStep> {
        self.with_session_mut(|sm, session| sm.go_to_step(session, index))
            .await
    }

    pub async fn advance(&self) -> Result<usize> {
        self.with_session_mut(|sm, session| sm.advance(session)).await
    }

    /// 完成步骤
    ///
    /// 完成患者选择步骤前先确认会话的持久 id；确认失败时步骤保持未完成。
    pub async fn complete_step(&self, index: usize, payload: Option<serde_json::Value>) -> Result<()> {
        if index == ReviewStep::PatientSelection.index() {
            let mut draft = self.snapshot().await.ok_or_else(no_active_session)?;
            self.state_machine
                .complete_step(&mut draft, index, payload.clone())?;

            if draft.id.is_none() {
                let patient_id = draft.patient_id.ok_or_else(|| {
                    MtrError::Validation("a patient must be selected".to_string())
                })?;
                let id = self.confirm_identity(patient_id).await?;
                let mut active = self.active.write().await;
                let session = active.as_mut().ok_or_else(no_active_session)?;
                let same_draft = session.created_at == draft.created_at
                    && session.patient_id.map_or(true, |p| p == patient_id);
                if !same_draft {
                    warn!(
                        "Active review changed while confirming id {} for patient {}",
                        id, patient_id
                    );
                    return Err(MtrError::Validation(
                        "the active review changed while its identity was being confirmed"
                            .to_string(),
                    ));
                }
                session.id.get_or_insert(id);
            }
        }

        self.with_session_mut(|sm, session| sm.complete_step(session, index, payload))
            .await
    }

    /// 为尚无 id 的本地会话向网关申请持久 id
    ///
    /// 网关中已有该患者进行中的会话时返回冲突，调用方应改为恢复该会话。
    async fn confirm_identity(&self, patient_id: Uuid) -> Result<Uuid> {
        let _guard = self.save_guard.lock().await;

        if let Some(existing) = self.gateway.load_in_progress(patient_id).await? {
            warn!(
                "Patient {} already has review {:?} in progress; local draft not linked",
                patient_id, existing.id
            );
            return Err(MtrError::Conflict {
                patient_id,
                session_id: existing.id,
            });
        }
        let session = self.gateway.create(patient_id).await?;

        let id = session.id.ok_or_else(|| {
            MtrError::Persistence(format!(
                "gateway returned a session without id for patient {}",
                patient_id
            ))
        })?;
        info!("Confirmed durable id {} for patient {}", id, patient_id);
        Ok(id)
    }

    // ---- 用药记录 ----

    pub async fn add_medication(&self, entry: MedicationEntry) -> Result<usize> {
        entry.validate()?;
        self.with_session_mut(|_, session| {
            ReviewStateMachine::ensure_in_progress(session)?;
            debug!("Adding medication {}", entry.drug_name);
            session.medications.push(entry);
            session.touch();
            Ok(session.medications.len() - 1)
        })
        .await
    }

    pub async fn update_medication(&self, index: usize, entry: MedicationEntry) -> Result<()> {
        entry.validate()?;
        self.with_session_mut(|_, session| {
            ReviewStateMachine::ensure_in_progress(session)?;
            let slot = session
                .medications
                .get_mut(index)
                .ok_or_else(|| MtrError::NotFound(format!("Medication {} not found", index)))?;
            *slot = entry;
            session.touch();
            Ok(())
        })
        .await
    }

    pub async fn remove_medication(&self, index: usize) -> Result<MedicationEntry> {
        self.with_session_mut(|_, session| {
            ReviewStateMachine::ensure_in_progress(session)?;
            if index >= session.medications.len() {
                return Err(MtrError::NotFound(format!("Medication {} not found", index)));
            }
            let removed = session.medications.remove(index);
            session.touch();
            Ok(removed)
        })
        .await
    }

    pub async fn set_patient_context(&self, context: PatientContext) -> Result<()> {
        self.with_session_mut(|_, session| {
            ReviewStateMachine::ensure_in_progress(session)?;
            session.patient_context = context;
            session.touch();
            Ok(())
        })
        .await
    }

    // ---- 评估 ----

    /// 运行四项常规检查，只追加新发现的问题
    pub async fn run_assessment(&self) -> Result<Reconciliation> {
        let engine = &self.engine;
        self.with_session_mut(|_, session| {
            ReviewStateMachine::ensure_in_progress(session)?;
            let report = engine.assess(&session.medications, &session.patient_context);
            Ok(Self::append_new(session, report.into_problems(), ASSESSMENT_SCOPE))
        })
        .await
    }

    /// 单独运行依从性检查
    pub async fn run_adherence_check(&self) -> Result<Reconciliation> {
        let engine = &self.engine;
        self.with_session_mut(|_, session| {
            ReviewStateMachine::ensure_in_progress(session)?;
            let problems = engine.assess_adherence(&session.medications);
            Ok(Self::append_new(session, problems, ADHERENCE_SCOPE))
        })
        .await
    }

    fn append_new(
        session: &mut MtrSession,
        problems: Vec<DrugTherapyProblem>,
        scope: &[ProblemType],
    ) -> Reconciliation {
        let reconciliation = reconcile(&session.ledger.problems, problems, scope);
        for problem in reconciliation.new_problems() {
            session.ledger.record_problem(problem.clone());
        }
        session.touch();

        info!(
            "Review {:?}: {} new problems, {} already open, {} no longer detected",
            session.id,
            reconciliation.new_count(),
            reconciliation.already_open_count(),
            reconciliation.no_longer_detected().len()
        );
        reconciliation
    }

    // ---- 台账 ----

    pub async fn record_manual_problem(&self, input: NewProblem) -> Result<Uuid> {
        self.with_ledger(|ledger| ledger.record_manual_problem(input)).await
    }

    pub async fn update_problem_status(&self, id: Uuid, status: ProblemStatus) -> Result<()> {
        self.with_ledger(|ledger| ledger.update_problem_status(id, status))
            .await
    }

    pub async fn record_intervention(&self, input: NewIntervention) -> Result<Uuid> {
        self.with_ledger(|ledger| ledger.record_intervention(input)).await
    }

    pub async fn record_intervention_outcome(
        &self,
        id: Uuid,
        outcome: InterventionOutcome,
        notes: Option<String>,
    ) -> Result<()> {
        self.with_ledger(|ledger| ledger.record_intervention_outcome(id, outcome, notes))
            .await
    }

    pub async fn schedule_follow_up(&self, input: NewFollowUp) -> Result<Uuid> {
        self.with_ledger(|ledger| ledger.schedule_follow_up(input)).await
    }

    pub async fn complete_follow_up(&self, id: Uuid, outcome: String) -> Result<()> {
        self.with_ledger(|ledger| ledger.complete_follow_up(id, outcome))
            .await
    }

    pub async fn mark_follow_up_missed(&self, id: Uuid) -> Result<()> {
        self.with_ledger(|ledger| ledger.mark_follow_up_missed(id)).await
    }

    pub async fn cancel_follow_up(&self, id: Uuid, reason: Option<String>) -> Result<()> {
        self.with_ledger(|ledger| ledger.cancel_follow_up(id, reason))
            .await
    }

    pub async fn reschedule_follow_up(
        &self,
        id: Uuid,
        new_date: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<()> {
        self.with_ledger(|ledger| ledger.reschedule_follow_up(id, new_date, reason))
            .await
    }

    // ---- 保存与生命周期 ----

    /// 手动保存；自动保存进行中时等待其结束，失败直接返回给调用方
    pub async fn save(&self) -> Result<DateTime<Utc>> {
        let _guard = self.save_guard.lock().await;
        self.save_locked().await
    }

    /// 已持有保存锁时写入当前快照
    pub(crate) async fn save_locked(&self) -> Result<DateTime<Utc>> {
        let snapshot = self.snapshot().await.ok_or_else(no_active_session)?;
        let stored = self.gateway.upsert(&snapshot).await?;

        if snapshot.id.is_none() {
            if let Some(session) = self.active.write().await.as_mut() {
                session.id = session.id.or(stored.id);
            }
        }

        let saved_at = Utc::now();
        *self.last_saved_at.write().await = Some(saved_at);
        debug!("Saved review {:?}", stored.id);
        Ok(saved_at)
    }

    /// 完成评估，返回会话的持久 id
    ///
    /// 前四个步骤未全部完成时返回前置条件错误。持久 id 依次从内存会话、
    /// 重新读取的活动会话和外部 id 线索中恢复，全部失败时返回身份恢复错误。
    /// 取得保存锁后重新检查状态，进行中的取消先生效。
    pub async fn complete_review(&self) -> Result<Uuid> {
        let snapshot = self.snapshot().await.ok_or_else(no_active_session)?;
        self.ensure_completable(&snapshot)?;

        let _guard = self.save_guard.lock().await;
        let current = self.snapshot().await.ok_or_else(no_active_session)?;
        self.ensure_completable(&current)?;

        let id = self.recover_identity(snapshot.id).await?;

        let latest = {
            let mut active = self.active.write().await;
            let session = active.as_mut().ok_or_else(no_active_session)?;
            session.id = Some(id);
            session.clone()
        };

        self.gateway.upsert(&latest).await?;
        let stored = self.gateway.complete(id).await?;

        {
            let mut active = self.active.write().await;
            let session = active.as_mut().ok_or_else(no_active_session)?;
            self.state_machine.apply(session, SessionEvent::Complete)?;
            session.completed_at = stored.completed_at.or(session.completed_at);
        }
        *self.last_saved_at.write().await = Some(Utc::now());

        info!("Review {} completed", id);
        Ok(id)
    }

    fn ensure_completable(&self, session: &MtrSession) -> Result<()> {
        if !self.state_machine.can_complete(session) {
            return Err(MtrError::Precondition(format!(
                "steps 1-4 must be completed before finishing the review ({}% done)",
                self.state_machine.completion_percentage(session)
            )));
        }
        self.state_machine
            .transition(session.status, SessionEvent::Complete)
            .map(|_| ())
    }

    async fn recover_identity(&self, in_memory: Option<Uuid>) -> Result<Uuid> {
        if let Some(id) = in_memory {
            return Ok(id);
        }

        let reread = self.snapshot().await.ok_or_else(no_active_session)?;
        if let Some(id) = reread.id {
            info!("Recovered review id {} from the active session", id);
            return Ok(id);
        }

        let hint = *self.identity_hint.read().await;
        if let Some(hint) = hint {
            match self.gateway.load(hint).await {
                Ok(stored) if stored.patient_id == reread.patient_id => {
                    info!("Recovered review id {} from the identity hint", hint);
                    return Ok(hint);
                }
                Ok(stored) => warn!(
                    "Identity hint {} belongs to patient {:?}, not {:?}",
                    hint, stored.patient_id, reread.patient_id
                ),
                Err(e) => warn!("Identity hint {} could not be loaded: {}", hint, e),
            }
        }

        Err(MtrError::IdentityRecovery(format!(
            "no durable id for the review of patient {:?}",
            reread.patient_id
        )))
    }

    /// 取消评估；可重复调用
    ///
    /// 进行中的保存或完成结束后才生效，届时按最新状态重新检查。
    pub async fn cancel_review(&self) -> Result<()> {
        let snapshot = self.snapshot().await.ok_or_else(no_active_session)?;
        self.state_machine
            .transition(snapshot.status, SessionEvent::Cancel)?;

        let _guard = self.save_guard.lock().await;
        let current = self.snapshot().await.ok_or_else(no_active_session)?;
        self.state_machine
            .transition(current.status, SessionEvent::Cancel)?;

        let id = current.id;
        if let Some(id) = id {
            self.gateway.cancel(id).await?;
        }

        self.with_session_mut(|sm, session| sm.apply(session, SessionEvent::Cancel).map(|_| ()))
            .await?;
        info!("Review {:?} cancelled", id);
        Ok(())
    }

    /// 暂停评估
    pub async fn put_on_hold(&self) -> Result<()> {
        self.change_status(SessionEvent::Hold).await
    }

    /// 从暂停中恢复
    pub async fn resume_from_hold(&self) -> Result<()> {
        self.change_status(SessionEvent::Resume).await
    }

    async fn change_status(&self, event: SessionEvent) -> Result<()> {
        let durable = self
            .with_session_mut(|sm, session| {
                sm.apply(session, event)?;
                Ok(session.has_durable_id())
            })
            .await?;

        if durable {
            self.save().await?;
        }
        Ok(())
    }

    // ---- 只读选择器 ----

    pub async fn snapshot(&self) -> Option<MtrSession> {
        self.active.read().await.clone()
    }

    pub async fn current_step(&self) -> Option<ReviewStep> {
        self.active.read().await.as_ref().map(MtrSession::current_step)
    }

    pub async fn completion_percentage(&self) -> u8 {
        self.active
            .read()
            .await
            .as_ref()
            .map_or(0, |s| self.state_machine.completion_percentage(s))
    }

    pub async fn can_complete(&self) -> bool {
        self.active
            .read()
            .await
            .as_ref()
            .is_some_and(|s| self.state_machine.can_complete(s))
    }

    pub async fn step_status(&self, index: usize) -> Option<StepStatus> {
        let active = self.active.read().await;
        active
            .as_ref()
            .and_then(|s| self.state_machine.step_status(s, index))
    }

    pub async fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        *self.last_saved_at.read().await
    }

    pub fn set_autosave_enabled(&self, enabled: bool) {
        info!("Auto-save {}", if enabled { "enabled" } else { "disabled" });
        self.autosave_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn autosave_enabled(&self) -> bool {
        self.autosave_enabled.load(Ordering::SeqCst)
    }

    /// 是否有保存正在进行
    pub fn save_in_flight(&self) -> bool {
        self.save_guard.try_lock().is_err()
    }

    pub async fn summary(&self) -> Result<ReviewSummary> {
        let session = self.snapshot().await.ok_or_else(no_active_session)?;
        Ok(ReviewSummary {
            session_id: session.id,
            patient_id: session.patient_id,
            status: session.status,
            current_step: session.current_step(),
            current_step_index: session.current_step_index,
            completion_percentage: self.state_machine.completion_percentage(&session),
            can_complete: self.state_machine.can_complete(&session),
            medication_count: session.medications.len(),
            ledger: session.ledger.summary(Utc::now()),
            last_saved_at: self.last_saved_at().await,
        })
    }

    async fn with_session_mut<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&ReviewStateMachine, &mut MtrSession) -> Result<T>,
    {
        let mut active = self.active.write().await;
        let session = active.as_mut().ok_or_else(no_active_session)?;
        apply(&self.state_machine, session)
    }

    async fn with_ledger<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut ReviewLedger) -> Result<T>,
    {
        self.with_session_mut(|_, session| {
            let result = apply(&mut session.ledger)?;
            session.touch();
            Ok(result)
        })
        .await
    }
}
