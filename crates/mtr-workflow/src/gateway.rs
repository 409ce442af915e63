//! 持久化网关
//!
//! 会话的异步保存与加载接口，以及内存和 JSON 文件两种实现。
//! 状态机只调用网关，网关从不回调状态机。

use async_trait::async_trait;
use chrono::Utc;
use mtr_core::{MtrError, MtrSession, Result, SessionStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 持久化网关接口
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// 为患者创建新会话并分配持久 id
    async fn create(&self, patient_id: Uuid) -> Result<MtrSession>;

    /// 按 id 加载会话
    async fn load(&self, id: Uuid) -> Result<MtrSession>;

    /// 加载患者进行中的会话
    async fn load_in_progress(&self, patient_id: Uuid) -> Result<Option<MtrSession>>;

    /// 保存完整会话快照；无 id 的会话在首次保存时分配 id
    async fn upsert(&self, session: &MtrSession) -> Result<MtrSession>;

    /// 将会话标记为已完成
    async fn complete(&self, id: Uuid) -> Result<MtrSession>;

    /// 将会话标记为已取消，重复调用无副作用
    async fn cancel(&self, id: Uuid) -> Result<()>;
}

/// 首次保存时分配 id
fn with_identity(session: &MtrSession) -> MtrSession {
    let mut stored = session.clone();
    if stored.id.is_none() {
        stored.id = Some(Uuid::new_v4());
    }
    stored.updated_at = Utc::now();
    stored
}

/// 每位患者至多一个进行中的会话
fn ensure_single_in_progress<'a>(
    candidate: &MtrSession,
    others: impl IntoIterator<Item = &'a MtrSession>,
) -> Result<()> {
    if candidate.status != SessionStatus::InProgress {
        return Ok(());
    }
    let Some(patient_id) = candidate.patient_id else {
        return Ok(());
    };

    for other in others {
        if other.id != candidate.id
            && other.patient_id == Some(patient_id)
            && other.status == SessionStatus::InProgress
        {
            return Err(MtrError::Conflict {
                patient_id,
                session_id: other.id,
            });
        }
    }
    Ok(())
}

fn rejected(session: &MtrSession, event: &str) -> MtrError {
    MtrError::InvalidStateTransition {
        from: session.status.to_string(),
        event: event.to_string(),
    }
}

/// 已完成的会话重复完成无副作用；已取消或暂停的会话不能完成
fn mark_completed(session: &mut MtrSession) -> Result<()> {
    match session.status {
        SessionStatus::Completed => return Ok(()),
        SessionStatus::InProgress => {}
        _ => return Err(rejected(session, "Complete")),
    }
    let now = Utc::now();
    session.status = SessionStatus::Completed;
    session.completed_at.get_or_insert(now);
    session.updated_at = now;
    Ok(())
}

/// 已归档的会话不能取消；重复取消无副作用
fn mark_cancelled(session: &mut MtrSession) -> Result<()> {
    match session.status {
        SessionStatus::Cancelled => return Ok(()),
        SessionStatus::Completed => return Err(rejected(session, "Cancel")),
        _ => {}
    }
    session.status = SessionStatus::Cancelled;
    session.updated_at = Utc::now();
    Ok(())
}

/// 内存网关
///
/// 用于演示和测试；提供可切换的故障开关与可选的模拟延迟。
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    sessions: RwLock<HashMap<Uuid, MtrSession>>,
    unavailable: AtomicBool,
    latency: Option<Duration>,
    upserts: AtomicUsize,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次调用前等待指定时长
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// 模拟传输故障
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 成功的 upsert 次数
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub async fn stored(&self, id: Uuid) -> Option<MtrSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    async fn call(&self, operation: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            warn!("In-memory gateway rejected {}: unavailable", operation);
            return Err(MtrError::Persistence(format!(
                "gateway unavailable during {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn create(&self, patient_id: Uuid) -> Result<MtrSession> {
        self.call("create").await?;
        let session = with_identity(&MtrSession::new(patient_id));

        let mut sessions = self.sessions.write().await;
        ensure_single_in_progress(&session, sessions.values())?;

        let id = session.id.unwrap_or_default();
        sessions.insert(id, session.clone());
        info!("Created review session {} for patient {}", id, patient_id);
        Ok(session)
    }

    async fn load(&self, id: Uuid) -> Result<MtrSession> {
        self.call("load").await?;
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| MtrError::NotFound(format!("Review session {} not found", id)))
    }

    async fn load_in_progress(&self, patient_id: Uuid) -> Result<Option<MtrSession>> {
        self.call("load_in_progress").await?;
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.patient_id == Some(patient_id) && s.status == SessionStatus::InProgress)
            .cloned())
    }

    async fn upsert(&self, session: &MtrSession) -> Result<MtrSession> {
        self.call("upsert").await?;
        let stored = with_identity(session);

        let mut sessions = self.sessions.write().await;
        ensure_single_in_progress(&stored, sessions.values())?;

        let id = stored.id.unwrap_or_default();
        sessions.insert(id, stored.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        debug!("Upserted review session {}", id);
        Ok(stored)
    }

    async fn complete(&self, id: Uuid) -> Result<MtrSession> {
        self.call("complete").await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| MtrError::NotFound(format!("Review session {} not found", id)))?;
        mark_completed(session)?;
        info!("Review session {} completed", id);
        Ok(session.clone())
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        self.call("cancel").await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| MtrError::NotFound(format!("Review session {} not found", id)))?;
        mark_cancelled(session)?;
        info!("Review session {} cancelled", id);
        Ok(())
    }
}

/// JSON 文件网关，每个会话一个文件
#[derive(Debug)]
pub struct JsonFileGateway {
    data_dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileGateway {
    /// 打开（必要时创建）数据目录
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| io_error("create data directory", &data_dir, e))?;

        info!("JSON file gateway using {}", data_dir.display());
        Ok(Self {
            data_dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.data_dir.join(format!("{}.json", id))
    }

    async fn read_session(&self, path: &Path) -> Result<MtrSession> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| io_error("read session", path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            MtrError::Persistence(format!("corrupt session file {}: {}", path.display(), e))
        })
    }

    async fn read_all(&self) -> Result<Vec<MtrSession>> {
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| io_error("list sessions", &self.data_dir, e))?;

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list sessions", &self.data_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_session(&path).await {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Ignoring unreadable session file: {}", e),
            }
        }
        Ok(sessions)
    }

    async fn write_session(&self, session: &MtrSession) -> Result<()> {
        let id = session
            .id
            .ok_or_else(|| MtrError::Persistence("cannot write a session without id".to_string()))?;
        let path = self.session_path(id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error("write session", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("replace session", &path, e))?;
        Ok(())
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> Result<MtrSession>
    where
        F: FnOnce(&mut MtrSession) -> Result<()> + Send,
    {
        let _lock = self.write_lock.lock().await;
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(MtrError::NotFound(format!("Review session {} not found", id)));
        }
        let mut session = self.read_session(&path).await?;
        apply(&mut session)?;
        self.write_session(&session).await?;
        Ok(session)
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> MtrError {
    MtrError::Persistence(format!("failed to {} at {}: {}", action, path.display(), err))
}

#[async_trait]
impl PersistenceGateway for JsonFileGateway {
    async fn create(&self, patient_id: Uuid) -> Result<MtrSession> {
        let _lock = self.write_lock.lock().await;
        let session = with_identity(&MtrSession::new(patient_id));
        ensure_single_in_progress(&session, &self.read_all().await?)?;
        self.write_session(&session).await?;
        info!("Created review session file for patient {}", patient_id);
        Ok(session)
    }

    async fn load(&self, id: Uuid) -> Result<MtrSession> {
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(MtrError::NotFound(format!("Review session {} not found", id)));
        }
        self.read_session(&path).await
    }

    async fn load_in_progress(&self, patient_id: Uuid) -> Result<Option<MtrSession>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|s| s.patient_id == Some(patient_id) && s.status == SessionStatus::InProgress))
    }

    async fn upsert(&self, session: &MtrSession) -> Result<MtrSession> {
        let _lock = self.write_lock.lock().await;
        let stored = with_identity(session);
        ensure_single_in_progress(&stored, &self.read_all().await?)?;
        self.write_session(&stored).await?;
        debug!("Wrote review session file {:?}", stored.id);
        Ok(stored)
    }

    async fn complete(&self, id: Uuid) -> Result<MtrSession> {
        self.update(id, mark_completed).await
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        self.update(id, mark_cancelled).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_assigns_identity_once() {
        let gateway = InMemoryGateway::new();
        let session = MtrSession::new(Uuid::new_v4());

        let saved = gateway.upsert(&session).await.unwrap();
        let id = saved.id.unwrap();
        let saved_again = gateway.upsert(&saved).await.unwrap();

        assert_eq!(saved_again.id, Some(id));
        assert_eq!(gateway.upsert_count(), 2);
        assert!(gateway.stored(id).await.is_some());
    }

    #[tokio::test]
    async fn test_single_in_progress_per_patient() {
        let gateway = InMemoryGateway::new();
        let patient_id = Uuid::new_v4();
        let first = gateway.create(patient_id).await.unwrap();

        let second = gateway.create(patient_id).await;
        assert!(matches!(
            second,
            Err(MtrError::Conflict { session_id, .. }) if session_id == first.id
        ));

        gateway.cancel(first.id.unwrap()).await.unwrap();
        assert!(gateway.create(patient_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_outage_surfaces_persistence_error() {
        let gateway = InMemoryGateway::new();
        gateway.set_available(false);
        let result = gateway.create(Uuid::new_v4()).await;
        assert!(matches!(result, Err(MtrError::Persistence(_))));

        gateway.set_available(true);
        assert!(gateway.create(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let gateway = InMemoryGateway::new();
        let id = gateway.create(Uuid::new_v4()).await.unwrap().id.unwrap();
        gateway.cancel(id).await.unwrap();
        gateway.cancel(id).await.unwrap();
        assert_eq!(gateway.load(id).await.unwrap().status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_archived_sessions_keep_their_status() {
        let gateway = InMemoryGateway::new();
        let completed = gateway.create(Uuid::new_v4()).await.unwrap().id.unwrap();
        gateway.complete(completed).await.unwrap();
        assert!(matches!(
            gateway.cancel(completed).await,
            Err(MtrError::InvalidStateTransition { .. })
        ));
        assert!(gateway.complete(completed).await.is_ok());
        assert_eq!(gateway.load(completed).await.unwrap().status, SessionStatus::Completed);

        let cancelled = gateway.create(Uuid::new_v4()).await.unwrap().id.unwrap();
        gateway.cancel(cancelled).await.unwrap();
        assert!(matches!(
            gateway.complete(cancelled).await,
            Err(MtrError::InvalidStateTransition { .. })
        ));
        assert_eq!(gateway.load(cancelled).await.unwrap().status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_json_file_gateway_archived_sessions_keep_their_status() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::open(dir.path()).await.unwrap();

        let completed = gateway.create(Uuid::new_v4()).await.unwrap().id.unwrap();
        gateway.complete(completed).await.unwrap();
        assert!(matches!(
            gateway.cancel(completed).await,
            Err(MtrError::InvalidStateTransition { .. })
        ));
        assert_eq!(gateway.load(completed).await.unwrap().status, SessionStatus::Completed);

        let cancelled = gateway.create(Uuid::new_v4()).await.unwrap().id.unwrap();
        gateway.cancel(cancelled).await.unwrap();
        gateway.cancel(cancelled).await.unwrap();
        assert!(matches!(
            gateway.complete(cancelled).await,
            Err(MtrError::InvalidStateTransition { .. })
        ));
        assert_eq!(gateway.load(cancelled).await.unwrap().status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_json_file_gateway_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::open(dir.path().join("sessions")).await.unwrap();
        let patient_id = Uuid::new_v4();

        let created = gateway.create(patient_id).await.unwrap();
        let id = created.id.unwrap();

        let mut session = gateway.load(id).await.unwrap();
        session.current_step_index = 2;
        gateway.upsert(&session).await.unwrap();

        let in_progress = gateway.load_in_progress(patient_id).await.unwrap().unwrap();
        assert_eq!(in_progress.id, Some(id));
        assert_eq!(in_progress.current_step_index, 2);

        let completed = gateway.complete(id).await.unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert!(gateway.load_in_progress(patient_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_file_gateway_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = JsonFileGateway::open(dir.path()).await.unwrap();
        let result = gateway.load(Uuid::new_v4()).await;
        assert!(matches!(result, Err(MtrError::NotFound(_))));
        assert!(matches!(gateway.cancel(Uuid::new_v4()).await, Err(MtrError::NotFound(_))));
    }
}
