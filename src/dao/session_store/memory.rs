use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::{
    models::{SessionEntity, SessionSummaryEntity},
    session_store::SessionStore,
    storage::{StorageError, StorageResult},
};

/// Process-local store, used when no database is configured and by tests.
///
/// It can be switched offline to exercise the degraded paths.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<Uuid, SessionEntity>>,
    offline: Arc<AtomicBool>,
}

impl MemorySessionStore {
    /// Create an empty, reachable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Synchronous read used by tests to inspect what was persisted.
    pub fn get(&self, id: Uuid) -> Option<SessionEntity> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    fn check(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::offline("in-memory store is offline"))
        } else {
            Ok(())
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn save_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            store.sessions.insert(session.id, session);
            Ok(())
        })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            Ok(store.get(id))
        })
    }

    fn list_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionSummaryEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            let mut sessions: Vec<SessionSummaryEntity> = store
                .sessions
                .iter()
                .map(|entry| SessionSummaryEntity::from(entry.value()))
                .collect();
            sessions.sort_by_key(|session| session.created_at);
            Ok(sessions)
        })
    }

    fn delete_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.check()?;
            Ok(store.sessions.remove(&id).is_some())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.check() })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.health_check()
    }
}
