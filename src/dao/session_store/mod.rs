#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use crate::dao::models::{SessionEntity, SessionSummaryEntity};
use crate::dao::storage::StorageResult;
use futures::future::BoxFuture;
use uuid::Uuid;

pub use memory::MemorySessionStore;

/// Abstraction over the persistence layer for quiz sessions.
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session.
    fn save_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>>;
    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    fn list_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<SessionSummaryEntity>>>;
    /// Remove a session, returning whether it existed.
    fn delete_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
