use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dao::models::SessionEntity;

pub const SESSION_PREFIX: &str = "session::";
pub const END_SUFFIX: &str = "\u{ffff}";

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    #[serde(default)]
    pub doc: Option<Value>,
}

/// Session document; the entity is stored flat next to the CouchDB keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchSessionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub session: SessionEntity,
}

impl CouchSessionDocument {
    pub fn new(session: SessionEntity, rev: Option<String>) -> Self {
        Self {
            id: session_doc_id(session.id),
            rev,
            session,
        }
    }
}

/// Minimal projection used to fetch the current revision.
#[derive(Debug, Deserialize)]
pub struct RevisionOnly {
    #[serde(rename = "_rev")]
    pub rev: String,
}

pub fn session_doc_id(id: Uuid) -> String {
    format!("{SESSION_PREFIX}{id}")
}
