use mongodb::bson::{self, DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dao::models::{
    AnswerEntity, BoardEntity, BuzzerEntity, QuestionInstanceEntity, SessionEntity,
    SessionStatusEntity, SessionSummaryEntity, TeamEntity,
};

/// Session as stored in the `sessions` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    id: bson::Uuid,
    name: String,
    status: SessionStatusEntity,
    created_at: DateTime,
    updated_at: DateTime,
    teams: Vec<TeamEntity>,
    #[serde(default)]
    active_instance: Option<QuestionInstanceEntity>,
    #[serde(default)]
    instance_sequence: u32,
    buzzer: BuzzerEntity,
    board: BoardEntity,
    #[serde(default)]
    answers: Vec<AnswerEntity>,
    version: i64,
    state_updated_at: i64,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: bson_uuid(value.id),
            name: value.name,
            status: value.status,
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
            teams: value.teams,
            active_instance: value.active_instance,
            instance_sequence: value.instance_sequence,
            buzzer: value.buzzer,
            board: value.board,
            answers: value.answers,
            version: i64::try_from(value.version).unwrap_or(i64::MAX),
            state_updated_at: i64::try_from(value.state_updated_at).unwrap_or(i64::MAX),
        }
    }
}

impl From<MongoSessionDocument> for SessionEntity {
    fn from(value: MongoSessionDocument) -> Self {
        Self {
            id: Uuid::from_bytes(value.id.bytes()),
            name: value.name,
            status: value.status,
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
            teams: value.teams,
            active_instance: value.active_instance,
            instance_sequence: value.instance_sequence,
            buzzer: value.buzzer,
            board: value.board,
            answers: value.answers,
            version: u64::try_from(value.version).unwrap_or_default(),
            state_updated_at: u64::try_from(value.state_updated_at).unwrap_or_default(),
        }
    }
}

impl From<MongoSessionDocument> for SessionSummaryEntity {
    fn from(value: MongoSessionDocument) -> Self {
        let entity = SessionEntity::from(value);
        SessionSummaryEntity::from(&entity)
    }
}

fn bson_uuid(id: Uuid) -> bson::Uuid {
    bson::Uuid::from_bytes(id.into_bytes())
}

/// Filter selecting a session by primary key.
pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": bson_uuid(id)}
}
