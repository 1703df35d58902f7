//! Shared fixtures for service tests.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::session_store::MemorySessionStore,
    dto::{
        envelope::session_channel,
        session::{CreateSessionRequest, TeamInput},
    },
    services::{session_service, transport::Subscription},
    state::{AppState, SharedState},
};

/// An active session backed by an in-memory store and the private hub.
pub struct Fixture {
    pub state: SharedState,
    pub store: MemorySessionStore,
    pub session_id: Uuid,
    /// Team identifiers in roster order.
    pub teams: Vec<Uuid>,
}

impl Fixture {
    /// Join the session channel the way a mirror would.
    pub async fn join_session(&self) -> Subscription {
        self.state
            .transport()
            .subscribe(&session_channel(self.session_id))
            .await
            .unwrap()
    }
}

pub fn session_request(name: &str, teams: usize) -> CreateSessionRequest {
    CreateSessionRequest {
        name: name.to_owned(),
        teams: (0..teams)
            .map(|index| TeamInput {
                name: format!("Team {}", index + 1),
                color: None,
            })
            .collect(),
    }
}

/// Create and activate a session with `teams` teams.
pub async fn live_fixture(teams: usize) -> Fixture {
    let state = AppState::with_local_hub(AppConfig::default());
    let store = MemorySessionStore::new();
    state.set_session_store(Arc::new(store.clone())).await;

    let summary = session_service::create(&state, session_request("quiz night", teams))
        .await
        .unwrap();
    let snapshot = session_service::activate(&state, summary.id).await.unwrap();
    let teams = snapshot.teams.iter().map(|team| team.id).collect();

    Fixture {
        state,
        store,
        session_id: summary.id,
        teams,
    }
}
