pub mod arbiter;
pub mod game;
pub mod presence;
pub mod session;
pub mod timer;

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::session_store::SessionStore,
    dto::{
        envelope::{ChannelEvent, presence_channel, session_channel},
        session::SessionSnapshot,
        team::TeamSummary,
    },
    error::ServiceError,
    services::transport::{LocalHub, Transport},
    state::{
        game::{GameState, SessionStatus},
        presence::PresenceTracker,
        session::LiveSession,
    },
};

pub type SharedState = Arc<AppState>;

/// Events queued by a write and published once it is committed.
pub type Outbox = Vec<ChannelEvent>;

/// Central application state: storage handle, transport, the live session and
/// the runtime registries around it.
pub struct AppState {
    config: Arc<AppConfig>,
    session_store: RwLock<Option<Arc<dyn SessionStore>>>,
    degraded: watch::Sender<bool>,
    transport: Arc<dyn Transport>,
    hub: Option<LocalHub>,
    live: RwLock<Option<LiveSession>>,
    presence: PresenceTracker,
    write_gate: Mutex<()>,
    command_timeout: Option<Duration>,
    session_tasks: StdMutex<Vec<JoinHandle<()>>>,
    timer_task: StdMutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig, transport: Arc<dyn Transport>, hub: Option<LocalHub>) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let command_timeout = Some(config.timing.command_timeout);
        Arc::new(Self {
            config: Arc::new(config),
            session_store: RwLock::new(None),
            degraded: degraded_tx,
            transport,
            hub,
            live: RwLock::new(None),
            presence: PresenceTracker::new(),
            write_gate: Mutex::new(()),
            command_timeout,
            session_tasks: StdMutex::new(Vec::new()),
            timer_task: StdMutex::new(None),
        })
    }

    /// State whose transport is a private in-process hub, also served on `/ws`.
    pub fn with_local_hub(config: AppConfig) -> SharedState {
        let hub = LocalHub::new();
        Self::new(config, Arc::new(hub.clone()), Some(hub))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Private hub, when it is the configured transport.
    pub fn hub(&self) -> Option<&LocalHub> {
        self.hub.as_ref()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Server time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.transport.now()
    }

    /// Obtain a handle to the current session store, if one is installed.
    pub async fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        let guard = self.session_store.read().await;
        guard.as_ref().cloned()
    }

    /// Current session store, or [`ServiceError::Degraded`] while storage is unhealthy.
    pub async fn require_session_store(&self) -> Result<Arc<dyn SessionStore>, ServiceError> {
        if *self.degraded.borrow() {
            return Err(ServiceError::Degraded);
        }
        self.session_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new session store implementation and leave degraded mode.
    pub async fn set_session_store(&self, store: Arc<dyn SessionStore>) {
        {
            let mut guard = self.session_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false).await;
    }

    /// Remove the current session store and enter degraded mode.
    pub async fn clear_session_store(&self) {
        {
            let mut guard = self.session_store.write().await;
            guard.take();
        }
        self.update_degraded(true).await;
    }

    /// Current degraded flag.
    pub async fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub async fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Identifier of the loaded session.
    pub async fn live_session_id(&self) -> Option<Uuid> {
        self.live.read().await.as_ref().map(LiveSession::id)
    }

    /// Run `f` against the loaded session.
    pub async fn read_live<R>(&self, f: impl FnOnce(Option<&LiveSession>) -> R) -> R {
        let guard = self.live.read().await;
        f(guard.as_ref())
    }

    /// Loaded session, or [`ServiceError::InvalidState`] when none is active.
    pub async fn require_live_id(&self) -> Result<Uuid, ServiceError> {
        self.live_session_id()
            .await
            .ok_or_else(|| ServiceError::InvalidState("no live session".into()))
    }

    /// Serialize a mutation of the live session.
    ///
    /// The work runs on a clone of the live session. The draft is persisted
    /// (bounded by the command timeout) and only then committed and broadcast:
    /// a `state:update` diff followed by the events queued in the outbox. Any
    /// failure discards the draft and nothing is published. Writes are refused
    /// unless the session is active.
    pub async fn run_write<T, F>(&self, work: F) -> Result<(T, GameState), ServiceError>
    where
        F: FnOnce(&mut LiveSession, &mut Outbox) -> Result<T, ServiceError>,
    {
        self.write_live(true, work).await
    }

    /// Like [`AppState::run_write`] but allowed whatever the session status.
    pub async fn run_lifecycle_write<T, F>(&self, work: F) -> Result<(T, GameState), ServiceError>
    where
        F: FnOnce(&mut LiveSession, &mut Outbox) -> Result<T, ServiceError>,
    {
        self.write_live(false, work).await
    }

    async fn write_live<T, F>(&self, require_active: bool, work: F) -> Result<(T, GameState), ServiceError>
    where
        F: FnOnce(&mut LiveSession, &mut Outbox) -> Result<T, ServiceError>,
    {
        let _gate = self.write_gate.lock().await;
        let store = self.require_session_store().await?;

        let mut draft = {
            let guard = self.live.read().await;
            guard
                .clone()
                .ok_or_else(|| ServiceError::InvalidState("no live session".into()))?
        };
        if require_active && draft.session.status != SessionStatus::Active {
            return Err(ServiceError::InvalidState(format!(
                "session `{}` is not active",
                draft.id()
            )));
        }

        let before = draft.game_state();
        let mut outbox = Outbox::new();
        let value = work(&mut draft, &mut outbox)?;
        draft.touch(self.now_ms());

        self.persist(store.as_ref(), &draft).await?;

        let after = draft.game_state();
        let channel = session_channel(draft.id());
        {
            let mut guard = self.live.write().await;
            *guard = Some(draft);
        }

        let patch = before.diff(&after);
        self.publish_on(&channel, ChannelEvent::StateUpdate(patch)).await;
        for event in outbox {
            self.publish_on(&channel, event).await;
        }
        Ok((value, after))
    }

    /// Save `live` through `store`, bounded by the command timeout.
    pub async fn persist(&self, store: &dyn SessionStore, live: &LiveSession) -> Result<(), ServiceError> {
        let save = store.save_session(live.to_entity());
        match self.command_timeout {
            Some(limit) => match timeout(limit, save).await {
                Ok(result) => result.map_err(ServiceError::from),
                Err(_) => {
                    warn!(session_id = %live.id(), "persisting the session timed out");
                    Err(ServiceError::Timeout)
                }
            },
            None => save.await.map_err(ServiceError::from),
        }
    }

    /// Take the write gate for work that replaces the live session wholesale.
    pub async fn write_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Install (or clear) the live session. Callers hold the write gate.
    pub async fn replace_live(&self, live: Option<LiveSession>) -> Option<LiveSession> {
        let mut guard = self.live.write().await;
        std::mem::replace(&mut *guard, live)
    }

    /// Full picture of the live session, stamped after every committed write.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, ServiceError> {
        let _gate = self.write_gate.lock().await;
        self.snapshot_unlocked().await
    }

    /// Publish `state:full` under the write gate so no delta overtakes it.
    pub async fn publish_snapshot(&self) -> Result<SessionSnapshot, ServiceError> {
        let _gate = self.write_gate.lock().await;
        let snapshot = self.snapshot_unlocked().await?;
        self.publish(ChannelEvent::StateFull(Box::new(snapshot.clone())))
            .await;
        Ok(snapshot)
    }

    pub(crate) async fn snapshot_unlocked(&self) -> Result<SessionSnapshot, ServiceError> {
        let guard = self.live.read().await;
        let live = guard
            .as_ref()
            .ok_or_else(|| ServiceError::InvalidState("no live session".into()))?;
        Ok(SessionSnapshot {
            state: live.game_state(),
            teams: self.team_summaries(live),
            ts: self.now_ms(),
        })
    }

    /// Roster of `live` with presence merged in.
    pub fn team_summaries(&self, live: &LiveSession) -> Vec<TeamSummary> {
        live.teams
            .iter()
            .map(|(id, team)| TeamSummary::new(*id, team, self.presence.get(*id).as_ref()))
            .collect()
    }

    /// Publish on the session channel of the live session.
    ///
    /// Failures are logged; mirrors catch up through their reconciliation pass.
    pub async fn publish(&self, event: ChannelEvent) {
        let Some(session_id) = self.live_session_id().await else {
            debug!(event = event.name(), "no live session; event dropped");
            return;
        };
        self.publish_on(&session_channel(session_id), event).await;
    }

    /// Publish on an explicit channel, logging failures.
    pub async fn publish_on(&self, channel: &str, event: ChannelEvent) {
        let name = event.name();
        if let Err(err) = self.transport.publish(channel, event).await {
            warn!(channel, event = name, error = %err, "failed to publish event");
        }
    }

    /// Channel names of the live session: game then presence.
    pub async fn live_channels(&self) -> Option<(String, String)> {
        self.live_session_id()
            .await
            .map(|id| (session_channel(id), presence_channel(id)))
    }

    /// Let the transport forget the channels of a session that is no longer live.
    pub fn release_channels(&self, session_id: Uuid) {
        self.transport.release(&session_channel(session_id));
        self.transport.release(&presence_channel(session_id));
    }

    /// Register background tasks bound to the live session.
    pub fn add_session_task(&self, handle: JoinHandle<()>) {
        self.session_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Abort every task bound to the previous live session, timer included.
    pub fn stop_session_tasks(&self) {
        let handles = std::mem::take(
            &mut *self
                .session_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
        self.replace_timer_task(None);
    }

    /// Install a new countdown task, aborting the previous one.
    pub fn replace_timer_task(&self, handle: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self.timer_task.lock().unwrap_or_else(PoisonError::into_inner),
            handle,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}
