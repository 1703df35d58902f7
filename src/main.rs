//! Live quiz backend entrypoint wiring REST, the channel transport and the session store.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_quiz_back::{
    config::AppConfig,
    dao::{
        session_store::{MemorySessionStore, SessionStore},
        storage::StorageError,
    },
    routes,
    services::{
        storage_supervisor,
        transport::{RealtimeConfig, RealtimeTransport},
    },
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let app_state = build_state(config)?;

    spawn_storage_supervisor(app_state.clone())?;
    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state.clone());

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    app_state.transport().disconnect().await;
    Ok(())
}

/// Pick the channel transport from `TRANSPORT_BACKEND` (`hub` by default).
fn build_state(config: AppConfig) -> anyhow::Result<SharedState> {
    let backend = env::var("TRANSPORT_BACKEND").unwrap_or_else(|_| "hub".into());
    match backend.as_str() {
        "hub" => {
            info!("using the private channel hub on /ws");
            Ok(AppState::with_local_hub(config))
        }
        "realtime" => {
            let realtime = RealtimeConfig::from_env()
                .context("TRANSPORT_BACKEND=realtime requires REALTIME_URL")?;
            info!(url = %realtime.url, "using the hosted realtime service");
            let transport = RealtimeTransport::start(realtime);
            Ok(AppState::new(config, Arc::new(transport), None))
        }
        other => bail!("unknown TRANSPORT_BACKEND `{other}`"),
    }
}

/// Start the storage supervisor for the backend named by `STORE_BACKEND`.
fn spawn_storage_supervisor(state: SharedState) -> anyhow::Result<()> {
    let backend = env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".into());
    info!(backend = %backend, "starting session store supervisor");
    match backend.as_str() {
        "memory" => {
            let store = MemorySessionStore::new();
            tokio::spawn(storage_supervisor::run(state, move || {
                let store: Arc<dyn SessionStore> = Arc::new(store.clone());
                async move { Ok::<_, StorageError>(store) }
            }));
        }
        #[cfg(feature = "mongo-store")]
        "mongo" => {
            use live_quiz_back::dao::session_store::mongodb::{MongoConfig, MongoSessionStore};

            let uri = env::var("MONGO_URI").unwrap_or_else(|_| "mongodb://localhost:27017".into());
            let db_name = env::var("MONGO_DB").ok();
            tokio::spawn(storage_supervisor::run(state, move || {
                let uri = uri.clone();
                let db_name = db_name.clone();
                async move {
                    let config = MongoConfig::from_uri(&uri, db_name.as_deref()).await?;
                    let store = MongoSessionStore::connect(config).await?;
                    Ok::<Arc<dyn SessionStore>, StorageError>(Arc::new(store))
                }
            }));
        }
        #[cfg(feature = "couch-store")]
        "couch" => {
            use live_quiz_back::dao::session_store::couchdb::{CouchConfig, CouchSessionStore};

            tokio::spawn(storage_supervisor::run(state, move || async move {
                let config = CouchConfig::from_env()?;
                let store = CouchSessionStore::connect(config).await?;
                Ok::<Arc<dyn SessionStore>, StorageError>(Arc::new(store))
            }));
        }
        other => bail!("unsupported STORE_BACKEND `{other}`"),
    }
    Ok(())
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(error = %err, "cannot install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
