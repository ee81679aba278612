use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use relay_store::{Database, QueryRepo, SessionRepo};
use relay_telemetry::SqliteLogSink;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api;
use crate::config::ServerSettings;
use crate::connection::Connection;
use crate::handler::ChatHandler;
use crate::hub::Hub;
use crate::notify::{Notifier, NotifyQueue};
use crate::pump::{self, PumpContext, PumpSettings};
use crate::router::SessionRouter;
use crate::sessions::ChatService;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const LOG_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Persisted WARN+ logs served at `/logs` and pruned in the background.
#[derive(Clone)]
pub struct PersistedLogs {
    pub sink: Arc<SqliteLogSink>,
    pub retention_days: u32,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub handler: Arc<ChatHandler>,
    pub service: Arc<ChatService>,
    pub queries: Arc<QueryRepo>,
    pub log_sink: Option<Arc<SqliteLogSink>>,
    pub pump: PumpSettings,
    pub outbound_capacity: usize,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire hub, router, session service and handler over one database.
    pub fn new(
        db: Database,
        notices: NotifyQueue,
        settings: &ServerSettings,
        log_sink: Option<Arc<SqliteLogSink>>,
        shutdown: CancellationToken,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let service = Arc::new(ChatService::new(Arc::new(SessionRepo::new(db.clone())), notices));
        let handler = Arc::new(ChatHandler::new(
            Arc::clone(&service),
            SessionRouter::new(Arc::clone(&hub)),
        ));
        Self {
            hub,
            handler,
            service,
            queries: Arc::new(QueryRepo::new(db)),
            log_sink,
            pump: PumpSettings::from(settings),
            outbound_capacity: settings.outbound_capacity,
            shutdown,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/chat/sessions", get(api::list_sessions))
        .route("/chat/sessions/{id}", get(api::get_session))
        .route("/chatbot", post(api::submit_contact))
        .route("/queries", get(api::list_queries))
        .route("/logs", get(api::query_logs))
        .route("/health", get(api::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns once the socket is bound.
pub async fn start(
    settings: &ServerSettings,
    db: Database,
    notifier: Arc<dyn Notifier>,
    logs: Option<PersistedLogs>,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let (notices, notify_worker) = NotifyQueue::spawn(notifier, shutdown.child_token());
    let log_sink = logs.as_ref().map(|logs| Arc::clone(&logs.sink));
    let state = AppState::new(db, notices, settings, log_sink, shutdown.clone());
    let hub = Arc::clone(&state.hub);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "chat relay listening");

    let log_pruner = logs.map(|logs| {
        start_log_pruner(logs.sink, logs.retention_days, LOG_PRUNE_INTERVAL, shutdown.child_token())
    });

    let router = build_router(state);
    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        hub,
        shutdown,
        server,
        notify_worker,
        log_pruner,
    })
}

/// Periodically delete persisted log records older than `retention_days`.
pub fn start_log_pruner(
    sink: Arc<SqliteLogSink>,
    retention_days: u32,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sink = Arc::clone(&sink);
            match tokio::task::spawn_blocking(move || sink.prune(retention_days)).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => info!(removed, retention_days, "pruned persisted logs"),
                Ok(Err(e)) => warn!(error = %e, "log prune failed"),
                Err(e) => warn!(error = %e, "log prune task panicked"),
            }
        }
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    notify_worker: JoinHandle<()>,
    log_pruner: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn connection_count(&self) -> usize {
        self.hub.count()
    }

    /// Stop accepting, close every connection and wait briefly for tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let pruner = async {
            if let Some(task) = self.log_pruner {
                let _ = task.await;
            }
        };
        let drain = futures::future::join3(self.server, self.notify_worker, pruner);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown timed out, some tasks may still be running");
        }
        info!("chat relay stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // Slack over the frame limit so ingress sees the oversized frame and
    // closes with its own reason instead of a protocol error.
    let limit = state.pump.max_frame_size * 2;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn, outbound) = Connection::new(state.outbound_capacity);
    state.hub.register(Arc::clone(&conn));
    info!(connection_id = %conn.id(), "websocket connected");

    let ctx = PumpContext {
        hub: state.hub,
        handler: state.handler,
        settings: state.pump,
        shutdown: state.shutdown,
    };
    pump::serve(socket, conn, outbound, ctx).await;
}
