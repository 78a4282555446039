use axum::{
    extract::FromRef,
    routing::{get, post},
    Json, Router,
};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::compose::Composer;
use crate::config::MailSettings;
use crate::models::{BlacklistRepository, OutgoingMailRepository};
use crate::outbound::TransferWorker;
use crate::spam::SpamChecker;
use crate::sync::SyncService;

mod blacklist;
mod error;
mod inbound;
mod outbound;
mod spamd;
mod track;

pub use error::{ApiError, ApiResult};

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pool: PgPool,
    settings: MailSettings,
    composer: Arc<Composer>,
    transfer: Arc<TransferWorker>,
    sync: SyncService,
    spam: SpamChecker,
}

/// Caller identity from the (upstream-authenticated) request headers.
pub(crate) fn request_context(headers: &axum::http::HeaderMap) -> crate::Context {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_owned())
    };

    crate::Context {
        user: header("X-User").unwrap_or_else(|| "guest".to_owned()),
        request_ip: header("X-Forwarded-For").unwrap_or_else(|| "127.0.0.1".to_owned()),
        site: header("X-Site"),
        system_manager: header("X-Roles")
            .is_some_and(|roles| roles.split(',').any(|r| r.trim() == "system_manager")),
        postmaster: header("X-Roles")
            .is_some_and(|roles| roles.split(',').any(|r| r.trim() == "postmaster")),
    }
}

impl FromRef<ApiState> for PgPool {
    fn from_ref(state: &ApiState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<ApiState> for MailSettings {
    fn from_ref(state: &ApiState) -> Self {
        state.settings.clone()
    }
}

impl FromRef<ApiState> for Arc<Composer> {
    fn from_ref(state: &ApiState) -> Self {
        state.composer.clone()
    }
}

impl FromRef<ApiState> for Arc<TransferWorker> {
    fn from_ref(state: &ApiState) -> Self {
        state.transfer.clone()
    }
}

impl FromRef<ApiState> for SyncService {
    fn from_ref(state: &ApiState) -> Self {
        state.sync.clone()
    }
}

impl FromRef<ApiState> for SpamChecker {
    fn from_ref(state: &ApiState) -> Self {
        state.spam.clone()
    }
}

impl FromRef<ApiState> for OutgoingMailRepository {
    fn from_ref(state: &ApiState) -> Self {
        OutgoingMailRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for BlacklistRepository {
    fn from_ref(state: &ApiState) -> Self {
        BlacklistRepository::new(state.pool.clone())
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        socket: SocketAddr,
        pool: PgPool,
        composer: Arc<Composer>,
        transfer: Arc<TransferWorker>,
        settings: MailSettings,
        shutdown: CancellationToken,
    ) -> ApiServer {
        let state = ApiState {
            sync: SyncService::new(pool.clone(), settings.clone()),
            spam: SpamChecker::new(&settings),
            pool,
            settings,
            composer,
            transfer,
        };

        let router = Router::new()
            .route("/healthy", get(healthy))
            .route("/track/open", get(track::open))
            .route("/blacklist", get(blacklist::lookup))
            .route("/spamd/scan", post(spamd::scan))
            .route("/spamd/is_spam", post(spamd::is_spam))
            .route("/spamd/score", post(spamd::score))
            .route("/outbound/submit", post(outbound::submit))
            .route("/inbound/pull", get(inbound::pull))
            .route("/inbound/pull_raw", get(inbound::pull_raw))
            .layer((
                TraceLayer::new_for_http(),
                TimeoutLayer::new(Duration::from_secs(30)),
            ))
            .with_state(state);

        ApiServer {
            socket,
            router: Router::new().nest("/api", router),
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(&self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(crate::shutdown_signal(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                tracing::error!("API server failed: {e}");
            }
        })
    }
}

async fn healthy() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
