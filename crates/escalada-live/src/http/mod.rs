pub mod api;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::get;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auth::{Authorizer, Claims};
use crate::error::AuthError;
use crate::service::LiveService;

#[derive(Clone)]
pub struct HttpState {
    pub service: Arc<LiveService>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl HttpState {
    pub fn new(service: Arc<LiveService>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            service,
            authorizer,
        }
    }

    /// Bearer token from the `Authorization` header, else from `?token=`.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Claims, AuthError> {
        let token = bearer_token(headers)
            .or(query_token)
            .ok_or(AuthError::MissingToken)?;
        self.authorizer.authenticate(token)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .nest("/api", api::router())
        .with_state(state)
}

pub fn spawn_http_server(
    bind: SocketAddr,
    state: HttpState,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let app = router(state);
    tokio::spawn(async move {
        if let Err(err) = serve(bind, app, shutdown_tx).await {
            tracing::error!("http server error: {err}");
        }
    })
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind {addr}: {e}"))?;
    tracing::info!("HTTP server listening on http://{}", addr);
    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| format!("serve {addr}: {e}"))
}
