//! HTTP server setup and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! # Graceful Shutdown
//!
//! On Ctrl-C or SIGTERM the server stops accepting connections and waits
//! for in-flight requests before returning.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use courier_broker::{BrokerHandle, QueueProvisioner, QueueRecord};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{handlers, management::ManagementClient};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Broker connection and channel pool
    pub broker: Arc<BrokerHandle>,
    /// Provisioned queue `POST /`, `/health` and `/stats` act on
    pub queue: Arc<QueueRecord>,
    /// Declares queues named on `POST /{queue}` on first use
    pub provisioner: QueueProvisioner,
    /// Management API client; `/stats` fails without one
    pub management: Option<Arc<ManagementClient>>,
}

impl AppState {
    /// Bundles the handler dependencies.
    pub fn new(
        broker: Arc<BrokerHandle>,
        queue: Arc<QueueRecord>,
        management: Option<ManagementClient>,
    ) -> Self {
        let provisioner = QueueProvisioner::new(Arc::clone(&broker));
        Self { broker, queue, provisioner, management: management.map(Arc::new) }
    }
}

/// Creates the router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use courier_api::{create_router, AppState};
///
/// fn build(state: AppState) {
///     let app = create_router(state, Duration::from_secs(30));
///     // Serve the app...
/// }
/// ```
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", post(handlers::publish))
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::queue_stats))
        .route("/{queue}", post(handlers::publish_to_queue))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves the front door on `addr` until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving fails.
pub async fn start_server<F>(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = create_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "http server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("http server stopped");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install sigterm handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received ctrl-c, starting graceful shutdown");
        },
        () = terminate => {
            info!("received sigterm, starting graceful shutdown");
        },
    }

    warn!("waiting for in-flight work to complete");
}
