//! keybroker-api — service broker REST API.
//!
//! Translates broker protocol requests into engine operations and engine
//! outcomes into protocol responses. Every route sits behind HTTP basic
//! auth; every request is logged with its status and latency.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v2/catalog` | Service catalog |
//! | PUT | `/v2/service_instances/{instance_id}` | Provision an instance |
//! | DELETE | `/v2/service_instances/{instance_id}` | Deprovision an instance |
//! | PUT | `/v2/service_instances/{instance_id}/service_bindings/{binding_id}` | Bind |
//! | DELETE | `/v2/service_instances/{instance_id}/service_bindings/{binding_id}` | Unbind |

pub mod auth;
pub mod handlers;
pub mod logging;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, put};
use tokio::sync::watch;

use keybroker_core::{Catalog, ConnectionEndpoint};
use keybroker_engine::{CancelSignal, StoreEngine};

pub use auth::BasicCredentials;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<StoreEngine>,
    pub catalog: Arc<Catalog>,
    pub endpoint: Arc<ConnectionEndpoint>,
    /// Flips to true when the daemon starts shutting down.
    pub shutdown: watch::Receiver<bool>,
    /// Set by a handler that hit a process-level fault.
    pub fatal: Arc<watch::Sender<bool>>,
}

impl ApiState {
    /// Cancellation for one request: fires on daemon shutdown.
    pub fn cancel_signal(&self) -> CancelSignal {
        CancelSignal::new(self.shutdown.clone())
    }
}

/// Build the broker router with auth and request logging applied.
pub fn build_router(state: ApiState, credentials: BasicCredentials) -> Router {
    let broker_routes = Router::new()
        .route("/catalog", get(handlers::catalog))
        .route(
            "/service_instances/{instance_id}",
            put(handlers::create_instance).delete(handlers::delete_instance),
        )
        .route(
            "/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(handlers::create_binding).delete(handlers::delete_binding),
        )
        .with_state(state);

    Router::new()
        .nest("/v2", broker_routes)
        .layer(middleware::from_fn_with_state(
            Arc::new(credentials),
            auth::require_basic_auth,
        ))
        .layer(middleware::from_fn(logging::log_requests))
}
