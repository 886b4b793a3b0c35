//! Broker protocol handlers.
//!
//! Each handler runs one engine operation and maps its outcome onto the
//! protocol's status codes. Failure bodies are `{"description": ...}`.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use keybroker_engine::ProvisionError;

use crate::ApiState;

/// Body of a provision request. The ids are logged; the broker offers a
/// single plan so none of them change what gets provisioned.
#[derive(Debug, Default, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub organization_guid: Option<String>,
    #[serde(default)]
    pub space_guid: Option<String>,
}

/// Body of a bind request.
#[derive(Debug, Default, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub app_guid: String,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BindResponse {
    pub credentials: Credentials,
}

/// What a bound application needs to connect.
#[derive(Debug, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub keyspace: String,
    pub nodes: Vec<String>,
    pub port: u16,
}

fn empty(status: StatusCode) -> Response {
    (status, Json(serde_json::json!({}))).into_response()
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "description": msg }))).into_response()
}

/// Empty body means defaults; anything else must be valid JSON.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        error_response(&format!("invalid request body: {e}"), StatusCode::BAD_REQUEST)
    })
}

/// Map an engine failure to a response. `not_found` is the status this
/// route uses for a missing entity.
fn failure(state: &ApiState, err: ProvisionError, not_found: StatusCode) -> Response {
    let status = match &err {
        ProvisionError::AlreadyExists { .. } => StatusCode::CONFLICT,
        ProvisionError::NotFound { .. } => not_found,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if err.is_fatal() {
        error!(error = %err, "unrecoverable fault, requesting shutdown");
        state.fatal.send_replace(true);
    } else if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "operation failed");
    } else if status == StatusCode::SERVICE_UNAVAILABLE {
        warn!(error = %err, "operation failed transiently");
    }

    error_response(&err.to_string(), status)
}

/// GET /v2/catalog
pub async fn catalog(State(state): State<ApiState>) -> Response {
    Json(state.catalog.as_ref().clone()).into_response()
}

/// PUT /v2/service_instances/{instance_id}
pub async fn create_instance(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> Response {
    let req: ProvisionRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    debug!(
        %instance_id,
        service_id = ?req.service_id,
        plan_id = ?req.plan_id,
        organization_guid = ?req.organization_guid,
        space_guid = ?req.space_guid,
        "provision requested"
    );
    match state
        .engine
        .create_instance(&instance_id, state.cancel_signal())
        .await
    {
        Ok(()) => empty(StatusCode::CREATED),
        Err(e) => failure(&state, e, StatusCode::NOT_FOUND),
    }
}

/// DELETE /v2/service_instances/{instance_id}
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Response {
    match state
        .engine
        .delete_instance(&instance_id, state.cancel_signal())
        .await
    {
        Ok(()) => empty(StatusCode::OK),
        Err(e) => failure(&state, e, StatusCode::GONE),
    }
}

/// PUT /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub async fn create_binding(
    State(state): State<ApiState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let req: BindRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    debug!(
        %instance_id,
        %binding_id,
        app_guid = %req.app_guid,
        service_id = ?req.service_id,
        plan_id = ?req.plan_id,
        "bind requested"
    );
    match state
        .engine
        .create_binding(&instance_id, &binding_id, &req.app_guid, state.cancel_signal())
        .await
    {
        Ok(creds) => (
            StatusCode::CREATED,
            Json(BindResponse {
                credentials: Credentials {
                    username: creds.username,
                    password: creds.password,
                    keyspace: creds.keyspace,
                    nodes: state.endpoint.nodes.clone(),
                    port: state.endpoint.port,
                },
            }),
        )
            .into_response(),
        Err(e) => failure(&state, e, StatusCode::GONE),
    }
}

/// DELETE /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub async fn delete_binding(
    State(state): State<ApiState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Response {
    match state
        .engine
        .delete_binding(&instance_id, &binding_id, state.cancel_signal())
        .await
    {
        Ok(()) => empty(StatusCode::OK),
        Err(e) => failure(&state, e, StatusCode::GONE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use keybroker_core::{Catalog, ConnectionEndpoint};
    use keybroker_engine::{EngineSettings, EntityKind, StoreEngine};
    use keybroker_state::StateStore;
    use tokio::sync::watch;

    fn test_state() -> (ApiState, StateStore, watch::Receiver<bool>) {
        let store = StateStore::open_in_memory().unwrap();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let state = ApiState {
            engine: Arc::new(StoreEngine::for_store(store.clone(), EngineSettings::default())),
            catalog: Arc::new(Catalog::default()),
            endpoint: Arc::new(ConnectionEndpoint {
                nodes: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                port: 9042,
            }),
            shutdown,
            fatal: Arc::new(fatal_tx),
        };
        (state, store, fatal_rx)
    }

    async fn json_of(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_instance_returns_created() {
        let (state, store, _) = test_state();
        let resp = create_instance(State(state), Path("i1".to_string()), Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(json_of(resp).await, serde_json::json!({}));
        assert!(store.instance_exists("i1").unwrap());
    }

    #[tokio::test]
    async fn duplicate_instance_is_conflict() {
        let (state, _, _) = test_state();
        create_instance(State(state.clone()), Path("i1".to_string()), Bytes::new()).await;
        let resp = create_instance(State(state), Path("i1".to_string()), Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = json_of(resp).await;
        assert!(body["description"].as_str().unwrap().contains("i1"));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (state, store, _) = test_state();
        let resp = create_instance(
            State(state),
            Path("i1".to_string()),
            Bytes::from_static(b"{not json"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!store.instance_exists("i1").unwrap());
    }

    #[tokio::test]
    async fn delete_missing_instance_is_gone() {
        let (state, _, _) = test_state();
        let resp = delete_instance(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn bind_returns_credentials_with_endpoint() {
        let (state, store, _) = test_state();
        create_instance(State(state.clone()), Path("i1".to_string()), Bytes::new()).await;

        let resp = create_binding(
            State(state),
            Path(("i1".to_string(), "b1".to_string())),
            Bytes::from_static(br#"{"app_guid":"app1","plan_id":"p"}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let body = json_of(resp).await;
        let creds = &body["credentials"];
        let keyspace = store.get_instance("i1").unwrap().unwrap().keyspace_name;
        assert_eq!(creds["keyspace"], keyspace.as_str());
        assert_eq!(creds["nodes"], serde_json::json!(["10.0.0.1", "10.0.0.2"]));
        assert_eq!(creds["port"], 9042);
        assert!(!creds["username"].as_str().unwrap().is_empty());
        assert!(!creds["password"].as_str().unwrap().is_empty());
        assert_eq!(store.get_binding("b1").unwrap().unwrap().app_guid, "app1");
    }

    #[tokio::test]
    async fn bind_to_missing_instance_is_gone() {
        let (state, store, _) = test_state();
        let resp = create_binding(
            State(state),
            Path(("nope".to_string(), "b1".to_string())),
            Bytes::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::GONE);
        let body = json_of(resp).await;
        assert!(body["description"].as_str().unwrap().contains("nope"));
        assert!(store.list_roles().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_provision_body_is_accepted() {
        let (state, store, _) = test_state();
        let body = br#"{"service_id":"s","plan_id":"p","organization_guid":"o","space_guid":"sp"}"#;
        let resp = create_instance(
            State(state),
            Path("i1".to_string()),
            Bytes::from_static(body),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(store.instance_exists("i1").unwrap());
    }

    #[tokio::test]
    async fn mistyped_bind_field_is_bad_request() {
        let (state, store, _) = test_state();
        create_instance(State(state.clone()), Path("i1".to_string()), Bytes::new()).await;
        let resp = create_binding(
            State(state),
            Path(("i1".to_string(), "b1".to_string())),
            Bytes::from_static(br#"{"app_guid":"a","plan_id":7}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!store.binding_exists("b1").unwrap());
    }

    #[tokio::test]
    async fn unbind_missing_binding_is_gone() {
        let (state, _, _) = test_state();
        create_instance(State(state.clone()), Path("i1".to_string()), Bytes::new()).await;
        let resp = delete_binding(State(state), Path(("i1".to_string(), "b1".to_string()))).await;
        assert_eq!(resp.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn failure_statuses() {
        let (state, _, fatal) = test_state();

        let timeout = ProvisionError::Timeout {
            step: "create_keyspace",
            after: Duration::from_secs(1),
        };
        let resp = failure(&state, timeout, StatusCode::GONE);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let interrupted = ProvisionError::Interrupted {
            id: "i1".to_string(),
            step: "insert_instance",
        };
        let resp = failure(&state, interrupted, StatusCode::GONE);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let missing = ProvisionError::not_found(EntityKind::Binding, "b1");
        assert_eq!(failure(&state, missing, StatusCode::GONE).status(), StatusCode::GONE);
        assert!(!*fatal.borrow());

        let entropy = ProvisionError::EntropyUnavailable("no entropy".to_string());
        let resp = failure(&state, entropy, StatusCode::GONE);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(*fatal.borrow());
    }

    #[tokio::test]
    async fn catalog_is_echoed() {
        let (state, _, _) = test_state();
        let resp = catalog(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_of(resp).await, serde_json::json!({ "services": [] }));
    }
}
