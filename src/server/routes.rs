//! Axum route handlers for the agentgate HTTP server.
//!
//! # Routes
//!
//! - `GET  /health`: Liveness probe with storage and provider status
//! - `GET  /tasks`: Every known task, newest first
//! - `POST /tasks`: Run a task to completion
//! - `POST /tasks/async`: Start a task and return its id
//! - `GET  /tasks/:id`: Task status and result
//! - `POST /tasks/:id/cancel`: Stop scheduling further steps
//! - `GET  /audit?n=`: Last `n` audit entries
//! - `GET  /audit/verify`: Check the audit hash chain
//! - `GET  /budget`: Global budget and every task record
//! - `GET  /budget/:task_id`: One task's budget record
//! - `GET  /blackboard?prefix=`: Blackboard entries
//! - `GET  /events`: SSE stream of observer snapshots
//! - `GET  /admin/profiles`: Current trust/risk profiles
//! - `PUT  /admin/profiles`: Administrative profile update

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, CoordinatorError, TaskRequest, TaskStatus};
use crate::observer::ObserverHub;
use crate::persistence::FallbackStore;
use crate::trust::{ProfileUpdate, TrustError};
use crate::types::TaskId;

const DEFAULT_AUDIT_TAIL: usize = 50;
const MAX_AUDIT_TAIL: usize = 1_000;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub observer: Arc<ObserverHub>,
    pub store: Arc<FallbackStore>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, observer: Arc<ObserverHub>, store: Arc<FallbackStore>) -> Self {
        Self {
            coordinator,
            observer,
            store,
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn coordinator_error(e: CoordinatorError) -> ApiError {
    let status = match &e {
        CoordinatorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

fn trust_error(e: TrustError) -> ApiError {
    let status = match &e {
        TrustError::InvalidProfile(_) => StatusCode::BAD_REQUEST,
        TrustError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    api_error(status, e.to_string())
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/tasks", get(list_tasks_handler).post(submit_task_handler))
        .route("/tasks/async", post(spawn_task_handler))
        .route("/tasks/:id", get(get_task_handler))
        .route("/tasks/:id/cancel", post(cancel_task_handler))
        .route("/audit", get(audit_handler))
        .route("/audit/verify", get(verify_audit_handler))
        .route("/budget", get(budget_handler))
        .route("/budget/:task_id", get(task_budget_handler))
        .route("/blackboard", get(blackboard_handler))
        .route("/events", get(events_handler))
        .route("/admin/profiles", get(get_profiles_handler).put(update_profiles_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health: liveness probe.
///
/// Always 200; a store serving from its fallback reports `"degraded"`.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let storage = state.store.status();
    let gateway = state.coordinator.gateway();
    Json(json!({
        "status": if storage.degraded { "degraded" } else { "ok" },
        "version": crate::VERSION,
        "service": "agentgate",
        "storage": storage,
        "default_provider": gateway.default_provider(),
        "providers": gateway.health(),
        "observers": state.observer.subscriber_count(),
    }))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn list_tasks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "tasks": state.coordinator.tasks() }))
}

/// POST /tasks: run a task and return its `TaskResult`.
async fn submit_task_handler(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .coordinator
        .submit(request)
        .await
        .map_err(coordinator_error)?;
    Ok(Json(result))
}

/// POST /tasks/async: 202 with the new task id.
async fn spawn_task_handler(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = state.coordinator.spawn(request).map_err(coordinator_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task_id,
            "status": TaskStatus::Pending,
        })),
    ))
}

async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::from(id);
    state
        .coordinator
        .task(&task_id)
        .map(Json)
        .ok_or_else(|| coordinator_error(CoordinatorError::NotFound(task_id)))
}

async fn cancel_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::from(id);
    let status = state.coordinator.cancel(&task_id).map_err(coordinator_error)?;
    Ok(Json(json!({
        "task_id": task_id,
        "status": status,
        "cancel_requested": !status.is_terminal(),
    })))
}

// ---------------------------------------------------------------------------
// Audit, budget, blackboard
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuditQuery {
    n: Option<usize>,
}

/// GET /audit?n=: oldest first, at most `MAX_AUDIT_TAIL` entries.
async fn audit_handler(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let n = query.n.unwrap_or(DEFAULT_AUDIT_TAIL).min(MAX_AUDIT_TAIL);
    let entries = state
        .coordinator
        .trust()
        .tail(n)
        .await
        .map_err(trust_error)?;
    Ok(Json(json!({ "entries": entries })))
}

async fn verify_audit_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .coordinator
        .trust()
        .audit()
        .verify_chain()
        .await
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(report))
}

async fn budget_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ledger = state.coordinator.ledger();
    Json(json!({
        "global": ledger.get_global(),
        "tasks": ledger.all(),
    }))
}

async fn task_budget_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = TaskId::from(task_id);
    state
        .coordinator
        .ledger()
        .get(&task_id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no budget record for task {task_id}")))
}

#[derive(Debug, Deserialize)]
struct BlackboardQuery {
    prefix: Option<String>,
}

async fn blackboard_handler(
    State(state): State<AppState>,
    Query(query): Query<BlackboardQuery>,
) -> impl IntoResponse {
    let blackboard = state.coordinator.blackboard();
    let entries = match query.prefix.as_deref() {
        Some(prefix) => blackboard.list_prefix(prefix),
        None => blackboard.list(),
    };
    Json(json!({ "entries": entries }))
}

/// GET /events: one `snapshot` event per observer tick.
///
/// A client that falls behind skips the snapshots it missed.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let mut rx = state.observer.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(snapshot) => match Event::default().event("snapshot").json_data(snapshot.as_ref()) {
                    Ok(event) => yield Ok::<_, Infallible>(event),
                    Err(e) => warn!(error = %e, "Failed to encode snapshot"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Observer client lagged, skipping snapshots");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

async fn get_profiles_handler(State(state): State<AppState>) -> impl IntoResponse {
    let profiles = state.coordinator.trust().profiles();
    Json(profiles.as_ref().clone())
}

/// Body of `PUT /admin/profiles`. Names are parsed here so an unknown agent
/// or resource is rejected with 400 instead of failing deserialization.
#[derive(Debug, Deserialize)]
struct ProfileUpdateRequest {
    #[serde(default)]
    trust: HashMap<String, f64>,
    #[serde(default)]
    risk: HashMap<String, f64>,
    #[serde(default)]
    actor: Option<String>,
}

async fn update_profiles_handler(
    State(state): State<AppState>,
    Json(body): Json<ProfileUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let update = ProfileUpdate::from_named(&body.trust, &body.risk, body.actor).map_err(trust_error)?;
    if update.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "update names no trust or risk values"));
    }
    let next = state
        .coordinator
        .trust()
        .update_profiles(update)
        .await
        .map_err(trust_error)?;
    Ok(Json(next.as_ref().clone()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use tower::ServiceExt;

    use crate::blackboard::Blackboard;
    use crate::budget::{BudgetLedger, Pricing};
    use crate::coordinator::CoordinatorConfig;
    use crate::observer::SnapshotSources;
    use crate::provider::{CircuitConfig, ProviderGateway, RetryConfig, ScriptedProvider};
    use crate::trust::{ProfileSet, TrustEngine};

    fn test_state() -> AppState {
        let store = Arc::new(FallbackStore::in_memory());
        let blackboard = Arc::new(Blackboard::new(store.clone()));
        let ledger = Arc::new(BudgetLedger::new(store.clone(), Pricing::default()));
        let trust = Arc::new(TrustEngine::new(ProfileSet::default(), store.clone()).unwrap());
        let gateway = Arc::new(
            ProviderGateway::new(
                "scripted",
                RetryConfig::default(),
                Duration::from_secs(2),
                CircuitConfig::default(),
            )
            .register(Arc::new(ScriptedProvider::new("scripted"))),
        );
        let coordinator = Arc::new(Coordinator::new(
            blackboard.clone(),
            ledger.clone(),
            trust.clone(),
            gateway,
            CoordinatorConfig::default(),
        ));
        let observer = Arc::new(ObserverHub::spawn(
            SnapshotSources {
                blackboard,
                ledger,
                trust,
                audit_entries: 10,
            },
            Duration::from_millis(20),
        ));
        AppState::new(coordinator, observer, store)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = app_router(test_state());

        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = read_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::VERSION);
        assert_eq!(json["service"], "agentgate");
        assert_eq!(json["default_provider"], "scripted");
        assert_eq!(json["providers"][0]["name"], "scripted");
        assert_eq!(json["storage"]["degraded"], false);
    }

    #[tokio::test]
    async fn test_submit_task_runs_to_completion() {
        let state = test_state();
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/tasks",
                json!({
                    "message": "Summarize the quarterly notes",
                    "agents": ["research", "analysis"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let result = read_json(response).await;
        assert_eq!(result["status"], "COMPLETED");
        assert_eq!(result["steps"].as_array().unwrap().len(), 2);
        let task_id = result["task_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/budget/{task_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = read_json(response).await;
        assert!(record["tokens_used"].as_u64().unwrap() > 0);
        assert_eq!(record["status"], "ACTIVE");

        let response = app
            .oneshot(get_request(&format!("/blackboard?prefix={task_id}/")))
            .await
            .unwrap();
        let entries = read_json(response).await;
        assert!(entries["entries"]
            .as_object()
            .unwrap()
            .contains_key(&format!("{task_id}/research")));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_message() {
        let app = app_router(test_state());

        let response = app
            .oneshot(json_request("POST", "/tasks", json!({ "message": "   " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = read_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("message"));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let app = app_router(test_state());

        let response = app
            .clone()
            .oneshot(get_request("/tasks/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/tasks/does-not-exist/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(get_request("/budget/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_async_task_can_be_polled() {
        let state = test_state();
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/tasks/async",
                json!({ "message": "Draft a short summary", "agents": ["writing"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = read_json(response).await;
        assert_eq!(accepted["status"], "PENDING");
        let task_id = TaskId::from(accepted["task_id"].as_str().unwrap());

        state.coordinator.wait(&task_id).await.unwrap();

        let response = app
            .oneshot(get_request(&format!("/tasks/{task_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot = read_json(response).await;
        assert_eq!(snapshot["status"], "COMPLETED");
        assert_eq!(snapshot["result"]["steps"][0]["agent"], "writing");
    }

    #[tokio::test]
    async fn test_denial_shows_up_in_audit() {
        let app = app_router(test_state());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/tasks",
                json!({ "message": "Process the refund", "agents": ["billing"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result = read_json(response).await;
        assert_eq!(result["steps"][0]["status"], "DENIED");

        let response = app.clone().oneshot(get_request("/audit?n=5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let audit = read_json(response).await;
        let entries = audit["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["event"]["kind"], "permission");
        assert_eq!(entries[0]["event"]["agent_id"], "billing");
        assert_eq!(entries[0]["event"]["granted"], false);

        let response = app.oneshot(get_request("/audit/verify")).await.unwrap();
        let report = read_json(response).await;
        assert_eq!(report["valid"], true);
        assert_eq!(report["entries"], 1);
    }

    #[tokio::test]
    async fn test_admin_profile_update() {
        let state = test_state();
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/admin/profiles",
                json!({ "trust": { "billing": 0.95 }, "actor": "ops" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let profiles = read_json(response).await;
        assert_eq!(profiles["version"], 2);
        assert_eq!(profiles["trust"]["billing"], 0.95);
        assert_eq!(state.coordinator.trust().profiles().version, 2);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/admin/profiles",
                json!({ "trust": { "janitor": 0.5 } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/admin/profiles",
                json!({ "risk": { "PAYMENTS": 1.5 } }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request("PUT", "/admin/profiles", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.coordinator.trust().profiles().version, 2);
    }

    #[tokio::test]
    async fn test_budget_overview() {
        let app = app_router(test_state());

        app.clone()
            .oneshot(json_request(
                "POST",
                "/tasks",
                json!({ "message": "Look into it", "agents": ["research"], "budget_limit": 10000 }),
            ))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/budget")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let budget = read_json(response).await;
        assert_eq!(budget["global"]["task_count"], 1);
        assert_eq!(budget["tasks"][0]["token_limit"], 10000);
    }

    #[tokio::test]
    async fn test_events_stream_pushes_snapshots() {
        let app = app_router(test_state());

        let response = app.oneshot(get_request("/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("no snapshot within 2s")
            .unwrap()
            .unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.starts_with("event: snapshot"));
        assert!(text.contains("\"global\""));
    }
}
