//! Administrative reporter API.
//!
//! Test lifecycle CRUD served on the reporter hostname: create a test run
//! (issuing the UUID the client builds its test hostnames from), submit
//! client-side captures, update and inspect runs. Mutating requests carry an
//! `X-Requested-With` header as a CSRF gate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::claim::validate_uuid;
use crate::config::Config;
use crate::models::{Capture, ClientCapture, Frame, Test};
use crate::storage::{ClientResultOutcome, EditCheck, Storage};

/// Peer address of the TLS connection a request arrived on, injected by the
/// serving layer.
#[derive(Debug, Clone, Copy)]
pub struct PeerIp(pub IpAddr);

pub struct ReporterState {
    pub storage: Arc<Storage>,
    pub config: Arc<Config>,
}

/// Builds the reporter router, nested under the configured API prefix.
pub fn router(state: Arc<ReporterState>) -> Router {
    let prefix = state.config.reporter_api_prefix.clone();
    let api = Router::new()
        .route("/tests", post(create_test).get(list_tests))
        .route(
            "/tests/{test_id}",
            get(get_test).patch(update_test).delete(remove_test),
        )
        .route("/tests/{test_id}/subtests", get(list_subtests))
        .route(
            "/tests/{test_id}/subtests/{number}/clientresult",
            put(add_client_result),
        )
        .layer(middleware::from_fn(csrf_protection))
        .with_state(state);

    Router::new()
        .nest(&prefix, api)
        .layer(TraceLayer::new_for_http())
}

/// Requires the X-Requested-With header for requests with non-safe methods.
async fn csrf_protection(request: axum::extract::Request, next: Next) -> Response {
    let method = request.method();
    let safe = method == Method::GET || method == Method::HEAD || method == Method::OPTIONS;
    if !safe && !request.headers().contains_key("x-requested-with") {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "missing X-Requested-With header"})),
        )
            .into_response();
    }
    next.run(request).await
}

/// Client versions that are allowed to submit tests.
fn is_allowed_client_version(client_version: &str) -> bool {
    matches!(client_version, "TEST")
}

fn db_error(err: anyhow::Error) -> Response {
    error!("database error: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "database error"})),
    )
        .into_response()
}

fn test_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "test not found"})),
    )
        .into_response()
}

fn test_locked() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "test can no longer be modified"})),
    )
        .into_response()
}

/// Checks whether a test exists and whether it is still allowed to be
/// modified given the elapsed time. Returns the internal row key.
fn check_test_edit_allowed(state: &ReporterState, test_id: &str) -> Result<i64, Response> {
    if !validate_uuid(test_id) {
        return Err(test_not_found());
    }
    match state
        .storage
        .check_test_edit_allowed(test_id, state.config.mutable_test_period_secs as i64)
    {
        Ok(EditCheck::Editable(key)) => Ok(key),
        Ok(EditCheck::NotFound) => Err(test_not_found()),
        Ok(EditCheck::Locked) => Err(test_locked()),
        Err(e) => Err(db_error(e)),
    }
}

#[derive(Debug, Deserialize)]
struct CreateTestRequest {
    #[serde(default)]
    client_version: String,
    #[serde(default)]
    flash_version: String,
    #[serde(default)]
    user_agent: String,
}

async fn create_test(
    State(state): State<Arc<ReporterState>>,
    Extension(PeerIp(client_ip)): Extension<PeerIp>,
    Query(params): Query<HashMap<String, String>>,
    Json(request): Json<CreateTestRequest>,
) -> Response {
    if !is_allowed_client_version(&request.client_version) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid client version"})),
        )
            .into_response();
    }

    // `?anonymous` (with empty value) asks for a surrogate identifier: the
    // client still needs a random domain but nothing is persisted.
    if params.get("anonymous").is_some_and(String::is_empty) {
        return (
            StatusCode::CREATED,
            Json(json!({
                "test_id": format!("otr-{}", Uuid::new_v4()),
                "subtests": state.config.subtests,
            })),
        )
            .into_response();
    }

    let mut test = Test {
        id: 0,
        test_id: String::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        client_ip,
        client_version: request.client_version,
        flash_version: request.flash_version,
        user_agent: request.user_agent,
        user_comment: String::new(),
        has_failed: false,
        is_mitm: false,
        is_pending: true,
    };
    if let Err(e) = state.storage.create_test(&mut test, &state.config.subtests) {
        return db_error(e);
    }
    info!("created test {}", test.test_id);

    (
        StatusCode::CREATED,
        Json(json!({
            "test_id": test.test_id,
            "subtests": state.config.subtests,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct UpdateTestRequest {
    user_comment: Option<String>,
    is_pending: Option<bool>,
}

async fn update_test(
    State(state): State<Arc<ReporterState>>,
    Path(test_id): Path<String>,
    Json(request): Json<UpdateTestRequest>,
) -> Response {
    let key = match check_test_edit_allowed(&state, &test_id) {
        Ok(key) => key,
        Err(response) => return response,
    };

    if request.user_comment.is_none() && request.is_pending.unwrap_or(true) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "no changes requested"})),
        )
            .into_response();
    }

    match state
        .storage
        .update_test(key, request.user_comment.as_deref(), request.is_pending)
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => test_locked(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AddClientResultRequest {
    #[serde(default)]
    begin_time: DateTime<Utc>,
    #[serde(default)]
    end_time: DateTime<Utc>,
    #[serde(default)]
    actual_tls_version: u16,
    #[serde(default)]
    frames: Vec<Frame>,
    #[serde(default)]
    key_log: String,
    #[serde(default)]
    has_failed: bool,
}

fn client_capture_from_request(request: AddClientResultRequest) -> Result<ClientCapture, String> {
    if request.frames.is_empty() {
        return Err("Frames is required".to_string());
    }
    for (i, frame) in request.frames.iter().enumerate() {
        if frame.data.is_empty() {
            return Err(format!("Frame number {} has no data", i + 1));
        }
    }
    Ok(ClientCapture {
        capture: Capture {
            id: 0,
            subtest_id: 0,
            created_at: Utc::now(),
            begin_time: request.begin_time,
            end_time: request.end_time,
            actual_tls_version: request.actual_tls_version,
            frames: request.frames,
            key_log: request.key_log,
            has_failed: request.has_failed,
        },
    })
}

async fn add_client_result(
    State(state): State<Arc<ReporterState>>,
    Path((test_id, number)): Path<(String, i64)>,
    Json(request): Json<AddClientResultRequest>,
) -> Response {
    let key = match check_test_edit_allowed(&state, &test_id) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let capture = match client_capture_from_request(request) {
        Ok(capture) => capture,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
        }
    };

    match state.storage.insert_client_capture(key, number, &capture) {
        Ok(ClientResultOutcome::Created(_)) => StatusCode::OK.into_response(),
        Ok(ClientResultOutcome::SubtestNotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "subtest not found"})),
        )
            .into_response(),
        Ok(ClientResultOutcome::Duplicate) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "test submission was already received"})),
        )
            .into_response(),
        Err(e) => db_error(e),
    }
}

async fn list_tests(State(state): State<Arc<ReporterState>>) -> Response {
    match state.storage.list_tests() {
        Ok(tests) => Json(tests).into_response(),
        Err(e) => db_error(e),
    }
}

async fn list_subtests(
    State(state): State<Arc<ReporterState>>,
    Path(test_id): Path<String>,
) -> Response {
    if !validate_uuid(&test_id) {
        return test_not_found();
    }
    match state.storage.list_subtests(&test_id) {
        Ok(Some(subtests)) => Json(subtests).into_response(),
        Ok(None) => test_not_found(),
        Err(e) => db_error(e),
    }
}

async fn get_test(
    State(state): State<Arc<ReporterState>>,
    Path(test_id): Path<String>,
) -> Response {
    if !validate_uuid(&test_id) {
        return test_not_found();
    }
    match state.storage.get_test(&test_id) {
        Ok(Some(test)) => Json(test).into_response(),
        Ok(None) => test_not_found(),
        Err(e) => db_error(e),
    }
}

async fn remove_test(
    State(state): State<Arc<ReporterState>>,
    Path(test_id): Path<String>,
) -> Response {
    if !validate_uuid(&test_id) {
        return test_not_found();
    }
    match state.storage.delete_test(&test_id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => test_not_found(),
        Err(e) => db_error(e),
    }
}
