//! Administrative HTTP API.
//!
//! Thin handlers over the routing service and endpoint runtime. Every
//! response body is an [`ApiResult`]; the status code reflects the failure
//! class.

use crate::error::RoutingError;
use crate::protocol::{ApiResult, Packet};
use crate::ws_server::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

type ApiResponse = (StatusCode, Json<ApiResult>);

/// Admin routes, nested under `/api/ws`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/send-message", post(send_message_handler))
        // Friends
        .route("/add-friend", post(add_friend_handler))
        .route("/remove-friend", post(remove_friend_handler))
        .route("/user-friend-list", get(user_friend_list_handler))
        // Channels
        .route("/create-chan", post(create_chan_handler))
        .route("/join-chan", post(join_chan_handler))
        .route("/leave-chan", post(leave_chan_handler))
        .route("/user-chan-list", get(user_chan_list_handler))
        // Presence
        .route("/online-count", get(online_count_handler))
        .route("/presence/{identity}", get(presence_handler))
}

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendParams {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    friend_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChanParams {
    #[serde(default)]
    chan_name: String,
    #[serde(default)]
    client_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientParams {
    #[serde(default)]
    client_id: String,
}

// =============================================================================
// Responses
// =============================================================================

fn ok(message: &str, data: Value) -> ApiResponse {
    (StatusCode::OK, Json(ApiResult::ok(message, data)))
}

fn fail(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(ApiResult::fail(message)))
}

fn routing_failure(op: &str, err: RoutingError) -> ApiResponse {
    let status = match &err {
        RoutingError::DuplicateChannel(_) => StatusCode::CONFLICT,
        RoutingError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        RoutingError::NotAMember { .. } | RoutingError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        RoutingError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    if status == StatusCode::SERVICE_UNAVAILABLE {
        error!("{} failed: {}", op, err);
    } else {
        warn!("{} rejected: {}", op, err);
    }
    fail(status, err.to_string())
}

// =============================================================================
// Handlers
// =============================================================================

async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Packet>, JsonRejection>,
) -> ApiResponse {
    let Json(packet) = match body {
        Ok(body) => body,
        Err(rejection) => return fail(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.router.send(&packet).await {
        Ok(recipients) => ok("ok", json!({ "recipients": recipients })),
        Err(e) => routing_failure("send-message", e),
    }
}

async fn add_friend_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FriendParams>,
) -> ApiResponse {
    match state
        .router
        .add_friend(&params.client_id, &params.friend_id)
        .await
    {
        Ok(()) => ok("success", json!({})),
        Err(e) => routing_failure("add-friend", e),
    }
}

async fn remove_friend_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FriendParams>,
) -> ApiResponse {
    match state
        .router
        .remove_friend(&params.client_id, &params.friend_id)
        .await
    {
        Ok(removed) => ok("success", json!({ "removed": removed })),
        Err(e) => routing_failure("remove-friend", e),
    }
}

async fn user_friend_list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClientParams>,
) -> ApiResponse {
    match state.router.user_friends(&params.client_id).await {
        Ok(friends) => ok("success", json!(friends)),
        Err(e) => routing_failure("user-friend-list", e),
    }
}

async fn create_chan_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChanParams>,
) -> ApiResponse {
    match state
        .router
        .create_channel(&params.chan_name, &params.client_id)
        .await
    {
        Ok(()) => {
            info!("API: created channel '{}'", params.chan_name);
            ok("created", json!({}))
        }
        Err(e) => routing_failure("create-chan", e),
    }
}

async fn join_chan_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChanParams>,
) -> ApiResponse {
    match state
        .router
        .join_channel(&params.chan_name, &params.client_id)
        .await
    {
        Ok(()) => ok("joined", json!({})),
        Err(e) => routing_failure("join-chan", e),
    }
}

async fn leave_chan_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChanParams>,
) -> ApiResponse {
    match state
        .router
        .leave_channel(&params.chan_name, &params.client_id)
        .await
    {
        Ok(()) => ok("left", json!({})),
        Err(e) => routing_failure("leave-chan", e),
    }
}

async fn user_chan_list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClientParams>,
) -> ApiResponse {
    match state.router.user_channels(&params.client_id).await {
        Ok(channels) => ok("success", json!(channels)),
        Err(e) => routing_failure("user-chan-list", e),
    }
}

async fn online_count_handler(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.router.online_count().await {
        Ok(count) => ok("success", json!(count)),
        Err(e) => routing_failure("online-count", e),
    }
}

async fn presence_handler(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResponse {
    match state.presence.is_online(&identity).await {
        Ok(online) => ok("success", json!(online)),
        Err(e) => fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
