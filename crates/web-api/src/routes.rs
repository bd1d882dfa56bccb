use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use application::{ApplicationError, OnlineUser, PresenceView};
use domain::{Session, UserId};

use crate::{auth::extract_token, error::ApiError, state::AppState, ws_connection};

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(websocket_upgrade))
        .route("/presence", get(list_online))
        .route("/presence/{user_id}", get(user_presence))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// 解析请求携带的会话凭据，缺失或无效时返回 401
async fn authenticate(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
) -> Result<Session, ApiError> {
    let token = extract_token(query.token.as_deref(), headers)
        .ok_or_else(|| ApiError::unauthorized("Missing session credential"))?;

    state
        .sessions
        .resolve(&token)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "会话解析失败");
            ApiError::service_unavailable("Session store unavailable")
        })?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))
}

/// 升级前解析会话，失败时连接不会进入注册表
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = authenticate(&state, &query, &headers).await?;

    tracing::debug!(user_id = %session.user_id, "会话已解析，升级为 WebSocket");
    Ok(ws.on_upgrade(move |socket| ws_connection::run(socket, state, session)))
}

async fn list_online(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<OnlineUser>>, ApiError> {
    authenticate(&state, &query, &headers).await?;
    Ok(Json(state.presence.online().await?))
}

async fn user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<PresenceView>, ApiError> {
    authenticate(&state, &query, &headers).await?;
    let user_id = UserId::parse(&user_id).map_err(ApplicationError::from)?;
    Ok(Json(state.presence.status_of(user_id).await?))
}
