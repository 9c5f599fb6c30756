use axum::{
    Extension, Json,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use pawlink_types::api::{HistoryResponse, InitiateChatRequest, InitiateChatResponse};
use pawlink_types::{RoomId, UserId};

use crate::dispatcher::Dispatcher;

/// The authenticated caller. The dev gateway trusts the bearer token as the
/// user id.
#[derive(Debug, Clone)]
pub struct Caller(pub UserId);

/// Reject requests without a bearer token.
pub async fn require_auth(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let caller = Caller(UserId::from(token));
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

/// GET /chat/{room_id}
pub async fn get_history(
    State(dispatcher): State<Dispatcher>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    let messages = dispatcher.history(&RoomId::new(room_id)).await;
    Json(HistoryResponse { messages })
}

/// POST /chat/initiate
pub async fn initiate_chat(
    State(dispatcher): State<Dispatcher>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<InitiateChatRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let pet_id = req.pet_id.trim();
    if pet_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let chat_id = dispatcher.initiate(pet_id, &caller.0).await;
    Ok(Json(InitiateChatResponse { chat_id }))
}

/// GET /chat
pub async fn list_chats(
    State(dispatcher): State<Dispatcher>,
    Extension(caller): Extension<Caller>,
) -> impl IntoResponse {
    let chats = dispatcher.list(&caller.0).await;
    debug!("{} has {} chats", caller.0, chats.len());
    Json(chats)
}
