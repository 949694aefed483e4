use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use knock_core::{ChatStore, RelationshipError};
use knock_types::api::{Claims, OpenChatRequest, SendMessageRequest, SendMessageResponse};
use knock_types::events::GatewayEvent;
use knock_types::models::{ChatAccess, ChatGate, Message};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult, run_blocking};

const MAX_BODY_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn open_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenChatRequest>,
) -> ApiResult<Json<ChatAccess>> {
    let gate = state.gate.clone();
    let access = run_blocking(move || Ok(gate.open_chat(claims.sub, req.with)?)).await?;
    Ok(Json(access))
}

pub async fn access(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<ChatAccess>> {
    let gate = state.gate.clone();
    let access = run_blocking(move || Ok(gate.compute_access(chat_id, claims.sub)?)).await?;
    Ok(Json(access))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let body = req.body.trim().to_string();
    if body.is_empty() {
        return Err(ApiError::Validation("message body is empty".into()));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(ApiError::Validation(format!(
            "message body exceeds {} characters",
            MAX_BODY_CHARS
        )));
    }

    let gate = state.gate.clone();
    let db = state.db.clone();
    let sender = claims.sub;

    let (delivery, participants) = run_blocking(move || {
        let delivery = gate.send(chat_id, sender, &body)?;
        let chat = db
            .chat(chat_id)
            .map_err(RelationshipError::from)?
            .ok_or(RelationshipError::ChatNotFound)?;
        Ok((delivery, [chat.initiator, chat.counterpart]))
    })
    .await?;

    let message = delivery.message.clone();
    state
        .dispatcher
        .send_to_users(
            &participants,
            GatewayEvent::MessageCreate {
                id: message.id,
                chat_id,
                sender_id: message.sender_id,
                body: message.body.clone(),
                timestamp: message.created_at,
            },
        )
        .await;

    if delivery.unlocked {
        state
            .dispatcher
            .send_to_users(
                &participants,
                GatewayEvent::ChatGateUpdate {
                    chat_id,
                    gate: ChatGate::LockedOpen,
                },
            )
            .await;
    }

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message,
            access: delivery.access,
        }),
    ))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Message>>> {
    let gate = state.gate.clone();
    let limit = query.limit.clamp(1, 200);
    let messages = run_blocking(move || Ok(gate.messages(chat_id, claims.sub, limit)?)).await?;
    Ok(Json(messages))
}
