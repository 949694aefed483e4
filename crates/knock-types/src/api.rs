use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatAccess, Edge, Message};

// -- JWT Claims --

/// JWT claims shared by knock-api (REST middleware) and knock-gateway
/// (WebSocket identify).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub is_private: bool,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetPrivacyRequest {
    pub is_private: bool,
}

// -- Knocks --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnockRequest {
    pub to: Uuid,
}

/// Both directed edges between the caller and another user.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipResponse {
    pub outgoing: Option<Edge>,
    pub incoming: Option<Edge>,
    pub is_locked_in: bool,
}

// -- Chats --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenChatRequest {
    pub with: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
}

/// The stored message and the chat access that applies after it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub message: Message,
    pub access: ChatAccess,
}
