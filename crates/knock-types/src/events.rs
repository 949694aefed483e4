use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatGate, RelationshipKind};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A relationship transition involving the receiving user
    Relationship {
        kind: RelationshipKind,
        from: Uuid,
        to: Uuid,
        edge_id: Uuid,
    },

    /// A message was posted to a chat the receiving user is part of
    MessageCreate {
        id: Uuid,
        chat_id: Uuid,
        sender_id: Uuid,
        body: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The gate state of a chat changed
    ChatGateUpdate { chat_id: Uuid, gate: ChatGate },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },
}
