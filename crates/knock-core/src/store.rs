//! Seams between the relationship core and its collaborators.

use uuid::Uuid;

use knock_types::models::{Chat, Edge, EdgeStatus, Message, RelationshipEvent};

use crate::error::StoreError;

/// Expected state of one directed edge at commit time. `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub from: Uuid,
    pub to: Uuid,
    pub expect: Option<EdgeStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeWrite {
    Insert {
        id: Uuid,
        from: Uuid,
        to: Uuid,
        status: EdgeStatus,
    },
    SetStatus {
        from: Uuid,
        to: Uuid,
        status: EdgeStatus,
    },
    Delete {
        from: Uuid,
        to: Uuid,
    },
}

/// An atomic unit of edge writes, valid only while every guard still holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairChange {
    pub guards: Vec<Guard>,
    pub writes: Vec<EdgeWrite>,
}

/// Persistent directed edges, unique per (from, to).
pub trait RelationshipStore: Send + Sync {
    fn edge(&self, id: Uuid) -> Result<Option<Edge>, StoreError>;

    fn edge_between(&self, from: Uuid, to: Uuid) -> Result<Option<Edge>, StoreError>;

    /// Check all guards and apply all writes as one unit.
    ///
    /// Returns the inserted or updated edges in write order. Fails with
    /// `StoreError::Conflict` when a guard no longer matches or an insert
    /// collides with an existing (from, to) pair; nothing is written then.
    fn commit(&self, change: &PairChange) -> Result<Vec<Edge>, StoreError>;

    /// Edges pointing at `user` with one of `statuses`, newest first.
    fn edges_to(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<Vec<Edge>, StoreError>;

    /// Edges originating from `user` with one of `statuses`, newest first.
    fn edges_from(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<Vec<Edge>, StoreError>;

    fn count_to(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<u64, StoreError> {
        Ok(self.edges_to(user, statuses)?.len() as u64)
    }

    fn count_from(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<u64, StoreError> {
        Ok(self.edges_from(user, statuses)?.len() as u64)
    }
}

/// Read access to the externally owned user records.
pub trait UserDirectory: Send + Sync {
    fn exists(&self, user: Uuid) -> Result<bool, StoreError>;

    /// Unknown users read as public.
    fn is_private(&self, user: Uuid) -> Result<bool, StoreError>;
}

/// Receives committed relationship events. Delivery is best effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &RelationshipEvent) -> anyhow::Result<()>;
}

/// Direct chats and their messages, as seen by the message gate.
pub trait ChatStore: Send + Sync {
    fn chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError>;

    /// The chat between two users, in either direction.
    fn chat_between(&self, a: Uuid, b: Uuid) -> Result<Option<Chat>, StoreError>;

    /// Fails with `StoreError::Conflict` if the pair already has a chat.
    fn create_chat(&self, chat: &Chat) -> Result<(), StoreError>;

    /// Move a restricted chat to `LockedOpen` and clear its opener marker.
    /// A chat that is not restricted is left untouched.
    fn unlock_chat(&self, chat_id: Uuid) -> Result<(), StoreError>;

    fn sent_count(&self, chat_id: Uuid, sender: Uuid) -> Result<u64, StoreError>;

    /// Append a message. With `only_if_first`, the insert happens only when
    /// `message.sender_id` has no earlier message in the chat, and `Ok(false)`
    /// is returned otherwise.
    fn append_message(&self, message: &Message, only_if_first: bool) -> Result<bool, StoreError>;

    fn messages(&self, chat_id: Uuid, limit: u32) -> Result<Vec<Message>, StoreError>;
}
