use thiserror::Error;

/// Errors returned by relationship and gate operations.
///
/// Everything except `Unavailable` and `Storage` is a domain decision and is
/// never retried.
#[derive(Debug, Error)]
pub enum RelationshipError {
    #[error("cannot knock yourself")]
    SelfTarget,

    #[error("target user not found")]
    TargetNotFound,

    #[error("a knock toward this user already exists")]
    DuplicateEdge,

    #[error("knock not found or not eligible for this action")]
    EdgeNotFoundOrNotEligible,

    #[error("recipient must reply to unlock")]
    ChatRestricted,

    #[error("chat not found")]
    ChatNotFound,

    #[error("not a participant of this chat")]
    NotChatParticipant,

    /// Transient store faults outlasted the retry budget.
    #[error("relationship store temporarily unavailable")]
    Unavailable,

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl RelationshipError {
    /// Stable reason code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SelfTarget => "self_target",
            Self::TargetNotFound => "target_not_found",
            Self::DuplicateEdge => "duplicate_edge",
            Self::EdgeNotFoundOrNotEligible => "edge_not_eligible",
            Self::ChatRestricted => "chat_restricted",
            Self::ChatNotFound => "chat_not_found",
            Self::NotChatParticipant => "not_chat_participant",
            Self::Unavailable => "service_unavailable",
            Self::Storage(_) => "storage_error",
        }
    }
}

/// Faults reported by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A guard did not match or a uniqueness constraint was hit.
    #[error("write conflict")]
    Conflict,

    /// The backend is locked or timed out.
    #[error("store busy")]
    Busy,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict | Self::Busy)
    }
}

impl From<StoreError> for RelationshipError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict | StoreError::Busy => Self::Unavailable,
            StoreError::Backend(e) => Self::Storage(e),
        }
    }
}
