use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a single directed knock edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeStatus {
    /// Request toward a private user, awaiting their decision.
    #[serde(rename = "pending")]
    Pending,
    /// Acknowledged one-way relationship.
    #[serde(rename = "onesided")]
    OneSided,
    /// Mutual relationship. The reciprocal edge is always `LockedIn` too.
    #[serde(rename = "lockedIn")]
    LockedIn,
}

impl EdgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OneSided => "onesided",
            Self::LockedIn => "lockedIn",
        }
    }
}

impl fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown edge status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for EdgeStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "onesided" => Ok(Self::OneSided),
            "lockedIn" => Ok(Self::LockedIn),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A directed knock from one user to another. At most one exists per (from, to).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub status: EdgeStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipKind {
    /// A pending request was sent to a private user.
    Invite,
    /// A one-sided knock landed on a public user.
    OneWayNotice,
    /// Both edges of the pair became locked in.
    MutualLock,
    /// A pending request was accepted as one-sided.
    Accepted,
    Declined,
    /// A lock was broken and degraded to one-sided.
    Broken,
}

/// Emitted by the relationship engine after a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEvent {
    pub kind: RelationshipKind,
    pub from: Uuid,
    pub to: Uuid,
    pub edge_id: Uuid,
}

/// Incoming/outgoing/locked-in totals for a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnockCounts {
    pub incoming_count: u64,
    pub outgoing_count: u64,
    pub locked_in_count: u64,
}

/// Gate state of a direct chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatGate {
    Open,
    RestrictedAwaitingReply,
    LockedOpen,
}

impl ChatGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::RestrictedAwaitingReply => "restricted",
            Self::LockedOpen => "locked_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "restricted" => Some(Self::RestrictedAwaitingReply),
            "locked_open" => Some(Self::LockedOpen),
            _ => None,
        }
    }
}

/// A private chat between two users, one per unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: Uuid,
    pub initiator: Uuid,
    pub counterpart: Uuid,
    pub gate: ChatGate,
    /// Sender of the opening message while the chat is restricted.
    pub opened_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.initiator == user_id || self.counterpart == user_id
    }

    /// The other participant, if `user_id` is in this chat.
    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if self.initiator == user_id {
            Some(self.counterpart)
        } else if self.counterpart == user_id {
            Some(self.initiator)
        } else {
            None
        }
    }
}

/// Result of evaluating the message gate for one sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAccess {
    pub chat_id: Uuid,
    pub allow: bool,
    pub is_restricted: bool,
    pub is_locked_in: bool,
    pub opened_by: Option<Uuid>,
    pub gate: ChatGate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_string(&EdgeStatus::LockedIn).unwrap(), "\"lockedIn\"");
        assert_eq!(serde_json::to_string(&EdgeStatus::OneSided).unwrap(), "\"onesided\"");
        assert_eq!("pending".parse::<EdgeStatus>().unwrap(), EdgeStatus::Pending);
        assert!("locked".parse::<EdgeStatus>().is_err());
    }

    #[test]
    fn event_kind_is_kebab_case() {
        let json = serde_json::to_string(&RelationshipKind::OneWayNotice).unwrap();
        assert_eq!(json, "\"one-way-notice\"");
    }

    #[test]
    fn chat_other_participant() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let chat = Chat {
            id: Uuid::new_v4(),
            initiator: a,
            counterpart: b,
            gate: ChatGate::Open,
            opened_by: None,
            created_at: Utc::now(),
        };
        assert_eq!(chat.other(a), Some(b));
        assert_eq!(chat.other(b), Some(a));
        assert_eq!(chat.other(Uuid::new_v4()), None);
        assert_eq!(ChatGate::parse(ChatGate::LockedOpen.as_str()), Some(ChatGate::LockedOpen));
    }
}
