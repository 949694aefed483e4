//! Database row types. These map directly to SQLite rows and are converted
//! into knock-types models at the store boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use knock_types::models::{Chat, ChatGate, Edge, EdgeStatus, Message};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub is_private: bool,
    pub created_at: String,
}

pub struct EdgeRow {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub status: String,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub initiator: String,
    pub counterpart: String,
    pub gate: String,
    pub opened_by: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at: String,
}

/// SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS[.fff]" without timezone.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = raw.parse::<DateTime<Utc>>() {
        return Ok(ts);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|ndt| ndt.and_utc())
        .with_context(|| format!("Corrupt timestamp '{}'", raw))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Corrupt {} '{}'", what, raw))
}

impl TryFrom<EdgeRow> for Edge {
    type Error = anyhow::Error;

    fn try_from(row: EdgeRow) -> Result<Self> {
        Ok(Edge {
            id: parse_id(&row.id, "knock id")?,
            from: parse_id(&row.from_id, "from_id")?,
            to: parse_id(&row.to_id, "to_id")?,
            status: row.status.parse::<EdgeStatus>()?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

impl TryFrom<ChatRow> for Chat {
    type Error = anyhow::Error;

    fn try_from(row: ChatRow) -> Result<Self> {
        Ok(Chat {
            id: parse_id(&row.id, "chat id")?,
            initiator: parse_id(&row.initiator, "initiator")?,
            counterpart: parse_id(&row.counterpart, "counterpart")?,
            gate: ChatGate::parse(&row.gate)
                .with_context(|| format!("Corrupt gate '{}' on chat '{}'", row.gate, row.id))?,
            opened_by: row
                .opened_by
                .as_deref()
                .map(|raw| parse_id(raw, "opened_by"))
                .transpose()?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: parse_id(&row.id, "message id")?,
            chat_id: parse_id(&row.chat_id, "chat_id")?,
            sender_id: parse_id(&row.sender_id, "sender_id")?,
            body: row.body,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}
