//! SQLite implementations of the knock-core store traits.

use anyhow::Result;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, ffi};
use thiserror::Error;
use uuid::Uuid;

use knock_core::store::{ChatStore, EdgeWrite, PairChange, RelationshipStore, UserDirectory};
use knock_core::StoreError;
use knock_types::models::{Chat, Edge, EdgeStatus, Message};

use crate::Database;
use crate::models::{ChatRow, EdgeRow, MessageRow};

const EDGE_COLUMNS: &str = "id, from_id, to_id, status, created_at";
const CHAT_COLUMNS: &str = "id, initiator, counterpart, gate, opened_by, created_at";

#[derive(Debug, Error)]
#[error("guard mismatch on knock {from} -> {to}")]
struct GuardMismatch {
    from: Uuid,
    to: Uuid,
}

/// Sort out retryable faults from the anyhow errors the query closures return.
/// True when `err` is a SQLite UNIQUE or PRIMARY KEY violation.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
    )
}

fn classify(err: anyhow::Error) -> StoreError {
    if err.downcast_ref::<GuardMismatch>().is_some() || is_unique_violation(&err) {
        return StoreError::Conflict;
    }
    if let Some(rusqlite::Error::SqliteFailure(failure, _)) = err.downcast_ref::<rusqlite::Error>() {
        if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
            return StoreError::Busy;
        }
    }
    StoreError::Backend(err)
}

fn edge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EdgeRow> {
    Ok(EdgeRow {
        id: row.get(0)?,
        from_id: row.get(1)?,
        to_id: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn chat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        initiator: row.get(1)?,
        counterpart: row.get(2)?,
        gate: row.get(3)?,
        opened_by: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn select_edge(conn: &Connection, from: Uuid, to: Uuid) -> Result<Option<Edge>> {
    let sql = format!("SELECT {} FROM knocks WHERE from_id = ?1 AND to_id = ?2", EDGE_COLUMNS);
    let row = conn
        .query_row(&sql, [from.to_string(), to.to_string()], edge_row)
        .optional()?;
    row.map(Edge::try_from).transpose()
}

/// The pair in a stable order, for the chats uniqueness key.
fn sorted_pair(a: Uuid, b: Uuid) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl Database {
    fn query_edges(&self, column: &str, user: Uuid, statuses: &[EdgeStatus]) -> Result<Vec<Edge>, StoreError> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (2..statuses.len() + 2).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {} FROM knocks WHERE {} = ?1 AND status IN ({})
                 ORDER BY created_at DESC, rowid DESC",
                EDGE_COLUMNS,
                column,
                placeholders.join(", ")
            );

            let mut params = vec![user.to_string()];
            params.extend(statuses.iter().map(|s| s.as_str().to_string()));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), edge_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(Edge::try_from).collect()
        })
        .map_err(classify)
    }

    fn count_edges(&self, column: &str, user: Uuid, statuses: &[EdgeStatus]) -> Result<u64, StoreError> {
        if statuses.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (2..statuses.len() + 2).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT COUNT(*) FROM knocks WHERE {} = ?1 AND status IN ({})",
                column,
                placeholders.join(", ")
            );

            let mut params = vec![user.to_string()];
            params.extend(statuses.iter().map(|s| s.as_str().to_string()));

            let count: i64 = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |r| r.get(0))?;
            Ok(count as u64)
        })
        .map_err(classify)
    }
}

impl RelationshipStore for Database {
    fn edge(&self, id: Uuid) -> Result<Option<Edge>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM knocks WHERE id = ?1", EDGE_COLUMNS);
            let row = conn.query_row(&sql, [id.to_string()], edge_row).optional()?;
            row.map(Edge::try_from).transpose()
        })
        .map_err(classify)
    }

    fn edge_between(&self, from: Uuid, to: Uuid) -> Result<Option<Edge>, StoreError> {
        self.with_conn(|conn| select_edge(conn, from, to)).map_err(classify)
    }

    fn commit(&self, change: &PairChange) -> Result<Vec<Edge>, StoreError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            for guard in &change.guards {
                let actual: Option<String> = tx
                    .query_row(
                        "SELECT status FROM knocks WHERE from_id = ?1 AND to_id = ?2",
                        [guard.from.to_string(), guard.to.to_string()],
                        |r| r.get(0),
                    )
                    .optional()?;
                let actual = actual.map(|s| s.parse::<EdgeStatus>()).transpose()?;
                if actual != guard.expect {
                    return Err(GuardMismatch {
                        from: guard.from,
                        to: guard.to,
                    }
                    .into());
                }
            }

            let mut written = Vec::new();
            for write in &change.writes {
                match *write {
                    EdgeWrite::Insert { id, from, to, status } => {
                        tx.execute(
                            "INSERT INTO knocks (id, from_id, to_id, status) VALUES (?1, ?2, ?3, ?4)",
                            [id.to_string(), from.to_string(), to.to_string(), status.as_str().to_string()],
                        )?;
                        written.extend(select_edge(&tx, from, to)?);
                    }
                    EdgeWrite::SetStatus { from, to, status } => {
                        let changed = tx.execute(
                            "UPDATE knocks SET status = ?3 WHERE from_id = ?1 AND to_id = ?2",
                            [from.to_string(), to.to_string(), status.as_str().to_string()],
                        )?;
                        if changed == 0 {
                            return Err(GuardMismatch { from, to }.into());
                        }
                        written.extend(select_edge(&tx, from, to)?);
                    }
                    EdgeWrite::Delete { from, to } => {
                        let changed = tx.execute(
                            "DELETE FROM knocks WHERE from_id = ?1 AND to_id = ?2",
                            [from.to_string(), to.to_string()],
                        )?;
                        if changed == 0 {
                            return Err(GuardMismatch { from, to }.into());
                        }
                    }
                }
            }

            tx.commit()?;
            Ok(written)
        })
        .map_err(classify)
    }

    fn edges_to(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<Vec<Edge>, StoreError> {
        self.query_edges("to_id", user, statuses)
    }

    fn edges_from(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<Vec<Edge>, StoreError> {
        self.query_edges("from_id", user, statuses)
    }

    fn count_to(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<u64, StoreError> {
        self.count_edges("to_id", user, statuses)
    }

    fn count_from(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<u64, StoreError> {
        self.count_edges("from_id", user, statuses)
    }
}

impl UserDirectory for Database {
    fn exists(&self, user: Uuid) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [user.to_string()], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
        .map_err(classify)
    }

    fn is_private(&self, user: Uuid) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let flag: Option<bool> = conn
                .query_row(
                    "SELECT is_private FROM users WHERE id = ?1",
                    [user.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(flag.unwrap_or(false))
        })
        .map_err(classify)
    }
}

impl ChatStore for Database {
    fn chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM chats WHERE id = ?1", CHAT_COLUMNS);
            let row = conn.query_row(&sql, [id.to_string()], chat_row).optional()?;
            row.map(Chat::try_from).transpose()
        })
        .map_err(classify)
    }

    fn chat_between(&self, a: Uuid, b: Uuid) -> Result<Option<Chat>, StoreError> {
        let (low, high) = sorted_pair(a, b);
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chats WHERE user_low = ?1 AND user_high = ?2",
                CHAT_COLUMNS
            );
            let row = conn.query_row(&sql, [low, high], chat_row).optional()?;
            row.map(Chat::try_from).transpose()
        })
        .map_err(classify)
    }

    fn create_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        let (low, high) = sorted_pair(chat.initiator, chat.counterpart);
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chats (id, user_low, user_high, initiator, counterpart, gate, opened_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    chat.id.to_string(),
                    low,
                    high,
                    chat.initiator.to_string(),
                    chat.counterpart.to_string(),
                    chat.gate.as_str(),
                    chat.opened_by.map(|u| u.to_string()),
                    format_timestamp(&chat.created_at),
                ],
            )?;
            Ok(())
        })
        .map_err(classify)
    }

    fn unlock_chat(&self, chat_id: Uuid) -> Result<(), StoreError> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE chats SET gate = 'locked_open', opened_by = NULL
                 WHERE id = ?1 AND gate = 'restricted'",
                [chat_id.to_string()],
            )?;
            Ok(())
        })
        .map_err(classify)
    }

    fn sent_count(&self, chat_id: Uuid, sender: Uuid) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND sender_id = ?2",
                [chat_id.to_string(), sender.to_string()],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
        .map_err(classify)
    }

    fn append_message(&self, message: &Message, only_if_first: bool) -> Result<bool, StoreError> {
        let sql = if only_if_first {
            "INSERT INTO messages (id, chat_id, sender_id, body, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE NOT EXISTS (SELECT 1 FROM messages WHERE chat_id = ?2 AND sender_id = ?3)"
        } else {
            "INSERT INTO messages (id, chat_id, sender_id, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)"
        };

        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                sql,
                rusqlite::params![
                    message.id.to_string(),
                    message.chat_id.to_string(),
                    message.sender_id.to_string(),
                    message.body,
                    format_timestamp(&message.created_at),
                ],
            )?;
            Ok(inserted == 1)
        })
        .map_err(classify)
    }

    fn messages(&self, chat_id: Uuid, limit: u32) -> Result<Vec<Message>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, sender_id, body, created_at
                 FROM messages
                 WHERE chat_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![chat_id.to_string(), limit], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        body: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(Message::try_from).collect()
        })
        .map_err(classify)
    }
}

fn format_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use knock_core::memory::RecordingNotifier;
    use knock_core::store::Guard;
    use knock_core::{MessageGate, RelationshipEngine, RelationshipError};
    use knock_types::models::ChatGate;

    fn open() -> (tempfile::TempDir, Arc<Database>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("knock.db")).unwrap();
        (dir, Arc::new(db))
    }

    fn user(db: &Database, name: &str, is_private: bool) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), name, "hash", is_private).unwrap();
        id
    }

    fn engine(db: &Arc<Database>) -> RelationshipEngine {
        RelationshipEngine::new(db.clone(), db.clone(), Arc::new(RecordingNotifier::default()))
    }

    #[test]
    fn stale_guard_conflicts_and_writes_nothing() {
        let (_dir, db) = open();
        let a = user(&db, "alice", false);
        let b = user(&db, "bob", false);

        let change = PairChange {
            guards: vec![Guard { from: b, to: a, expect: Some(EdgeStatus::OneSided) }],
            writes: vec![EdgeWrite::Insert {
                id: Uuid::new_v4(),
                from: a,
                to: b,
                status: EdgeStatus::OneSided,
            }],
        };
        assert!(matches!(db.commit(&change), Err(StoreError::Conflict)));
        assert!(db.edge_between(a, b).unwrap().is_none());
    }

    #[test]
    fn duplicate_username_is_unique_violation() {
        let (_dir, db) = open();
        user(&db, "alice", false);

        let err = db
            .create_user(&Uuid::new_v4().to_string(), "alice", "hash", true)
            .unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(!is_unique_violation(&anyhow::anyhow!("unrelated")));
    }

    #[test]
    fn duplicate_insert_is_conflict() {
        let (_dir, db) = open();
        let a = user(&db, "alice", false);
        let b = user(&db, "bob", false);

        let insert = |id| PairChange {
            guards: vec![],
            writes: vec![EdgeWrite::Insert { id, from: a, to: b, status: EdgeStatus::Pending }],
        };
        let written = db.commit(&insert(Uuid::new_v4())).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].status, EdgeStatus::Pending);

        assert!(matches!(db.commit(&insert(Uuid::new_v4())), Err(StoreError::Conflict)));
    }

    #[test]
    fn failed_write_rolls_back_earlier_writes() {
        let (_dir, db) = open();
        let a = user(&db, "alice", false);
        let b = user(&db, "bob", false);

        let change = PairChange {
            guards: vec![],
            writes: vec![
                EdgeWrite::Insert { id: Uuid::new_v4(), from: a, to: b, status: EdgeStatus::LockedIn },
                EdgeWrite::SetStatus { from: b, to: a, status: EdgeStatus::LockedIn },
            ],
        };
        assert!(matches!(db.commit(&change), Err(StoreError::Conflict)));
        assert!(db.edge_between(a, b).unwrap().is_none());
    }

    #[test]
    fn handshake_on_sqlite() {
        let (_dir, db) = open();
        let engine = engine(&db);
        let a = user(&db, "alice", false);
        let b = user(&db, "bob", false);
        let c = user(&db, "carol", true);

        let ab = engine.knock(a, b).unwrap();
        assert_eq!(ab.status, EdgeStatus::OneSided);

        let locked = engine.knock_back(b, ab.id).unwrap();
        assert_eq!(locked.len(), 2);
        assert!(engine.is_locked_in(a, b).unwrap());

        let ac = engine.knock(a, c).unwrap();
        assert_eq!(ac.status, EdgeStatus::Pending);
        assert_eq!(engine.list_pending(c).unwrap(), vec![ac.clone()]);
        assert!(matches!(engine.knock(a, c), Err(RelationshipError::DuplicateEdge)));

        engine.decline(c, ac.id).unwrap();
        assert!(matches!(
            engine.decline(c, ac.id),
            Err(RelationshipError::EdgeNotFoundOrNotEligible)
        ));

        let counts = engine.counts(a).unwrap();
        assert_eq!(counts.locked_in_count, 1);
        assert_eq!(counts.outgoing_count, 0);

        engine.break_lock(b, a).unwrap();
        assert!(db.edge_between(b, a).unwrap().is_none());
        assert_eq!(
            db.edge_between(a, b).unwrap().map(|e| e.status),
            Some(EdgeStatus::OneSided)
        );
        assert_eq!(engine.list_incoming(b).unwrap().len(), 1);
    }

    #[test]
    fn privacy_flag_feeds_directory() {
        let (_dir, db) = open();
        let a = user(&db, "alice", false);
        assert!(db.exists(a).unwrap());
        assert!(!db.is_private(a).unwrap());

        assert!(db.set_private(&a.to_string(), true).unwrap());
        assert!(db.is_private(a).unwrap());
        assert!(!db.exists(Uuid::new_v4()).unwrap());
        assert!(!db.set_private(&Uuid::new_v4().to_string(), true).unwrap());
    }

    #[test]
    fn restricted_chat_on_sqlite() {
        let (_dir, db) = open();
        let engine = engine(&db);
        let gate = MessageGate::new(db.clone(), db.clone(), engine);
        let a = user(&db, "alice", false);
        let b = user(&db, "bob", true);

        let access = gate.open_chat(a, b).unwrap();
        assert!(access.is_restricted);
        assert_eq!(db.chat_between(b, a).unwrap().map(|c| c.id), Some(access.chat_id));

        gate.send(access.chat_id, a, "hi").unwrap();
        assert!(matches!(
            gate.send(access.chat_id, a, "hi again"),
            Err(RelationshipError::ChatRestricted)
        ));

        let message = Message {
            id: Uuid::new_v4(),
            chat_id: access.chat_id,
            sender_id: a,
            body: "sneaky".into(),
            created_at: chrono::Utc::now(),
        };
        assert!(!db.append_message(&message, true).unwrap());

        let reply = gate.send(access.chat_id, b, "hello").unwrap();
        assert!(reply.unlocked);
        let chat = db.chat(access.chat_id).unwrap().unwrap();
        assert_eq!(chat.gate, ChatGate::LockedOpen);
        assert_eq!(chat.opened_by, None);

        let history = gate.messages(access.chat_id, a, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].body, "hello");
    }
}
