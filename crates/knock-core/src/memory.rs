//! In-memory stores for tests and local tooling.
//!
//! `MemoryStore` can run a closure right before its next commit, which lets
//! tests replay a concurrent caller landing between another caller's read and
//! write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use chrono::Utc;
use uuid::Uuid;

use knock_types::models::{Chat, ChatGate, Edge, EdgeStatus, Message, RelationshipEvent};

use crate::error::StoreError;
use crate::store::{ChatStore, EdgeWrite, Notifier, PairChange, RelationshipStore, UserDirectory};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, bool>,
    /// (from, to) -> (insertion sequence, edge)
    edges: HashMap<(Uuid, Uuid), (u64, Edge)>,
    chats: HashMap<Uuid, Chat>,
    messages: Vec<Message>,
    seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    before_commit: Mutex<Option<Hook>>,
    busy_commits: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, is_private: bool) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut state) = self.state.lock() {
            state.users.insert(id, is_private);
        }
        id
    }

    pub fn set_private(&self, user: Uuid, is_private: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.users.insert(user, is_private);
        }
    }

    /// Every stored edge, oldest first.
    pub fn all_edges(&self) -> Vec<Edge> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut edges: Vec<_> = state.edges.values().cloned().collect();
        edges.sort_by_key(|(seq, _)| *seq);
        edges.into_iter().map(|(_, e)| e).collect()
    }

    /// Run `hook` at the start of the next commit, before guards are checked.
    pub fn before_next_commit<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut slot) = self.before_commit.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Make the next `n` commits fail with `StoreError::Busy`.
    pub fn fail_next_commits(&self, n: u32) {
        self.busy_commits.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Backend(anyhow!("Memory store lock poisoned: {}", e)))
    }

    fn take_hook(&self) -> Option<Hook> {
        self.before_commit.lock().ok().and_then(|mut slot| slot.take())
    }

    fn filtered<F>(&self, statuses: &[EdgeStatus], keep: F) -> Result<Vec<Edge>, StoreError>
    where
        F: Fn(&Edge) -> bool,
    {
        let state = self.lock()?;
        let mut edges: Vec<_> = state
            .edges
            .values()
            .filter(|(_, e)| statuses.contains(&e.status) && keep(e))
            .cloned()
            .collect();
        edges.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(edges.into_iter().map(|(_, e)| e).collect())
    }
}

impl RelationshipStore for MemoryStore {
    fn edge(&self, id: Uuid) -> Result<Option<Edge>, StoreError> {
        let state = self.lock()?;
        Ok(state.edges.values().find(|(_, e)| e.id == id).map(|(_, e)| e.clone()))
    }

    fn edge_between(&self, from: Uuid, to: Uuid) -> Result<Option<Edge>, StoreError> {
        let state = self.lock()?;
        Ok(state.edges.get(&(from, to)).map(|(_, e)| e.clone()))
    }

    fn commit(&self, change: &PairChange) -> Result<Vec<Edge>, StoreError> {
        if let Some(hook) = self.take_hook() {
            hook();
        }

        let busy = self
            .busy_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if busy.is_ok() {
            return Err(StoreError::Busy);
        }

        let mut state = self.lock()?;
        for guard in &change.guards {
            let actual = state.edges.get(&(guard.from, guard.to)).map(|(_, e)| e.status);
            if actual != guard.expect {
                return Err(StoreError::Conflict);
            }
        }

        // apply to a copy so a failing write leaves nothing behind
        let mut edges = state.edges.clone();
        let mut seq = state.seq;
        let mut written = Vec::new();
        for write in &change.writes {
            match *write {
                EdgeWrite::Insert { id, from, to, status } => {
                    if edges.contains_key(&(from, to)) {
                        return Err(StoreError::Conflict);
                    }
                    seq += 1;
                    let edge = Edge {
                        id,
                        from,
                        to,
                        status,
                        created_at: Utc::now(),
                    };
                    edges.insert((from, to), (seq, edge.clone()));
                    written.push(edge);
                }
                EdgeWrite::SetStatus { from, to, status } => {
                    let (_, edge) = edges.get_mut(&(from, to)).ok_or(StoreError::Conflict)?;
                    edge.status = status;
                    written.push(edge.clone());
                }
                EdgeWrite::Delete { from, to } => {
                    edges.remove(&(from, to)).ok_or(StoreError::Conflict)?;
                }
            }
        }

        state.edges = edges;
        state.seq = seq;
        Ok(written)
    }

    fn edges_to(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<Vec<Edge>, StoreError> {
        self.filtered(statuses, |e| e.to == user)
    }

    fn edges_from(&self, user: Uuid, statuses: &[EdgeStatus]) -> Result<Vec<Edge>, StoreError> {
        self.filtered(statuses, |e| e.from == user)
    }
}

impl UserDirectory for MemoryStore {
    fn exists(&self, user: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock()?.users.contains_key(&user))
    }

    fn is_private(&self, user: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock()?.users.get(&user).copied().unwrap_or(false))
    }
}

impl ChatStore for MemoryStore {
    fn chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        Ok(self.lock()?.chats.get(&id).cloned())
    }

    fn chat_between(&self, a: Uuid, b: Uuid) -> Result<Option<Chat>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .chats
            .values()
            .find(|c| c.has_participant(a) && c.other(a) == Some(b))
            .cloned())
    }

    fn create_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let taken = state
            .chats
            .values()
            .any(|c| c.has_participant(chat.initiator) && c.other(chat.initiator) == Some(chat.counterpart));
        if taken {
            return Err(StoreError::Conflict);
        }
        state.chats.insert(chat.id, chat.clone());
        Ok(())
    }

    fn unlock_chat(&self, chat_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(chat) = state.chats.get_mut(&chat_id) {
            if chat.gate == ChatGate::RestrictedAwaitingReply {
                chat.gate = ChatGate::LockedOpen;
                chat.opened_by = None;
            }
        }
        Ok(())
    }

    fn sent_count(&self, chat_id: Uuid, sender: Uuid) -> Result<u64, StoreError> {
        let state = self.lock()?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id && m.sender_id == sender)
            .count() as u64)
    }

    fn append_message(&self, message: &Message, only_if_first: bool) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if only_if_first
            && state
                .messages
                .iter()
                .any(|m| m.chat_id == message.chat_id && m.sender_id == message.sender_id)
        {
            return Ok(false);
        }
        state.messages.push(message.clone());
        Ok(true)
    }

    fn messages(&self, chat_id: Uuid, limit: u32) -> Result<Vec<Message>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| m.chat_id == chat_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// Keeps every event it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RelationshipEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<RelationshipEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &RelationshipEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|e| anyhow!("Notifier lock poisoned: {}", e))?
            .push(event.clone());
        Ok(())
    }
}
