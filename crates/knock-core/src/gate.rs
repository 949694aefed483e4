//! Cold-outreach lock for direct chats.
//!
//! A chat opened toward a private user who is not locked in with the opener
//! starts restricted: the opener gets one message, then waits for a reply.
//! The restriction is re-derived on every evaluation from the relationship
//! engine plus the chat's `opened_by` marker; the stored gate only records
//! the one-way unlock.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use knock_types::models::{Chat, ChatAccess, ChatGate, Message};

use crate::engine::RelationshipEngine;
use crate::error::{RelationshipError, StoreError};
use crate::store::{ChatStore, UserDirectory};

/// How a send by a given participant would be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Chat is not restricted.
    Free,
    /// The opener's single message while restricted.
    Opening,
    /// The counterpart's reply, which lifts the restriction.
    Reply,
    Denied,
}

/// A stored message and the chat state after it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub access: ChatAccess,
    /// The send lifted the restriction.
    pub unlocked: bool,
}

#[derive(Clone)]
pub struct MessageGate {
    chats: Arc<dyn ChatStore>,
    users: Arc<dyn UserDirectory>,
    engine: RelationshipEngine,
}

impl MessageGate {
    pub fn new(chats: Arc<dyn ChatStore>, users: Arc<dyn UserDirectory>, engine: RelationshipEngine) -> Self {
        Self { chats, users, engine }
    }

    /// Open (or reopen) the direct chat between `initiator` and `counterpart`.
    pub fn open_chat(&self, initiator: Uuid, counterpart: Uuid) -> Result<ChatAccess, RelationshipError> {
        if initiator == counterpart {
            return Err(RelationshipError::SelfTarget);
        }
        if !self.users.exists(counterpart)? {
            return Err(RelationshipError::TargetNotFound);
        }

        if let Some(existing) = self.chats.chat_between(initiator, counterpart)? {
            return self.access_for(&existing, initiator);
        }

        let restricted =
            self.users.is_private(counterpart)? && !self.engine.is_locked_in(initiator, counterpart)?;
        let chat = Chat {
            id: Uuid::new_v4(),
            initiator,
            counterpart,
            gate: if restricted {
                ChatGate::RestrictedAwaitingReply
            } else {
                ChatGate::Open
            },
            opened_by: restricted.then_some(initiator),
            created_at: Utc::now(),
        };

        match self.chats.create_chat(&chat) {
            Ok(()) => {
                info!("Chat {} opened by {} ({:?})", chat.id, initiator, chat.gate);
                self.access_for(&chat, initiator)
            }
            // the other side opened the same pair first
            Err(StoreError::Conflict) => {
                let existing = self
                    .chats
                    .chat_between(initiator, counterpart)?
                    .ok_or(RelationshipError::Unavailable)?;
                self.access_for(&existing, initiator)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Evaluate whether `sender` may post to `chat_id` right now.
    pub fn compute_access(&self, chat_id: Uuid, sender: Uuid) -> Result<ChatAccess, RelationshipError> {
        let chat = self.load(chat_id, sender)?;
        self.access_for(&chat, sender)
    }

    /// Gate and store a message from `sender`.
    pub fn send(&self, chat_id: Uuid, sender: Uuid, body: &str) -> Result<Delivery, RelationshipError> {
        let chat = self.load(chat_id, sender)?;
        let (mut access, admission) = self.evaluate(&chat, sender)?;

        let message = Message {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: sender,
            body: body.to_string(),
            created_at: Utc::now(),
        };

        match admission {
            Admission::Denied => return Err(RelationshipError::ChatRestricted),
            Admission::Opening => {
                if !self.chats.append_message(&message, true)? {
                    debug!("Second opening message from {} in chat {} refused", sender, chat_id);
                    return Err(RelationshipError::ChatRestricted);
                }
            }
            Admission::Free | Admission::Reply => {
                self.chats.append_message(&message, false)?;
            }
        }

        let unlocked = admission == Admission::Reply;
        if unlocked {
            self.chats.unlock_chat(chat_id)?;
            info!("Chat {} unlocked by reply from {}", chat_id, sender);
            access.gate = ChatGate::LockedOpen;
            access.is_restricted = false;
            access.opened_by = None;
        } else if admission == Admission::Opening {
            // the opener's allowance is now spent
            access.allow = false;
        }

        Ok(Delivery {
            message,
            access,
            unlocked,
        })
    }

    pub fn messages(&self, chat_id: Uuid, reader: Uuid, limit: u32) -> Result<Vec<Message>, RelationshipError> {
        self.load(chat_id, reader)?;
        Ok(self.chats.messages(chat_id, limit)?)
    }

    fn load(&self, chat_id: Uuid, user: Uuid) -> Result<Chat, RelationshipError> {
        let chat = self
            .chats
            .chat(chat_id)?
            .ok_or(RelationshipError::ChatNotFound)?;
        if !chat.has_participant(user) {
            return Err(RelationshipError::NotChatParticipant);
        }
        Ok(chat)
    }

    fn access_for(&self, chat: &Chat, sender: Uuid) -> Result<ChatAccess, RelationshipError> {
        Ok(self.evaluate(chat, sender)?.0)
    }

    fn evaluate(&self, chat: &Chat, sender: Uuid) -> Result<(ChatAccess, Admission), RelationshipError> {
        let other = chat.other(sender).ok_or(RelationshipError::NotChatParticipant)?;
        let is_locked_in = self.engine.is_locked_in(sender, other)?;

        let mut access = ChatAccess {
            chat_id: chat.id,
            allow: true,
            is_restricted: false,
            is_locked_in,
            opened_by: None,
            gate: chat.gate,
        };

        let opened_by = match (chat.gate, chat.opened_by) {
            (ChatGate::RestrictedAwaitingReply, Some(opened_by)) => opened_by,
            (ChatGate::RestrictedAwaitingReply, None) | (ChatGate::Open, _) | (ChatGate::LockedOpen, _) => {
                return Ok((access, Admission::Free));
            }
        };

        if is_locked_in {
            self.chats.unlock_chat(chat.id)?;
            info!("Chat {} unlocked by lock-in", chat.id);
            access.gate = ChatGate::LockedOpen;
            return Ok((access, Admission::Free));
        }

        access.is_restricted = true;
        access.opened_by = Some(opened_by);

        let admission = if sender != opened_by {
            Admission::Reply
        } else if self.chats.sent_count(chat.id, sender)? == 0 {
            Admission::Opening
        } else {
            Admission::Denied
        };
        access.allow = admission != Admission::Denied;

        Ok((access, admission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, RecordingNotifier};

    fn setup() -> (Arc<MemoryStore>, RelationshipEngine, MessageGate) {
        let store = Arc::new(MemoryStore::new());
        let engine = RelationshipEngine::new(
            store.clone(),
            store.clone(),
            Arc::new(RecordingNotifier::default()),
        );
        let gate = MessageGate::new(store.clone(), store.clone(), engine.clone());
        (store, engine, gate)
    }

    #[test]
    fn restricted_chat_allows_one_opener_message_until_reply() {
        let (store, _, gate) = setup();
        let a = store.add_user(false);
        let b = store.add_user(true);

        let access = gate.open_chat(a, b).unwrap();
        assert!(access.is_restricted);
        assert_eq!(access.opened_by, Some(a));
        assert_eq!(access.gate, ChatGate::RestrictedAwaitingReply);
        assert!(access.allow);

        let first = gate.send(access.chat_id, a, "hi").unwrap();
        assert!(!first.unlocked);
        assert!(!first.access.allow);

        assert!(matches!(
            gate.send(access.chat_id, a, "hello?"),
            Err(RelationshipError::ChatRestricted)
        ));
        let blocked = gate.compute_access(access.chat_id, a).unwrap();
        assert!(!blocked.allow);
        assert!(blocked.is_restricted);

        let reply = gate.send(access.chat_id, b, "hey").unwrap();
        assert!(reply.unlocked);
        assert_eq!(reply.access.gate, ChatGate::LockedOpen);

        // the reply lifts the restriction for both sides
        let after = gate.compute_access(access.chat_id, a).unwrap();
        assert!(after.allow);
        assert!(!after.is_restricted);
        assert_eq!(after.gate, ChatGate::LockedOpen);
        gate.send(access.chat_id, a, "thanks").unwrap();
        gate.send(access.chat_id, a, "again").unwrap();
        assert_eq!(gate.messages(access.chat_id, b, 50).unwrap().len(), 4);
    }

    #[test]
    fn public_recipient_chat_is_open() {
        let (store, _, gate) = setup();
        let a = store.add_user(true);
        let b = store.add_user(false);

        let access = gate.open_chat(a, b).unwrap();
        assert!(!access.is_restricted);
        assert_eq!(access.gate, ChatGate::Open);
        gate.send(access.chat_id, a, "one").unwrap();
        gate.send(access.chat_id, a, "two").unwrap();

        // recipient turning private later does not re-restrict
        store.set_private(b, true);
        assert!(gate.compute_access(access.chat_id, a).unwrap().allow);
    }

    #[test]
    fn locked_in_pair_opens_unrestricted() {
        let (store, engine, gate) = setup();
        let a = store.add_user(true);
        let b = store.add_user(true);

        let ab = engine.knock(a, b).unwrap();
        engine.knock(b, a).unwrap();
        engine.accept(b, ab.id).unwrap();

        let access = gate.open_chat(a, b).unwrap();
        assert_eq!(access.gate, ChatGate::Open);
        assert!(access.is_locked_in);
    }

    #[test]
    fn lock_in_after_opening_unlocks_for_good() {
        let (store, engine, gate) = setup();
        let a = store.add_user(true);
        let b = store.add_user(true);

        let chat = gate.open_chat(a, b).unwrap();
        gate.send(chat.chat_id, a, "hi").unwrap();
        assert!(!gate.compute_access(chat.chat_id, a).unwrap().allow);

        let ab = engine.knock(a, b).unwrap();
        engine.knock(b, a).unwrap();
        engine.accept(b, ab.id).unwrap();

        let access = gate.compute_access(chat.chat_id, a).unwrap();
        assert!(access.allow);
        assert!(access.is_locked_in);
        assert_eq!(access.gate, ChatGate::LockedOpen);

        // breaking the lock never re-restricts
        engine.break_lock(a, b).unwrap();
        let access = gate.compute_access(chat.chat_id, a).unwrap();
        assert!(access.allow);
        assert!(!access.is_locked_in);
        assert_eq!(access.gate, ChatGate::LockedOpen);
    }

    #[test]
    fn counterpart_may_reply_before_opener_writes() {
        let (store, _, gate) = setup();
        let a = store.add_user(false);
        let b = store.add_user(true);

        let chat = gate.open_chat(a, b).unwrap();
        let reopened = gate.open_chat(b, a).unwrap();
        assert_eq!(reopened.chat_id, chat.chat_id);
        assert!(reopened.is_restricted);

        let delivery = gate.send(chat.chat_id, b, "hello").unwrap();
        assert!(delivery.unlocked);
        assert!(gate.compute_access(chat.chat_id, a).unwrap().allow);
    }

    #[test]
    fn outsiders_and_unknown_chats_are_rejected() {
        let (store, _, gate) = setup();
        let a = store.add_user(false);
        let b = store.add_user(false);
        let c = store.add_user(false);

        let chat = gate.open_chat(a, b).unwrap();
        assert!(matches!(
            gate.send(chat.chat_id, c, "psst"),
            Err(RelationshipError::NotChatParticipant)
        ));
        assert!(matches!(
            gate.compute_access(Uuid::new_v4(), a),
            Err(RelationshipError::ChatNotFound)
        ));
        assert!(matches!(gate.open_chat(a, a), Err(RelationshipError::SelfTarget)));
        assert!(matches!(
            gate.open_chat(a, Uuid::new_v4()),
            Err(RelationshipError::TargetNotFound)
        ));
    }
}
