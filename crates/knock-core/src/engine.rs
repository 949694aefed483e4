//! Knock handshake transitions.
//!
//! Each operation re-reads the pair of directed edges it touches, plans the
//! transition with a pure function, and commits the plan guarded by the
//! pre-state of both edges. A guard mismatch means another caller moved the
//! pair first; the operation then re-reads and re-plans.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info, warn};
use uuid::Uuid;

use knock_types::models::{Edge, EdgeStatus, KnockCounts, RelationshipEvent, RelationshipKind};

use crate::error::{RelationshipError, StoreError};
use crate::store::{EdgeWrite, Guard, Notifier, PairChange, RelationshipStore, UserDirectory};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Both directed edges between two users, oriented from the first to the second.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pair {
    pub forward: Option<Edge>,
    pub reverse: Option<Edge>,
}

impl Pair {
    pub fn is_locked_in(&self) -> bool {
        status_of(&self.forward) == Some(EdgeStatus::LockedIn)
            && status_of(&self.reverse) == Some(EdgeStatus::LockedIn)
    }
}

fn status_of(edge: &Option<Edge>) -> Option<EdgeStatus> {
    edge.as_ref().map(|e| e.status)
}

/// Writes and events for one transition, valid against the pair it was planned from.
#[derive(Debug, Default)]
pub struct Plan {
    pub change: PairChange,
    pub events: Vec<RelationshipEvent>,
}

impl Plan {
    /// A plan guarded on the current state of both directions of (a, b).
    fn guarding(a: Uuid, b: Uuid, pair: &Pair) -> Self {
        let mut plan = Self::default();
        plan.change.guards.push(Guard {
            from: a,
            to: b,
            expect: status_of(&pair.forward),
        });
        plan.change.guards.push(Guard {
            from: b,
            to: a,
            expect: status_of(&pair.reverse),
        });
        plan
    }

    fn insert(&mut self, id: Uuid, from: Uuid, to: Uuid, status: EdgeStatus) {
        self.change.writes.push(EdgeWrite::Insert { id, from, to, status });
    }

    fn set(&mut self, from: Uuid, to: Uuid, status: EdgeStatus) {
        self.change.writes.push(EdgeWrite::SetStatus { from, to, status });
    }

    fn delete(&mut self, from: Uuid, to: Uuid) {
        self.change.writes.push(EdgeWrite::Delete { from, to });
    }

    fn event(&mut self, kind: RelationshipKind, from: Uuid, to: Uuid, edge_id: Uuid) {
        self.events.push(RelationshipEvent {
            kind,
            from,
            to,
            edge_id,
        });
    }

    /// Lock in both directions of a pair where the edge a -> b already exists.
    fn promote(&mut self, a: Uuid, b: Uuid, reverse: &Option<Edge>) {
        self.set(a, b, EdgeStatus::LockedIn);
        match reverse {
            Some(edge) if edge.status == EdgeStatus::LockedIn => {}
            Some(_) => self.set(b, a, EdgeStatus::LockedIn),
            None => self.insert(Uuid::new_v4(), b, a, EdgeStatus::LockedIn),
        }
    }
}

/// `pair` is oriented from -> to.
pub fn plan_knock(
    from: Uuid,
    to: Uuid,
    from_private: bool,
    to_private: bool,
    pair: &Pair,
) -> Result<Plan, RelationshipError> {
    if pair.forward.is_some() {
        return Err(RelationshipError::DuplicateEdge);
    }

    let id = Uuid::new_v4();
    let mut plan = Plan::guarding(from, to, pair);

    if to_private {
        plan.insert(id, from, to, EdgeStatus::Pending);
        plan.event(RelationshipKind::Invite, from, to, id);
    } else if pair.reverse.is_some() && !from_private {
        plan.insert(id, from, to, EdgeStatus::LockedIn);
        if status_of(&pair.reverse) != Some(EdgeStatus::LockedIn) {
            plan.set(to, from, EdgeStatus::LockedIn);
        }
        plan.event(RelationshipKind::MutualLock, from, to, id);
    } else {
        plan.insert(id, from, to, EdgeStatus::OneSided);
        plan.event(RelationshipKind::OneWayNotice, from, to, id);
    }

    Ok(plan)
}

/// `pair` is oriented origin -> actor; its forward edge must be `edge_id`.
pub fn plan_knock_back(
    actor: Uuid,
    origin: Uuid,
    edge_id: Uuid,
    origin_private: bool,
    pair: &Pair,
) -> Result<Plan, RelationshipError> {
    eligible(&pair.forward, edge_id, EdgeStatus::OneSided)?;
    let mut plan = Plan::guarding(origin, actor, pair);

    if origin_private {
        match status_of(&pair.reverse) {
            Some(EdgeStatus::Pending) => {
                plan.promote(origin, actor, &pair.reverse);
                plan.event(RelationshipKind::MutualLock, actor, origin, edge_id);
            }
            Some(_) => return Err(RelationshipError::DuplicateEdge),
            None => {
                let id = Uuid::new_v4();
                plan.insert(id, actor, origin, EdgeStatus::Pending);
                plan.event(RelationshipKind::Invite, actor, origin, id);
            }
        }
    } else {
        plan.promote(origin, actor, &pair.reverse);
        plan.event(RelationshipKind::MutualLock, actor, origin, edge_id);
    }

    Ok(plan)
}

/// `pair` is oriented origin -> actor; its forward edge must be `edge_id`.
pub fn plan_accept(
    actor: Uuid,
    origin: Uuid,
    edge_id: Uuid,
    origin_private: bool,
    actor_private: bool,
    pair: &Pair,
) -> Result<Plan, RelationshipError> {
    eligible(&pair.forward, edge_id, EdgeStatus::Pending)?;
    let mut plan = Plan::guarding(origin, actor, pair);

    let promote = match (status_of(&pair.reverse), origin_private, actor_private) {
        (Some(EdgeStatus::OneSided), _, _) => true,
        (Some(EdgeStatus::Pending), true, true) => true,
        (Some(EdgeStatus::Pending), false, true) => true,
        // Origin private, acceptor public: no promotion rule exists for this
        // combination, so it takes the one-sided default below.
        (Some(EdgeStatus::Pending), true, false) => false,
        _ => false,
    };

    if promote {
        plan.promote(origin, actor, &pair.reverse);
        plan.event(RelationshipKind::MutualLock, actor, origin, edge_id);
    } else {
        plan.set(origin, actor, EdgeStatus::OneSided);
        plan.event(RelationshipKind::Accepted, actor, origin, edge_id);
    }

    Ok(plan)
}

/// `pair` is oriented origin -> actor.
pub fn plan_decline(actor: Uuid, origin: Uuid, edge_id: Uuid, pair: &Pair) -> Result<Plan, RelationshipError> {
    eligible(&pair.forward, edge_id, EdgeStatus::Pending)?;
    let mut plan = Plan::guarding(origin, actor, pair);
    plan.delete(origin, actor);
    plan.event(RelationshipKind::Declined, actor, origin, edge_id);
    Ok(plan)
}

/// `pair` is oriented actor -> target.
pub fn plan_unknock(actor: Uuid, target: Uuid, edge_id: Uuid, pair: &Pair) -> Result<Plan, RelationshipError> {
    match &pair.forward {
        Some(edge)
            if edge.id == edge_id
                && matches!(edge.status, EdgeStatus::Pending | EdgeStatus::OneSided) => {}
        _ => return Err(RelationshipError::EdgeNotFoundOrNotEligible),
    }
    let mut plan = Plan::guarding(actor, target, pair);
    plan.delete(actor, target);
    Ok(plan)
}

/// `pair` is oriented actor -> counterpart.
pub fn plan_break_lock(actor: Uuid, counterpart: Uuid, pair: &Pair) -> Result<Plan, RelationshipError> {
    let surviving = match (&pair.forward, &pair.reverse) {
        (Some(f), Some(r)) if f.status == EdgeStatus::LockedIn && r.status == EdgeStatus::LockedIn => r.id,
        _ => return Err(RelationshipError::EdgeNotFoundOrNotEligible),
    };
    let mut plan = Plan::guarding(actor, counterpart, pair);
    plan.delete(actor, counterpart);
    plan.set(counterpart, actor, EdgeStatus::OneSided);
    plan.event(RelationshipKind::Broken, actor, counterpart, surviving);
    Ok(plan)
}

fn eligible(edge: &Option<Edge>, edge_id: Uuid, status: EdgeStatus) -> Result<(), RelationshipError> {
    match edge {
        Some(e) if e.id == edge_id && e.status == status => Ok(()),
        _ => Err(RelationshipError::EdgeNotFoundOrNotEligible),
    }
}

/// Outcome of one planning attempt: a store fault (maybe retryable) or a
/// domain decision.
type Attempt = Result<Result<Plan, RelationshipError>, StoreError>;

#[derive(Clone)]
pub struct RelationshipEngine {
    store: Arc<dyn RelationshipStore>,
    users: Arc<dyn UserDirectory>,
    notifier: Arc<dyn Notifier>,
    max_attempts: u32,
}

impl RelationshipEngine {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        users: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            users,
            notifier,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    // -- Transitions --

    pub fn knock(&self, from: Uuid, to: Uuid) -> Result<Edge, RelationshipError> {
        if from == to {
            return Err(RelationshipError::SelfTarget);
        }

        let edges = self.transact("knock", || {
            if !self.users.exists(to)? {
                return Ok(Err(RelationshipError::TargetNotFound));
            }
            let from_private = self.users.is_private(from)?;
            let to_private = self.users.is_private(to)?;
            let pair = self.pair(from, to)?;
            Ok(plan_knock(from, to, from_private, to_private, &pair))
        })?;

        take_edge(edges, |e| e.from == from && e.to == to)
    }

    pub fn knock_back(&self, actor: Uuid, edge_id: Uuid) -> Result<Vec<Edge>, RelationshipError> {
        self.transact("knock_back", || {
            let origin = match self.store.edge(edge_id)? {
                Some(edge) if edge.to == actor => edge.from,
                _ => return Ok(Err(RelationshipError::EdgeNotFoundOrNotEligible)),
            };
            let origin_private = self.users.is_private(origin)?;
            let pair = self.pair(origin, actor)?;
            Ok(plan_knock_back(actor, origin, edge_id, origin_private, &pair))
        })
    }

    pub fn accept(&self, actor: Uuid, edge_id: Uuid) -> Result<Edge, RelationshipError> {
        let edges = self.transact("accept", || {
            let origin = match self.store.edge(edge_id)? {
                Some(edge) if edge.to == actor => edge.from,
                _ => return Ok(Err(RelationshipError::EdgeNotFoundOrNotEligible)),
            };
            let origin_private = self.users.is_private(origin)?;
            let actor_private = self.users.is_private(actor)?;
            let pair = self.pair(origin, actor)?;
            Ok(plan_accept(actor, origin, edge_id, origin_private, actor_private, &pair))
        })?;

        take_edge(edges, |e| e.id == edge_id)
    }

    pub fn decline(&self, actor: Uuid, edge_id: Uuid) -> Result<(), RelationshipError> {
        self.transact("decline", || {
            let origin = match self.store.edge(edge_id)? {
                Some(edge) if edge.to == actor => edge.from,
                _ => return Ok(Err(RelationshipError::EdgeNotFoundOrNotEligible)),
            };
            let pair = self.pair(origin, actor)?;
            Ok(plan_decline(actor, origin, edge_id, &pair))
        })?;
        Ok(())
    }

    /// Withdraw a pending or one-sided knock the actor sent.
    pub fn unknock(&self, actor: Uuid, edge_id: Uuid) -> Result<(), RelationshipError> {
        self.transact("unknock", || {
            let target = match self.store.edge(edge_id)? {
                Some(edge) if edge.from == actor => edge.to,
                _ => return Ok(Err(RelationshipError::EdgeNotFoundOrNotEligible)),
            };
            let pair = self.pair(actor, target)?;
            Ok(plan_unknock(actor, target, edge_id, &pair))
        })?;
        Ok(())
    }

    pub fn break_lock(&self, actor: Uuid, counterpart: Uuid) -> Result<(), RelationshipError> {
        if actor == counterpart {
            return Err(RelationshipError::SelfTarget);
        }
        self.transact("break_lock", || {
            let pair = self.pair(actor, counterpart)?;
            Ok(plan_break_lock(actor, counterpart, &pair))
        })?;
        Ok(())
    }

    // -- Queries --

    /// One-sided knocks received by `user`, which they may knock back.
    pub fn list_incoming(&self, user: Uuid) -> Result<Vec<Edge>, RelationshipError> {
        Ok(self.store.edges_to(user, &[EdgeStatus::OneSided])?)
    }

    /// Knocks sent by `user` that are not locked in.
    pub fn list_outgoing(&self, user: Uuid) -> Result<Vec<Edge>, RelationshipError> {
        Ok(self
            .store
            .edges_from(user, &[EdgeStatus::Pending, EdgeStatus::OneSided])?)
    }

    /// Requests awaiting a decision from `user`.
    pub fn list_pending(&self, user: Uuid) -> Result<Vec<Edge>, RelationshipError> {
        Ok(self.store.edges_to(user, &[EdgeStatus::Pending])?)
    }

    pub fn counts(&self, user: Uuid) -> Result<KnockCounts, RelationshipError> {
        Ok(KnockCounts {
            incoming_count: self.store.count_to(user, &[EdgeStatus::OneSided])?,
            outgoing_count: self
                .store
                .count_from(user, &[EdgeStatus::Pending, EdgeStatus::OneSided])?,
            locked_in_count: self.store.count_from(user, &[EdgeStatus::LockedIn])?,
        })
    }

    /// Both edges between `a` and `b`, oriented a -> b.
    pub fn relationship(&self, a: Uuid, b: Uuid) -> Result<Pair, RelationshipError> {
        Ok(self.pair(a, b)?)
    }

    pub fn is_locked_in(&self, a: Uuid, b: Uuid) -> Result<bool, RelationshipError> {
        Ok(self.pair(a, b)?.is_locked_in())
    }

    // -- Internals --

    fn pair(&self, a: Uuid, b: Uuid) -> Result<Pair, StoreError> {
        Ok(Pair {
            forward: self.store.edge_between(a, b)?,
            reverse: self.store.edge_between(b, a)?,
        })
    }

    fn transact<F>(&self, op: &str, mut attempt: F) -> Result<Vec<Edge>, RelationshipError>
    where
        F: FnMut() -> Attempt,
    {
        let mut tries = 0;
        loop {
            tries += 1;

            let plan = match attempt() {
                Ok(Ok(plan)) => plan,
                Ok(Err(rejected)) => {
                    debug!("{} rejected: {}", op, rejected);
                    return Err(rejected);
                }
                Err(e) => {
                    self.retry_or_fail(op, tries, e)?;
                    continue;
                }
            };

            debug!("{} plan: {:?}", op, plan.change.writes);

            match self.store.commit(&plan.change) {
                Ok(edges) => {
                    self.emit(&plan.events);
                    return Ok(edges);
                }
                Err(StoreError::Conflict) if tries >= self.max_attempts => {
                    // The winning write may now read as a domain rejection
                    if let Ok(Err(rejected)) = attempt() {
                        debug!("{} rejected after conflict: {}", op, rejected);
                        return Err(rejected);
                    }
                    warn!("{} gave up after {} attempts: write conflict", op, tries);
                    return Err(RelationshipError::Unavailable);
                }
                Err(e) => self.retry_or_fail(op, tries, e)?,
            }
        }
    }

    fn retry_or_fail(&self, op: &str, tries: u32, err: StoreError) -> Result<(), RelationshipError> {
        if !err.is_transient() {
            return Err(err.into());
        }
        if tries >= self.max_attempts {
            warn!("{} gave up after {} attempts: {}", op, tries, err);
            return Err(RelationshipError::Unavailable);
        }
        warn!("{} attempt {} hit {}, retrying", op, tries, err);
        Ok(())
    }

    fn emit(&self, events: &[RelationshipEvent]) {
        for event in events {
            info!(
                "{:?}: {} -> {} (edge {})",
                event.kind, event.from, event.to, event.edge_id
            );
            if let Err(e) = self.notifier.notify(event) {
                warn!("Failed to dispatch {:?} event for edge {}: {}", event.kind, event.edge_id, e);
            }
        }
    }
}

fn take_edge<P>(edges: Vec<Edge>, pred: P) -> Result<Edge, RelationshipError>
where
    P: Fn(&Edge) -> bool,
{
    edges
        .into_iter()
        .find(|e| pred(e))
        .ok_or_else(|| RelationshipError::Storage(anyhow!("commit did not return the written edge")))
}
