//! Knock relationship core.
//!
//! `RelationshipEngine` drives the directed-edge handshake between two users
//! toward a symmetric locked-in state. `MessageGate` uses that state to decide
//! who may write into a direct chat. Persistence, user lookup and event
//! delivery sit behind the traits in [`store`].

pub mod engine;
pub mod error;
pub mod gate;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod store;

pub use engine::{Pair, RelationshipEngine};
pub use error::{RelationshipError, StoreError};
pub use gate::{Delivery, MessageGate};
pub use store::{ChatStore, Notifier, RelationshipStore, UserDirectory};
