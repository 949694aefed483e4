use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::debug;

use knock_core::Notifier;
use knock_types::events::GatewayEvent;
use knock_types::models::RelationshipEvent;

use crate::dispatcher::Dispatcher;

/// Fire-and-forget notifier. Events are queued on an unbounded channel and
/// a background task delivers each one to both parties of the edge.
#[derive(Clone)]
pub struct GatewayNotifier {
    tx: mpsc::UnboundedSender<RelationshipEvent>,
}

impl GatewayNotifier {
    /// Must be called from within a tokio runtime.
    pub fn spawn(dispatcher: Dispatcher) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RelationshipEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                route(&dispatcher, event).await;
            }
            debug!("Gateway notifier queue closed");
        });

        Self { tx }
    }
}

async fn route(dispatcher: &Dispatcher, event: RelationshipEvent) {
    let participants = [event.from, event.to];
    let gateway_event = GatewayEvent::Relationship {
        kind: event.kind,
        from: event.from,
        to: event.to,
        edge_id: event.edge_id,
    };
    dispatcher.send_to_users(&participants, gateway_event).await;
}

impl Notifier for GatewayNotifier {
    fn notify(&self, event: &RelationshipEvent) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow!("gateway notifier task has stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knock_types::models::RelationshipKind;
    use uuid::Uuid;

    #[tokio::test]
    async fn relationship_events_reach_both_parties() {
        let dispatcher = Dispatcher::new();
        let notifier = GatewayNotifier::spawn(dispatcher.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_, mut alice_rx) = dispatcher.register_user_channel(alice).await;
        let (_, mut bob_rx) = dispatcher.register_user_channel(bob).await;

        let edge_id = Uuid::new_v4();
        notifier
            .notify(&RelationshipEvent {
                kind: RelationshipKind::MutualLock,
                from: alice,
                to: bob,
                edge_id,
            })
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.recv().await {
                Some(GatewayEvent::Relationship { kind, edge_id: id, .. }) => {
                    assert_eq!(kind, RelationshipKind::MutualLock);
                    assert_eq!(id, edge_id);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn offline_recipient_is_skipped() {
        let dispatcher = Dispatcher::new();
        let notifier = GatewayNotifier::spawn(dispatcher.clone());
        let alice = Uuid::new_v4();
        let (_, mut alice_rx) = dispatcher.register_user_channel(alice).await;

        notifier
            .notify(&RelationshipEvent {
                kind: RelationshipKind::Invite,
                from: Uuid::new_v4(),
                to: alice,
                edge_id: Uuid::new_v4(),
            })
            .unwrap();

        assert!(matches!(alice_rx.recv().await, Some(GatewayEvent::Relationship { .. })));
    }
}
