use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId},
    message::{Inbound, Notice},
    registry::Registry,
};

/// Per-recipient result of a fan-out. Never shown to the sender.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failures: Vec<DeliveryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub identity: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastOutcome {
    Delivered,
    NotFound,
    DeliveryFailed,
}

/// What the router did with one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Broadcast(DeliveryReport),
    Unicast(UnicastOutcome),
    Rejected,
    Ignored,
}

/// Routes payloads between registered connections.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Classifies `payload` from `sender` and delivers it.
    pub async fn dispatch(&self, sender: &Connection, payload: &str) -> Dispatch {
        match Inbound::classify(payload) {
            None => Dispatch::Ignored,
            Some(Inbound::Broadcast(body)) => {
                info!(sender = sender.identity(), body, "broadcast message");
                Dispatch::Broadcast(
                    self.broadcast(sender.identity(), body, Some(sender.id()))
                        .await,
                )
            }
            Some(Inbound::Unicast { recipient, body }) => Dispatch::Unicast(
                self.unicast(sender.identity(), recipient, body, sender)
                    .await,
            ),
            Some(Inbound::MalformedUnicast) => {
                self.reject_malformed(sender).await;
                Dispatch::Rejected
            }
        }
    }

    /// Relays `<sender>: <body>` to everyone except `exclude`.
    pub async fn broadcast(
        &self,
        sender: &str,
        body: &str,
        exclude: Option<ConnectionId>,
    ) -> DeliveryReport {
        let notice = Notice::Relay {
            sender: sender.to_string(),
            body: body.to_string(),
        };
        self.announce(&notice, exclude).await
    }

    /// Sends a notice to a snapshot of the registry. A failed recipient is
    /// recorded and skipped.
    pub async fn announce(&self, notice: &Notice, exclude: Option<ConnectionId>) -> DeliveryReport {
        let text = notice.to_string();
        let mut report = DeliveryReport::default();

        for (identity, connection) in self.registry.snapshot() {
            if Some(connection.id()) == exclude {
                continue;
            }
            match connection.send(&text).await {
                Ok(()) => report.delivered.push(identity),
                Err(err) => {
                    warn!(
                        recipient = %identity,
                        peer = ?connection.peer(),
                        error = %err,
                        "broadcast delivery failed"
                    );
                    report.failures.push(DeliveryFailure {
                        identity,
                        reason: err.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Delivers a private message and tells the sender how it went.
    pub async fn unicast(
        &self,
        sender: &str,
        recipient: &str,
        body: &str,
        sender_connection: &Connection,
    ) -> UnicastOutcome {
        let Some(target) = self.registry.lookup(recipient) else {
            warn!(sender, recipient, "private message recipient not found");
            notify(
                sender_connection,
                &Notice::RecipientNotFound {
                    recipient: recipient.to_string(),
                },
            )
            .await;
            return UnicastOutcome::NotFound;
        };

        let relay = Notice::private(sender, body);
        match target.send(&relay.to_string()).await {
            Ok(()) => {
                info!(sender, recipient, "private message delivered");
                notify(
                    sender_connection,
                    &Notice::Delivered {
                        recipient: recipient.to_string(),
                    },
                )
                .await;
                UnicastOutcome::Delivered
            }
            Err(err) => {
                warn!(
                    sender,
                    recipient,
                    peer = ?target.peer(),
                    error = %err,
                    "private message delivery failed"
                );
                notify(
                    sender_connection,
                    &Notice::DeliveryFailed {
                        recipient: recipient.to_string(),
                    },
                )
                .await;
                UnicastOutcome::DeliveryFailed
            }
        }
    }

    pub async fn reject_malformed(&self, sender: &Connection) {
        debug!(sender = sender.identity(), "malformed private message");
        notify(sender, &Notice::InvalidFormat).await;
    }
}

async fn notify(connection: &Connection, notice: &Notice) {
    if let Err(err) = connection.send(&notice.to_string()).await {
        debug!(identity = connection.identity(), ?err, "failed to notify sender");
    }
}
