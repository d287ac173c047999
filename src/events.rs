//! The outbound Event Bus.
//!
//! Every subsystem (transport, shell, SFTP engine, port-forwarding manager,
//! reconnect controller, host-key verifier) publishes [`Event`]s tagged with
//! the id of the thing they're about. [`EventBus::subscribe`] hands back a
//! [`tokio::sync::broadcast::Receiver`] and a [`SubscriptionId`] the caller
//! can later pass to [`EventBus::unsubscribe`] purely for bookkeeping;
//! dropping the receiver is what actually stops delivery.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::ids::{ConnectionId, RuleId, ShellId, SubscriptionId, TransferId};

/// Capacity of the broadcast channel each subscriber reads from. Lagging
/// subscribers miss events rather than stall publishers; at-least-once
/// delivery within one process lifetime, per the dispatcher contract, does
/// not promise delivery to a subscriber that falls this far behind.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbdiPrompt {
    pub prompt: String,
    pub echo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostKeyVerifyRequest {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub fingerprint: String,
    pub public_key_base64: String,
    pub status: crate::hostkey::VerifyStatus,
    pub previous_fingerprint: Option<String>,
    pub previous_trusted_at: Option<u64>,
}

/// Every event the core can publish, tagged with the id of the connection,
/// shell, transfer or rule it concerns. `#[serde(tag = "type")]` gives each
/// variant a discriminant string on the wire (`ssh:status-change`, and so
/// on) matching the names used in the presentation contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "ssh:status-change")]
    SshStatusChange {
        connection_id: ConnectionId,
        status: ConnectionStatus,
    },
    #[serde(rename = "ssh:error")]
    SshError {
        connection_id: ConnectionId,
        error: String,
    },
    #[serde(rename = "ssh:banner")]
    SshBanner {
        connection_id: ConnectionId,
        message: String,
    },
    #[serde(rename = "ssh:kbdi-prompt")]
    SshKbdiPrompt {
        connection_id: ConnectionId,
        name: Option<String>,
        instruction: Option<String>,
        prompts: Vec<KbdiPrompt>,
    },
    #[serde(rename = "ssh:reconnect-waiting")]
    ReconnectWaiting {
        connection_id: ConnectionId,
        delay_ms: u64,
        next_attempt: u32,
        next_retry_at: u64,
    },
    #[serde(rename = "ssh:reconnect-attempt")]
    ReconnectAttempt {
        connection_id: ConnectionId,
        attempt: u32,
        max_attempts: u32,
    },
    #[serde(rename = "ssh:reconnect-success")]
    ReconnectSuccess {
        connection_id: ConnectionId,
        attempt: u32,
    },
    #[serde(rename = "ssh:reconnect-failed")]
    ReconnectFailed {
        connection_id: ConnectionId,
        attempt: u32,
        error: String,
    },
    #[serde(rename = "ssh:reconnect-exhausted")]
    ReconnectExhausted {
        connection_id: ConnectionId,
        total_attempts: u32,
    },
    #[serde(rename = "ssh:reconnect-paused")]
    ReconnectPaused { connection_id: ConnectionId },
    #[serde(rename = "ssh:reconnect-resumed")]
    ReconnectResumed { connection_id: ConnectionId },
    #[serde(rename = "hostkey:verify-request")]
    HostKeyVerifyRequest {
        connection_id: ConnectionId,
        request: HostKeyVerifyRequest,
    },
    #[serde(rename = "terminal:data")]
    TerminalData { shell_id: ShellId, data: Vec<u8> },
    #[serde(rename = "terminal:exit")]
    TerminalExit {
        shell_id: ShellId,
        code: Option<i32>,
    },
    #[serde(rename = "sftp:transfer-update")]
    TransferUpdate {
        connection_id: ConnectionId,
        transfer_id: TransferId,
        item: serde_json::Value,
    },
    #[serde(rename = "sftp:transfer-complete")]
    TransferComplete {
        connection_id: ConnectionId,
        transfer_id: TransferId,
        item: serde_json::Value,
    },
    #[serde(rename = "portforward:rule-update")]
    ForwardRuleUpdate {
        connection_id: ConnectionId,
        rule_id: RuleId,
        rule: serde_json::Value,
    },
}

struct Subscriber {
    id: SubscriptionId,
    sender: broadcast::Sender<Event>,
}

/// Fan-out publisher: every [`Event`] published is cloned to every live
/// subscriber. Subscribe/publish and unsubscribe are all safe to call
/// concurrently from any task.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers a new subscriber and returns its id plus a receiver of all
    /// future events. Past events are not replayed.
    pub async fn subscribe(&self) -> (SubscriptionId, broadcast::Receiver<Event>) {
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = SubscriptionId::from(format!("sub-{n}"));
        self.subscribers.write().await.push(Subscriber {
            id: id.clone(),
            sender: tx,
        });
        (id, rx)
    }

    /// Removes a subscriber by id. A no-op if it was already gone.
    pub async fn unsubscribe(&self, id: &SubscriptionId) {
        self.subscribers.write().await.retain(|s| &s.id != id);
    }

    /// Publishes `event` to every current subscriber. Subscribers with no
    /// receiver left (or too far behind to keep up) simply don't get it;
    /// this never blocks the publisher.
    pub async fn publish(&self, event: Event) {
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            let _ = sub.sender.send(event.clone());
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event::SshStatusChange {
            connection_id: ConnectionId::from("c1"),
            status: ConnectionStatus::Connected,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe().await;
        bus.publish(sample_event()).await;
        let got = rx.recv().await.unwrap();
        assert!(matches!(got, Event::SshStatusChange { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery_bookkeeping() {
        let bus = EventBus::new();
        let (id, _rx) = bus.subscribe().await;
        assert_eq!(bus.subscriber_count().await, 1);
        bus.unsubscribe(&id).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::new();
        let (_id1, mut rx1) = bus.subscribe().await;
        let (_id2, mut rx2) = bus.subscribe().await;
        bus.publish(sample_event()).await;
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
