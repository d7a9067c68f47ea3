//! # Registry Events
//!
//! Registry and health changes are published as [`RegistryEvent`]s through the
//! [`EventPublisher`] capability. [`BroadcastPublisher`] fans them out over a
//! `tokio::sync::broadcast` channel; each consumer holds a [`Subscription`]
//! that can be cancelled from anywhere through its cancellation token.
//!
//! ## Rust Concepts Used
//!
//! - `broadcast::Sender` clones events to every live receiver
//! - `CancellationToken` lets another task stop a consumer without touching its receiver
//! - `BroadcastStream` adapts the receiver into a `Stream`

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::core::types::ServiceInstance;

/// Change notifications emitted by the registry and health tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A new instance joined a service
    Registered {
        service: String,
        instance: ServiceInstance,
    },
    /// An existing instance was re-registered and its fields merged
    Updated {
        service: String,
        instance: ServiceInstance,
    },
    Deregistered {
        service: String,
        instance_id: String,
    },
    /// Health flipped for an instance
    HealthChanged {
        service: String,
        instance_id: String,
        healthy: bool,
    },
}

impl RegistryEvent {
    pub fn service(&self) -> &str {
        match self {
            Self::Registered { service, .. }
            | Self::Updated { service, .. }
            | Self::Deregistered { service, .. }
            | Self::HealthChanged { service, .. } => service,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Updated { .. } => "updated",
            Self::Deregistered { .. } => "deregistered",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Capability for publishing registry events
pub trait EventPublisher: Send + Sync {
    /// Publish an event; delivery is best-effort and never fails the caller
    fn publish(&self, event: RegistryEvent);
}

/// Broadcast channel publisher
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<RegistryEvent>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            token: CancellationToken::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: RegistryEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            trace!(event = kind, "No subscribers for registry event");
        }
    }
}

/// A cancellable stream of registry events
pub struct Subscription {
    receiver: broadcast::Receiver<RegistryEvent>,
    token: CancellationToken,
}

impl Subscription {
    /// Token that ends this subscription when cancelled
    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the next event
    ///
    /// Returns `None` once cancelled or once the publisher is gone. Events
    /// dropped because this subscriber lagged are skipped.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                received = self.receiver.recv() => match received {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Registry event subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Convert into a `Stream` that ends on cancellation
    pub fn into_stream(self) -> impl Stream<Item = RegistryEvent> + Send + 'static {
        let token = self.token;
        BroadcastStream::new(self.receiver)
            .filter_map(|received| futures::future::ready(received.ok()))
            .take_until(async move { token.cancelled().await })
    }
}
