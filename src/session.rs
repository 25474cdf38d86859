//! Session and subscription registry
//!
//! Tracks every live connection, its subscriptions, and its authentication
//! state. Subscription maps sit behind a per-connection `RwLock` (writes are
//! rare), auth state behind a synchronous lock so transitions serialize per
//! connection, and the connection map itself is a `DashMap` so connections
//! never contend with each other.

use crate::auth::AuthState;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::{Filter, FilterEngine};
use crate::messages::{MessageSender, RelayMessage};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A client-chosen subscription: OR-combined filter sets plus delivery
/// bookkeeping.
pub struct Subscription {
    pub filters: Vec<Filter>,
    pub created_at: Instant,
    /// Last event id delivered, for deduplicating at-least-once upstream
    /// redelivery.
    last_delivered: parking_lot::RwLock<Option<String>>,
}

impl Subscription {
    fn new(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            created_at: Instant::now(),
            last_delivered: parking_lot::RwLock::new(None),
        }
    }

    /// Record a delivery. Returns false when this event id was already the
    /// last one delivered here, making the duplicate a no-op.
    pub fn mark_delivered(&self, event_id: &str) -> bool {
        let mut last = self.last_delivered.write();
        if last.as_deref() == Some(event_id) {
            return false;
        }
        *last = Some(event_id.to_string());
        true
    }
}

/// State for a single live connection
pub struct ConnectionSession {
    /// Map of subscription_id to subscription - RwLock since writes are rare
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    /// Channel to send messages to this connection
    sender: MessageSender,
    /// Authentication state, serialized per connection
    auth: parking_lot::RwLock<AuthState>,
    /// Cancelled when the connection is dropped
    token: CancellationToken,
}

impl ConnectionSession {
    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.read().clone()
    }

    pub fn authed_pubkey(&self) -> Option<String> {
        self.auth.read().pubkey().map(str::to_owned)
    }

    /// Run a serialized transition on this connection's auth state.
    pub fn update_auth<R>(&self, f: impl FnOnce(&mut AuthState) -> R) -> R {
        f(&mut self.auth.write())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn subscription(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.read().await.get(subscription_id).cloned()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

/// Handle for a connection that ensures cleanup on drop
pub struct ConnectionHandle {
    /// Connection ID
    pub id: String,
    /// Weak reference to the registry for cleanup
    registry: std::sync::Weak<SessionRegistry>,
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        // If the connection still exists, the explicit disconnect path didn't
        // run; fall back to async cleanup.
        if registry.connections.contains_key(&self.id) {
            warn!(
                "ConnectionHandle::drop performing fallback cleanup for connection {}",
                self.id
            );
            let connection_id = self.id.clone();
            tokio::spawn(async move {
                registry.drop_connection(&connection_id).await;
            });
        } else {
            trace!(
                "ConnectionHandle::drop for connection {} - already cleaned up (expected)",
                self.id
            );
        }
    }
}

/// Registry for all active connections and their subscriptions
pub struct SessionRegistry {
    /// Map of connection_id to session data
    connections: DashMap<String, Arc<ConnectionSession>>,
    /// Maximum number of active subscriptions per connection
    max_subscriptions: usize,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("connections_count", &self.connections.len())
            .field("max_subscriptions", &self.max_subscriptions)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_subscriptions,
        }
    }

    /// Register a new connection and return a handle for cleanup
    pub fn register_connection(
        self: &Arc<Self>,
        connection_id: String,
        sender: MessageSender,
    ) -> ConnectionHandle {
        let session = Arc::new(ConnectionSession {
            subscriptions: RwLock::new(HashMap::new()),
            sender,
            auth: parking_lot::RwLock::new(AuthState::Unauthenticated),
            token: CancellationToken::new(),
        });
        self.connections.insert(connection_id.clone(), session);

        ConnectionHandle {
            id: connection_id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionSession>> {
        self.connections.get(connection_id).map(|c| Arc::clone(&c))
    }

    pub fn has_connection(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Upsert a subscription. A new id on a connection already at the cap is
    /// refused with a `rate-limited:` outcome and no state change; replacing
    /// an existing id never counts against the cap.
    pub async fn open_subscription(
        &self,
        connection_id: &str,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> Result<()> {
        let connection = self
            .get(connection_id)
            .ok_or_else(|| Error::internal("Connection not found"))?;

        let mut subscriptions = connection.subscriptions.write().await;
        let is_new = !subscriptions.contains_key(subscription_id);
        if is_new && subscriptions.len() >= self.max_subscriptions {
            return Err(Error::rate_limited(format!(
                "Reached maximum of {} subscriptions",
                self.max_subscriptions
            )));
        }
        subscriptions.insert(
            subscription_id.to_string(),
            Arc::new(Subscription::new(filters)),
        );

        debug!(
            "Added subscription {} for connection {}",
            subscription_id, connection_id
        );
        Ok(())
    }

    /// Remove a subscription; idempotent when the id is absent.
    pub async fn close_subscription(
        &self,
        connection_id: &str,
        subscription_id: &str,
    ) -> Result<()> {
        let connection = self
            .get(connection_id)
            .ok_or_else(|| Error::internal("Connection not found"))?;

        let mut subscriptions = connection.subscriptions.write().await;
        if subscriptions.remove(subscription_id).is_some() {
            debug!(
                "Removed subscription {} for connection {}",
                subscription_id, connection_id
            );
        }
        Ok(())
    }

    /// Remove a connection with its subscriptions and auth state, and take
    /// it out of dispatch candidacy immediately.
    pub async fn drop_connection(&self, connection_id: &str) {
        debug!("Cleaning up connection {}", connection_id);

        if let Some((_, session)) = self.connections.remove(connection_id) {
            session.token.cancel();
            let count = session.subscriptions.read().await.len();
            debug!(
                "Connection {} dropped with {} subscriptions",
                connection_id, count
            );
        } else {
            warn!(
                "Connection {} not found in registry during cleanup",
                connection_id
            );
        }
    }

    /// Deliver an accepted event to every matching subscription. Failures
    /// are isolated per connection: a dead or too-slow connection is marked
    /// for removal and the rest keep receiving.
    pub async fn fan_out(&self, engine: &FilterEngine, event: &Arc<Event>) {
        trace!("Distributing event {} to subscribers", event.id);

        let mut total_matches = 0;
        let mut dead_connections = Vec::new();

        // Snapshot the connection set so delivery never holds map shards
        // across await points.
        let connections: Vec<(String, Arc<ConnectionSession>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (connection_id, connection) in connections {
            if connection.token.is_cancelled() {
                continue;
            }
            let viewer = connection.authed_pubkey();
            let subscriptions = connection.subscriptions.read().await;

            let mut failed = false;
            for (subscription_id, subscription) in subscriptions.iter() {
                if !engine.matches_any(event, &subscription.filters, viewer.as_deref()) {
                    continue;
                }
                if !subscription.mark_delivered(&event.id) {
                    trace!(
                        "Subscription {} already saw event {}",
                        subscription_id,
                        event.id
                    );
                    continue;
                }

                total_matches += 1;
                let message = RelayMessage::event(subscription_id.clone(), Arc::clone(event));
                if let Err(e) = connection.sender.send(message) {
                    let error_str = e.to_string();
                    if error_str.contains("Channel full") {
                        warn!(
                            "Channel full for connection {} - client too slow, marking for removal",
                            connection_id
                        );
                    } else if error_str.contains("Channel disconnected") {
                        debug!(
                            "Channel disconnected for connection {} - connection already closed",
                            connection_id
                        );
                    } else {
                        warn!("Failed to send to connection {}: {}", connection_id, e);
                    }
                    failed = true;
                    break;
                }
            }
            drop(subscriptions);

            if failed {
                dead_connections.push(connection_id);
            }
        }

        for connection_id in dead_connections {
            self.drop_connection(&connection_id).await;
        }

        if total_matches > 0 {
            trace!("Event {} sent to {} subscriptions", event.id, total_matches);
        }
    }
}
