//! End-to-end orchestration: validation, resolution, persistence, fanout
//!
//! The dispatcher owns the admission pipeline for submitted events and the
//! lifecycle of REQ/CLOSE subscriptions. Accepted events, persisted and
//! ephemeral alike, pass through a single bounded queue drained by one
//! distribution task, so delivery order to any one subscription always
//! matches the order the relay accepted events, while store I/O for one
//! connection never stalls dispatch to the others.

use crate::auth::{self, AuthFlow, AuthState};
use crate::config::RelayConfig;
use crate::crypto::CryptoVerifier;
use crate::error::{Error, Result};
use crate::event::{unix_now, Event};
use crate::filter::{Filter, FilterEngine};
use crate::messages::{ClientMessage, MessageSender, RelayMessage};
use crate::replaceable::{ReplaceableResolver, SUPERSEDED_MESSAGE};
use crate::session::{ConnectionHandle, SessionRegistry};
use crate::store::EventStore;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct Dispatcher {
    config: Arc<RelayConfig>,
    store: Arc<dyn EventStore>,
    registry: Arc<SessionRegistry>,
    resolver: ReplaceableResolver,
    auth: AuthFlow,
    crypto: CryptoVerifier,
    fanout: flume::Sender<Arc<Event>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("relay_url", &self.config.relay_url)
            .field("connections", &self.registry.connection_count())
            .finish()
    }
}

impl Dispatcher {
    /// Build a dispatcher and spawn its distribution task. Must be called
    /// within a tokio runtime.
    pub fn new(config: RelayConfig, store: Arc<dyn EventStore>) -> Arc<Self> {
        let config = Arc::new(config);
        let engine = FilterEngine::new(&config);
        let registry = Arc::new(SessionRegistry::new(config.max_subscriptions));
        let (fanout_tx, fanout_rx) = flume::bounded::<Arc<Event>>(config.fanout_queue_size);

        {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while let Ok(event) = fanout_rx.recv_async().await {
                    registry.fan_out(&engine, &event).await;
                }
                debug!("Distribution task shutting down");
            });
        }

        Arc::new(Self {
            auth: AuthFlow::new(Arc::clone(&config)),
            store,
            registry,
            resolver: ReplaceableResolver::new(),
            crypto: CryptoVerifier::new(),
            fanout: fanout_tx,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a transport connection. A challenge is issued and the AUTH
    /// directive queued before any other traffic can reach the client.
    pub fn connect(
        &self,
        connection_id: impl Into<String>,
        sender: MessageSender,
    ) -> ConnectionHandle {
        let connection_id = connection_id.into();
        let handle = self
            .registry
            .register_connection(connection_id.clone(), sender);

        if let Some(session) = self.registry.get(&connection_id) {
            let challenge = auth::generate_challenge();
            session.update_auth(|state| *state = AuthState::ChallengeSent(challenge.clone()));
            if let Err(e) = session.sender().send(RelayMessage::auth(challenge)) {
                warn!("[{}] Failed to send auth challenge: {}", connection_id, e);
            }
        }
        handle
    }

    /// Transport disconnect: cascades removal of subscriptions and auth
    /// state. Deliveries already queued toward the transport stand.
    pub async fn disconnect(&self, connection_id: &str) {
        self.registry.drop_connection(connection_id).await;
    }

    /// Handle one raw frame. A frame that cannot be parsed costs the client
    /// a NOTICE; it never terminates the connection or affects others.
    pub async fn handle_frame(&self, connection_id: &str, raw: &str) {
        match ClientMessage::from_json(raw) {
            Ok(message) => self.handle_message(connection_id, message).await,
            Err(e) => {
                debug!("[{}] Dropping malformed frame: {}", connection_id, e);
                self.send_to(connection_id, RelayMessage::notice(e.ok_message()));
            }
        }
    }

    pub async fn handle_message(&self, connection_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.handle_req(connection_id, subscription_id, filters).await,
            ClientMessage::Close { subscription_id } => {
                self.handle_close(connection_id, &subscription_id).await
            }
            ClientMessage::Event { event } => self.handle_event(connection_id, event).await,
        }
    }

    /// REQ: upsert the subscription, then deliver the one-shot snapshot of
    /// currently stored matches terminated by EOSE. Later matches arrive
    /// only through live dispatch, via the same predicate.
    async fn handle_req(&self, connection_id: &str, subscription_id: String, filters: Vec<Filter>) {
        let Some(session) = self.registry.get(connection_id) else {
            warn!("REQ from unknown connection {}", connection_id);
            return;
        };

        if let Err(e) = self
            .registry
            .open_subscription(connection_id, &subscription_id, filters)
            .await
        {
            // Quota refusals leave existing state untouched and the REQ ignored
            let _ = session.sender().send(RelayMessage::notice(e.ok_message()));
            return;
        }

        let Some(subscription) = session.subscription(&subscription_id).await else {
            return;
        };
        let viewer = session.authed_pubkey();

        let mut seen: HashSet<String> = HashSet::new();
        for filter in &subscription.filters {
            let events = match self.store.query(filter, viewer.as_deref()).await {
                Ok(events) => events,
                Err(e) => {
                    error!(
                        "[{}] Snapshot query failed for {}: {}",
                        connection_id, subscription_id, e
                    );
                    let _ = session.sender().send(RelayMessage::notice(e.ok_message()));
                    continue;
                }
            };
            for event in events {
                if !seen.insert(event.id.clone()) {
                    continue;
                }
                let event = Arc::new(event);
                subscription.mark_delivered(&event.id);
                if session
                    .sender()
                    .send(RelayMessage::event(subscription_id.clone(), event))
                    .is_err()
                {
                    self.registry.drop_connection(connection_id).await;
                    return;
                }
            }
        }
        let _ = session
            .sender()
            .send(RelayMessage::eose(subscription_id));
    }

    async fn handle_close(&self, connection_id: &str, subscription_id: &str) {
        if let Err(e) = self
            .registry
            .close_subscription(connection_id, subscription_id)
            .await
        {
            debug!("[{}] CLOSE ignored: {}", connection_id, e);
        }
    }

    /// EVENT: run the admission pipeline and answer with OK (or, for policy
    /// refusals such as re-authentication, a NOTICE). Errors never cross
    /// over to other commands or connections.
    async fn handle_event(&self, connection_id: &str, event: Value) {
        // Echo the claimed id even when the object is malformed
        let event_id = event
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();

        let reply = match self.admit_event(connection_id, event).await {
            Ok(message) => RelayMessage::ok(event_id, true, message),
            Err(Error::Notice { message, .. }) => RelayMessage::notice(message),
            Err(e) => RelayMessage::ok(event_id, false, e.ok_message()),
        };
        self.send_to(connection_id, reply);
    }

    /// Decide what happens to a submitted event: rejected, consumed for
    /// authentication, fanned out ephemerally, or persisted (with
    /// replaceable-class resolution) and fanned out. Returns the OK message
    /// body for the accepted case.
    async fn admit_event(&self, connection_id: &str, event: Value) -> Result<String> {
        let event = Arc::new(Event::from_value(event)?);

        // Cheap duplicate probe before any signature work; only a full-length
        // id can be trusted as an exact match here
        if event.id.len() == 64 && self.store.exists_by_id(&event.id).await? {
            return Err(Error::duplicate(SUPERSEDED_MESSAGE));
        }

        self.crypto.verify_event(Arc::clone(&event)).await?;

        if event.is_expired(unix_now()) {
            return Err(Error::invalid("event has expired"));
        }

        if event.is_authentication() {
            let session = self
                .registry
                .get(connection_id)
                .ok_or_else(|| Error::internal("Connection not found"))?;
            let trust =
                session.update_auth(|state| self.auth.authenticate(&event, state, unix_now()))?;
            debug!(
                target: "auth",
                "[{}] Connection authenticated as {} (trust {:?})",
                connection_id, event.pubkey, trust
            );
            return Ok("authenticated".to_string());
        }

        if event.is_ephemeral() {
            self.enqueue_fanout(event).await?;
            return Ok(String::new());
        }

        if event.is_replaceable() || event.is_addressable() {
            self.resolver.resolve(&event, self.store.as_ref()).await?;
        } else {
            self.store.insert((*event).clone()).await?;
        }

        self.enqueue_fanout(event).await?;
        Ok(String::new())
    }

    /// Accept an event relayed by a cooperating instance. Delivery between
    /// instances is at-least-once, so everything downstream is idempotent:
    /// the store ignores known ids, replaceable classes converge through the
    /// resolver, and subscriptions suppress repeated delivery.
    pub async fn ingest_broadcast(&self, event: Event) -> Result<()> {
        let event = Arc::new(event);

        if event.is_replaceable() || event.is_addressable() {
            match self.resolver.resolve(&event, self.store.as_ref()).await {
                Ok(_) => {}
                // Superseded remotely-relayed state is simply dropped
                Err(Error::Duplicate { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
        } else if !event.is_ephemeral() {
            self.store.insert((*event).clone()).await?;
        }

        self.enqueue_fanout(event).await
    }

    async fn enqueue_fanout(&self, event: Arc<Event>) -> Result<()> {
        self.fanout
            .send_async(event)
            .await
            .map_err(|_| Error::internal("distribution task is gone"))
    }

    fn send_to(&self, connection_id: &str, message: RelayMessage) {
        if let Some(session) = self.registry.get(connection_id) {
            if let Err(e) = session.sender().send(message) {
                debug!("[{}] Failed to send reply: {}", connection_id, e);
            }
        }
    }
}
