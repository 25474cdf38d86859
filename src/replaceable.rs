//! Latest-wins resolution for replaceable and parameterized-replaceable kinds
//!
//! Within an equivalence class, (author, kind) for replaceable kinds and
//! (author, kind, d) for parameterized ones, exactly one event survives.
//! The ordering is total: strictly greater `created_at` wins, and ties break
//! to the lexicographically LOWER hex id. Lower, not higher: this is the
//! convergence contract cooperating relays agree on, so replicas reach the
//! same survivor without coordination.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::store::EventStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// OK-message body for a candidate that lost its class, or an id that is
/// already stored. Success-shaped: the client gets accepted=false with a
/// `duplicate:` reason, not a validation error.
pub const SUPERSEDED_MESSAGE: &str = "this event is already present in the database (for replaceable and parameterized replaceable events it may mean newer events are present)";

/// Identity key of a replaceable equivalence class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    pubkey: String,
    kind: u16,
    d_value: Option<String>,
}

impl ClassKey {
    /// The class an event belongs to, if its kind is subject to replacement.
    pub fn for_event(event: &Event) -> Option<Self> {
        if event.is_replaceable() {
            Some(Self {
                pubkey: event.pubkey.to_ascii_lowercase(),
                kind: event.kind,
                d_value: None,
            })
        } else if event.is_addressable() {
            Some(Self {
                pubkey: event.pubkey.to_ascii_lowercase(),
                kind: event.kind,
                d_value: Some(event.d_tag_value().to_ascii_lowercase()),
            })
        } else {
            None
        }
    }
}

/// Whether `existing` beats `candidate` in the class's total order.
fn outranks(existing: &Event, candidate: &Event) -> bool {
    existing.created_at > candidate.created_at
        || (existing.created_at == candidate.created_at
            && existing.id.to_ascii_lowercase() < candidate.id.to_ascii_lowercase())
}

/// Serializes conflict resolution per equivalence class and commits the
/// winner atomically with respect to concurrent candidates of the same key.
#[derive(Debug, Default)]
pub struct ReplaceableResolver {
    locks: DashMap<ClassKey, Arc<Mutex<()>>>,
}

impl ReplaceableResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a candidate against its equivalence class and commit it if it
    /// wins, deleting every superseded member. Returns the ids that were
    /// superseded. A losing candidate is a `duplicate:` outcome.
    ///
    /// The per-key critical section guarantees exactly one winner is ever
    /// persisted under concurrency; unrelated keys proceed in parallel.
    pub async fn resolve(&self, event: &Event, store: &dyn EventStore) -> Result<Vec<String>> {
        if event.is_ephemeral() {
            return Err(Error::invalid("must not be ephemeral"));
        }
        let key = ClassKey::for_event(event)
            .ok_or_else(|| Error::internal("event kind is not replaceable"))?;

        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let class = store
            .replaceable_class(&event.pubkey, event.kind, key.d_value.as_deref())
            .await?;

        if class.iter().any(|existing| outranks(existing, event)) {
            debug!(
                "Replaceable candidate {} superseded within (author={}, kind={})",
                event.id, event.pubkey, event.kind
            );
            return Err(Error::duplicate(SUPERSEDED_MESSAGE));
        }

        let superseded: Vec<String> = class
            .iter()
            .filter(|existing| !existing.id.eq_ignore_ascii_case(&event.id))
            .map(|existing| existing.id.clone())
            .collect();
        for id in &superseded {
            store.delete(id).await?;
        }
        store.insert(event.clone()).await?;

        Ok(superseded)
    }
}
