//! Event store collaborator contract and the in-memory reference store
//!
//! The durable engine lives behind [`EventStore`]; the relay core only needs
//! prefix lookup on ids, class retrieval for replaceable resolution, and a
//! query whose matching semantics are identical to live dispatch. The
//! reference store guarantees that by delegating to the same
//! [`FilterEngine`] predicate.

use crate::config::RelayConfig;
use crate::error::Result;
use crate::event::Event;
use crate::filter::{Filter, FilterEngine};
use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Stored events matching the filter as seen by `viewer`, newest first,
    /// clamped to the filter's effective limit.
    async fn query(&self, filter: &Filter, viewer: Option<&str>) -> Result<Vec<Event>>;

    /// Persist an event. Inserting an id that is already present is a no-op
    /// (duplicate delivery from cooperating relays is expected).
    async fn insert(&self, event: Event) -> Result<()>;

    /// Remove an event by full id; idempotent.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Whether any stored event's id starts with the given hex prefix
    /// (case-insensitive; a full 64-char id is an exact match).
    async fn exists_by_id(&self, id_prefix: &str) -> Result<bool>;

    /// All stored members of a replaceable equivalence class:
    /// (author, kind) or, with `d_value`, (author, kind, d) where the d-tag
    /// comparison is case-insensitive.
    async fn replaceable_class(
        &self,
        pubkey: &str,
        kind: u16,
        d_value: Option<&str>,
    ) -> Result<Vec<Event>>;
}

/// Reference store backed by a vector; good for tests and small relays.
#[derive(Debug)]
pub struct MemoryStore {
    engine: FilterEngine,
    events: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            engine: FilterEngine::new(config),
            events: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn query(&self, filter: &Filter, viewer: Option<&str>) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| self.engine.matches(e, filter, viewer))
            .cloned()
            .collect();
        // Newest first; id as a stable tie-break
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        matched.truncate(self.engine.effective_limit(filter));
        Ok(matched)
    }

    async fn insert(&self, event: Event) -> Result<()> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| e.id.eq_ignore_ascii_case(&event.id)) {
            return Ok(());
        }
        events.push(event);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut events = self.events.write().await;
        events.retain(|e| !e.id.eq_ignore_ascii_case(id));
        Ok(())
    }

    async fn exists_by_id(&self, id_prefix: &str) -> Result<bool> {
        let prefix = id_prefix.to_ascii_lowercase();
        let events = self.events.read().await;
        Ok(events.iter().any(|e| e.id.to_ascii_lowercase().starts_with(&prefix)))
    }

    async fn replaceable_class(
        &self,
        pubkey: &str,
        kind: u16,
        d_value: Option<&str>,
    ) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.kind == kind && e.pubkey.eq_ignore_ascii_case(pubkey))
            .filter(|e| match d_value {
                Some(d) => e.d_tag_value().eq_ignore_ascii_case(d),
                None => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::test_utils::{sign_event, text_note, RelayKeys};
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(&RelayConfig::new("wss://relay.test"))
    }

    #[tokio::test]
    async fn query_returns_newest_first_with_limit() {
        let store = store();
        let keys = RelayKeys::generate();
        for (i, ts) in [100u64, 300, 200].iter().enumerate() {
            store
                .insert(text_note(&keys, &format!("note {i}"), *ts))
                .await
                .unwrap();
        }

        let filter = Filter::from_value(&json!({"kinds": [1], "limit": 2})).unwrap();
        let result = store.query(&filter, None).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].created_at, 300);
        assert_eq!(result[1].created_at, 200);
    }

    #[tokio::test]
    async fn insert_is_idempotent_by_id() {
        let store = store();
        let keys = RelayKeys::generate();
        let event = text_note(&keys, "once", 100);
        store.insert(event.clone()).await.unwrap();
        store.insert(event).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn exists_by_id_matches_prefix_case_insensitively() {
        let store = store();
        let keys = RelayKeys::generate();
        let event = text_note(&keys, "here", 100);
        let id = event.id.clone();
        store.insert(event).await.unwrap();

        assert!(store.exists_by_id(&id).await.unwrap());
        assert!(store.exists_by_id(&id[..10].to_ascii_uppercase()).await.unwrap());
        assert!(!store.exists_by_id("0123456789abcdef0123").await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_by_id() {
        let store = store();
        let keys = RelayKeys::generate();
        let event = text_note(&keys, "gone soon", 100);
        let id = event.id.clone();
        store.insert(event).await.unwrap();
        store.delete(&id.to_ascii_uppercase()).await.unwrap();
        assert!(store.is_empty().await);
        // idempotent
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn replaceable_class_keys_on_author_kind_and_d() {
        let store = store();
        let alice = RelayKeys::generate();
        let bob = RelayKeys::generate();

        store.insert(sign_event(&alice, 0, vec![], "a1", 100)).await.unwrap();
        store.insert(sign_event(&alice, 0, vec![], "a2", 200)).await.unwrap();
        store.insert(sign_event(&bob, 0, vec![], "b", 300)).await.unwrap();
        store
            .insert(sign_event(
                &alice,
                30_000,
                vec![Tag::new(["d", "Topic"])],
                "param",
                400,
            ))
            .await
            .unwrap();

        let class = store
            .replaceable_class(&alice.public_key_hex(), 0, None)
            .await
            .unwrap();
        assert_eq!(class.len(), 2);

        let class = store
            .replaceable_class(&alice.public_key_hex(), 30_000, Some("topic"))
            .await
            .unwrap();
        assert_eq!(class.len(), 1);

        let class = store
            .replaceable_class(&alice.public_key_hex(), 30_000, Some("other"))
            .await
            .unwrap();
        assert!(class.is_empty());
    }
}
