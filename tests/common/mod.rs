//! Shared helpers for integration tests: signing identities and a test client

use nostr_relay_core::{
    ConnectionHandle, Dispatcher, Event, MessageSender, RelayMessage, Tag,
};
use secp256k1::{All, Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use std::time::Duration;

static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

pub struct TestKeys {
    keypair: Keypair,
}

impl TestKeys {
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::new(&SECP, &mut rand::thread_rng()),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    pub fn sign_event(&self, kind: u16, tags: Vec<Tag>, content: &str, created_at: u64) -> Event {
        let mut event = Event {
            id: String::new(),
            pubkey: self.public_key_hex(),
            created_at,
            kind,
            tags,
            content: content.to_string(),
            sig: String::new(),
        };
        let digest: [u8; 32] = Sha256::digest(event.canonical_serialization()).into();
        event.id = hex::encode(digest);
        let signature = SECP.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &self.keypair);
        event.sig = hex::encode(signature.serialize());
        event
    }

    pub fn text_note(&self, content: &str, created_at: u64) -> Event {
        self.sign_event(1, vec![], content, created_at)
    }

    pub fn auth_event(&self, relay_url: &str, challenge: &str, created_at: u64) -> Event {
        self.sign_event(
            22_242,
            vec![
                Tag::new(["relay", relay_url]),
                Tag::new(["challenge", challenge]),
            ],
            "",
            created_at,
        )
    }
}

/// A connected client driving the dispatcher through raw frames
pub struct TestClient {
    pub id: String,
    pub rx: flume::Receiver<RelayMessage>,
    _handle: ConnectionHandle,
}

impl TestClient {
    pub fn connect(dispatcher: &Dispatcher, id: &str) -> Self {
        let (tx, rx) = flume::bounded(1000);
        let handle = dispatcher.connect(id, MessageSender::new(tx));
        Self {
            id: id.to_string(),
            rx,
            _handle: handle,
        }
    }

    pub async fn recv(&self) -> RelayMessage {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv_async())
            .await
            .expect("timed out waiting for a relay message")
            .expect("connection channel closed")
    }

    /// Consume the AUTH directive a fresh connection receives
    pub async fn challenge(&self) -> String {
        match self.recv().await {
            RelayMessage::Auth { challenge } => challenge,
            other => panic!("expected AUTH first, got {other:?}"),
        }
    }

    pub async fn send_event(&self, dispatcher: &Dispatcher, event: &Event) -> (bool, String) {
        let frame = serde_json::json!(["EVENT", event]).to_string();
        dispatcher.handle_frame(&self.id, &frame).await;
        match self.recv().await {
            RelayMessage::Ok {
                accepted, message, ..
            } => (accepted, message),
            other => panic!("expected OK, got {other:?}"),
        }
    }

    pub async fn req(&self, dispatcher: &Dispatcher, subscription_id: &str, filters: &str) {
        let frame = format!(r#"["REQ","{subscription_id}",{filters}]"#);
        dispatcher.handle_frame(&self.id, &frame).await;
    }

    /// Drain EVENT messages until EOSE, returning the snapshot in order
    pub async fn collect_snapshot(&self, subscription_id: &str) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.recv().await {
                RelayMessage::Event {
                    subscription_id: sid,
                    event,
                } => {
                    assert_eq!(sid, subscription_id);
                    events.push((*event).clone());
                }
                RelayMessage::Eose {
                    subscription_id: sid,
                } => {
                    assert_eq!(sid, subscription_id);
                    return events;
                }
                other => panic!("unexpected message during snapshot: {other:?}"),
            }
        }
    }
}
