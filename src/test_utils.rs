//! Shared helpers for tests: key generation and event signing

use crate::event::{Event, Tag, KIND_AUTHENTICATION};
use secp256k1::{All, Keypair, Message, Secp256k1};
use std::sync::LazyLock;

static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// A signing identity for tests
pub struct RelayKeys {
    keypair: Keypair,
}

impl RelayKeys {
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::new(&SECP, &mut rand::thread_rng()),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    fn sign_digest(&self, digest: [u8; 32]) -> String {
        let signature = SECP.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &self.keypair);
        hex::encode(signature.serialize())
    }
}

/// Build a correctly signed event
pub fn sign_event(
    keys: &RelayKeys,
    kind: u16,
    tags: Vec<Tag>,
    content: &str,
    created_at: u64,
) -> Event {
    let mut event = Event {
        id: String::new(),
        pubkey: keys.public_key_hex(),
        created_at,
        kind,
        tags,
        content: content.to_string(),
        sig: String::new(),
    };
    event.id = event.compute_id();
    let digest: [u8; 32] = hex::decode(&event.id)
        .expect("computed id is hex")
        .try_into()
        .expect("sha256 digest is 32 bytes");
    event.sig = keys.sign_digest(digest);
    event
}

/// A plain kind-1 note
pub fn text_note(keys: &RelayKeys, content: &str, created_at: u64) -> Event {
    sign_event(keys, 1, vec![], content, created_at)
}

/// A kind-22242 authentication event with relay and challenge tags
pub fn auth_event(keys: &RelayKeys, relay_url: &str, challenge: &str, created_at: u64) -> Event {
    sign_event(
        keys,
        KIND_AUTHENTICATION,
        vec![
            Tag::new(["relay", relay_url]),
            Tag::new(["challenge", challenge]),
        ],
        "",
        created_at,
    )
}
