//! Event data model, canonical serialization, and cryptographic validation
//!
//! An [`Event`] is the relay's unit of data: a content-addressed, signed
//! record. Deserialization produces a fully-formed value in one step; nothing
//! partially constructed is ever observable. Identity is bound to every field
//! through the canonical serialization, so mutating a validated event simply
//! makes it invalid again.

use crate::error::{Error, Result};
use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Direct messages, gated to their participants.
pub const KIND_DIRECT_MESSAGE: u16 = 4;
/// NIP-42 client authentication. Ephemeral by range.
pub const KIND_AUTHENTICATION: u16 = 22242;

static SECP: LazyLock<Secp256k1<VerifyOnly>> = LazyLock::new(Secp256k1::verification_only);

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An ordered sequence of strings; the first element is the tag name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// The tag's first value (the element after the name), if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// A signed, content-addressed relay message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Parse an event object. Structural problems (tags not a sequence of
    /// sequences, non-integer kind, missing fields) are reported as
    /// validation failures before any persistence is attempted.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::invalid(format!("malformed event: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid(format!("malformed event: {e}")))
    }

    /// The fixed tuple `[0, pubkey, created_at, kind, tags, content]` with no
    /// inserted whitespace, UTF-8.
    pub fn canonical_serialization(&self) -> Vec<u8> {
        serde_json::to_vec(&(
            0u8,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .expect("canonical serialization of strings and integers cannot fail")
    }

    /// Lowercase-hex SHA-256 digest of the canonical serialization.
    pub fn compute_id(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_serialization()))
    }

    /// Verify that `id` matches the canonical digest and that `sig` is a
    /// valid Schnorr signature over the raw id bytes with `pubkey` as an
    /// x-only public key.
    pub fn verify(&self) -> Result<()> {
        if self.id != self.compute_id() {
            return Err(Error::invalid("id must match payload"));
        }
        self.verify_signature()
    }

    fn verify_signature(&self) -> Result<()> {
        let id_bytes: [u8; 32] = hex::decode(&self.id)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::invalid("id must be 64 hex characters"))?;
        let pubkey_bytes = hex::decode(&self.pubkey)
            .map_err(|_| Error::invalid("pubkey must be 64 hex characters"))?;
        let sig_bytes = hex::decode(&self.sig)
            .map_err(|_| Error::invalid("sig must be 128 hex characters"))?;

        let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|_| Error::invalid("pubkey is not a valid x-only public key"))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| Error::invalid("sig is not a valid Schnorr signature"))?;
        let message = Message::from_digest(id_bytes);

        SECP.verify_schnorr(&signature, &message, &pubkey)
            .map_err(|_| Error::invalid("sig must match payload"))
    }

    pub fn is_replaceable(&self) -> bool {
        self.kind == 0 || self.kind == 3 || (10_000..20_000).contains(&self.kind)
    }

    pub fn is_ephemeral(&self) -> bool {
        (20_000..30_000).contains(&self.kind)
    }

    /// Parameterized-replaceable: one surviving event per (author, kind, d).
    pub fn is_addressable(&self) -> bool {
        (30_000..40_000).contains(&self.kind)
    }

    pub fn is_authentication(&self) -> bool {
        self.kind == KIND_AUTHENTICATION
    }

    pub fn is_direct_message(&self) -> bool {
        self.kind == KIND_DIRECT_MESSAGE
    }

    /// All values of tags with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.name() == name)
            .filter_map(|t| t.value())
    }

    /// Value of the first `d` tag; empty string when absent. Case is
    /// preserved here, comparisons downstream are case-insensitive.
    pub fn d_tag_value(&self) -> &str {
        self.tag_values("d").next().unwrap_or("")
    }

    /// Delegator pubkey from the first `delegation` tag, if any.
    pub fn delegation_pubkey(&self) -> Option<&str> {
        self.tag_values("delegation").next()
    }

    /// Absolute expiration timestamp from the `expiration` tag, if present
    /// and well-formed.
    pub fn expiration(&self) -> Option<u64> {
        self.tag_values("expiration")
            .next()
            .and_then(|v| v.parse::<u64>().ok())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expiration(), Some(at) if at <= now)
    }

    /// Whether a pubkey is addressed by this event's `p` or `delegation`
    /// tags (hex comparison, case-insensitive).
    pub fn references_pubkey(&self, pubkey: &str) -> bool {
        self.tag_values("p")
            .chain(self.tag_values("delegation"))
            .any(|v| v.eq_ignore_ascii_case(pubkey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sign_event, text_note, RelayKeys};

    #[test]
    fn valid_event_verifies() {
        let keys = RelayKeys::generate();
        let event = text_note(&keys, "hello world", 1_700_000_000);
        assert!(event.verify().is_ok());
    }

    #[test]
    fn canonical_serialization_has_no_whitespace() {
        let keys = RelayKeys::generate();
        let event = sign_event(
            &keys,
            1,
            vec![Tag::new(["e", "abc"]), Tag::new(["p", "def"])],
            "payload",
            1_700_000_000,
        );
        let canonical = String::from_utf8(event.canonical_serialization()).unwrap();
        assert!(canonical.starts_with("[0,\""));
        assert!(!canonical.contains(": "));
        assert!(!canonical.contains(", "));
    }

    #[test]
    fn tampered_content_fails_validation() {
        let keys = RelayKeys::generate();
        let mut event = text_note(&keys, "original", 1_700_000_000);
        event.content = "tampered".to_string();
        assert!(event.verify().is_err());
    }

    #[test]
    fn tampered_created_at_fails_validation() {
        let keys = RelayKeys::generate();
        let mut event = text_note(&keys, "note", 1_700_000_000);
        event.created_at += 1;
        assert!(event.verify().is_err());
    }

    #[test]
    fn tampered_kind_fails_validation() {
        let keys = RelayKeys::generate();
        let mut event = text_note(&keys, "note", 1_700_000_000);
        event.kind = 2;
        assert!(event.verify().is_err());
    }

    #[test]
    fn tampered_tags_fail_validation() {
        let keys = RelayKeys::generate();
        let mut event = text_note(&keys, "note", 1_700_000_000);
        event.tags.push(Tag::new(["t", "sneaky"]));
        assert!(event.verify().is_err());
    }

    #[test]
    fn tampered_pubkey_fails_validation() {
        let keys = RelayKeys::generate();
        let other = RelayKeys::generate();
        let mut event = text_note(&keys, "note", 1_700_000_000);
        event.pubkey = other.public_key_hex();
        assert!(event.verify().is_err());
    }

    #[test]
    fn uppercase_id_is_rejected() {
        let keys = RelayKeys::generate();
        let mut event = text_note(&keys, "note", 1_700_000_000);
        event.id = event.id.to_ascii_uppercase();
        assert!(event.verify().is_err());
    }

    #[test]
    fn structurally_malformed_input_is_invalid() {
        // tags must be a sequence of sequences
        let err = Event::from_json(
            r#"{"id":"00","pubkey":"00","created_at":1,"kind":1,"tags":["oops"],"content":"","sig":"00"}"#,
        )
        .unwrap_err();
        assert_eq!(err.ok_prefix(), "invalid");

        // kind must be an integer
        assert!(Event::from_json(
            r#"{"id":"00","pubkey":"00","created_at":1,"kind":"one","tags":[],"content":"","sig":"00"}"#,
        )
        .is_err());
    }

    #[test]
    fn kind_classification() {
        let keys = RelayKeys::generate();
        assert!(sign_event(&keys, 0, vec![], "", 1).is_replaceable());
        assert!(sign_event(&keys, 3, vec![], "", 1).is_replaceable());
        assert!(sign_event(&keys, 10_002, vec![], "", 1).is_replaceable());
        assert!(sign_event(&keys, 20_001, vec![], "", 1).is_ephemeral());
        assert!(sign_event(&keys, KIND_AUTHENTICATION, vec![], "", 1).is_ephemeral());
        assert!(sign_event(&keys, 30_023, vec![], "", 1).is_addressable());
        assert!(!sign_event(&keys, 1, vec![], "", 1).is_replaceable());
    }

    #[test]
    fn d_tag_defaults_to_empty() {
        let keys = RelayKeys::generate();
        let plain = sign_event(&keys, 30_000, vec![], "", 1);
        assert_eq!(plain.d_tag_value(), "");

        let tagged = sign_event(&keys, 30_000, vec![Tag::new(["d", "Topic"])], "", 1);
        assert_eq!(tagged.d_tag_value(), "Topic");
    }

    #[test]
    fn expiration_tag_round_trip() {
        let keys = RelayKeys::generate();
        let event = sign_event(
            &keys,
            1,
            vec![Tag::new(["expiration", "1000"])],
            "short lived",
            900,
        );
        assert_eq!(event.expiration(), Some(1000));
        assert!(!event.is_expired(999));
        assert!(event.is_expired(1000));
        assert!(event.is_expired(2000));
    }

    #[test]
    fn references_pubkey_via_p_and_delegation() {
        let keys = RelayKeys::generate();
        let friend = RelayKeys::generate();
        let event = sign_event(
            &keys,
            4,
            vec![Tag::new(["p", &friend.public_key_hex()])],
            "hi",
            1,
        );
        assert!(event.references_pubkey(&friend.public_key_hex()));
        assert!(event.references_pubkey(&friend.public_key_hex().to_ascii_uppercase()));
        assert!(!event.references_pubkey(&keys.public_key_hex()));
    }
}
