//! NIP-42 challenge-response authentication
//!
//! Each connection walks `Unauthenticated -> ChallengeSent -> Authenticated`.
//! The challenge is issued on connect and stays valid for the connection's
//! lifetime (the transport issues a fresh one on reconnect), so an
//! unrestricted relay lets a client re-authenticate as another pubkey over
//! the same connection, as the reference implementation does.

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Ordinal authorization tier. Base for unknown pubkeys, the trusted-author
/// tier above it; finer tiers slot in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrustLevel(pub u8);

impl TrustLevel {
    pub const BASE: Self = Self(0);
    pub const TRUSTED: Self = Self(4);
}

/// Per-connection authentication state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    ChallengeSent(String),
    Authenticated {
        pubkey: String,
        trust: TrustLevel,
        /// Retained so the same connection may authenticate again.
        challenge: String,
    },
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// The authenticated pubkey, if any.
    pub fn pubkey(&self) -> Option<&str> {
        match self {
            Self::Authenticated { pubkey, .. } => Some(pubkey),
            _ => None,
        }
    }

    pub fn trust(&self) -> Option<TrustLevel> {
        match self {
            Self::Authenticated { trust, .. } => Some(*trust),
            _ => None,
        }
    }

    /// The outstanding challenge, if one was issued.
    pub fn challenge(&self) -> Option<&str> {
        match self {
            Self::ChallengeSent(challenge) => Some(challenge),
            Self::Authenticated { challenge, .. } => Some(challenge),
            Self::Unauthenticated => None,
        }
    }
}

/// Generate a unique opaque challenge for a new connection.
pub fn generate_challenge() -> String {
    format!("{}", rand::random::<u64>())
}

/// Validates kind-22242 events and drives [`AuthState`] transitions.
#[derive(Debug, Clone)]
pub struct AuthFlow {
    config: Arc<RelayConfig>,
}

impl AuthFlow {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self { config }
    }

    /// The highest applicable trust tier for a pubkey.
    pub fn lookup_trust(&self, pubkey: &str) -> TrustLevel {
        if self
            .config
            .trusted_authors
            .contains(&pubkey.to_ascii_lowercase())
        {
            TrustLevel::TRUSTED
        } else {
            TrustLevel::BASE
        }
    }

    /// Process a candidate authentication event against the connection's
    /// current state. The event's signature must already be verified. On
    /// success the state becomes `Authenticated` with freshly computed trust.
    pub fn authenticate(
        &self,
        event: &Event,
        state: &mut AuthState,
        now: u64,
    ) -> Result<TrustLevel> {
        if !event.is_authentication() {
            return Err(Error::invalid("invalid event kind for authentication"));
        }

        if let AuthState::Authenticated { pubkey, .. } = state {
            let same_pubkey = pubkey.eq_ignore_ascii_case(&event.pubkey);
            if !same_pubkey && self.config.restrict_reauthentication {
                return Err(Error::notice(
                    "This connection is already authenticated. \
                     To authenticate another pubkey please open new connection",
                ));
            }
        }

        let challenge = state
            .challenge()
            .ok_or_else(|| Error::auth_required("no challenge pending"))?
            .to_string();
        self.validate_tags(event, &challenge)?;
        self.validate_recency(event, now)?;

        let trust = self.lookup_trust(&event.pubkey);
        if trust < self.config.min_trust_level {
            return Err(Error::restricted("unknown author"));
        }

        debug!(
            target: "auth",
            "Authenticated pubkey {} at trust level {:?}", event.pubkey, trust
        );
        *state = AuthState::Authenticated {
            pubkey: event.pubkey.to_ascii_lowercase(),
            trust,
            challenge,
        };
        Ok(trust)
    }

    fn validate_tags(&self, event: &Event, challenge: &str) -> Result<()> {
        match event.tag_values("challenge").next() {
            None => return Err(Error::invalid("'challenge' is missing")),
            Some(value) if value != challenge => {
                return Err(Error::invalid("'challenge' is invalid"))
            }
            Some(_) => {}
        }

        match event.tag_values("relay").next() {
            None => Err(Error::invalid("'relay' is missing")),
            Some(value) if !self.relay_url_matches(value) => Err(Error::invalid(format!(
                "'relay' must equal to {}",
                self.config.relay_url
            ))),
            Some(_) => Ok(()),
        }
    }

    fn validate_recency(&self, event: &Event, now: u64) -> Result<()> {
        let window = self.config.auth_window_seconds;
        if event.created_at < now.saturating_sub(window) {
            return Err(Error::invalid(format!(
                "created_at is too old, must be within {window} seconds"
            )));
        }
        if event.created_at > now {
            return Err(Error::invalid("created_at must not be in the future"));
        }
        Ok(())
    }

    // Exact match modulo trailing slash first, then host (and explicit port)
    // comparison so ws://host and wss://host/ variants authenticate.
    fn relay_url_matches(&self, client_url: &str) -> bool {
        let configured = self.config.relay_url.trim_end_matches('/');
        let client = client_url.trim_end_matches('/');
        if client.eq_ignore_ascii_case(configured) {
            return true;
        }

        match (Url::parse(client), Url::parse(configured)) {
            (Ok(client), Ok(configured)) => {
                let hosts_match = match (client.host_str(), configured.host_str()) {
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    _ => false,
                };
                let ports_match = match (client.port(), configured.port()) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                };
                hosts_match && ports_match
            }
            _ => false,
        }
    }
}
