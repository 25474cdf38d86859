//! Core engine for a Nostr relay
//!
//! This crate implements the decision-making half of a relay:
//! - Event validation (canonical serialization, id digest, Schnorr signature)
//! - Filter parsing and a single matching predicate shared by stored-event
//!   queries and live dispatch
//! - Latest-wins resolution for replaceable and parameterized-replaceable
//!   kinds (NIP-33)
//! - NIP-42 challenge-response authentication with trust tiers
//! - Per-connection subscription bookkeeping with caps
//! - Acceptance-ordered fanout to matching subscriptions
//!
//! Wire framing, HTTP upgrade, and durable storage live behind the
//! [`messages::MessageSender`] and [`store::EventStore`] seams.
// Performance-focused clippy lints
#![warn(
    clippy::perf,
    clippy::redundant_clone,
    clippy::inefficient_to_string,
    clippy::clone_on_copy
)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod filter;
pub mod messages;
pub mod replaceable;
pub mod session;
pub mod store;
#[cfg(test)]
pub mod test_utils;

pub use auth::{AuthFlow, AuthState, TrustLevel};
pub use config::RelayConfig;
pub use crypto::CryptoVerifier;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use event::{Event, Tag};
pub use filter::{Filter, FilterEngine};
pub use messages::{ClientMessage, MessageSender, RelayMessage};
pub use replaceable::ReplaceableResolver;
pub use session::{ConnectionHandle, SessionRegistry};
pub use store::{EventStore, MemoryStore};
