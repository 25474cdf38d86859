//! Error types for the relay core

use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Internal error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Store error: {message}"))]
    Store {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Protocol error: {message}"))]
    Protocol {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid: {message}"))]
    Invalid {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Duplicate: {message}"))]
    Duplicate {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Restricted: {message}"))]
    Restricted {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Rate limited: {message}"))]
    RateLimited {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Blocked: {message}"))]
    Blocked {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Notice: {message}"))]
    Notice {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Auth required: {message}"))]
    AuthRequired {
        message: String,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a validation-failure error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a duplicate error
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::Duplicate {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a restricted error
    pub fn restricted(message: impl Into<String>) -> Self {
        Self::Restricted {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a rate-limited error
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a blocked error
    pub fn blocked(message: impl Into<String>) -> Self {
        Self::Blocked {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create a notice error
    pub fn notice(message: impl Into<String>) -> Self {
        Self::Notice {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// Create an auth required error
    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::AuthRequired {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// The machine-readable prefix this error carries in an `["OK", ...]` reply.
    pub fn ok_prefix(&self) -> &'static str {
        match self {
            Self::Invalid { .. } | Self::Protocol { .. } => "invalid",
            Self::Duplicate { .. } => "duplicate",
            Self::Restricted { .. } => "restricted",
            Self::RateLimited { .. } => "rate-limited",
            Self::Blocked { .. } => "blocked",
            Self::AuthRequired { .. } => "auth-required",
            Self::Internal { .. } | Self::Store { .. } | Self::Notice { .. } => "error",
        }
    }

    /// Full `["OK", ...]` message body: prefix plus the human-readable reason.
    pub fn ok_message(&self) -> String {
        let message = match self {
            Self::Internal { message, .. }
            | Self::Store { message, .. }
            | Self::Protocol { message, .. }
            | Self::Invalid { message, .. }
            | Self::Duplicate { message, .. }
            | Self::Restricted { message, .. }
            | Self::RateLimited { message, .. }
            | Self::Blocked { message, .. }
            | Self::Notice { message, .. }
            | Self::AuthRequired { message, .. } => message,
        };
        format!("{}: {}", self.ok_prefix(), message)
    }
}

// Conversion to anyhow is done by anyhow's blanket implementation
// since Error implements std::error::Error through snafu

pub type Result<T> = std::result::Result<T, Error>;
