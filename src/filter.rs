//! Filter parsing and the matching engine
//!
//! A [`Filter`] is one AND-combined set of constraints; a subscription holds
//! several, OR-combined. [`FilterEngine::matches`] is the single source of
//! truth for matching: the snapshot query path and live dispatch both go
//! through it, so the two can never disagree about the same (event, filter)
//! pair. Requester identity is an explicit parameter, never ambient state.

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::event::{unix_now, Event, KIND_DIRECT_MESSAGE};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Every key a filter set may carry. Dispatch over keys is exhaustive so a
/// new key cannot be silently half-supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterKey {
    Ids,
    Authors,
    Kinds,
    /// Single-letter tag filter such as `#e` or `#p`.
    Tag(char),
    Since,
    Until,
    Limit,
    /// Anything else is ignored, with a warning, as the reference
    /// implementation does.
    Unsupported,
}

impl FilterKey {
    fn parse(key: &str) -> Self {
        match key {
            "ids" => Self::Ids,
            "authors" => Self::Authors,
            "kinds" => Self::Kinds,
            "since" => Self::Since,
            "until" => Self::Until,
            "limit" => Self::Limit,
            _ => {
                let mut chars = key.chars();
                match (chars.next(), chars.next(), chars.next()) {
                    (Some('#'), Some(letter), None) if letter.is_ascii_lowercase() => {
                        Self::Tag(letter)
                    }
                    _ => Self::Unsupported,
                }
            }
        }
    }
}

/// One AND-combined set of match constraints. Absent fields are wildcards;
/// id/author/tag-value matches are hex prefix matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    /// Single-letter tag name -> requested value prefixes.
    pub tags: BTreeMap<char, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Kept as sent; clamping happens in [`FilterEngine::effective_limit`].
    pub limit: Option<i64>,
}

impl Filter {
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::invalid("filter must be a JSON object"))?;

        let mut filter = Filter::default();
        for (key, entry) in object {
            match FilterKey::parse(&key.to_ascii_lowercase()) {
                FilterKey::Ids => filter.ids = Some(string_list(entry, "ids")?),
                FilterKey::Authors => filter.authors = Some(string_list(entry, "authors")?),
                FilterKey::Kinds => filter.kinds = Some(kind_list(entry)?),
                FilterKey::Tag(letter) => {
                    filter
                        .tags
                        .insert(letter, string_list(entry, "tag filter")?);
                }
                FilterKey::Since => filter.since = Some(timestamp(entry, "since")?),
                FilterKey::Until => filter.until = Some(timestamp(entry, "until")?),
                FilterKey::Limit => {
                    filter.limit = Some(
                        entry
                            .as_i64()
                            .ok_or_else(|| Error::invalid("limit must be an integer"))?,
                    )
                }
                FilterKey::Unsupported => {
                    warn!("Unhandled filter key: {key}");
                }
            }
        }
        Ok(filter)
    }
}

impl<'de> serde::Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = <Value as serde::Deserialize>::deserialize(deserializer)?;
        Filter::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn string_list(value: &Value, what: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| Error::invalid(format!("{what} must contain strings")))
                })
                .collect()
        })
        .unwrap_or_else(|| Err(Error::invalid(format!("{what} must be an array"))))
}

fn kind_list(value: &Value) -> Result<Vec<u16>> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|k| u16::try_from(k).ok())
                        .ok_or_else(|| Error::invalid("kinds must contain integers"))
                })
                .collect()
        })
        .unwrap_or_else(|| Err(Error::invalid("kinds must be an array")))
}

fn timestamp(value: &Value, what: &str) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| Error::invalid(format!("{what} must be a unix timestamp")))
}

/// Case-insensitive prefix match; hex identifiers compare this way
/// throughout.
fn starts_with_hex(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Evaluates filters against events for both the snapshot and live paths.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    max_filter_limit: usize,
    default_filter_limit: usize,
}

impl FilterEngine {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            max_filter_limit: config.max_filter_limit.max(1),
            default_filter_limit: config.default_filter_limit.max(1),
        }
    }

    /// Does `event` satisfy every present constraint of `filter`, as seen by
    /// `viewer` (the connection's authenticated pubkey, if any)?
    ///
    /// Two rules go beyond plain constraint evaluation:
    /// - a filter without `kinds` never matches kind 4, so sensitive content
    ///   is not swept up by broad unqualified subscriptions;
    /// - kind-4 events are only visible to their author or a `p`/`delegation`
    ///   recipient, judged against the authenticated identity.
    pub fn matches(&self, event: &Event, filter: &Filter, viewer: Option<&str>) -> bool {
        if event.is_expired(unix_now()) {
            return false;
        }

        match &filter.kinds {
            Some(kinds) => {
                if !kinds.contains(&event.kind) {
                    return false;
                }
            }
            None => {
                if event.kind == KIND_DIRECT_MESSAGE {
                    return false;
                }
            }
        }
        if event.kind == KIND_DIRECT_MESSAGE && !Self::can_view_direct_message(event, viewer) {
            return false;
        }

        if let Some(ids) = &filter.ids {
            if !ids.iter().any(|prefix| starts_with_hex(&event.id, prefix)) {
                return false;
            }
        }

        if let Some(authors) = &filter.authors {
            // NIP-26: a delegated event also matches its delegator
            let delegation = event.delegation_pubkey();
            let matched = authors.iter().any(|prefix| {
                starts_with_hex(&event.pubkey, prefix)
                    || delegation.is_some_and(|d| starts_with_hex(d, prefix))
            });
            if !matched {
                return false;
            }
        }

        for (letter, prefixes) in &filter.tags {
            let name = letter.to_string();
            let matched = event.tag_values(&name).any(|value| {
                prefixes.iter().any(|prefix| starts_with_hex(value, prefix))
            });
            if !matched {
                return false;
            }
        }

        if let Some(since) = filter.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = filter.until {
            if event.created_at > until {
                return false;
            }
        }

        true
    }

    /// True iff any of the subscription's filter sets matches.
    pub fn matches_any(&self, event: &Event, filters: &[Filter], viewer: Option<&str>) -> bool {
        filters.iter().any(|f| self.matches(event, f, viewer))
    }

    /// Clamp a filter's limit to `[1, max_filter_limit]`, falling back to the
    /// configured default when absent or non-positive.
    pub fn effective_limit(&self, filter: &Filter) -> usize {
        match filter.limit {
            Some(limit) if limit > 0 => (limit as usize).min(self.max_filter_limit),
            _ => self.default_filter_limit.min(self.max_filter_limit),
        }
    }

    /// Kind-4 visibility rule: the author sees their own messages, a
    /// `p`-tagged or delegated recipient sees theirs, nobody else sees any.
    pub fn can_view_direct_message(event: &Event, viewer: Option<&str>) -> bool {
        match viewer {
            Some(pubkey) => {
                event.pubkey.eq_ignore_ascii_case(pubkey) || event.references_pubkey(pubkey)
            }
            None => false,
        }
    }
}
