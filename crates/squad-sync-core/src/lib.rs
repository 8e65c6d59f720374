//! Optimistic-update and realtime-reconciliation engine for squad scopes.
//!
//! A scope is one entity collection (reactions, comments or votes) attached to a
//! parent object (a photo or an event). For each active scope the crate keeps:
//! - an [`AggregateStore`] of raw records (plus a [`TallyBoard`] for votes),
//! - a [`ScopeEngine`] that applies local mutations speculatively and reconciles
//!   them with write acknowledgments and change-feed notifications,
//! - pure derivations in [`aggregate`] (grouped reactions, winners, percentages).
//!
//! [`ScopeManager`] ties a scope's lifetime to a backend implementing
//! [`RecordSource`], [`RecordSink`] and [`ChangeFeed`].

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod engine;
pub mod ids;
pub mod lifecycle;
pub mod memory;
pub mod record;
pub mod store;

pub use aggregate::{CommentView, OptionShare, ReactionGroup};
pub use backend::{ChangeFeed, Identity, RecordSink, RecordSource, ScopeSnapshot, SubscriptionId};
pub use config::EngineConfig;
pub use engine::{
    Ack, Command, Dispatch, Intent, MutationOutcome, NoopReason, Reconciled, ScopeEngine,
    Settlement, Ticket,
};
pub use ids::{
    ActorId, EntityKind, OptionId, ProvisionalId, RecordId, ScopeId, ScopeKey, StableId,
    PROVISIONAL_PREFIX,
};
pub use lifecycle::{execute_command, LoadState, MutationReport, ScopeManager};
pub use memory::MemoryBackend;
pub use record::{
    FeedCursor, MutationKey, Notification, OptionTally, PayloadKey, Record, RecordBase,
    RecordBody, RecordDraft,
};
pub use store::{AggregateStore, InsertOutcome, ReplaceOutcome, TallyBoard};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transient write failure: {0}")]
    TransientWrite(String),
    #[error("fetch failure: {0}")]
    Fetch(String),
    #[error("subscription failure: {0}")]
    Subscription(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SyncError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SyncError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SyncError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SyncError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SyncError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SyncError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| SyncError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
