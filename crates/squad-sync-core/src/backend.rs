//! Collaborator contracts consumed by the engine.

use serde::{Deserialize, Serialize};

use crate::ids::{ActorId, ScopeKey, StableId};
use crate::record::{FeedCursor, Notification, OptionTally, Record, RecordDraft};
use crate::SyncError;

/// Result of a full fetch for one scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScopeSnapshot {
    pub records: Vec<Record>,
    /// Option counters; empty for reaction and comment scopes.
    pub tallies: Vec<OptionTally>,
    /// Feed position the snapshot reflects, when the source knows it.
    pub cursor: Option<FeedCursor>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

pub trait RecordSource {
    /// Loads every record currently stored for `scope`.
    ///
    /// # Errors
    /// Returns [`SyncError::Fetch`] when the store cannot be read. An empty
    /// scope is an `Ok` snapshot with no records.
    fn fetch(&mut self, scope: &ScopeKey) -> Result<ScopeSnapshot, SyncError>;
}

pub trait RecordSink {
    /// Persists a draft and returns it with its stable id.
    ///
    /// # Errors
    /// Returns [`SyncError::TransientWrite`] on store failure, or
    /// [`SyncError::Validation`] when the store refuses the record.
    fn write(&mut self, draft: &RecordDraft) -> Result<Record, SyncError>;

    /// Deletes a record. Deleting an absent id succeeds.
    ///
    /// # Errors
    /// Returns [`SyncError::TransientWrite`] on store failure, or
    /// [`SyncError::Validation`] when the record may not be deleted.
    fn delete(&mut self, id: StableId) -> Result<(), SyncError>;
}

/// Pull-based change feed with cancellable subscriptions.
pub trait ChangeFeed {
    /// Opens a subscription for `scope`. When `after` is given, changes
    /// recorded after that cursor are delivered first.
    ///
    /// # Errors
    /// Returns [`SyncError::Subscription`] when the feed cannot be opened.
    fn subscribe(
        &mut self,
        scope: &ScopeKey,
        after: Option<FeedCursor>,
    ) -> Result<SubscriptionId, SyncError>;

    /// Returns notifications delivered since the previous poll.
    ///
    /// # Errors
    /// Returns [`SyncError::Subscription`] for unknown or closed
    /// subscriptions and transport failures.
    fn poll(&mut self, subscription: SubscriptionId) -> Result<Vec<Notification>, SyncError>;

    /// Stops delivery. Closing twice is a no-op.
    fn close(&mut self, subscription: SubscriptionId);
}

pub trait Identity {
    fn current_actor(&self) -> Option<ActorId>;
}

impl Identity for Option<ActorId> {
    fn current_actor(&self) -> Option<ActorId> {
        self.clone()
    }
}

impl Identity for ActorId {
    fn current_actor(&self) -> Option<ActorId> {
        Some(self.clone())
    }
}
