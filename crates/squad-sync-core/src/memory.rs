//! In-process backend for tests and local tooling.
//!
//! Every subscription owns a crossbeam channel; writes publish onto all
//! channels whose scope matches, so a cloned handle can feed notifications
//! from another thread while the engine side polls.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::backend::{ChangeFeed, RecordSink, RecordSource, ScopeSnapshot, SubscriptionId};
use crate::ids::{EntityKind, OptionId, RecordId, ScopeId, ScopeKey, StableId};
use crate::record::{FeedCursor, Notification, OptionTally, Record, RecordBody, RecordDraft};
use crate::SyncError;

#[derive(Debug)]
struct Subscriber {
    scope: ScopeKey,
    sender: Sender<Notification>,
    receiver: Receiver<Notification>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<Record>,
    tallies: Vec<OptionTally>,
    /// Every notification ever published. Positions are feed cursors, so the
    /// log is never trimmed; it lives as long as one test backend.
    log: Vec<Notification>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscription: u64,
    failing_writes: usize,
    failing_deletes: usize,
    failing_fetch: bool,
}

impl MemoryState {
    fn publish(&mut self, notification: Notification) {
        let scope = notification.scope_key();
        for subscriber in self.subscribers.values() {
            if subscriber.scope == scope && subscriber.sender.send(notification.clone()).is_err() {
                tracing::debug!(%scope, "subscriber channel disconnected");
            }
        }
        self.log.push(notification);
    }

    fn cursor(&self) -> FeedCursor {
        FeedCursor(i64::try_from(self.log.len()).unwrap_or(i64::MAX))
    }

    fn store(&mut self, draft: &RecordDraft) -> Result<Record, SyncError> {
        let scope = draft.scope_key();
        let duplicate = self.records.iter().any(|record| {
            record.scope_key() == scope
                && record.base.actor_id == draft.actor_id
                && record.kind() != EntityKind::Comment
                && record.body.payload_key() == draft.body.payload_key()
        });
        if duplicate {
            return Err(SyncError::Validation(format!(
                "{} already holds {} in {scope}",
                draft.actor_id,
                draft.body.payload_text()
            )));
        }

        let bumped = match &draft.body {
            RecordBody::Vote { option_id } => {
                let Some(tally) = self
                    .tallies
                    .iter_mut()
                    .find(|tally| tally.id == *option_id && tally.event_id == draft.scope_id)
                else {
                    return Err(SyncError::Validation(format!(
                        "unknown vote option {option_id}"
                    )));
                };
                tally.vote_count = tally.vote_count.saturating_add(1);
                Some(tally.clone())
            }
            RecordBody::Reaction { .. } | RecordBody::Comment { .. } => None,
        };

        let record = draft
            .clone()
            .into_record(RecordId::Stable(StableId::generate()));
        self.records.push(record.clone());
        self.publish(Notification::Created {
            record: record.clone(),
        });
        if let Some(tally) = bumped {
            self.publish(Notification::TallyChanged { tally });
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, SyncError> {
        self.state
            .lock()
            .map_err(|_| SyncError::Storage("memory backend lock poisoned".to_string()))
    }

    /// Makes the next `count` writes fail with a transient error.
    ///
    /// # Errors
    /// Returns [`SyncError::Storage`] if the state lock is poisoned.
    pub fn fail_next_writes(&self, count: usize) -> Result<(), SyncError> {
        self.lock()?.failing_writes = count;
        Ok(())
    }

    /// Makes the next `count` deletes fail with a transient error.
    ///
    /// # Errors
    /// Returns [`SyncError::Storage`] if the state lock is poisoned.
    pub fn fail_next_deletes(&self, count: usize) -> Result<(), SyncError> {
        self.lock()?.failing_deletes = count;
        Ok(())
    }

    /// Makes the next fetch fail.
    ///
    /// # Errors
    /// Returns [`SyncError::Storage`] if the state lock is poisoned.
    pub fn fail_next_fetch(&self) -> Result<(), SyncError> {
        self.lock()?.failing_fetch = true;
        Ok(())
    }

    /// Stores a pre-existing record without publishing it.
    ///
    /// # Errors
    /// Returns [`SyncError::Storage`] if the state lock is poisoned.
    pub fn seed_record(&self, record: Record) -> Result<(), SyncError> {
        self.lock()?.records.push(record);
        Ok(())
    }

    /// Adds a voting option with zero votes.
    ///
    /// # Errors
    /// Returns [`SyncError::Storage`] if the state lock is poisoned.
    pub fn seed_option(&self, event_id: ScopeId, label: &str) -> Result<OptionTally, SyncError> {
        let tally = OptionTally {
            id: OptionId::generate(),
            event_id,
            label: label.to_string(),
            vote_count: 0,
        };
        self.lock()?.tallies.push(tally.clone());
        Ok(tally)
    }

    /// Writes on behalf of another client, bypassing injected failures.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] for duplicate reactions or votes and
    /// unknown vote options.
    pub fn remote_write(&self, draft: &RecordDraft) -> Result<Record, SyncError> {
        self.lock()?.store(draft)
    }

    /// Publishes a raw notification, e.g. a duplicate or reordered delivery.
    ///
    /// # Errors
    /// Returns [`SyncError::Storage`] if the state lock is poisoned.
    pub fn publish(&self, notification: Notification) -> Result<(), SyncError> {
        self.lock()?.publish(notification);
        Ok(())
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().map_or(0, |state| state.subscribers.len())
    }

    #[must_use]
    pub fn stored_records(&self) -> Vec<Record> {
        self.lock()
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }
}

impl RecordSource for MemoryBackend {
    fn fetch(&mut self, scope: &ScopeKey) -> Result<ScopeSnapshot, SyncError> {
        let mut state = self.lock()?;
        if state.failing_fetch {
            state.failing_fetch = false;
            return Err(SyncError::Fetch(format!("fetch for {scope} failed")));
        }
        let records = state
            .records
            .iter()
            .filter(|record| record.scope_key() == *scope)
            .cloned()
            .collect();
        let tallies = if scope.kind == EntityKind::Vote {
            state
                .tallies
                .iter()
                .filter(|tally| tally.event_id == scope.scope_id)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        Ok(ScopeSnapshot {
            records,
            tallies,
            cursor: Some(state.cursor()),
        })
    }
}

impl RecordSink for MemoryBackend {
    fn write(&mut self, draft: &RecordDraft) -> Result<Record, SyncError> {
        let mut state = self.lock()?;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(SyncError::TransientWrite(format!(
                "write to {} failed",
                draft.scope_key()
            )));
        }
        state.store(draft)
    }

    fn delete(&mut self, id: StableId) -> Result<(), SyncError> {
        let mut state = self.lock()?;
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(SyncError::TransientWrite(format!("delete of {id} failed")));
        }
        let target = RecordId::Stable(id);
        let Some(index) = state
            .records
            .iter()
            .position(|record| record.base.id == target)
        else {
            return Ok(());
        };
        if state.records[index].kind() == EntityKind::Vote {
            return Err(SyncError::Validation(
                "votes are append-only and cannot be removed".to_string(),
            ));
        }
        let record = state.records.remove(index);
        state.publish(Notification::Deleted {
            kind: record.kind(),
            scope_id: record.base.scope_id,
            id,
        });
        Ok(())
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(
        &mut self,
        scope: &ScopeKey,
        after: Option<FeedCursor>,
    ) -> Result<SubscriptionId, SyncError> {
        let mut state = self
            .lock()
            .map_err(|err| SyncError::Subscription(err.to_string()))?;
        let (sender, receiver) = unbounded();
        if let Some(FeedCursor(after)) = after {
            let start = usize::try_from(after).unwrap_or(0);
            for notification in state.log.iter().skip(start) {
                if notification.scope_key() == *scope
                    && sender.send(notification.clone()).is_err()
                {
                    return Err(SyncError::Subscription(
                        "subscription channel closed during replay".to_string(),
                    ));
                }
            }
        }
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscribers.insert(
            id,
            Subscriber {
                scope: scope.clone(),
                sender,
                receiver,
            },
        );
        Ok(SubscriptionId(id))
    }

    fn poll(&mut self, subscription: SubscriptionId) -> Result<Vec<Notification>, SyncError> {
        let state = self
            .lock()
            .map_err(|err| SyncError::Subscription(err.to_string()))?;
        let Some(subscriber) = state.subscribers.get(&subscription.0) else {
            return Err(SyncError::Subscription(format!(
                "unknown subscription {}",
                subscription.0
            )));
        };
        Ok(subscriber.receiver.try_iter().collect())
    }

    fn close(&mut self, subscription: SubscriptionId) {
        match self.lock() {
            Ok(mut state) => {
                state.subscribers.remove(&subscription.0);
            }
            Err(err) => tracing::warn!(error = %err, "failed to close subscription"),
        }
    }
}
