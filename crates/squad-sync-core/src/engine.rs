//! Per-scope optimistic mutation and change-feed reconciliation.
//!
//! [`ScopeEngine`] performs no I/O. [`ScopeEngine::request`] applies a local
//! intent speculatively and hands back a [`Command`] for the caller to execute
//! against the authoritative store; the result is fed back through
//! [`ScopeEngine::complete`]. Change-feed notifications are queued with
//! [`ScopeEngine::enqueue`] and merged in arrival order by
//! [`ScopeEngine::drain`], so both paths run on the caller's thread.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::aggregate::{self, ReactionGroup};
use crate::backend::ScopeSnapshot;
use crate::config::EngineConfig;
use crate::ids::{ActorId, EntityKind, OptionId, ProvisionalId, RecordId, ScopeKey, StableId};
use crate::record::{MutationKey, Notification, OptionTally, Record, RecordBody, RecordDraft};
use crate::store::{AggregateStore, InsertOutcome, ReplaceOutcome, TallyBoard};
use crate::{now_utc, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    Add { body: RecordBody },
    Remove { id: RecordId },
}

/// Correlates a [`Command`] with its completion.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Ticket {
    pub epoch: u64,
    pub seq: u64,
    pub key: MutationKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Write { ticket: Ticket, draft: RecordDraft },
    Delete { ticket: Ticket, id: StableId },
}

impl Command {
    #[must_use]
    pub fn ticket(&self) -> &Ticket {
        match self {
            Self::Write { ticket, .. } | Self::Delete { ticket, .. } => ticket,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NoopReason {
    NothingToRemove,
    AlreadyVoted,
    /// A released add found the reaction already held.
    AlreadyReacted,
    /// The toggle undid an add still waiting in the queue.
    ToggleCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "dispatch", rename_all = "snake_case")]
pub enum Dispatch {
    Issue { command: Command },
    /// Waiting behind an in-flight mutation with the same key.
    Queued { depth: usize },
    Noop { reason: NoopReason },
}

/// Successful result of executing a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum Ack {
    Written { record: Record },
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    Confirmed { provisional: RecordId, id: StableId },
    /// The change feed delivered the stable record before the ack did.
    AlreadyReconciled { provisional: RecordId },
    Removed { id: StableId },
    RolledBack { id: RecordId, error: SyncError },
    /// The ticket belongs to a torn-down scope or an already settled mutation.
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Settlement {
    pub outcome: MutationOutcome,
    /// Queued intents released by this settlement, already re-evaluated.
    pub released: Vec<Result<Dispatch, SyncError>>,
}

impl Settlement {
    fn stale() -> Self {
        Self {
            outcome: MutationOutcome::Stale,
            released: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reconciled {
    Inserted { id: StableId },
    /// Echo of a local pending mutation replaced its provisional record.
    Reconciled { provisional: RecordId, id: StableId },
    Duplicate { id: StableId },
    /// A local delete for this id is in flight.
    Suppressed { id: StableId },
    Removed { id: StableId },
    Absent { id: StableId },
    TallyUpdated { option: OptionId, vote_count: u32 },
    Ignored,
}

#[derive(Debug, Clone)]
enum Pending {
    Add {
        seq: u64,
        provisional: ProvisionalId,
        tally_owed: Option<OptionId>,
    },
    Remove {
        seq: u64,
        record: Record,
        index: usize,
    },
}

impl Pending {
    fn seq(&self) -> u64 {
        match self {
            Self::Add { seq, .. } | Self::Remove { seq, .. } => *seq,
        }
    }
}

enum Target {
    Add { body: RecordBody, key: MutationKey },
    Remove { record: Record, key: MutationKey },
    Absent,
}

#[derive(Debug)]
pub struct ScopeEngine {
    scope: ScopeKey,
    epoch: u64,
    actor: Option<ActorId>,
    config: EngineConfig,
    store: AggregateStore,
    tallies: TallyBoard,
    next_provisional: u64,
    next_seq: u64,
    in_flight: BTreeMap<MutationKey, Pending>,
    waiting: BTreeMap<MutationKey, VecDeque<Intent>>,
    /// Deletes in flight, flagged once the feed confirmed the deletion.
    deleting: BTreeMap<StableId, bool>,
    aliases: BTreeMap<ProvisionalId, StableId>,
    inbox: VecDeque<Notification>,
}

impl ScopeEngine {
    #[must_use]
    pub fn new(scope: ScopeKey, epoch: u64, actor: Option<ActorId>, config: EngineConfig) -> Self {
        Self {
            store: AggregateStore::new(scope.clone()),
            scope,
            epoch,
            actor,
            config,
            tallies: TallyBoard::default(),
            next_provisional: 1,
            next_seq: 1,
            in_flight: BTreeMap::new(),
            waiting: BTreeMap::new(),
            deleting: BTreeMap::new(),
            aliases: BTreeMap::new(),
            inbox: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn actor(&self) -> Option<&ActorId> {
        self.actor.as_ref()
    }

    pub fn set_actor(&mut self, actor: Option<ActorId>) {
        self.actor = actor;
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        self.store.snapshot()
    }

    #[must_use]
    pub fn tallies(&self) -> &[OptionTally] {
        self.tallies.snapshot()
    }

    #[must_use]
    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.waiting.values().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn pending_notifications(&self) -> usize {
        self.inbox.len()
    }

    /// Stable id a provisional record was reconciled to, if known.
    #[must_use]
    pub fn resolve_alias(&self, id: RecordId) -> RecordId {
        match id {
            RecordId::Provisional(provisional) => self
                .aliases
                .get(&provisional)
                .map_or(id, |stable| RecordId::Stable(*stable)),
            RecordId::Stable(_) => id,
        }
    }

    #[must_use]
    pub fn reaction_groups(&self) -> Vec<ReactionGroup> {
        aggregate::group_reactions(self.store.snapshot(), self.actor.as_ref())
    }

    /// Replaces the store contents with a fetched snapshot.
    ///
    /// Provisional records of in-flight mutations are kept, and vote bumps
    /// still owed are re-applied on top of the fetched counters.
    pub fn load(&mut self, snapshot: ScopeSnapshot) -> usize {
        let pending: Vec<Record> = self
            .store
            .snapshot()
            .iter()
            .filter(|record| record.is_provisional())
            .cloned()
            .collect();
        let loaded = self.store.reset(snapshot.records);
        for record in pending {
            self.store.insert(record);
        }
        if self.scope.kind == EntityKind::Vote {
            self.tallies.reset(snapshot.tallies);
            for pending in self.in_flight.values() {
                if let Pending::Add {
                    tally_owed: Some(option),
                    ..
                } = pending
                {
                    self.tallies.bump(option);
                }
            }
        }
        loaded
    }

    /// Applies `intent` speculatively.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when no actor is signed in, the body
    /// is invalid for this scope, the target belongs to another actor, the
    /// target is an append-only vote, or the per-key queue is full.
    pub fn request(&mut self, intent: Intent) -> Result<Dispatch, SyncError> {
        self.evaluate(intent, true)
    }

    fn evaluate(&mut self, intent: Intent, toggle: bool) -> Result<Dispatch, SyncError> {
        let actor = self
            .actor
            .clone()
            .ok_or_else(|| SyncError::Validation("a signed-in actor is required".to_string()))?;
        let intent = self.normalize(intent)?;
        let target = self.resolve(&actor, &intent)?;

        let key = match &target {
            Target::Add { key, .. } | Target::Remove { key, .. } => key,
            Target::Absent => {
                return Ok(Dispatch::Noop {
                    reason: NoopReason::NothingToRemove,
                })
            }
        };

        if self.in_flight.contains_key(key) {
            let key = key.clone();
            return self.enqueue_intent(key, intent);
        }

        Ok(self.start(actor, target, toggle))
    }

    /// Queues `intent` behind the in-flight mutation for `key`.
    ///
    /// Reaction toggles are resolved against what the actor sees now: a held
    /// record (provisional or stable) is queued for removal, a queued removal
    /// is followed by a re-add, and a queued add is cancelled.
    fn enqueue_intent(&mut self, key: MutationKey, intent: Intent) -> Result<Dispatch, SyncError> {
        let intent = match intent {
            Intent::Add {
                body: body @ RecordBody::Reaction { .. },
            } => {
                let queued_add = self
                    .waiting
                    .get(&key)
                    .and_then(VecDeque::back)
                    .map(|last| matches!(last, Intent::Add { .. }));
                match queued_add {
                    Some(true) => {
                        if let Some(queue) = self.waiting.get_mut(&key) {
                            queue.pop_back();
                            if queue.is_empty() {
                                self.waiting.remove(&key);
                            }
                        }
                        return Ok(Dispatch::Noop {
                            reason: NoopReason::ToggleCancelled,
                        });
                    }
                    Some(false) => Intent::Add { body },
                    None => match self.store.find_own(&key) {
                        Some(held) => Intent::Remove { id: held.id() },
                        None => Intent::Add { body },
                    },
                }
            }
            other => other,
        };

        let limit = self.config.max_queued_per_key;
        let queue = self.waiting.entry(key).or_default();
        if queue.len() >= limit {
            return Err(SyncError::Validation(format!(
                "at most {limit} mutations may wait on the same record"
            )));
        }
        queue.push_back(intent);
        Ok(Dispatch::Queued { depth: queue.len() })
    }

    /// Settles the command identified by `ticket`.
    ///
    /// Failures never propagate: a failed write or delete is rolled back and
    /// reported as [`MutationOutcome::RolledBack`].
    pub fn complete(&mut self, ticket: &Ticket, result: Result<Ack, SyncError>) -> Settlement {
        if ticket.epoch != self.epoch {
            tracing::debug!(
                scope = %self.scope,
                epoch = ticket.epoch,
                "ignoring completion from a previous scope epoch"
            );
            return Settlement::stale();
        }
        let matches = self
            .in_flight
            .get(&ticket.key)
            .is_some_and(|pending| pending.seq() == ticket.seq);
        if !matches {
            tracing::debug!(
                scope = %self.scope,
                seq = ticket.seq,
                "ignoring completion for a settled mutation"
            );
            return Settlement::stale();
        }
        let Some(pending) = self.in_flight.remove(&ticket.key) else {
            return Settlement::stale();
        };

        let outcome = match pending {
            Pending::Add {
                provisional,
                tally_owed,
                ..
            } => self.settle_add(provisional, tally_owed, result),
            Pending::Remove { record, index, .. } => self.settle_remove(record, index, result),
        };

        Settlement {
            outcome,
            released: self.release(&ticket.key),
        }
    }

    pub fn enqueue(&mut self, notification: Notification) {
        self.inbox.push_back(notification);
    }

    /// Applies every queued notification in arrival order.
    pub fn drain(&mut self) -> Vec<Reconciled> {
        let mut applied = Vec::with_capacity(self.inbox.len());
        while let Some(notification) = self.inbox.pop_front() {
            applied.push(self.apply(notification));
        }
        applied
    }

    /// Merges a single notification. Anomalies resolve to no-ops.
    pub fn apply(&mut self, notification: Notification) -> Reconciled {
        if notification.scope_key() != self.scope {
            tracing::debug!(
                scope = %self.scope,
                op = notification.op_name(),
                "ignoring notification for another scope"
            );
            return Reconciled::Ignored;
        }

        match notification {
            Notification::Created { record } => self.apply_created(record),
            Notification::Deleted { id, .. } => {
                if let Some(confirmed) = self.deleting.get_mut(&id) {
                    *confirmed = true;
                }
                match self.store.remove(&RecordId::Stable(id)) {
                    Some(_) => Reconciled::Removed { id },
                    None => {
                        tracing::debug!(
                            scope = %self.scope,
                            %id,
                            "delete notification for an absent record"
                        );
                        Reconciled::Absent { id }
                    }
                }
            }
            Notification::TallyChanged { tally } => {
                let option = tally.id;
                let vote_count = tally.vote_count;
                self.tallies.overwrite(tally);
                for pending in self.in_flight.values_mut() {
                    if let Pending::Add { tally_owed, .. } = pending {
                        if *tally_owed == Some(option) {
                            *tally_owed = None;
                        }
                    }
                }
                Reconciled::TallyUpdated { option, vote_count }
            }
        }
    }

    fn apply_created(&mut self, record: Record) -> Reconciled {
        let Some(id) = record.stable_id() else {
            tracing::debug!(scope = %self.scope, "create notification without a stable id");
            return Reconciled::Ignored;
        };
        if self.store.contains(&record.id()) {
            tracing::debug!(scope = %self.scope, %id, "duplicate create notification");
            return Reconciled::Duplicate { id };
        }
        if self.deleting.contains_key(&id) {
            return Reconciled::Suppressed { id };
        }

        if self.actor.as_ref() == Some(&record.base.actor_id) {
            let provisional = self
                .store
                .find_provisional(&record.mutation_key())
                .map(Record::id);
            if let Some(provisional) = provisional {
                if self.store.replace(&provisional, record) == ReplaceOutcome::Replaced {
                    if let RecordId::Provisional(local) = provisional {
                        self.aliases.insert(local, id);
                    }
                    return Reconciled::Reconciled { provisional, id };
                }
                return Reconciled::Duplicate { id };
            }
        }

        match self.store.insert(record) {
            InsertOutcome::Inserted => Reconciled::Inserted { id },
            InsertOutcome::Duplicate => Reconciled::Duplicate { id },
            InsertOutcome::ForeignScope => Reconciled::Ignored,
        }
    }

    fn normalize(&self, intent: Intent) -> Result<Intent, SyncError> {
        match intent {
            Intent::Add { body } => {
                if body.kind() != self.scope.kind {
                    return Err(SyncError::Validation(format!(
                        "{} body does not belong to scope {}",
                        body.kind().as_str(),
                        self.scope
                    )));
                }
                let body = self.config.normalize_body(body)?;
                if let RecordBody::Vote { option_id } = &body {
                    if !self.tallies.is_empty() && !self.tallies.contains(option_id) {
                        return Err(SyncError::Validation(format!(
                            "unknown vote option {option_id}"
                        )));
                    }
                }
                Ok(Intent::Add { body })
            }
            remove @ Intent::Remove { .. } => Ok(remove),
        }
    }

    fn resolve(&self, actor: &ActorId, intent: &Intent) -> Result<Target, SyncError> {
        match intent {
            Intent::Add { body } => Ok(Target::Add {
                key: MutationKey {
                    actor: actor.clone(),
                    payload: body.payload_key(),
                },
                body: body.clone(),
            }),
            Intent::Remove { id } => {
                let id = self.resolve_alias(*id);
                let Some(record) = self.store.get(&id) else {
                    return Ok(Target::Absent);
                };
                if record.kind() == EntityKind::Vote {
                    return Err(SyncError::Validation(
                        "votes are append-only and cannot be removed".to_string(),
                    ));
                }
                if record.base.actor_id != *actor {
                    return Err(SyncError::Validation(format!(
                        "record {id} belongs to another actor"
                    )));
                }
                Ok(Target::Remove {
                    key: record.mutation_key(),
                    record: record.clone(),
                })
            }
        }
    }

    fn start(&mut self, actor: ActorId, target: Target, toggle: bool) -> Dispatch {
        match target {
            Target::Add { body, key } => {
                if let Some(existing) = self.store.find_own(&key).cloned() {
                    match body {
                        RecordBody::Reaction { .. } if toggle => {
                            return self.start_remove(existing, key);
                        }
                        RecordBody::Reaction { .. } => {
                            return Dispatch::Noop {
                                reason: NoopReason::AlreadyReacted,
                            };
                        }
                        RecordBody::Vote { .. } => {
                            return Dispatch::Noop {
                                reason: NoopReason::AlreadyVoted,
                            };
                        }
                        RecordBody::Comment { .. } => {}
                    }
                }
                self.start_add(actor, body, key)
            }
            Target::Remove { record, key } => self.start_remove(record, key),
            Target::Absent => Dispatch::Noop {
                reason: NoopReason::NothingToRemove,
            },
        }
    }

    fn start_add(&mut self, actor: ActorId, body: RecordBody, key: MutationKey) -> Dispatch {
        let provisional = ProvisionalId(self.next_provisional);
        self.next_provisional += 1;

        let tally_owed = match &body {
            RecordBody::Vote { option_id } if self.tallies.bump(option_id) => Some(*option_id),
            _ => None,
        };
        let draft = RecordDraft {
            scope_id: self.scope.scope_id.clone(),
            actor_id: actor,
            created_at: now_utc(),
            body,
        };
        self.store
            .insert(draft.clone().into_record(RecordId::Provisional(provisional)));

        let ticket = self.ticket(key.clone());
        self.in_flight.insert(
            key,
            Pending::Add {
                seq: ticket.seq,
                provisional,
                tally_owed,
            },
        );
        Dispatch::Issue {
            command: Command::Write { ticket, draft },
        }
    }

    fn start_remove(&mut self, record: Record, key: MutationKey) -> Dispatch {
        let Some(id) = record.stable_id() else {
            tracing::debug!(
                scope = %self.scope,
                id = %record.id(),
                "provisional record has no pending write"
            );
            return Dispatch::Noop {
                reason: NoopReason::NothingToRemove,
            };
        };
        let Some((index, record)) = self.store.remove(&record.id()) else {
            return Dispatch::Noop {
                reason: NoopReason::NothingToRemove,
            };
        };
        self.deleting.insert(id, false);

        let ticket = self.ticket(key.clone());
        self.in_flight.insert(
            key,
            Pending::Remove {
                seq: ticket.seq,
                record,
                index,
            },
        );
        Dispatch::Issue {
            command: Command::Delete { ticket, id },
        }
    }

    fn settle_add(
        &mut self,
        provisional: ProvisionalId,
        tally_owed: Option<OptionId>,
        result: Result<Ack, SyncError>,
    ) -> MutationOutcome {
        let local = RecordId::Provisional(provisional);
        let written = match result {
            Ok(Ack::Written { record }) => match record.stable_id() {
                Some(id) => Ok((record, id)),
                None => Err(SyncError::Validation(
                    "write acknowledgment carried a provisional id".to_string(),
                )),
            },
            Ok(Ack::Deleted) => Err(SyncError::Validation(
                "write acknowledged as a delete".to_string(),
            )),
            Err(error) => Err(error),
        };

        match written {
            Ok((record, id)) => match self.store.replace(&local, record) {
                ReplaceOutcome::Replaced => {
                    self.aliases.insert(provisional, id);
                    MutationOutcome::Confirmed {
                        provisional: local,
                        id,
                    }
                }
                ReplaceOutcome::Collapsed | ReplaceOutcome::Missing => {
                    self.aliases.insert(provisional, id);
                    MutationOutcome::AlreadyReconciled { provisional: local }
                }
                ReplaceOutcome::ForeignScope => self.roll_back_add(
                    local,
                    tally_owed,
                    SyncError::Validation(format!(
                        "write acknowledgment for {id} does not belong to scope {}",
                        self.scope
                    )),
                ),
            },
            Err(error) => {
                if self.aliases.contains_key(&provisional) {
                    tracing::debug!(
                        scope = %self.scope,
                        %local,
                        %error,
                        "write failed after the feed reconciled it"
                    );
                    return MutationOutcome::AlreadyReconciled { provisional: local };
                }
                self.roll_back_add(local, tally_owed, error)
            }
        }
    }

    fn roll_back_add(
        &mut self,
        local: RecordId,
        tally_owed: Option<OptionId>,
        error: SyncError,
    ) -> MutationOutcome {
        self.store.remove(&local);
        if let Some(option) = tally_owed {
            self.tallies.unbump(&option);
        }
        tracing::warn!(scope = %self.scope, id = %local, %error, "optimistic add rolled back");
        MutationOutcome::RolledBack { id: local, error }
    }

    fn settle_remove(
        &mut self,
        record: Record,
        index: usize,
        result: Result<Ack, SyncError>,
    ) -> MutationOutcome {
        let id = record.stable_id();
        let confirmed_by_feed = id
            .and_then(|id| self.deleting.remove(&id))
            .unwrap_or(false);
        let error = match result {
            Ok(Ack::Deleted) => None,
            Ok(Ack::Written { .. }) => Some(SyncError::Validation(
                "delete acknowledged as a write".to_string(),
            )),
            Err(error) => Some(error),
        };

        match (error, id) {
            (None, Some(id)) => MutationOutcome::Removed { id },
            (Some(error), Some(id)) if confirmed_by_feed => {
                tracing::debug!(
                    scope = %self.scope,
                    %id,
                    %error,
                    "delete failed after the feed confirmed it"
                );
                MutationOutcome::Removed { id }
            }
            (error, _) => {
                let error = error.unwrap_or_else(|| {
                    SyncError::Validation("delete settled without a stable id".to_string())
                });
                let local = record.id();
                self.store.restore(index, record);
                tracing::warn!(
                    scope = %self.scope,
                    id = %local,
                    %error,
                    "optimistic delete rolled back"
                );
                MutationOutcome::RolledBack { id: local, error }
            }
        }
    }

    fn release(&mut self, key: &MutationKey) -> Vec<Result<Dispatch, SyncError>> {
        let mut released = Vec::new();
        while !self.in_flight.contains_key(key) {
            let Some(intent) = self.waiting.get_mut(key).and_then(VecDeque::pop_front) else {
                break;
            };
            released.push(self.evaluate(intent, false));
        }
        if self.waiting.get(key).is_some_and(VecDeque::is_empty) {
            self.waiting.remove(key);
        }
        released
    }

    fn ticket(&mut self, key: MutationKey) -> Ticket {
        let seq = self.next_seq;
        self.next_seq += 1;
        Ticket {
            epoch: self.epoch,
            seq,
            key,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;
    use crate::ids::ScopeId;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn actor(value: &str) -> ActorId {
        must_ok(ActorId::new(value))
    }

    fn scope(kind: EntityKind, id: &str) -> ScopeKey {
        ScopeKey::new(kind, must_ok(ScopeId::new(id)))
    }

    fn engine(kind: EntityKind) -> ScopeEngine {
        let scope_id = if kind == EntityKind::Vote { "event-1" } else { "photo-1" };
        ScopeEngine::new(scope(kind, scope_id), 1, Some(actor("me")), EngineConfig::v1())
    }

    fn react(emoji: &str) -> Intent {
        Intent::Add {
            body: RecordBody::Reaction {
                emoji: emoji.to_string(),
            },
        }
    }

    fn issued(dispatch: Result<Dispatch, SyncError>) -> Command {
        match dispatch {
            Ok(Dispatch::Issue { command }) => command,
            other => panic!("expected an issued command, got {other:?}"),
        }
    }

    fn ack_success(command: &Command) -> Result<Ack, SyncError> {
        match command {
            Command::Write { draft, .. } => Ok(Ack::Written {
                record: draft.clone().into_record(RecordId::Stable(StableId::generate())),
            }),
            Command::Delete { .. } => Ok(Ack::Deleted),
        }
    }

    fn stable_from(command: &Command) -> Record {
        match command {
            Command::Write { draft, .. } => {
                draft.clone().into_record(RecordId::Stable(StableId::generate()))
            }
            Command::Delete { .. } => panic!("expected a write command"),
        }
    }

    fn remote(scope_id: &str, actor_id: &str, body: RecordBody) -> Record {
        RecordDraft {
            scope_id: must_ok(ScopeId::new(scope_id)),
            actor_id: actor(actor_id),
            created_at: now_utc(),
            body,
        }
        .into_record(RecordId::Stable(StableId::generate()))
    }

    fn remote_reaction(actor_id: &str, emoji: &str) -> Record {
        remote(
            "photo-1",
            actor_id,
            RecordBody::Reaction {
                emoji: emoji.to_string(),
            },
        )
    }

    fn option(label: &str, vote_count: u32) -> OptionTally {
        OptionTally {
            id: OptionId::generate(),
            event_id: must_ok(ScopeId::new("event-1")),
            label: label.to_string(),
            vote_count,
        }
    }

    fn transient() -> SyncError {
        SyncError::TransientWrite("network unreachable".to_string())
    }

    #[test]
    fn add_then_ack_replaces_provisional_in_place() {
        let mut engine = engine(EntityKind::Reaction);
        let first = remote_reaction("u1", "👍");
        engine.apply(Notification::Created {
            record: first.clone(),
        });

        let command = issued(engine.request(react("❤️")));
        assert_eq!(engine.records().len(), 2);
        assert!(engine.records()[1].is_provisional());

        let stable = stable_from(&command);
        let settlement = engine.complete(
            command.ticket(),
            Ok(Ack::Written {
                record: stable.clone(),
            }),
        );
        assert!(matches!(settlement.outcome, MutationOutcome::Confirmed { .. }));
        assert_eq!(engine.records(), &[first, stable]);
        assert_eq!(engine.in_flight_count(), 0);
    }

    #[test]
    fn failed_write_restores_previous_snapshot() {
        let mut engine = engine(EntityKind::Reaction);
        engine.apply(Notification::Created {
            record: remote_reaction("u1", "👍"),
        });
        let before = engine.records().to_vec();

        let command = issued(engine.request(react("❤️")));
        assert!(engine
            .reaction_groups()
            .iter()
            .any(|group| group.emoji == "❤️" && group.actor_acted));

        let settlement = engine.complete(command.ticket(), Err(transient()));
        assert!(matches!(
            settlement.outcome,
            MutationOutcome::RolledBack { error: SyncError::TransientWrite(_), .. }
        ));
        assert_eq!(engine.records(), before.as_slice());
        assert!(engine
            .reaction_groups()
            .iter()
            .all(|group| group.emoji != "❤️"));
    }

    #[test]
    fn echo_before_ack_reconciles_once() {
        let mut engine = engine(EntityKind::Reaction);
        let command = issued(engine.request(react("🎉")));
        let stable = stable_from(&command);

        let reconciled = engine.apply(Notification::Created {
            record: stable.clone(),
        });
        assert!(matches!(reconciled, Reconciled::Reconciled { .. }));

        let settlement = engine.complete(
            command.ticket(),
            Ok(Ack::Written {
                record: stable.clone(),
            }),
        );
        assert!(matches!(
            settlement.outcome,
            MutationOutcome::AlreadyReconciled { .. }
        ));
        assert_eq!(engine.records(), &[stable]);
    }

    #[test]
    fn duplicate_delivery_keeps_one_record() {
        let mut engine = engine(EntityKind::Reaction);
        let record = remote_reaction("u1", "😂");
        engine.enqueue(Notification::Created {
            record: record.clone(),
        });
        engine.enqueue(Notification::Created {
            record: record.clone(),
        });
        let applied = engine.drain();

        assert!(matches!(applied[0], Reconciled::Inserted { .. }));
        assert!(matches!(applied[1], Reconciled::Duplicate { .. }));
        assert_eq!(engine.records(), &[record]);
        assert_eq!(engine.pending_notifications(), 0);
    }

    #[test]
    fn toggle_removes_held_reaction() {
        let mut engine = engine(EntityKind::Reaction);
        let command = issued(engine.request(react("👍")));
        let ack = ack_success(&command);
        engine.complete(command.ticket(), ack);
        assert_eq!(engine.records().len(), 1);

        let command = issued(engine.request(react("👍")));
        let Command::Delete { id, .. } = &command else {
            panic!("expected toggle to issue a delete");
        };
        let id = *id;
        assert!(engine.records().is_empty());

        // the delete echo arrives before the ack; a late create is suppressed
        let mut held = remote_reaction("me", "👍");
        held.base.id = RecordId::Stable(id);
        assert_eq!(
            engine.apply(Notification::Created { record: held }),
            Reconciled::Suppressed { id }
        );

        let settlement = engine.complete(command.ticket(), Ok(Ack::Deleted));
        assert_eq!(settlement.outcome, MutationOutcome::Removed { id });
        assert_eq!(
            engine.apply(Notification::Deleted {
                kind: EntityKind::Reaction,
                scope_id: must_ok(ScopeId::new("photo-1")),
                id,
            }),
            Reconciled::Absent { id }
        );
    }

    #[test]
    fn failed_delete_restores_record_position() {
        let mut engine = engine(EntityKind::Comment);
        let others = [
            remote("photo-1", "u1", RecordBody::Comment { text: "a".to_string() }),
            remote("photo-1", "me", RecordBody::Comment { text: "b".to_string() }),
            remote("photo-1", "u2", RecordBody::Comment { text: "c".to_string() }),
        ];
        for record in &others {
            engine.apply(Notification::Created {
                record: record.clone(),
            });
        }
        let before = engine.records().to_vec();

        let command = issued(engine.request(Intent::Remove { id: others[1].id() }));
        assert_eq!(engine.records().len(), 2);
        let settlement = engine.complete(command.ticket(), Err(transient()));
        assert!(matches!(settlement.outcome, MutationOutcome::RolledBack { .. }));
        assert_eq!(engine.records(), before.as_slice());
    }

    #[test]
    fn failed_delete_after_feed_confirmation_stays_removed() {
        let mut engine = engine(EntityKind::Comment);
        let mine = remote("photo-1", "me", RecordBody::Comment { text: "bye".to_string() });
        let Some(id) = mine.stable_id() else {
            panic!("fixture must carry a stable id");
        };
        engine.apply(Notification::Created { record: mine.clone() });

        let command = issued(engine.request(Intent::Remove { id: mine.id() }));
        engine.apply(Notification::Deleted {
            kind: EntityKind::Comment,
            scope_id: must_ok(ScopeId::new("photo-1")),
            id,
        });
        let settlement = engine.complete(command.ticket(), Err(transient()));
        assert_eq!(settlement.outcome, MutationOutcome::Removed { id });
        assert!(engine.records().is_empty());
    }

    #[test]
    fn removing_foreign_or_absent_records() {
        let mut engine = engine(EntityKind::Comment);
        let theirs = remote("photo-1", "u1", RecordBody::Comment { text: "hey".to_string() });
        engine.apply(Notification::Created { record: theirs.clone() });

        assert!(matches!(
            engine.request(Intent::Remove { id: theirs.id() }),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(
            engine.request(Intent::Remove {
                id: RecordId::Stable(StableId::generate())
            }),
            Ok(Dispatch::Noop {
                reason: NoopReason::NothingToRemove
            })
        );
    }

    #[test]
    fn second_request_for_same_key_waits_for_the_first() {
        let mut engine = engine(EntityKind::Reaction);
        let first = issued(engine.request(react("🔥")));
        assert_eq!(engine.request(react("🔥")), Ok(Dispatch::Queued { depth: 1 }));
        assert_eq!(engine.records().len(), 1);

        let ack = ack_success(&first);
        let settlement = engine.complete(first.ticket(), ack);
        assert!(matches!(settlement.outcome, MutationOutcome::Confirmed { .. }));
        assert_eq!(settlement.released.len(), 1);
        let second = issued(settlement.released[0].clone());
        assert!(matches!(second, Command::Delete { .. }));

        let settlement = engine.complete(second.ticket(), Ok(Ack::Deleted));
        assert!(matches!(settlement.outcome, MutationOutcome::Removed { .. }));
        assert!(engine.records().is_empty());
        assert_eq!(engine.queued_count(), 0);
    }

    #[test]
    fn queued_remove_of_provisional_follows_alias() {
        let mut engine = engine(EntityKind::Comment);
        let command = issued(engine.request(Intent::Add {
            body: RecordBody::Comment {
                text: "running late".to_string(),
            },
        }));
        let provisional = engine.records()[0].id();
        assert_eq!(
            engine.request(Intent::Remove { id: provisional }),
            Ok(Dispatch::Queued { depth: 1 })
        );

        let stable = stable_from(&command);
        let settlement = engine.complete(
            command.ticket(),
            Ok(Ack::Written {
                record: stable.clone(),
            }),
        );
        let delete = issued(settlement.released[0].clone());
        assert!(matches!(delete, Command::Delete { id, .. } if Some(id) == stable.stable_id()));
    }

    #[test]
    fn queue_overflow_is_rejected() {
        let mut config = EngineConfig::v1();
        config.max_queued_per_key = 1;
        let mut engine = ScopeEngine::new(
            scope(EntityKind::Reaction, "photo-1"),
            1,
            Some(actor("me")),
            config,
        );
        issued(engine.request(react("👍")));
        assert!(engine.request(react("👍")).is_ok());
        assert!(matches!(
            engine.request(react("👍")),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn toggle_behind_failed_add_leaves_nothing_held() {
        let mut engine = engine(EntityKind::Reaction);
        let write = issued(engine.request(react("❤️")));
        assert_eq!(engine.request(react("❤️")), Ok(Dispatch::Queued { depth: 1 }));

        let settlement = engine.complete(write.ticket(), Err(transient()));
        assert!(matches!(settlement.outcome, MutationOutcome::RolledBack { .. }));
        assert_eq!(
            settlement.released,
            vec![Ok(Dispatch::Noop {
                reason: NoopReason::NothingToRemove
            })]
        );
        assert!(engine.records().is_empty());
        assert_eq!(engine.in_flight_count(), 0);
        assert_eq!(engine.queued_count(), 0);
    }

    #[test]
    fn toggle_cancels_a_queued_re_add() {
        let mut engine = engine(EntityKind::Reaction);
        let held = remote_reaction("me", "🎉");
        engine.apply(Notification::Created { record: held });

        let delete = issued(engine.request(react("🎉")));
        assert!(matches!(delete, Command::Delete { .. }));
        assert_eq!(engine.request(react("🎉")), Ok(Dispatch::Queued { depth: 1 }));
        assert_eq!(
            engine.request(react("🎉")),
            Ok(Dispatch::Noop {
                reason: NoopReason::ToggleCancelled
            })
        );
        assert_eq!(engine.queued_count(), 0);

        let settlement = engine.complete(delete.ticket(), Ok(Ack::Deleted));
        assert!(matches!(settlement.outcome, MutationOutcome::Removed { .. }));
        assert!(settlement.released.is_empty());
        assert!(engine.records().is_empty());
    }

    #[test]
    fn re_add_behind_failed_delete_keeps_the_restored_reaction() {
        let mut engine = engine(EntityKind::Reaction);
        let held = remote_reaction("me", "😂");
        engine.apply(Notification::Created { record: held.clone() });

        let delete = issued(engine.request(react("😂")));
        assert_eq!(engine.request(react("😂")), Ok(Dispatch::Queued { depth: 1 }));

        let settlement = engine.complete(delete.ticket(), Err(transient()));
        assert!(matches!(settlement.outcome, MutationOutcome::RolledBack { .. }));
        assert_eq!(
            settlement.released,
            vec![Ok(Dispatch::Noop {
                reason: NoopReason::AlreadyReacted
            })]
        );
        assert_eq!(engine.records(), &[held]);
    }

    #[test]
    fn delete_before_create_lets_the_late_create_through() {
        let mut engine = engine(EntityKind::Reaction);
        let late = remote_reaction("u1", "😍");
        let Some(id) = late.stable_id() else {
            panic!("remote record must carry a stable id");
        };

        let deleted = engine.apply(Notification::Deleted {
            kind: EntityKind::Reaction,
            scope_id: must_ok(ScopeId::new("photo-1")),
            id,
        });
        assert_eq!(deleted, Reconciled::Absent { id });

        let created = engine.apply(Notification::Created {
            record: late.clone(),
        });
        assert_eq!(created, Reconciled::Inserted { id });
        assert_eq!(engine.records(), &[late]);
    }

    #[test]
    fn stale_tickets_are_ignored() {
        let mut engine = engine(EntityKind::Reaction);
        let command = issued(engine.request(react("😍")));
        let mut ticket = command.ticket().clone();
        ticket.epoch += 1;
        let settlement = engine.complete(&ticket, Err(transient()));
        assert_eq!(settlement.outcome, MutationOutcome::Stale);
        assert_eq!(engine.records().len(), 1);

        let ack = ack_success(&command);
        engine.complete(command.ticket(), ack);
        let again = engine.complete(command.ticket(), Err(transient()));
        assert_eq!(again.outcome, MutationOutcome::Stale);
        assert_eq!(engine.records().len(), 1);
    }

    #[test]
    fn signed_out_actor_cannot_mutate() {
        let mut engine = engine(EntityKind::Reaction);
        engine.set_actor(None);
        assert!(matches!(
            engine.request(react("👍")),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn vote_bumps_tally_and_rolls_back_once() {
        let mut engine = engine(EntityKind::Vote);
        let pizza = option("Pizza", 2);
        engine.load(ScopeSnapshot {
            records: Vec::new(),
            tallies: vec![pizza.clone()],
            cursor: None,
        });

        let command = issued(engine.request(Intent::Add {
            body: RecordBody::Vote { option_id: pizza.id },
        }));
        assert_eq!(engine.tallies()[0].vote_count, 3);

        engine.complete(command.ticket(), Err(transient()));
        assert_eq!(engine.tallies()[0].vote_count, 2);
        assert!(engine.records().is_empty());

        // authoritative counter arrives first; rollback must not subtract again
        let command = issued(engine.request(Intent::Add {
            body: RecordBody::Vote { option_id: pizza.id },
        }));
        engine.apply(Notification::TallyChanged {
            tally: OptionTally {
                vote_count: 2,
                ..pizza.clone()
            },
        });
        engine.complete(command.ticket(), Err(transient()));
        assert_eq!(engine.tallies()[0].vote_count, 2);
    }

    #[test]
    fn votes_are_append_only() {
        let mut engine = engine(EntityKind::Vote);
        let pizza = option("Pizza", 0);
        engine.load(ScopeSnapshot {
            records: Vec::new(),
            tallies: vec![pizza.clone()],
            cursor: None,
        });
        let vote = RecordBody::Vote { option_id: pizza.id };
        let command = issued(engine.request(Intent::Add { body: vote.clone() }));
        let ack = ack_success(&command);
        engine.complete(command.ticket(), ack);

        assert_eq!(
            engine.request(Intent::Add { body: vote }),
            Ok(Dispatch::Noop {
                reason: NoopReason::AlreadyVoted
            })
        );
        let id = engine.records()[0].id();
        assert!(matches!(
            engine.request(Intent::Remove { id }),
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            engine.request(Intent::Add {
                body: RecordBody::Vote {
                    option_id: OptionId::generate()
                }
            }),
            Err(SyncError::Validation(_))
        ));
    }

    #[test]
    fn notifications_for_other_scopes_are_ignored() {
        let mut engine = engine(EntityKind::Reaction);
        let elsewhere = remote(
            "photo-2",
            "u1",
            RecordBody::Reaction {
                emoji: "👍".to_string(),
            },
        );
        assert_eq!(
            engine.apply(Notification::Created { record: elsewhere }),
            Reconciled::Ignored
        );
        assert!(engine.records().is_empty());
    }

    #[test]
    fn load_keeps_pending_provisional_records() {
        let mut engine = engine(EntityKind::Reaction);
        issued(engine.request(react("❤️")));
        let fetched = remote_reaction("u1", "👍");
        let loaded = engine.load(ScopeSnapshot {
            records: vec![fetched.clone()],
            tallies: Vec::new(),
            cursor: None,
        });
        assert_eq!(loaded, 1);
        assert_eq!(engine.records().len(), 2);
        assert_eq!(engine.records()[0], fetched);
        assert!(engine.records()[1].is_provisional());
    }

    proptest! {
        #[test]
        fn acted_flags_match_held_payloads(
            steps in proptest::collection::vec((0_usize..6, any::<bool>()), 0..40)
        ) {
            let palette = EngineConfig::v1().reaction_palette;
            let mut engine = engine(EntityKind::Reaction);
            let mut held: BTreeSet<String> = BTreeSet::new();

            for (index, succeed) in steps {
                let emoji = palette[index].clone();
                let command = issued(engine.request(react(&emoji)));
                let result = if succeed { ack_success(&command) } else { Err(transient()) };
                engine.complete(command.ticket(), result);
                if succeed && !held.remove(&emoji) {
                    held.insert(emoji);
                }
            }

            let acted: BTreeSet<String> = engine
                .reaction_groups()
                .into_iter()
                .filter(|group| group.actor_acted)
                .map(|group| group.emoji)
                .collect();
            prop_assert_eq!(acted, held);
        }

        #[test]
        fn create_notifications_are_idempotent(repeats in 1_usize..5) {
            let mut once = engine(EntityKind::Reaction);
            let mut many = engine(EntityKind::Reaction);
            let record = remote_reaction("u1", "🔥");
            once.apply(Notification::Created { record: record.clone() });
            for _ in 0..repeats {
                many.apply(Notification::Created { record: record.clone() });
            }
            prop_assert_eq!(once.records(), many.records());
        }
    }
}
