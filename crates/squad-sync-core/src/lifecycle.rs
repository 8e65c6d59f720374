use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::backend::{ChangeFeed, Identity, RecordSink, RecordSource, SubscriptionId};
use crate::config::EngineConfig;
use crate::engine::{
    Ack, Command, Dispatch, Intent, MutationOutcome, NoopReason, Reconciled, ScopeEngine,
    Settlement, Ticket,
};
use crate::ids::{OptionId, RecordId, ScopeKey};
use crate::record::RecordBody;
use crate::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    Loaded { records: usize },
    /// The store stays empty; the scope still receives live changes.
    Failed { reason: SyncError },
}

/// Everything that happened to one submitted intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MutationReport {
    pub noop: Option<NoopReason>,
    pub queued_depth: Option<usize>,
    pub outcomes: Vec<MutationOutcome>,
    /// Released queued intents that failed validation on re-evaluation.
    pub rejected: Vec<SyncError>,
}

#[derive(Debug)]
struct ActiveScope {
    engine: ScopeEngine,
    subscription: SubscriptionId,
    load: LoadState,
}

/// Executes a command against the authoritative store.
///
/// # Errors
/// Propagates the sink's failure for the engine to roll back.
pub fn execute_command<S: RecordSink>(sink: &mut S, command: &Command) -> Result<Ack, SyncError> {
    match command {
        Command::Write { draft, .. } => sink.write(draft).map(|record| Ack::Written { record }),
        Command::Delete { id, .. } => sink.delete(*id).map(|()| Ack::Deleted),
    }
}

/// Owns the single active scope and its change-feed subscription.
pub struct ScopeManager<B, I> {
    backend: B,
    identity: I,
    config: EngineConfig,
    active: Option<ActiveScope>,
    next_epoch: u64,
}

impl<B, I> ScopeManager<B, I>
where
    B: RecordSource + RecordSink + ChangeFeed,
    I: Identity,
{
    pub fn new(backend: B, identity: I, config: EngineConfig) -> Self {
        Self {
            backend,
            identity,
            config,
            active: None,
            next_epoch: 1,
        }
    }

    /// Tears down the current scope, then fetches and subscribes to `scope`.
    ///
    /// A failed fetch is not an error: the scope starts empty and the
    /// returned state is [`LoadState::Failed`].
    ///
    /// # Errors
    /// Returns [`SyncError::Subscription`] when the change feed cannot be
    /// opened; no scope is active afterwards.
    pub fn activate(&mut self, scope: ScopeKey) -> Result<LoadState, SyncError> {
        self.deactivate();

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let mut engine = ScopeEngine::new(
            scope.clone(),
            epoch,
            self.identity.current_actor(),
            self.config.clone(),
        );

        let (load, cursor) = match self.backend.fetch(&scope) {
            Ok(snapshot) => {
                let cursor = snapshot.cursor;
                let records = engine.load(snapshot);
                (LoadState::Loaded { records }, cursor)
            }
            Err(reason) => {
                tracing::warn!(%scope, error = %reason, "initial fetch failed; starting empty");
                (LoadState::Failed { reason }, None)
            }
        };

        let subscription = self.backend.subscribe(&scope, cursor)?;
        tracing::info!(%scope, epoch, "scope activated");
        self.active = Some(ActiveScope {
            engine,
            subscription,
            load: load.clone(),
        });
        Ok(load)
    }

    /// Closes the active subscription. Does nothing when no scope is active.
    pub fn deactivate(&mut self) {
        if let Some(active) = self.active.take() {
            self.backend.close(active.subscription);
            tracing::debug!(scope = %active.engine.scope(), "scope deactivated");
        }
    }

    /// Pulls pending change-feed notifications into the active scope.
    ///
    /// # Errors
    /// Returns [`SyncError::Subscription`] when polling fails.
    pub fn pump(&mut self) -> Result<Vec<Reconciled>, SyncError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(Vec::new());
        };
        for notification in self.backend.poll(active.subscription)? {
            active.engine.enqueue(notification);
        }
        Ok(active.engine.drain())
    }

    /// Applies `intent` and drives every resulting command to completion.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when no scope is active or the
    /// intent is rejected. Store failures are reported as rolled-back
    /// outcomes instead.
    pub fn submit(&mut self, intent: Intent) -> Result<MutationReport, SyncError> {
        let mut report = MutationReport::default();
        let mut commands = VecDeque::new();
        match self.dispatch(intent)? {
            Dispatch::Issue { command } => commands.push_back(command),
            Dispatch::Queued { depth } => report.queued_depth = Some(depth),
            Dispatch::Noop { reason } => report.noop = Some(reason),
        }

        while let Some(command) = commands.pop_front() {
            let result = execute_command(&mut self.backend, &command);
            let settlement = self.settle(command.ticket(), result);
            report.outcomes.push(settlement.outcome);
            for released in settlement.released {
                match released {
                    Ok(Dispatch::Issue { command }) => commands.push_back(command),
                    Ok(Dispatch::Queued { .. } | Dispatch::Noop { .. }) => {}
                    Err(err) => report.rejected.push(err),
                }
            }
        }
        Ok(report)
    }

    /// Applies `intent` without executing the resulting command.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when no scope is active or the
    /// intent is rejected.
    pub fn dispatch(&mut self, intent: Intent) -> Result<Dispatch, SyncError> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| SyncError::Validation("no scope is active".to_string()))?;
        active.engine.set_actor(self.identity.current_actor());
        active.engine.request(intent)
    }

    /// Delivers a completion, possibly long after the command was issued.
    pub fn settle(&mut self, ticket: &Ticket, result: Result<Ack, SyncError>) -> Settlement {
        match self.active.as_mut() {
            Some(active) => active.engine.complete(ticket, result),
            None => Settlement {
                outcome: MutationOutcome::Stale,
                released: Vec::new(),
            },
        }
    }

    /// # Errors
    /// See [`ScopeManager::submit`].
    pub fn toggle_reaction(&mut self, emoji: &str) -> Result<MutationReport, SyncError> {
        self.submit(Intent::Add {
            body: RecordBody::Reaction {
                emoji: emoji.to_string(),
            },
        })
    }

    /// # Errors
    /// See [`ScopeManager::submit`].
    pub fn post_comment(&mut self, text: &str) -> Result<MutationReport, SyncError> {
        self.submit(Intent::Add {
            body: RecordBody::Comment {
                text: text.to_string(),
            },
        })
    }

    /// # Errors
    /// See [`ScopeManager::submit`].
    pub fn delete_record(&mut self, id: RecordId) -> Result<MutationReport, SyncError> {
        self.submit(Intent::Remove { id })
    }

    /// # Errors
    /// See [`ScopeManager::submit`].
    pub fn cast_vote(&mut self, option_id: OptionId) -> Result<MutationReport, SyncError> {
        self.submit(Intent::Add {
            body: RecordBody::Vote { option_id },
        })
    }

    #[must_use]
    pub fn engine(&self) -> Option<&ScopeEngine> {
        self.active.as_ref().map(|active| &active.engine)
    }

    #[must_use]
    pub fn active_scope(&self) -> Option<&ScopeKey> {
        self.engine().map(ScopeEngine::scope)
    }

    #[must_use]
    pub fn load_state(&self) -> Option<&LoadState> {
        self.active.as_ref().map(|active| &active.load)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(mut self) -> B {
        self.deactivate();
        self.backend
    }
}
