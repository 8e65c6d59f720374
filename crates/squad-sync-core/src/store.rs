use serde::{Deserialize, Serialize};

use crate::ids::{OptionId, RecordId, ScopeKey};
use crate::record::{MutationKey, OptionTally, Record};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
    ForeignScope,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOutcome {
    Replaced,
    /// The replacement id was already present; only the old record was dropped.
    Collapsed,
    Missing,
    ForeignScope,
}

/// Ordered raw records of a single scope.
///
/// Ids are unique within the store: inserting an id that is already present
/// is a no-op, and removing an absent id is a no-op.
#[derive(Debug, Clone)]
pub struct AggregateStore {
    scope: ScopeKey,
    records: Vec<Record>,
}

impl AggregateStore {
    #[must_use]
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn insert(&mut self, record: Record) -> InsertOutcome {
        if !self.accepts(&record) {
            return InsertOutcome::ForeignScope;
        }
        if self.contains(&record.base.id) {
            return InsertOutcome::Duplicate;
        }
        self.records.push(record);
        InsertOutcome::Inserted
    }

    /// Puts a record back at `index` (clamped), used to undo a removal.
    pub fn restore(&mut self, index: usize, record: Record) -> InsertOutcome {
        if !self.accepts(&record) {
            return InsertOutcome::ForeignScope;
        }
        if self.contains(&record.base.id) {
            return InsertOutcome::Duplicate;
        }
        let index = index.min(self.records.len());
        self.records.insert(index, record);
        InsertOutcome::Inserted
    }

    /// Removes a record, returning it with the position it held.
    pub fn remove(&mut self, id: &RecordId) -> Option<(usize, Record)> {
        let index = self.position(id)?;
        Some((index, self.records.remove(index)))
    }

    pub fn replace(&mut self, old_id: &RecordId, record: Record) -> ReplaceOutcome {
        if !self.accepts(&record) {
            return ReplaceOutcome::ForeignScope;
        }
        let Some(index) = self.position(old_id) else {
            return ReplaceOutcome::Missing;
        };
        if record.base.id != *old_id && self.contains(&record.base.id) {
            self.records.remove(index);
            return ReplaceOutcome::Collapsed;
        }
        self.records[index] = record;
        ReplaceOutcome::Replaced
    }

    /// Replaces the whole collection, dropping foreign and duplicate records.
    /// Returns the number of records kept.
    pub fn reset(&mut self, records: Vec<Record>) -> usize {
        self.records.clear();
        records
            .into_iter()
            .filter(|record| self.insert(record.clone()) == InsertOutcome::Inserted)
            .count()
    }

    #[must_use]
    pub fn snapshot(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|record| record.base.id == *id)
    }

    #[must_use]
    pub fn contains(&self, id: &RecordId) -> bool {
        self.position(id).is_some()
    }

    /// First record held by `key.actor` with payload `key.payload`.
    #[must_use]
    pub fn find_own(&self, key: &MutationKey) -> Option<&Record> {
        self.records
            .iter()
            .find(|record| record.mutation_key() == *key)
    }

    #[must_use]
    pub fn find_provisional(&self, key: &MutationKey) -> Option<&Record> {
        self.records
            .iter()
            .find(|record| record.is_provisional() && record.mutation_key() == *key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, id: &RecordId) -> Option<usize> {
        self.records.iter().position(|record| record.base.id == *id)
    }

    fn accepts(&self, record: &Record) -> bool {
        record.kind() == self.scope.kind && record.base.scope_id == self.scope.scope_id
    }
}

/// Materialized vote counters of one event, in fetch order.
#[derive(Debug, Clone, Default)]
pub struct TallyBoard {
    options: Vec<OptionTally>,
}

impl TallyBoard {
    pub fn reset(&mut self, options: Vec<OptionTally>) {
        self.options = options;
    }

    #[must_use]
    pub fn get(&self, id: &OptionId) -> Option<&OptionTally> {
        self.options.iter().find(|option| option.id == *id)
    }

    #[must_use]
    pub fn contains(&self, id: &OptionId) -> bool {
        self.get(id).is_some()
    }

    pub fn bump(&mut self, id: &OptionId) -> bool {
        match self.options.iter_mut().find(|option| option.id == *id) {
            Some(option) => {
                option.vote_count = option.vote_count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    pub fn unbump(&mut self, id: &OptionId) -> bool {
        match self.options.iter_mut().find(|option| option.id == *id) {
            Some(option) => {
                option.vote_count = option.vote_count.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Applies an authoritative counter value, appending unknown options.
    pub fn overwrite(&mut self, tally: OptionTally) {
        match self.options.iter_mut().find(|option| option.id == tally.id) {
            Some(option) => *option = tally,
            None => self.options.push(tally),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> &[OptionTally] {
        &self.options
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}
