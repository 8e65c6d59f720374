use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::SyncError;

/// Marker carried by every provisional id when rendered as text.
pub const PROVISIONAL_PREFIX: &str = "temp-";

/// Identifier assigned by the authoritative store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct StableId(pub Ulid);

impl StableId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID string.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| SyncError::Validation(format!("invalid stable id {value}: {err}")))
    }
}

impl Display for StableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated identifier, unique within one scope engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProvisionalId(pub u64);

impl Display for ProvisionalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PROVISIONAL_PREFIX}{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum RecordId {
    Stable(StableId),
    Provisional(ProvisionalId),
}

impl RecordId {
    /// Parses either a ULID or a `temp-<n>` provisional id.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the value matches neither form.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        if let Some(raw) = value.strip_prefix(PROVISIONAL_PREFIX) {
            let sequence = raw.parse::<u64>().map_err(|err| {
                SyncError::Validation(format!("invalid provisional id {value}: {err}"))
            })?;
            return Ok(Self::Provisional(ProvisionalId(sequence)));
        }
        StableId::parse(value).map(Self::Stable)
    }

    #[must_use]
    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    #[must_use]
    pub fn stable(&self) -> Option<StableId> {
        match self {
            Self::Stable(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }

    #[must_use]
    pub fn provisional(&self) -> Option<ProvisionalId> {
        match self {
            Self::Provisional(id) => Some(*id),
            Self::Stable(_) => None,
        }
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable(id) => write!(f, "{id}"),
            Self::Provisional(id) => write!(f, "{id}"),
        }
    }
}

impl From<RecordId> for String {
    fn from(value: RecordId) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for RecordId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StableId> for RecordId {
    fn from(value: StableId) -> Self {
        Self::Stable(value)
    }
}

fn non_empty(label: &str, value: String) -> Result<String, SyncError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Validation(format!("{label} MUST be non-empty")));
    }
    if trimmed.len() == value.len() {
        Ok(value)
    } else {
        Ok(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(into = "String", try_from = "String")]
pub struct ActorId(String);

impl ActorId {
    /// Builds an actor id from a trimmed, non-empty string.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the value is blank.
    pub fn new(value: impl Into<String>) -> Result<Self, SyncError> {
        non_empty("actor_id", value.into()).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ActorId> for String {
    fn from(value: ActorId) -> Self {
        value.0
    }
}

impl TryFrom<String> for ActorId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Identifier of the parent object (photo or event) a collection belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(into = "String", try_from = "String")]
pub struct ScopeId(String);

impl ScopeId {
    /// Builds a scope id from a trimmed, non-empty string.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the value is blank.
    pub fn new(value: impl Into<String>) -> Result<Self, SyncError> {
        non_empty("scope_id", value.into()).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ScopeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ScopeId> for String {
    fn from(value: ScopeId) -> Self {
        value.0
    }
}

impl TryFrom<String> for ScopeId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct OptionId(pub Ulid);

impl OptionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID string.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| SyncError::Validation(format!("invalid option id {value}: {err}")))
    }
}

impl Display for OptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Reaction,
    Comment,
    Vote,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reaction => "reaction",
            Self::Comment => "comment",
            Self::Vote => "vote",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reaction" => Some(Self::Reaction),
            "comment" => Some(Self::Comment),
            "vote" => Some(Self::Vote),
            _ => None,
        }
    }
}

/// One tracked collection: an entity kind under one parent object.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScopeKey {
    pub kind: EntityKind,
    pub scope_id: ScopeId,
}

impl ScopeKey {
    #[must_use]
    pub fn new(kind: EntityKind, scope_id: ScopeId) -> Self {
        Self { kind, scope_id }
    }
}

impl Display for ScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.scope_id)
    }
}
