use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{
    ActorId, EntityKind, OptionId, ProvisionalId, RecordId, ScopeId, ScopeKey, StableId,
};
use crate::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordBase {
    pub id: RecordId,
    pub scope_id: ScopeId,
    pub actor_id: ActorId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    Reaction { emoji: String },
    Comment { text: String },
    Vote { option_id: OptionId },
}

impl RecordBody {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Reaction { .. } => EntityKind::Reaction,
            Self::Comment { .. } => EntityKind::Comment,
            Self::Vote { .. } => EntityKind::Vote,
        }
    }

    #[must_use]
    pub fn payload_key(&self) -> PayloadKey {
        match self {
            Self::Reaction { emoji } => PayloadKey::Emoji(emoji.clone()),
            Self::Comment { text } => PayloadKey::Text(text.clone()),
            Self::Vote { option_id } => PayloadKey::VoteOption(*option_id),
        }
    }

    /// Rebuilds a body from its kind and [`RecordBody::payload_text`] form.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when a vote payload is not an option id.
    pub fn from_parts(kind: EntityKind, payload: &str) -> Result<Self, SyncError> {
        Ok(match kind {
            EntityKind::Reaction => Self::Reaction {
                emoji: payload.to_string(),
            },
            EntityKind::Comment => Self::Comment {
                text: payload.to_string(),
            },
            EntityKind::Vote => Self::Vote {
                option_id: OptionId::parse(payload)?,
            },
        })
    }

    /// Column-friendly rendering of the payload value.
    #[must_use]
    pub fn payload_text(&self) -> String {
        match self {
            Self::Reaction { emoji } => emoji.clone(),
            Self::Comment { text } => text.clone(),
            Self::Vote { option_id } => option_id.to_string(),
        }
    }
}

/// Raw record for one reaction, comment or vote.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    #[serde(flatten)]
    pub base: RecordBase,
    pub body: RecordBody,
}

impl Record {
    #[must_use]
    pub fn id(&self) -> RecordId {
        self.base.id
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.body.kind()
    }

    #[must_use]
    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::new(self.kind(), self.base.scope_id.clone())
    }

    #[must_use]
    pub fn stable_id(&self) -> Option<StableId> {
        self.base.id.stable()
    }

    #[must_use]
    pub fn provisional_id(&self) -> Option<ProvisionalId> {
        self.base.id.provisional()
    }

    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.base.id.is_provisional()
    }

    #[must_use]
    pub fn mutation_key(&self) -> MutationKey {
        MutationKey {
            actor: self.base.actor_id.clone(),
            payload: self.body.payload_key(),
        }
    }
}

/// A record without an identifier, as sent to the authoritative store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordDraft {
    pub scope_id: ScopeId,
    pub actor_id: ActorId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub body: RecordBody,
}

impl RecordDraft {
    #[must_use]
    pub fn into_record(self, id: RecordId) -> Record {
        Record {
            base: RecordBase {
                id,
                scope_id: self.scope_id,
                actor_id: self.actor_id,
                created_at: self.created_at,
            },
            body: self.body,
        }
    }

    #[must_use]
    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::new(self.body.kind(), self.scope_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PayloadKey {
    Emoji(String),
    Text(String),
    VoteOption(OptionId),
}

/// Serialization key for local mutations: one actor acting on one payload.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MutationKey {
    pub actor: ActorId,
    pub payload: PayloadKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OptionTally {
    pub id: OptionId,
    pub event_id: ScopeId,
    pub label: String,
    pub vote_count: u32,
}

/// Position in a change feed, as reported by the authoritative store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct FeedCursor(pub i64);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Notification {
    Created {
        record: Record,
    },
    Deleted {
        kind: EntityKind,
        scope_id: ScopeId,
        id: StableId,
    },
    TallyChanged {
        tally: OptionTally,
    },
}

impl Notification {
    #[must_use]
    pub fn scope_key(&self) -> ScopeKey {
        match self {
            Self::Created { record } => record.scope_key(),
            Self::Deleted { kind, scope_id, .. } => ScopeKey::new(*kind, scope_id.clone()),
            Self::TallyChanged { tally } => ScopeKey::new(EntityKind::Vote, tally.event_id.clone()),
        }
    }

    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Deleted { .. } => "deleted",
            Self::TallyChanged { .. } => "tally_changed",
        }
    }
}
