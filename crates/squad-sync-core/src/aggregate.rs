//! Pure derivations over record and tally snapshots.
//!
//! Nothing here holds state; every view is recomputed from the current
//! [`AggregateStore`](crate::AggregateStore) snapshot on demand.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{ActorId, OptionId, RecordId};
use crate::record::{OptionTally, Record, RecordBody};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: u32,
    pub actor_acted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OptionShare {
    pub option: OptionTally,
    pub percentage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommentView {
    pub id: RecordId,
    pub actor_id: ActorId,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub pending: bool,
}

/// Folds reaction records into one group per emoji.
///
/// Groups are ordered by count descending; equal counts keep the order in
/// which the emoji was first seen. `actor_acted` is true when `current_actor`
/// holds at least one record in the group.
#[must_use]
pub fn group_reactions(records: &[Record], current_actor: Option<&ActorId>) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for record in records {
        let RecordBody::Reaction { emoji } = &record.body else {
            continue;
        };
        let acted = current_actor.is_some_and(|actor| *actor == record.base.actor_id);
        match groups.iter_mut().find(|group| group.emoji == *emoji) {
            Some(group) => {
                group.count = group.count.saturating_add(1);
                group.actor_acted |= acted;
            }
            None => groups.push(ReactionGroup {
                emoji: emoji.clone(),
                count: 1,
                actor_acted: acted,
            }),
        }
    }
    // sort_by is stable, first-seen order survives for ties
    groups.sort_by(|left, right| right.count.cmp(&left.count));
    groups
}

/// Option with the most votes; the first of equal maxima wins.
#[must_use]
pub fn winner(options: &[OptionTally]) -> Option<&OptionTally> {
    let mut best: Option<&OptionTally> = None;
    for option in options {
        match best {
            Some(current) if option.vote_count <= current.vote_count => {}
            _ => best = Some(option),
        }
    }
    best
}

/// Percentage share of each option, rounded half up.
///
/// Every share is `0` when no votes have been cast.
#[must_use]
pub fn percentages(options: &[OptionTally]) -> Vec<OptionShare> {
    let total: u64 = options.iter().map(|option| u64::from(option.vote_count)).sum();
    options
        .iter()
        .map(|option| {
            let percentage = if total == 0 {
                0
            } else {
                let votes = u64::from(option.vote_count);
                (200 * votes + total) / (2 * total)
            };
            OptionShare {
                option: option.clone(),
                percentage: u32::try_from(percentage).unwrap_or(100),
            }
        })
        .collect()
}

#[must_use]
pub fn is_voting_closed(deadline: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    deadline.is_some_and(|deadline| now >= deadline)
}

#[must_use]
pub fn has_actor_voted(records: &[Record], actor: &ActorId, option: &OptionId) -> bool {
    records.iter().any(|record| {
        record.base.actor_id == *actor
            && matches!(&record.body, RecordBody::Vote { option_id } if option_id == option)
    })
}

/// Actors who reacted with `emoji`, in record order.
#[must_use]
pub fn reactors<'a>(records: &'a [Record], emoji: &str) -> Vec<&'a ActorId> {
    records
        .iter()
        .filter(|record| {
            matches!(&record.body, RecordBody::Reaction { emoji: held } if held == emoji)
        })
        .map(|record| &record.base.actor_id)
        .collect()
}

#[must_use]
pub fn voters_by_option(records: &[Record]) -> BTreeMap<OptionId, Vec<ActorId>> {
    let mut voters: BTreeMap<OptionId, Vec<ActorId>> = BTreeMap::new();
    for record in records {
        if let RecordBody::Vote { option_id } = &record.body {
            voters
                .entry(*option_id)
                .or_default()
                .push(record.base.actor_id.clone());
        }
    }
    voters
}

/// Options `actor` has not voted for yet, in tally order.
#[must_use]
pub fn unvoted_options<'a>(
    options: &'a [OptionTally],
    records: &[Record],
    actor: &ActorId,
) -> Vec<&'a OptionTally> {
    options
        .iter()
        .filter(|option| !has_actor_voted(records, actor, &option.id))
        .collect()
}

#[must_use]
pub fn ranked_tallies(options: &[OptionTally]) -> Vec<OptionTally> {
    let mut ranked = options.to_vec();
    ranked.sort_by(|left, right| right.vote_count.cmp(&left.vote_count));
    ranked
}

/// Comments ordered oldest first; provisional entries are flagged pending.
#[must_use]
pub fn comment_thread(records: &[Record]) -> Vec<CommentView> {
    let mut thread: Vec<CommentView> = records
        .iter()
        .filter_map(|record| match &record.body {
            RecordBody::Comment { text } => Some(CommentView {
                id: record.base.id,
                actor_id: record.base.actor_id.clone(),
                text: text.clone(),
                created_at: record.base.created_at,
                pending: record.is_provisional(),
            }),
            _ => None,
        })
        .collect();
    thread.sort_by_key(|comment| comment.created_at);
    thread
}
