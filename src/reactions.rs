use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{null_as_default, ReactionCategory, ReactionSummary, UserId};

/// One user's reaction as reported by the likes endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRecord {
    pub user_id: UserId,
    #[serde(rename = "type", alias = "category")]
    pub code: u8,
    #[serde(default)]
    pub reacted_at: Option<String>,
}

impl ReactionRecord {
    pub fn new(user_id: UserId, category: ReactionCategory) -> Self {
        Self {
            user_id,
            code: category.code(),
            reacted_at: None,
        }
    }

    pub fn category(&self) -> Option<ReactionCategory> {
        ReactionCategory::from_code(self.code)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionCounts {
    #[serde(default, deserialize_with = "null_as_default")]
    pub like: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub love: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub laugh: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub angry: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sad: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub wow: u64,
}

impl ReactionCounts {
    fn to_array(self) -> [u64; 6] {
        [self.like, self.love, self.laugh, self.angry, self.sad, self.wow]
    }
}

/// Body of `GET {resource}/{id}/likes`. Newer servers precompute the counts;
/// older ones only return the raw liker list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ReactionPayload {
    #[serde(rename_all = "camelCase")]
    Aggregate {
        reaction_counts: ReactionCounts,
        #[serde(default)]
        total_count: Option<u64>,
        #[serde(default)]
        viewer_reaction: Option<ReactionCategory>,
        #[serde(default, deserialize_with = "null_as_default")]
        likers: Vec<ReactionRecord>,
    },
    Legacy {
        #[serde(default, deserialize_with = "null_as_default")]
        likers: Vec<ReactionRecord>,
    },
}

impl Default for ReactionPayload {
    fn default() -> Self {
        ReactionPayload::Legacy { likers: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactionAggregate {
    pub total_count: u64,
    counts: [u64; 6],
    pub viewer_reaction: Option<ReactionCategory>,
}

impl ReactionAggregate {
    pub fn from_counts(counts: [u64; 6], viewer_reaction: Option<ReactionCategory>) -> Self {
        Self {
            total_count: counts.iter().sum(),
            counts,
            viewer_reaction,
        }
    }

    /// Placeholder built from the summary embedded in a feed item. Only the
    /// total and the viewer's reaction are known until a reconciliation lands.
    pub fn from_summary(summary: &ReactionSummary) -> Self {
        Self {
            total_count: summary.total_count,
            counts: [0; 6],
            viewer_reaction: summary.viewer_reaction,
        }
    }

    pub fn count(&self, category: ReactionCategory) -> u64 {
        self.counts[category.index()]
    }

    /// Non-zero categories in wire-code order.
    pub fn per_category(&self) -> impl Iterator<Item = (ReactionCategory, u64)> + '_ {
        ReactionCategory::ALL
            .iter()
            .map(|category| (*category, self.count(*category)))
            .filter(|(_, count)| *count > 0)
    }

    pub fn is_consistent(&self) -> bool {
        self.total_count == self.counts.iter().sum::<u64>()
    }

    /// Moves the viewer's reaction from its current value to `next`,
    /// adjusting the affected buckets and the total.
    pub fn shift_viewer(&mut self, next: Option<ReactionCategory>) {
        if self.viewer_reaction == next {
            return;
        }
        if let Some(previous) = self.viewer_reaction {
            let slot = &mut self.counts[previous.index()];
            *slot = slot.saturating_sub(1);
            self.total_count = self.total_count.saturating_sub(1);
        }
        if let Some(category) = next {
            self.counts[category.index()] += 1;
            self.total_count += 1;
        }
        self.viewer_reaction = next;
    }
}

/// Whether an item's embedded summary warrants fetching reaction detail.
pub fn needs_detail(summary: &ReactionSummary) -> bool {
    summary.total_count > 0 || summary.viewer_reaction.is_some()
}

/// Folds a likes payload into display counts and the viewer's own reaction.
pub fn reconcile(payload: &ReactionPayload, viewer: Option<UserId>) -> ReactionAggregate {
    match payload {
        ReactionPayload::Aggregate {
            reaction_counts,
            total_count,
            viewer_reaction,
            likers,
        } => {
            let latest = latest_per_user(likers);
            let viewer_reaction = viewer
                .and_then(|id| latest.get(&id).copied())
                .or(*viewer_reaction);
            let aggregate = ReactionAggregate::from_counts(reaction_counts.to_array(), viewer_reaction);
            if let Some(reported) = total_count {
                if *reported != aggregate.total_count {
                    tracing::warn!(
                        reported = *reported,
                        summed = aggregate.total_count,
                        "reaction total disagrees with per-category counts"
                    );
                }
            }
            aggregate
        }
        ReactionPayload::Legacy { likers } => {
            let latest = latest_per_user(likers);
            let mut counts = [0u64; 6];
            for category in latest.values() {
                counts[category.index()] += 1;
            }
            let viewer_reaction = viewer.and_then(|id| latest.get(&id).copied());
            ReactionAggregate::from_counts(counts, viewer_reaction)
        }
    }
}

fn latest_per_user(records: &[ReactionRecord]) -> HashMap<UserId, ReactionCategory> {
    let mut latest = HashMap::with_capacity(records.len());
    let mut duplicates = 0usize;
    for record in records {
        let Some(category) = record.category() else {
            tracing::warn!(
                user_id = record.user_id,
                code = record.code,
                "skipping reaction record with unknown category"
            );
            continue;
        };
        if latest.insert(record.user_id, category).is_some() {
            duplicates += 1;
        }
    }
    if duplicates > 0 {
        tracing::warn!(duplicates, "reaction records contain repeated users; last record wins");
    }
    latest
}
