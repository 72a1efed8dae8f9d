use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::api;
use crate::cursor::PageFetch;
use crate::identity::IdentityEntry;
use crate::model::{AuthorRef, FeedKey, FeedKind, Post, ReactionCategory, ReactionSummary, UserId};
use crate::reactions::{ReactionPayload, ReactionRecord};

pub trait FeedService: Send + Sync {
    fn predictions(&self, page: u32, page_size: u32) -> Result<PageFetch<Post>>;
    fn daily_posts(&self, page: u32, page_size: u32) -> Result<PageFetch<Post>>;
}

pub trait ReactionService: Send + Sync {
    fn reactions(&self, key: FeedKey) -> Result<ReactionPayload>;
    /// Sends the tapped category; the server decides between set, replace
    /// and retract from what it already stores for the viewer.
    fn react(&self, key: FeedKey, category: ReactionCategory) -> Result<()>;
}

pub trait IdentityService: Send + Sync {
    fn users_bulk(&self, ids: &[UserId]) -> Result<Vec<IdentityEntry>>;
}

pub struct ApiFeedService {
    client: Arc<api::Client>,
}

impl ApiFeedService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl FeedService for ApiFeedService {
    fn predictions(&self, page: u32, page_size: u32) -> Result<PageFetch<Post>> {
        let page = self
            .client
            .predictions(page, page_size)
            .context("fetch predictions page")?;
        if let Some(rate) = self.client.rate_limit("predictions") {
            tracing::debug!(remaining = rate.remaining, used = rate.used, "predictions rate limit");
        }
        Ok(PageFetch {
            items: page.predictions,
            total_count: Some(page.total_count.unwrap_or(0)),
        })
    }

    fn daily_posts(&self, page: u32, page_size: u32) -> Result<PageFetch<Post>> {
        let items = self
            .client
            .daily_posts(page, page_size)
            .context("fetch daily posts page")?;
        Ok(PageFetch {
            items,
            total_count: None,
        })
    }
}

pub struct ApiReactionService {
    client: Arc<api::Client>,
}

impl ApiReactionService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl ReactionService for ApiReactionService {
    fn reactions(&self, key: FeedKey) -> Result<ReactionPayload> {
        self.client
            .likes(key)
            .with_context(|| format!("fetch reactions for {key}"))
    }

    fn react(&self, key: FeedKey, category: ReactionCategory) -> Result<()> {
        self.client
            .like(key, category)
            .with_context(|| format!("send {} reaction to {key}", category.label()))
    }
}

pub struct ApiIdentityService {
    client: Arc<api::Client>,
}

impl ApiIdentityService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl IdentityService for ApiIdentityService {
    fn users_bulk(&self, ids: &[UserId]) -> Result<Vec<IdentityEntry>> {
        self.client.users_bulk(ids).context("fetch users in bulk")
    }
}

/// In-memory feed source. Items are kept newest first, like the server.
#[derive(Default)]
pub struct MockFeedService {
    predictions: RwLock<Vec<Post>>,
    daily: RwLock<Vec<Post>>,
    calls: Mutex<Vec<(FeedKind, u32)>>,
    failures: Mutex<HashSet<FeedKind>>,
    gates: Mutex<HashMap<FeedKind, Receiver<()>>>,
}

impl MockFeedService {
    pub fn new(predictions: Vec<Post>, daily: Vec<Post>) -> Self {
        Self {
            predictions: RwLock::new(predictions),
            daily: RwLock::new(daily),
            ..Self::default()
        }
    }

    /// Sample data for offline browsing.
    pub fn demo() -> Self {
        let base = Utc
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let predictions = (1..=25)
            .rev()
            .map(|id| {
                sample_post(
                    id,
                    format!("Prediction #{id}"),
                    base + ChronoDuration::hours(id as i64 * 5),
                )
            })
            .collect();
        let daily = (1..=13)
            .rev()
            .map(|id| {
                sample_post(
                    id,
                    format!("Daily post #{id}"),
                    base + ChronoDuration::hours(id as i64 * 9),
                )
            })
            .collect();
        Self::new(predictions, daily)
    }

    pub fn publish(&self, kind: FeedKind, post: Post) {
        self.items(kind).write().insert(0, post);
    }

    pub fn calls(&self) -> Vec<(FeedKind, u32)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, kind: FeedKind) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, page)| *page)
            .collect()
    }

    pub fn fail_next(&self, kind: FeedKind) {
        self.failures.lock().insert(kind);
    }

    /// Blocks fetches of `kind` until a unit is sent on the returned sender.
    /// Dropping the sender releases every waiter.
    pub fn hold(&self, kind: FeedKind) -> Sender<()> {
        let (tx, rx) = unbounded();
        self.gates.lock().insert(kind, rx);
        tx
    }

    fn items(&self, kind: FeedKind) -> &RwLock<Vec<Post>> {
        match kind {
            FeedKind::Prediction => &self.predictions,
            FeedKind::Daily => &self.daily,
        }
    }

    fn page(&self, kind: FeedKind, page: u32, page_size: u32) -> Result<Vec<Post>> {
        self.calls.lock().push((kind, page));
        let gate = self.gates.lock().get(&kind).cloned();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.failures.lock().remove(&kind) {
            return Err(anyhow!("mock: {} unavailable", kind.resource()));
        }
        let items = self.items(kind).read();
        let start = ((page.max(1) - 1) * page_size) as usize;
        let end = (start + page_size as usize).min(items.len());
        Ok(items.get(start..end).map(|s| s.to_vec()).unwrap_or_default())
    }

    fn total(&self, kind: FeedKind) -> u64 {
        self.items(kind).read().len() as u64
    }
}

impl FeedService for MockFeedService {
    fn predictions(&self, page: u32, page_size: u32) -> Result<PageFetch<Post>> {
        let items = self.page(FeedKind::Prediction, page, page_size)?;
        Ok(PageFetch {
            items,
            total_count: Some(self.total(FeedKind::Prediction)),
        })
    }

    fn daily_posts(&self, page: u32, page_size: u32) -> Result<PageFetch<Post>> {
        Ok(PageFetch {
            items: self.page(FeedKind::Daily, page, page_size)?,
            total_count: None,
        })
    }
}

fn sample_post(id: u64, title: String, created_at: chrono::DateTime<Utc>) -> Post {
    Post {
        id,
        content: format!("{title} body"),
        title,
        created_at: created_at.to_rfc3339(),
        view_count: id * 3,
        comment_count: id % 4,
        reaction_summary: ReactionSummary {
            total_count: id % 3,
            viewer_reaction: None,
        },
        author: Some(AuthorRef {
            id: 100 + id % 5,
            ..AuthorRef::default()
        }),
    }
}

/// Server-side reaction store: one reaction per user per item, and a
/// repeated category retracts it.
pub struct MockReactionService {
    viewer: UserId,
    state: Mutex<HashMap<FeedKey, Vec<ReactionRecord>>>,
    writes: Mutex<Vec<(FeedKey, ReactionCategory)>>,
    reads: Mutex<Vec<FeedKey>>,
    fail_writes: Mutex<usize>,
    aggregate_shape: bool,
    gate: Mutex<Option<Receiver<()>>>,
    read_gate: Mutex<Option<Receiver<()>>>,
}

impl MockReactionService {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            state: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            fail_writes: Mutex::new(0),
            aggregate_shape: false,
            gate: Mutex::new(None),
            read_gate: Mutex::new(None),
        }
    }

    /// Answers with precomputed counts instead of the liker list only.
    pub fn with_aggregate_shape(mut self) -> Self {
        self.aggregate_shape = true;
        self
    }

    pub fn seed(&self, key: FeedKey, user: UserId, category: ReactionCategory) {
        let mut state = self.state.lock();
        let records = state.entry(key).or_default();
        records.retain(|record| record.user_id != user);
        records.push(ReactionRecord::new(user, category));
    }

    pub fn writes(&self) -> Vec<(FeedKey, ReactionCategory)> {
        self.writes.lock().clone()
    }

    pub fn reads(&self) -> Vec<FeedKey> {
        self.reads.lock().clone()
    }

    pub fn fail_next_writes(&self, count: usize) {
        *self.fail_writes.lock() = count;
    }

    /// Blocks writes until a unit is sent on the returned sender.
    pub fn hold_writes(&self) -> Sender<()> {
        let (tx, rx) = unbounded();
        *self.gate.lock() = Some(rx);
        tx
    }

    /// Blocks reads after they have taken their snapshot of the store, so a
    /// held read answers with the state from when it was issued.
    pub fn hold_reads(&self) -> Sender<()> {
        let (tx, rx) = unbounded();
        *self.read_gate.lock() = Some(rx);
        tx
    }
}

impl ReactionService for MockReactionService {
    fn reactions(&self, key: FeedKey) -> Result<ReactionPayload> {
        self.reads.lock().push(key);
        let likers = self.state.lock().get(&key).cloned().unwrap_or_default();
        let gate = self.read_gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if !self.aggregate_shape {
            return Ok(ReactionPayload::Legacy { likers });
        }
        let mut counts = crate::reactions::ReactionCounts::default();
        for record in &likers {
            let slot = match record.category() {
                Some(ReactionCategory::Like) => &mut counts.like,
                Some(ReactionCategory::Love) => &mut counts.love,
                Some(ReactionCategory::Laugh) => &mut counts.laugh,
                Some(ReactionCategory::Angry) => &mut counts.angry,
                Some(ReactionCategory::Sad) => &mut counts.sad,
                Some(ReactionCategory::Wow) => &mut counts.wow,
                None => continue,
            };
            *slot += 1;
        }
        Ok(ReactionPayload::Aggregate {
            reaction_counts: counts,
            total_count: Some(likers.len() as u64),
            viewer_reaction: None,
            likers,
        })
    }

    fn react(&self, key: FeedKey, category: ReactionCategory) -> Result<()> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.writes.lock().push((key, category));
        {
            let mut failures = self.fail_writes.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("mock: reaction write rejected"));
            }
        }
        let mut state = self.state.lock();
        let records = state.entry(key).or_default();
        let previous = records
            .iter()
            .position(|record| record.user_id == self.viewer)
            .map(|idx| records.remove(idx));
        if previous.and_then(|record| record.category()) != Some(category) {
            records.push(ReactionRecord::new(self.viewer, category));
        }
        Ok(())
    }
}

pub struct MockIdentityService {
    users: RwLock<HashMap<UserId, IdentityEntry>>,
    calls: Mutex<Vec<Vec<UserId>>>,
    fail_next: Mutex<bool>,
}

impl MockIdentityService {
    pub fn with_users(ids: &[UserId]) -> Self {
        let users = ids
            .iter()
            .map(|id| {
                (
                    *id,
                    IdentityEntry {
                        id: *id,
                        first_name: "user".into(),
                        last_name: id.to_string(),
                        avatar_url: None,
                        vip_active: id % 2 == 0,
                        blocked: false,
                        fetched_at: Utc::now(),
                    },
                )
            })
            .collect();
        Self {
            users: RwLock::new(users),
            calls: Mutex::new(Vec::new()),
            fail_next: Mutex::new(false),
        }
    }

    pub fn calls(&self) -> Vec<Vec<UserId>> {
        self.calls.lock().clone()
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }
}

impl IdentityService for MockIdentityService {
    fn users_bulk(&self, ids: &[UserId]) -> Result<Vec<IdentityEntry>> {
        self.calls.lock().push(ids.to_vec());
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(anyhow!("mock: bulk lookup failed"));
        }
        let users = self.users.read();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_feed_pages_and_totals() {
        let service = MockFeedService::demo();
        let first = service.predictions(1, 10).unwrap();
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.total_count, Some(25));
        assert_eq!(first.items[0].id, 25);

        let last = service.daily_posts(2, 10).unwrap();
        assert_eq!(last.items.len(), 3);
        assert!(last.total_count.is_none());
        assert!(service.daily_posts(5, 10).unwrap().items.is_empty());
        assert_eq!(service.calls_for(FeedKind::Daily), vec![2, 5]);
    }

    #[test]
    fn mock_reactions_toggle_like_the_server() {
        let service = MockReactionService::new(1);
        let key = FeedKey::new(FeedKind::Prediction, 3);
        service.react(key, ReactionCategory::Like).unwrap();
        service.react(key, ReactionCategory::Love).unwrap();
        let ReactionPayload::Legacy { likers } = service.reactions(key).unwrap() else {
            panic!("expected legacy payload");
        };
        assert_eq!(likers, vec![ReactionRecord::new(1, ReactionCategory::Love)]);

        service.react(key, ReactionCategory::Love).unwrap();
        let ReactionPayload::Legacy { likers } = service.reactions(key).unwrap() else {
            panic!("expected legacy payload");
        };
        assert!(likers.is_empty());
    }
}
