use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::data::ReactionService;
use crate::model::{FeedItem, FeedKey, Notice, ReactionCategory, UserId};
use crate::reactions::{self, ReactionAggregate};

/// Reaction the viewer holds after tapping `tapped`: the same category
/// retracts, anything else sets or replaces.
pub fn next_reaction(
    current: Option<ReactionCategory>,
    tapped: ReactionCategory,
) -> Option<ReactionCategory> {
    if current == Some(tapped) {
        None
    } else {
        Some(tapped)
    }
}

#[derive(Debug, Default)]
struct ItemState {
    aggregate: ReactionAggregate,
    /// Sequence number of the latest tap on this item.
    seq: u64,
    writing: bool,
    queued: VecDeque<(u64, ReactionCategory)>,
}

enum Response {
    Written {
        key: FeedKey,
        epoch: u64,
        seq: u64,
        category: ReactionCategory,
        result: Result<ReactionAggregate>,
    },
    Loaded {
        key: FeedKey,
        epoch: u64,
        seq: u64,
        result: Result<ReactionAggregate>,
    },
}

/// Owns the displayed reaction state of every item in view.
///
/// Taps update the aggregate immediately, then go to the server one at a
/// time per item, in tap order. Each write is followed by a full re-fetch
/// whose reconciled aggregate replaces the optimistic one, unless a later
/// tap on the same item has happened since. Failures keep the optimistic
/// state and surface a notice.
pub struct ReactionController {
    service: Arc<dyn ReactionService>,
    viewer: Option<UserId>,
    items: HashMap<FeedKey, ItemState>,
    /// Writes from before the last `reset` that have not reported yet. New
    /// writes on the same item wait for them.
    orphaned: HashMap<FeedKey, usize>,
    epoch: u64,
    in_flight: usize,
    response_tx: Sender<Response>,
    response_rx: Receiver<Response>,
    notices: Vec<Notice>,
}

impl ReactionController {
    pub fn new(service: Arc<dyn ReactionService>, viewer: Option<UserId>) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            viewer,
            items: HashMap::new(),
            orphaned: HashMap::new(),
            epoch: 0,
            in_flight: 0,
            response_tx,
            response_rx,
            notices: Vec::new(),
        }
    }

    pub fn aggregate(&self, key: FeedKey) -> Option<ReactionAggregate> {
        self.items.get(&key).map(|state| state.aggregate)
    }

    pub fn viewer_reaction(&self, key: FeedKey) -> Option<ReactionCategory> {
        self.items
            .get(&key)
            .and_then(|state| state.aggregate.viewer_reaction)
    }

    pub fn is_pending(&self, key: FeedKey) -> bool {
        self.items
            .get(&key)
            .map(|state| state.writing || !state.queued.is_empty())
            .unwrap_or(false)
            || self.orphaned.contains_key(&key)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Seeds the item from its embedded summary. Detail is only fetched when
    /// the item already has engagement.
    pub fn ensure_loaded(&mut self, item: &FeedItem) {
        let key = item.key();
        if self.items.contains_key(&key) {
            return;
        }
        let summary = &item.post().reaction_summary;
        self.items.insert(
            key,
            ItemState {
                aggregate: ReactionAggregate::from_summary(summary),
                ..ItemState::default()
            },
        );
        if reactions::needs_detail(summary) {
            self.spawn_load(key, 0);
        }
    }

    pub fn tap(&mut self, item: &FeedItem, category: ReactionCategory) -> Option<ReactionCategory> {
        self.ensure_loaded(item);
        let key = item.key();
        let Some(state) = self.items.get_mut(&key) else {
            return None;
        };

        let next = next_reaction(state.aggregate.viewer_reaction, category);
        state.aggregate.shift_viewer(next);
        state.seq += 1;
        state.queued.push_back((state.seq, category));
        tracing::debug!(item = %key, tapped = category.label(), seq = state.seq, "reaction tapped");

        self.dispatch_next(key);
        next
    }

    /// Forgets every item; results still in flight are dropped on arrival.
    pub fn reset(&mut self) {
        self.epoch += 1;
        for (key, state) in self.items.drain() {
            if state.writing {
                *self.orphaned.entry(key).or_default() += 1;
            }
        }
    }

    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_response(message);
            changed = true;
        }
        changed
    }

    /// Blocks until nothing is in flight or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(message) => self.handle_response(message),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false
                }
            }
        }
        true
    }

    /// Sends the oldest queued tap unless a write on `key` is still out.
    fn dispatch_next(&mut self, key: FeedKey) {
        if self.orphaned.contains_key(&key) {
            return;
        }
        let Some(state) = self.items.get_mut(&key) else {
            return;
        };
        if state.writing {
            return;
        }
        let Some((seq, category)) = state.queued.pop_front() else {
            return;
        };
        state.writing = true;

        let service = self.service.clone();
        let viewer = self.viewer;
        let epoch = self.epoch;
        let tx = self.response_tx.clone();
        self.in_flight += 1;
        thread::spawn(move || {
            let result = service
                .react(key, category)
                .and_then(|()| service.reactions(key))
                .map(|payload| reactions::reconcile(&payload, viewer));
            let _ = tx.send(Response::Written {
                key,
                epoch,
                seq,
                category,
                result,
            });
        });
    }

    fn spawn_load(&mut self, key: FeedKey, seq: u64) {
        let service = self.service.clone();
        let viewer = self.viewer;
        let epoch = self.epoch;
        let tx = self.response_tx.clone();
        self.in_flight += 1;
        thread::spawn(move || {
            let result = service
                .reactions(key)
                .map(|payload| reactions::reconcile(&payload, viewer));
            let _ = tx.send(Response::Loaded {
                key,
                epoch,
                seq,
                result,
            });
        });
    }

    fn settle_orphan(&mut self, key: FeedKey) {
        if let Some(count) = self.orphaned.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.orphaned.remove(&key);
                self.dispatch_next(key);
            }
        }
    }

    fn handle_response(&mut self, message: Response) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match message {
            Response::Written {
                key,
                epoch,
                seq,
                category,
                result,
            } => {
                if epoch != self.epoch {
                    self.settle_orphan(key);
                    return;
                }
                let Some(state) = self.items.get_mut(&key) else {
                    return;
                };
                state.writing = false;
                let latest = state.seq == seq;
                match result {
                    Ok(aggregate) if latest => {
                        state.aggregate = aggregate;
                    }
                    Ok(_) => {
                        tracing::debug!(item = %key, seq, latest = state.seq, "discarding stale reaction result");
                    }
                    Err(err) => {
                        tracing::warn!(item = %key, error = %err, "reaction update failed");
                        self.notices.push(Notice::new(
                            Some(key),
                            format!("Failed to {} {key}: {err}", category.label()),
                        ));
                    }
                }
                self.dispatch_next(key);
            }
            Response::Loaded {
                key,
                epoch,
                seq,
                result,
            } => {
                if epoch != self.epoch {
                    return;
                }
                let Some(state) = self.items.get_mut(&key) else {
                    return;
                };
                match result {
                    Ok(aggregate) if state.seq == seq && !state.writing => {
                        state.aggregate = aggregate;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(item = %key, error = %err, "reaction detail fetch failed");
                        self.notices.push(Notice::new(
                            Some(key),
                            format!("Failed to load reactions for {key}: {err}"),
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockReactionService;
    use crate::model::{FeedKind, Post, ReactionSummary};
    use ReactionCategory::*;

    const VIEWER: UserId = 1;
    const WAIT: Duration = Duration::from_secs(5);

    fn item(id: u64, total: u64) -> FeedItem {
        FeedItem::Prediction(Post {
            id,
            reaction_summary: ReactionSummary {
                total_count: total,
                viewer_reaction: None,
            },
            ..Post::default()
        })
    }

    fn setup() -> (Arc<MockReactionService>, ReactionController, FeedItem) {
        let service = Arc::new(MockReactionService::new(VIEWER));
        let item = item(7, 2);
        service.seed(item.key(), 2, Like);
        service.seed(item.key(), 3, Love);
        let controller = ReactionController::new(service.clone(), Some(VIEWER));
        (service, controller, item)
    }

    fn baseline(controller: &mut ReactionController, item: &FeedItem) -> ReactionAggregate {
        controller.ensure_loaded(item);
        assert!(controller.wait_idle(WAIT));
        controller.aggregate(item.key()).unwrap()
    }

    #[test]
    fn transition_table() {
        assert_eq!(next_reaction(None, Like), Some(Like));
        assert_eq!(next_reaction(Some(Like), Like), None);
        assert_eq!(next_reaction(Some(Like), Sad), Some(Sad));
    }

    #[test]
    fn lazy_load_only_with_engagement() {
        let service = Arc::new(MockReactionService::new(VIEWER));
        let mut controller = ReactionController::new(service.clone(), Some(VIEWER));
        let quiet = item(1, 0);
        controller.ensure_loaded(&quiet);
        assert!(controller.wait_idle(WAIT));
        assert!(service.reads().is_empty());
        assert_eq!(controller.aggregate(quiet.key()), Some(ReactionAggregate::default()));

        let busy = item(2, 4);
        controller.ensure_loaded(&busy);
        controller.ensure_loaded(&busy);
        assert!(controller.wait_idle(WAIT));
        assert_eq!(service.reads(), vec![busy.key()]);
    }

    #[test]
    fn optimistic_update_lands_before_network() {
        let (service, mut controller, item) = setup();
        let before = baseline(&mut controller, &item);
        let gate = service.hold_writes();

        assert_eq!(controller.tap(&item, Wow), Some(Wow));
        let optimistic = controller.aggregate(item.key()).unwrap();
        assert_eq!(optimistic.count(Wow), 1);
        assert_eq!(optimistic.total_count, before.total_count + 1);
        assert_eq!(optimistic.viewer_reaction, Some(Wow));
        assert!(controller.is_pending(item.key()));

        drop(gate);
        assert!(controller.wait_idle(WAIT));
        assert_eq!(service.writes(), vec![(item.key(), Wow)]);
        assert_eq!(controller.aggregate(item.key()).unwrap().count(Wow), 1);
    }

    #[test]
    fn tapping_same_category_twice_restores_baseline() {
        let (_service, mut controller, item) = setup();
        let before = baseline(&mut controller, &item);

        controller.tap(&item, Like);
        assert!(controller.wait_idle(WAIT));
        let liked = controller.aggregate(item.key()).unwrap();
        assert_eq!(liked.count(Like), before.count(Like) + 1);
        assert_eq!(liked.viewer_reaction, Some(Like));

        assert_eq!(controller.tap(&item, Like), None);
        assert!(controller.wait_idle(WAIT));
        assert_eq!(controller.aggregate(item.key()).unwrap(), before);
    }

    #[test]
    fn replacing_moves_one_count() {
        let (_service, mut controller, item) = setup();
        let before = baseline(&mut controller, &item);

        controller.tap(&item, Like);
        assert!(controller.wait_idle(WAIT));
        controller.tap(&item, Sad);
        assert!(controller.wait_idle(WAIT));

        let after = controller.aggregate(item.key()).unwrap();
        assert_eq!(after.count(Like), before.count(Like));
        assert_eq!(after.count(Sad), before.count(Sad) + 1);
        assert_eq!(after.total_count, before.total_count + 1);
        assert_eq!(after.viewer_reaction, Some(Sad));

        // Relative to holding Like, Like lost one and Sad gained one.
        let mut held_like = before;
        held_like.shift_viewer(Some(Like));
        assert_eq!(after.count(Like), held_like.count(Like) - 1);
        assert_eq!(after.count(Sad), held_like.count(Sad) + 1);
    }

    #[test]
    fn rapid_taps_are_written_in_order_and_last_wins() {
        let (service, mut controller, item) = setup();
        baseline(&mut controller, &item);
        let gate = service.hold_writes();

        controller.tap(&item, Like);
        controller.tap(&item, Love);
        controller.tap(&item, Love);
        assert_eq!(controller.viewer_reaction(item.key()), None);

        drop(gate);
        assert!(controller.wait_idle(WAIT));
        assert_eq!(
            service.writes(),
            vec![(item.key(), Like), (item.key(), Love), (item.key(), Love)]
        );
        let settled = controller.aggregate(item.key()).unwrap();
        assert_eq!(settled.viewer_reaction, None);
        assert_eq!(settled.count(Like), 1);
        assert_eq!(settled.count(Love), 1);
        assert!(!controller.is_pending(item.key()));
    }

    #[test]
    fn failed_write_keeps_optimistic_state() {
        let (service, mut controller, item) = setup();
        let before = baseline(&mut controller, &item);
        service.fail_next_writes(1);

        controller.tap(&item, Angry);
        assert!(controller.wait_idle(WAIT));
        let kept = controller.aggregate(item.key()).unwrap();
        assert_eq!(kept.viewer_reaction, Some(Angry));
        assert_eq!(kept.total_count, before.total_count + 1);

        let notices = controller.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].key, Some(item.key()));
        assert!(controller.take_notices().is_empty());
    }

    #[test]
    fn reset_drops_in_flight_results() {
        let (service, mut controller, item) = setup();
        baseline(&mut controller, &item);
        let gate = service.hold_writes();
        controller.tap(&item, Laugh);
        controller.reset();
        drop(gate);
        assert!(controller.wait_idle(WAIT));
        assert!(controller.aggregate(item.key()).is_none());
    }

    #[test]
    fn write_from_before_reset_blocks_next_write_on_item() {
        let service = Arc::new(MockReactionService::new(VIEWER));
        let item = item(8, 0);
        let mut controller = ReactionController::new(service.clone(), Some(VIEWER));
        let gate = service.hold_writes();

        controller.tap(&item, Like);
        assert_eq!(controller.in_flight(), 1);
        controller.reset();
        controller.tap(&item, Like);
        assert_eq!(controller.in_flight(), 1);
        assert!(controller.is_pending(item.key()));

        drop(gate);
        assert!(controller.wait_idle(WAIT));
        assert_eq!(service.writes(), vec![(item.key(), Like), (item.key(), Like)]);
        // Set then retract, in that order.
        assert_eq!(controller.viewer_reaction(item.key()), None);
        assert!(!controller.is_pending(item.key()));
    }

    #[test]
    fn detail_load_overtaken_by_tap_is_discarded() {
        let (service, mut controller, item) = setup();
        let reads = service.hold_reads();

        controller.ensure_loaded(&item);
        controller.tap(&item, Love);
        assert_eq!(controller.viewer_reaction(item.key()), Some(Love));

        drop(reads);
        assert!(controller.wait_idle(WAIT));
        assert_eq!(service.reads(), vec![item.key(), item.key()]);
        let settled = controller.aggregate(item.key()).unwrap();
        assert_eq!(settled.viewer_reaction, Some(Love));
        assert_eq!(settled.count(Love), 2);
        assert_eq!(settled.count(Like), 1);
        assert_eq!(settled.total_count, 3);
    }

    #[test]
    fn aggregate_shape_reconciles_the_same_way() {
        let service = Arc::new(MockReactionService::new(VIEWER).with_aggregate_shape());
        let item = FeedItem::Daily(Post {
            id: 4,
            ..Post::default()
        });
        service.seed(item.key(), 9, Wow);
        let mut controller = ReactionController::new(service.clone(), Some(VIEWER));
        controller.tap(&item, Wow);
        assert!(controller.wait_idle(WAIT));
        let aggregate = controller.aggregate(item.key()).unwrap();
        assert_eq!(aggregate.count(Wow), 2);
        assert_eq!(aggregate.viewer_reaction, Some(Wow));
        assert_eq!(item.key().kind, FeedKind::Daily);
    }
}
