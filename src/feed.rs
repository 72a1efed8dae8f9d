use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::cursor::{Advance, HasMore, PageFetcher, PagedStream, Refresh};
use crate::data::FeedService;
use crate::merge;
use crate::model::{FeedItem, FeedKind, Notice, Post};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    Predictions,
    Daily,
    #[default]
    All,
}

impl Tab {
    pub fn includes(&self, kind: FeedKind) -> bool {
        match self {
            Tab::All => true,
            Tab::Predictions => kind == FeedKind::Prediction,
            Tab::Daily => kind == FeedKind::Daily,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Tab::Predictions => "Predictions",
            Tab::Daily => "Daily posts",
            Tab::All => "All",
        }
    }

    pub fn from_key(key: &str) -> Option<Tab> {
        match key.trim().to_ascii_lowercase().as_str() {
            "predictions" | "prediction" => Some(Tab::Predictions),
            "daily" | "dailyposts" => Some(Tab::Daily),
            "all" => Some(Tab::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub page_size: u32,
    pub refresh_interval: Duration,
    pub tab: Tab,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: crate::cursor::DEFAULT_PAGE_SIZE,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            tab: Tab::All,
        }
    }
}

enum FeedEvent {
    Page {
        kind: FeedKind,
        result: Result<Advance<Post>>,
    },
    Refreshed {
        kind: FeedKind,
        result: Result<Refresh>,
    },
}

/// Drives the prediction and daily-post streams behind one merged list.
///
/// Fetches run on worker threads and report back over a channel; the owner
/// drains them with `poll` (or `wait_idle`), which re-merges whenever a page
/// lands. The merged list is derived state, rebuilt from both streams.
pub struct FeedCoordinator {
    predictions: Arc<PagedStream<Post>>,
    daily: Arc<PagedStream<Post>>,
    tab: Tab,
    merged: Vec<FeedItem>,
    refresh_interval: Duration,
    last_refresh: Instant,
    in_flight: usize,
    event_tx: Sender<FeedEvent>,
    event_rx: Receiver<FeedEvent>,
    notices: Vec<Notice>,
}

impl FeedCoordinator {
    pub fn new(service: Arc<dyn FeedService>, options: Options) -> Self {
        let predictions_fetch: PageFetcher<Post> = {
            let service = service.clone();
            Arc::new(move |page, size| service.predictions(page, size))
        };
        let daily_fetch: PageFetcher<Post> = {
            let service = service.clone();
            Arc::new(move |page, size| service.daily_posts(page, size))
        };
        let (event_tx, event_rx) = unbounded();
        Self {
            predictions: Arc::new(PagedStream::new(
                FeedKind::Prediction.resource(),
                options.page_size,
                HasMore::TotalCount,
                predictions_fetch,
            )),
            daily: Arc::new(PagedStream::new(
                FeedKind::Daily.resource(),
                options.page_size,
                HasMore::FullPage,
                daily_fetch,
            )),
            tab: options.tab,
            merged: Vec::new(),
            refresh_interval: options.refresh_interval,
            last_refresh: Instant::now(),
            in_flight: 0,
            event_tx,
            event_rx,
            notices: Vec::new(),
        }
    }

    pub fn tab(&self) -> Tab {
        self.tab
    }

    pub fn stream(&self, kind: FeedKind) -> &PagedStream<Post> {
        match kind {
            FeedKind::Prediction => &self.predictions,
            FeedKind::Daily => &self.daily,
        }
    }

    pub fn merged_items(&self) -> &[FeedItem] {
        &self.merged
    }

    /// An in-scope stream is fetching and has nothing to show yet.
    pub fn is_initial_loading(&self) -> bool {
        self.in_scope()
            .any(|kind| self.stream(kind).is_fetching() && self.stream(kind).is_empty())
    }

    /// An in-scope stream is fetching a continuation page.
    pub fn is_fetching_more(&self) -> bool {
        self.in_scope()
            .any(|kind| self.stream(kind).is_fetching() && !self.stream(kind).is_empty())
    }

    pub fn has_more(&self) -> bool {
        self.in_scope().any(|kind| self.stream(kind).has_more())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Loads the first page of every in-scope stream that has none yet.
    pub fn start(&mut self) {
        let kinds: Vec<FeedKind> = self
            .in_scope()
            .filter(|kind| self.stream(*kind).is_empty())
            .collect();
        for kind in kinds {
            self.spawn_advance(kind);
        }
    }

    /// Continuation signal from the view: the last rendered item became
    /// visible. Returns how many fetches were started.
    pub fn on_reached_end(&mut self) -> usize {
        let kinds: Vec<FeedKind> = self.in_scope().collect();
        kinds
            .into_iter()
            .filter(|kind| self.spawn_advance(*kind))
            .count()
    }

    /// Switching tabs restarts both streams from page 1 so nothing from the
    /// previous scope survives; fetches already running are discarded when
    /// they land.
    pub fn set_tab(&mut self, tab: Tab) {
        if tab == self.tab {
            return;
        }
        tracing::debug!(from = ?self.tab, to = ?tab, "switching feed tab");
        self.tab = tab;
        self.predictions.reset();
        self.daily.reset();
        self.merged.clear();
        self.last_refresh = Instant::now();
        self.start();
    }

    /// Starts a head refresh of the in-scope streams once the refresh
    /// interval has elapsed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_refresh) < self.refresh_interval {
            return false;
        }
        self.refresh_now();
        self.last_refresh = now;
        true
    }

    pub fn refresh_now(&mut self) {
        self.last_refresh = Instant::now();
        let kinds: Vec<FeedKind> = self
            .in_scope()
            .filter(|kind| !self.stream(*kind).is_empty())
            .collect();
        for kind in kinds {
            let stream = self.stream_arc(kind);
            let tx = self.event_tx.clone();
            self.in_flight += 1;
            thread::spawn(move || {
                let result = stream.refresh_head();
                let _ = tx.send(FeedEvent::Refreshed { kind, result });
            });
        }
    }

    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.event_rx.try_recv() {
            changed |= self.handle_event(event);
        }
        changed
    }

    /// Blocks until every started fetch has reported or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.event_rx.recv_timeout(remaining) {
                Ok(event) => {
                    self.handle_event(event);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false
                }
            }
        }
        true
    }

    fn in_scope(&self) -> impl Iterator<Item = FeedKind> + '_ {
        [FeedKind::Prediction, FeedKind::Daily]
            .into_iter()
            .filter(move |kind| self.tab.includes(*kind))
    }

    fn stream_arc(&self, kind: FeedKind) -> Arc<PagedStream<Post>> {
        match kind {
            FeedKind::Prediction => self.predictions.clone(),
            FeedKind::Daily => self.daily.clone(),
        }
    }

    fn spawn_advance(&mut self, kind: FeedKind) -> bool {
        let stream = self.stream_arc(kind);
        let Some(ticket) = stream.begin() else {
            return false;
        };
        let tx = self.event_tx.clone();
        self.in_flight += 1;
        thread::spawn(move || {
            let result = stream.complete(ticket);
            let _ = tx.send(FeedEvent::Page { kind, result });
        });
        true
    }

    fn handle_event(&mut self, event: FeedEvent) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        match event {
            FeedEvent::Page { kind, result } => match result {
                Ok(Advance::Loaded(_)) => {
                    self.remerge();
                    true
                }
                Ok(Advance::Skipped) | Ok(Advance::Discarded) => false,
                Err(err) => {
                    self.notices.push(Notice::new(
                        None,
                        format!("Failed to load {}: {err}", kind.resource()),
                    ));
                    true
                }
            },
            FeedEvent::Refreshed { kind, result } => match result {
                Ok(Refresh::Patched { .. }) => {
                    self.remerge();
                    true
                }
                Ok(Refresh::Skipped) | Ok(Refresh::Discarded) => false,
                Err(err) => {
                    tracing::warn!(stream = kind.resource(), error = %err, "head refresh failed");
                    self.notices.push(Notice::new(
                        None,
                        format!("Failed to refresh {}: {err}", kind.resource()),
                    ));
                    true
                }
            },
        }
    }

    fn remerge(&mut self) {
        let empty: Vec<Vec<Post>> = Vec::new();
        let predictions = if self.tab.includes(FeedKind::Prediction) {
            self.predictions.pages()
        } else {
            empty.clone()
        };
        let daily = if self.tab.includes(FeedKind::Daily) {
            self.daily.pages()
        } else {
            empty
        };
        self.merged = merge::merge(&predictions, &daily);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockFeedService;
    use crate::model::FeedKey;

    const WAIT: Duration = Duration::from_secs(5);

    fn coordinator(service: &Arc<MockFeedService>, tab: Tab) -> FeedCoordinator {
        FeedCoordinator::new(
            service.clone(),
            Options {
                tab,
                ..Options::default()
            },
        )
    }

    fn loaded(coordinator: &mut FeedCoordinator) {
        assert!(coordinator.wait_idle(WAIT));
    }

    #[test]
    fn all_tab_loads_and_merges_both_streams() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = coordinator(&service, Tab::All);
        feed.start();
        assert!(feed.is_initial_loading() || feed.in_flight() > 0);
        loaded(&mut feed);

        let items = feed.merged_items();
        assert_eq!(items.len(), 20);
        assert!(items.iter().any(|i| i.kind() == FeedKind::Prediction));
        assert!(items.iter().any(|i| i.kind() == FeedKind::Daily));
        let stamps: Vec<_> = items.iter().map(|i| i.created_at().unwrap()).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] >= pair[1]));
        assert!(!feed.is_initial_loading());
    }

    #[test]
    fn reached_end_advances_every_eligible_stream() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = coordinator(&service, Tab::All);
        feed.start();
        loaded(&mut feed);

        assert_eq!(feed.on_reached_end(), 2);
        loaded(&mut feed);
        // Daily ran out after 13 items; predictions still have a third page.
        assert!(!feed.stream(FeedKind::Daily).has_more());
        assert_eq!(feed.on_reached_end(), 1);
        loaded(&mut feed);
        assert!(!feed.has_more());
        assert_eq!(feed.on_reached_end(), 0);
        assert_eq!(feed.merged_items().len(), 38);
    }

    #[test]
    fn repeated_signals_while_fetching_issue_one_call() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = coordinator(&service, Tab::Predictions);
        let gate = service.hold(FeedKind::Prediction);
        feed.start();
        assert_eq!(feed.on_reached_end(), 0);
        assert_eq!(feed.on_reached_end(), 0);
        assert!(feed.is_initial_loading());
        drop(gate);
        loaded(&mut feed);
        assert_eq!(service.calls_for(FeedKind::Prediction), vec![1]);

        let gate = service.hold(FeedKind::Prediction);
        assert_eq!(feed.on_reached_end(), 1);
        assert_eq!(feed.on_reached_end(), 0);
        assert!(feed.is_fetching_more());
        drop(gate);
        loaded(&mut feed);
        assert_eq!(service.calls_for(FeedKind::Prediction), vec![1, 2]);
    }

    #[test]
    fn scoped_tab_only_advances_its_stream() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = coordinator(&service, Tab::Daily);
        feed.start();
        loaded(&mut feed);
        feed.on_reached_end();
        loaded(&mut feed);

        assert!(service.calls_for(FeedKind::Prediction).is_empty());
        assert_eq!(service.calls_for(FeedKind::Daily), vec![1, 2]);
        assert!(feed
            .merged_items()
            .iter()
            .all(|item| item.kind() == FeedKind::Daily));
    }

    #[test]
    fn tab_switch_restarts_from_first_page() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = coordinator(&service, Tab::Predictions);
        feed.start();
        loaded(&mut feed);
        feed.on_reached_end();
        loaded(&mut feed);
        assert_eq!(feed.stream(FeedKind::Prediction).pages_loaded(), 2);

        feed.set_tab(Tab::Daily);
        loaded(&mut feed);
        assert_eq!(feed.stream(FeedKind::Prediction).pages_loaded(), 0);
        assert!(feed
            .merged_items()
            .iter()
            .all(|item| item.kind() == FeedKind::Daily));

        feed.set_tab(Tab::Predictions);
        loaded(&mut feed);
        assert_eq!(service.calls_for(FeedKind::Prediction), vec![1, 2, 1]);
        assert_eq!(feed.stream(FeedKind::Prediction).pages_loaded(), 1);
        assert_eq!(feed.stream(FeedKind::Prediction).page(), 2);
        assert_eq!(feed.merged_items().len(), 10);
    }

    #[test]
    fn stale_page_after_tab_switch_is_dropped() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = coordinator(&service, Tab::All);
        let gate = service.hold(FeedKind::Prediction);
        feed.start();

        feed.set_tab(Tab::Daily);
        drop(gate);
        loaded(&mut feed);

        assert!(feed.stream(FeedKind::Prediction).is_empty());
        assert!(!feed.stream(FeedKind::Prediction).is_fetching());
        assert!(feed
            .merged_items()
            .iter()
            .all(|item| item.kind() == FeedKind::Daily));
        assert_eq!(feed.merged_items().len(), 10);
    }

    #[test]
    fn failure_becomes_notice_and_retry_works() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = coordinator(&service, Tab::Predictions);
        service.fail_next(FeedKind::Prediction);
        feed.start();
        loaded(&mut feed);
        assert!(feed.merged_items().is_empty());
        assert!(feed.has_more());
        let notices = feed.take_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.contains("predictions"));

        assert_eq!(feed.on_reached_end(), 1);
        loaded(&mut feed);
        assert_eq!(feed.merged_items().len(), 10);
    }

    #[test]
    fn refresh_patches_new_items_without_dropping_depth() {
        let service = Arc::new(MockFeedService::demo());
        let mut feed = FeedCoordinator::new(
            service.clone(),
            Options {
                tab: Tab::Predictions,
                refresh_interval: Duration::from_secs(30),
                ..Options::default()
            },
        );
        feed.start();
        loaded(&mut feed);
        feed.on_reached_end();
        loaded(&mut feed);
        assert_eq!(feed.merged_items().len(), 20);

        service.publish(
            FeedKind::Prediction,
            Post {
                id: 99,
                title: "Fresh".into(),
                created_at: "2030-01-01T00:00:00Z".into(),
                ..Post::default()
            },
        );
        assert!(!feed.tick(Instant::now()));
        assert!(feed.tick(Instant::now() + Duration::from_secs(31)));
        loaded(&mut feed);

        let items = feed.merged_items();
        assert_eq!(items.len(), 21);
        assert_eq!(items[0].key(), FeedKey::new(FeedKind::Prediction, 99));
        assert_eq!(feed.stream(FeedKind::Prediction).page(), 3);
    }

    #[test]
    fn tab_keys_parse() {
        assert_eq!(Tab::from_key("Daily"), Some(Tab::Daily));
        assert_eq!(Tab::from_key("predictions"), Some(Tab::Predictions));
        assert_eq!(Tab::from_key("all"), Some(Tab::All));
        assert_eq!(Tab::from_key("admin"), None);
    }
}
