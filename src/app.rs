use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::api;
use crate::config;
use crate::controller::ReactionController;
use crate::data::{self, FeedService, IdentityService, ReactionService};
use crate::feed::{self, FeedCoordinator, Tab};
use crate::identity::{self, AuthorView, IdentityCache};
use crate::logging;
use crate::model::{FeedItem, FeedKey, Notice, ReactionCategory, UserId};
use crate::reactions::ReactionAggregate;

const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Services {
    pub feed: Arc<dyn FeedService>,
    pub reactions: Arc<dyn ReactionService>,
    pub identities: Arc<IdentityCache>,
}

impl Services {
    pub fn from_api(client: Arc<api::Client>) -> Self {
        let identity_api: Arc<dyn IdentityService> =
            Arc::new(data::ApiIdentityService::new(client.clone()));
        Self {
            feed: Arc::new(data::ApiFeedService::new(client.clone())),
            reactions: Arc::new(data::ApiReactionService::new(client)),
            identities: Arc::new(IdentityCache::new(identity_api)),
        }
    }

    pub fn demo(viewer: UserId) -> Self {
        let users: Vec<UserId> = (100..105).collect();
        Self {
            feed: Arc::new(data::MockFeedService::demo()),
            reactions: Arc::new(data::MockReactionService::new(viewer)),
            identities: Arc::new(IdentityCache::new(Arc::new(
                data::MockIdentityService::with_users(&users),
            ))),
        }
    }
}

/// One renderable feed entry with everything the view needs.
#[derive(Debug, Clone)]
pub struct FeedRow {
    pub item: FeedItem,
    pub reactions: ReactionAggregate,
    pub author: Option<AuthorView>,
}

/// The feed screen's state: merged list, reaction state and author lookups.
pub struct Timeline {
    feed: FeedCoordinator,
    reactions: ReactionController,
    identities: Arc<IdentityCache>,
}

impl Timeline {
    pub fn new(services: Services, options: feed::Options, viewer: Option<UserId>) -> Self {
        Self {
            feed: FeedCoordinator::new(services.feed, options),
            reactions: ReactionController::new(services.reactions, viewer),
            identities: services.identities,
        }
    }

    pub fn feed(&self) -> &FeedCoordinator {
        &self.feed
    }

    pub fn start(&mut self) {
        self.feed.start();
    }

    pub fn on_reached_end(&mut self) -> usize {
        self.feed.on_reached_end()
    }

    pub fn switch_tab(&mut self, tab: Tab) {
        if tab == self.feed.tab() {
            return;
        }
        self.reactions.reset();
        self.feed.set_tab(tab);
    }

    pub fn tap(&mut self, key: FeedKey, category: ReactionCategory) -> Option<ReactionCategory> {
        let item = self
            .feed
            .merged_items()
            .iter()
            .find(|item| item.key() == key)?
            .clone();
        self.reactions.tap(&item, category)
    }

    pub fn tick(&mut self, now: Instant) -> bool {
        self.feed.tick(now)
    }

    /// Drains finished work. New feed items get their reaction state seeded
    /// and their unknown authors looked up in the background.
    pub fn poll(&mut self) -> bool {
        let feed_changed = self.feed.poll();
        let reactions_changed = self.reactions.poll();
        if feed_changed {
            self.seed_items();
            let missing = self.missing_authors();
            if !missing.is_empty() {
                let cache = self.identities.clone();
                thread::spawn(move || {
                    if let Err(err) = cache.fetch_many(&missing) {
                        tracing::warn!(error = %err, "author lookup failed");
                    }
                });
            }
        }
        feed_changed || reactions_changed
    }

    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let feed_idle = self.feed.wait_idle(timeout);
        self.seed_items();
        let reactions_idle = self.reactions.wait_idle(timeout);
        feed_idle && reactions_idle
    }

    /// Looks up every author not embedded in a loaded item, in one request.
    pub fn prefetch_authors(&self) -> Result<usize> {
        let missing = self.missing_authors();
        if missing.is_empty() {
            return Ok(0);
        }
        Ok(self.identities.fetch_many(&missing)?.len())
    }

    pub fn rows(&self) -> Vec<FeedRow> {
        self.feed
            .merged_items()
            .iter()
            .map(|item| FeedRow {
                item: item.clone(),
                reactions: self
                    .reactions
                    .aggregate(item.key())
                    .unwrap_or_else(|| ReactionAggregate::from_summary(&item.post().reaction_summary)),
                author: item
                    .post()
                    .author
                    .as_ref()
                    .map(|author| AuthorView::resolve(author, &self.identities)),
            })
            .collect()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        let mut notices = self.feed.take_notices();
        notices.extend(self.reactions.take_notices());
        notices
    }

    fn seed_items(&mut self) {
        let items: Vec<FeedItem> = self.feed.merged_items().to_vec();
        for item in &items {
            self.reactions.ensure_loaded(item);
        }
    }

    fn missing_authors(&self) -> Vec<UserId> {
        let mut seen = HashSet::new();
        self.feed
            .merged_items()
            .iter()
            .filter_map(|item| item.post().author.as_ref())
            .filter(|author| author.first_name.is_none())
            .map(|author| author.id)
            .filter(|id| self.identities.get(*id).is_none() && seen.insert(*id))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    pub tab: Option<Tab>,
    pub pages: usize,
    pub demo: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config_file: None,
            tab: None,
            pages: 1,
            demo: false,
        }
    }
}

/// Loads `pages` pages of the selected tab and prints the merged feed.
pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    if let Err(err) = logging::init(&cfg.log.filter) {
        eprintln!("{err}");
    }

    let viewer = cfg.api.viewer_id;
    let services = if options.demo {
        Services::demo(viewer.unwrap_or(1))
    } else {
        let token: Arc<dyn api::TokenProvider> = Arc::new(api::StaticToken(Some(
            cfg.api.access_token.clone(),
        )));
        let client = api::Client::new(
            token,
            api::ClientConfig {
                user_agent: cfg.api.user_agent.clone(),
                base_url: Some(cfg.api.base_url.clone()),
                timeout: Some(cfg.api.timeout),
                http_client: None,
            },
        )
        .context("build api client")?;
        Services::from_api(Arc::new(client))
    };
    let identities = identity::install(services.identities.clone())?;
    tracing::debug!(entries = identities.len(), "identity cache installed");

    let tab = options.tab.unwrap_or(cfg.feed.default_tab);
    let mut timeline = Timeline::new(
        services,
        feed::Options {
            page_size: cfg.feed.page_size,
            refresh_interval: cfg.feed.refresh_interval,
            tab,
        },
        viewer,
    );

    timeline.start();
    timeline.wait_idle(LOAD_TIMEOUT);
    for _ in 1..options.pages.max(1) {
        if timeline.on_reached_end() == 0 {
            break;
        }
        timeline.wait_idle(LOAD_TIMEOUT);
    }
    if let Err(err) = timeline.prefetch_authors() {
        tracing::warn!(error = %err, "author lookup failed");
    }

    println!("{} ({} items)", tab.display_name(), timeline.feed().merged_items().len());
    for row in timeline.rows() {
        println!("{}", format_row(&row));
    }
    for notice in timeline.take_notices() {
        eprintln!("warning: {}", notice.message);
    }
    Ok(())
}

fn format_row(row: &FeedRow) -> String {
    let post = row.item.post();
    let stamp = row
        .item
        .created_at()
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "----------------".to_string());
    let author = match &row.author {
        Some(AuthorView::Resolved { name, .. }) => name.clone(),
        Some(view @ AuthorView::Placeholder { .. }) => format!("[{}]", view.initial()),
        None => "-".to_string(),
    };
    let reactions = row
        .reactions
        .per_category()
        .map(|(category, count)| format!("{}:{}", category.label(), count))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{:<16} {}  {}  ({})  {} views, {} comments, {} reactions {}",
        row.item.key().to_string(),
        stamp,
        post.title,
        author,
        post.view_count,
        post.comment_count,
        row.reactions.total_count,
        reactions
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MockFeedService, MockIdentityService, MockReactionService};
    use crate::model::FeedKind;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        identity_api: Arc<MockIdentityService>,
        reactions_api: Arc<MockReactionService>,
        timeline: Timeline,
    }

    fn fixture(tab: Tab) -> Fixture {
        let identity_api = Arc::new(MockIdentityService::with_users(&[100, 101, 102, 103, 104]));
        let reactions_api = Arc::new(MockReactionService::new(1));
        let services = Services {
            feed: Arc::new(MockFeedService::demo()),
            reactions: reactions_api.clone(),
            identities: Arc::new(IdentityCache::new(identity_api.clone())),
        };
        let timeline = Timeline::new(
            services,
            feed::Options {
                tab,
                ..feed::Options::default()
            },
            Some(1),
        );
        Fixture {
            identity_api,
            reactions_api,
            timeline,
        }
    }

    #[test]
    fn prefetch_issues_one_coalesced_lookup() {
        let mut fx = fixture(Tab::All);
        fx.timeline.start();
        assert!(fx.timeline.wait_idle(WAIT));

        let resolved = fx.timeline.prefetch_authors().unwrap();
        assert_eq!(resolved, 5);
        assert_eq!(fx.identity_api.calls().len(), 1);
        assert_eq!(fx.timeline.prefetch_authors().unwrap(), 0);
        assert_eq!(fx.identity_api.calls().len(), 1);

        assert!(fx
            .timeline
            .rows()
            .iter()
            .all(|row| matches!(row.author, Some(AuthorView::Resolved { .. }))));
    }

    #[test]
    fn tap_routes_through_controller() {
        let mut fx = fixture(Tab::Predictions);
        fx.timeline.start();
        assert!(fx.timeline.wait_idle(WAIT));

        let key = fx.timeline.feed().merged_items()[0].key();
        assert_eq!(fx.timeline.tap(key, ReactionCategory::Love), Some(ReactionCategory::Love));
        assert!(fx.timeline.wait_idle(WAIT));
        assert_eq!(fx.reactions_api.writes(), vec![(key, ReactionCategory::Love)]);

        let row = fx
            .timeline
            .rows()
            .into_iter()
            .find(|row| row.item.key() == key)
            .unwrap();
        assert_eq!(row.reactions.viewer_reaction, Some(ReactionCategory::Love));

        assert!(fx
            .timeline
            .tap(FeedKey::new(FeedKind::Daily, 9999), ReactionCategory::Like)
            .is_none());
    }

    #[test]
    fn switching_tabs_resets_reaction_state() {
        let mut fx = fixture(Tab::All);
        fx.timeline.start();
        assert!(fx.timeline.wait_idle(WAIT));
        let key = fx.timeline.feed().merged_items()[0].key();
        let gate = fx.reactions_api.hold_writes();
        fx.timeline.tap(key, ReactionCategory::Sad);

        fx.timeline.switch_tab(Tab::Daily);
        drop(gate);
        assert!(fx.timeline.wait_idle(WAIT));
        assert!(fx
            .timeline
            .rows()
            .iter()
            .all(|row| row.item.kind() == FeedKind::Daily && row.reactions.viewer_reaction.is_none()));
    }

    #[test]
    fn format_row_shows_key_and_counts() {
        let row = FeedRow {
            item: FeedItem::Daily(crate::model::Post {
                id: 3,
                title: "Morning notes".into(),
                created_at: "2024-06-01T09:30:00Z".into(),
                ..Default::default()
            }),
            reactions: ReactionAggregate::from_counts([1, 0, 0, 0, 0, 2], None),
            author: None,
        };
        let line = format_row(&row);
        assert!(line.starts_with("daily:3"));
        assert!(line.contains("2024-06-01 09:30"));
        assert!(line.contains("like:1 wow:2"));
    }
}
