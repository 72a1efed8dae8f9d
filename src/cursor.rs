use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::model::{ItemId, Keyed};

pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// One page as returned by a remote collection.
#[derive(Debug, Clone, Default)]
pub struct PageFetch<T> {
    pub items: Vec<T>,
    pub total_count: Option<u64>,
}

/// Fetches page `page` (1-based) of `page_size` items.
pub type PageFetcher<T> = Arc<dyn Fn(u32, u32) -> Result<PageFetch<T>> + Send + Sync>;

/// How a stream learns that further pages exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasMore {
    /// The response carries the collection size.
    TotalCount,
    /// A full page implies another one may follow.
    FullPage,
}

impl HasMore {
    fn evaluate(&self, page: u32, page_size: u32, returned: usize, total: Option<u64>) -> bool {
        if returned == 0 {
            return false;
        }
        match self {
            HasMore::TotalCount => (page as u64) * (page_size as u64) < total.unwrap_or(0),
            HasMore::FullPage => returned == page_size as usize,
        }
    }
}

/// Claim on the stream's single in-flight page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    page: u32,
    generation: u64,
}

impl Ticket {
    pub fn page(&self) -> u32 {
        self.page
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub number: u32,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance<T> {
    Loaded(Page<T>),
    /// Nothing to do: a fetch is already running or the stream is exhausted.
    Skipped,
    /// The stream was reset while the fetch was in flight.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Patched { updated: usize, added: usize },
    Skipped,
    Discarded,
}

struct State<T> {
    page: u32,
    has_more: bool,
    is_fetching: bool,
    generation: u64,
    pages: Vec<Vec<T>>,
}

impl<T> State<T> {
    fn fresh(generation: u64) -> Self {
        Self {
            page: 1,
            has_more: true,
            is_fetching: false,
            generation,
            pages: Vec::new(),
        }
    }
}

/// Page-by-page view of one remote collection.
///
/// `begin` is the only admission point for fetches: while a ticket is out,
/// further calls are no-ops, so repeated end-of-list signals cannot double
/// fetch. `reset` bumps the generation and every outstanding ticket settles
/// as `Discarded` without touching the new state.
pub struct PagedStream<T> {
    name: &'static str,
    page_size: u32,
    rule: HasMore,
    fetch: PageFetcher<T>,
    state: Mutex<State<T>>,
}

impl<T> PagedStream<T>
where
    T: Keyed + Clone + Send + 'static,
{
    pub fn new(name: &'static str, page_size: u32, rule: HasMore, fetch: PageFetcher<T>) -> Self {
        Self {
            name,
            page_size: page_size.max(1),
            rule,
            fetch,
            state: Mutex::new(State::fresh(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Next page to be requested.
    pub fn page(&self) -> u32 {
        self.state.lock().page
    }

    pub fn pages_loaded(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn has_more(&self) -> bool {
        self.state.lock().has_more
    }

    pub fn is_fetching(&self) -> bool {
        self.state.lock().is_fetching
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pages.is_empty()
    }

    pub fn pages(&self) -> Vec<Vec<T>> {
        self.state.lock().pages.clone()
    }

    pub fn begin(&self) -> Option<Ticket> {
        let mut state = self.state.lock();
        if state.is_fetching || !state.has_more {
            return None;
        }
        state.is_fetching = true;
        Some(Ticket {
            page: state.page,
            generation: state.generation,
        })
    }

    /// Runs the fetch for `ticket` and folds the result into the stream.
    /// Errors are returned to the caller with `has_more` left as it was.
    pub fn complete(&self, ticket: Ticket) -> Result<Advance<T>> {
        tracing::debug!(stream = self.name, page = ticket.page, "fetching page");
        let result = (self.fetch)(ticket.page, self.page_size);

        let mut state = self.state.lock();
        if state.generation != ticket.generation {
            tracing::debug!(stream = self.name, page = ticket.page, "dropping page from before reset");
            return Ok(Advance::Discarded);
        }
        state.is_fetching = false;

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(stream = self.name, page = ticket.page, error = %err, "page fetch failed");
                return Err(err);
            }
        };
        let returned = fetched.items.len();
        state.has_more = self
            .rule
            .evaluate(ticket.page, self.page_size, returned, fetched.total_count);
        state.page = ticket.page + 1;
        state.pages.push(fetched.items.clone());
        tracing::debug!(
            stream = self.name,
            page = ticket.page,
            returned,
            has_more = state.has_more,
            "page loaded"
        );

        Ok(Advance::Loaded(Page {
            number: ticket.page,
            items: fetched.items,
        }))
    }

    pub fn advance(&self) -> Result<Advance<T>> {
        match self.begin() {
            Some(ticket) => self.complete(ticket),
            None => Ok(Advance::Skipped),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        let generation = state.generation + 1;
        *state = State::fresh(generation);
    }

    /// Re-fetches page 1 and patches it into what is already loaded: known
    /// ids are replaced where they sit, unseen ids are prepended to the head.
    /// Deeper pages and the page counter are left alone. Prepending shifts
    /// the tail, so `has_more` is re-armed whenever items were added; for a
    /// `FullPage` stream that can cost one extra empty fetch at the end.
    pub fn refresh_head(&self) -> Result<Refresh> {
        let generation = {
            let state = self.state.lock();
            if state.pages.is_empty() {
                return Ok(Refresh::Skipped);
            }
            state.generation
        };

        let result = (self.fetch)(1, self.page_size);

        let mut state = self.state.lock();
        if state.generation != generation || state.pages.is_empty() {
            return Ok(Refresh::Discarded);
        }
        let fetched = result?;

        let mut index: HashMap<ItemId, (usize, usize)> = HashMap::new();
        for (page_idx, page) in state.pages.iter().enumerate() {
            for (pos, item) in page.iter().enumerate() {
                index.entry(item.item_id()).or_insert((page_idx, pos));
            }
        }

        let mut updated = 0;
        let mut fresh = Vec::new();
        for item in fetched.items {
            match index.get(&item.item_id()) {
                Some(&(page_idx, pos)) => {
                    state.pages[page_idx][pos] = item;
                    updated += 1;
                }
                None => fresh.push(item),
            }
        }
        let added = fresh.len();
        if added > 0 {
            let head = &mut state.pages[0];
            let mut merged = fresh;
            merged.append(head);
            *head = merged;
            // New arrivals push older items past the last loaded page.
            state.has_more = true;
        }
        tracing::debug!(stream = self.name, updated, added, "head refreshed");

        Ok(Refresh::Patched { updated, added })
    }
}
