use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::IdentityService;
use crate::model::{null_as_default, AuthorRef, UserId};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("user {0} not returned by bulk lookup")]
    NotFound(UserId),
    #[error("identity cache already installed")]
    AlreadyInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEntry {
    pub id: UserId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub first_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub last_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub vip_active: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub blocked: bool,
    #[serde(skip, default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl IdentityEntry {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Session-lived store of user identities. Entries never expire; callers
/// invalidate explicitly with `evict` or `clear` after profile edits.
pub struct IdentityCache {
    service: Arc<dyn IdentityService>,
    entries: RwLock<HashMap<UserId, IdentityEntry>>,
}

static SHARED: OnceCell<Arc<IdentityCache>> = OnceCell::new();

/// Installs the process-wide cache. Components still receive it by `Arc`.
pub fn install(cache: Arc<IdentityCache>) -> Result<Arc<IdentityCache>> {
    SHARED
        .set(cache.clone())
        .map_err(|_| IdentityError::AlreadyInstalled)?;
    Ok(cache)
}

pub fn shared() -> Option<Arc<IdentityCache>> {
    SHARED.get().cloned()
}

impl IdentityCache {
    pub fn new(service: Arc<dyn IdentityService>) -> Self {
        Self {
            service,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: UserId) -> Option<IdentityEntry> {
        self.entries.read().get(&id).cloned()
    }

    pub fn fetch(&self, id: UserId) -> Result<IdentityEntry> {
        if let Some(entry) = self.get(id) {
            return Ok(entry);
        }
        self.fetch_many(&[id])?
            .into_iter()
            .next()
            .ok_or_else(|| IdentityError::NotFound(id).into())
    }

    /// Resolves `ids` in order, issuing at most one bulk request for the ids
    /// not yet cached. Ids the server does not know are left out.
    pub fn fetch_many(&self, ids: &[UserId]) -> Result<Vec<IdentityEntry>> {
        let missing: Vec<UserId> = {
            let entries = self.entries.read();
            let mut seen = HashSet::new();
            ids.iter()
                .copied()
                .filter(|id| !entries.contains_key(id) && seen.insert(*id))
                .collect()
        };

        if !missing.is_empty() {
            tracing::debug!(count = missing.len(), "bulk identity lookup");
            let fetched = self
                .service
                .users_bulk(&missing)
                .context("identity: bulk lookup")?;
            let mut entries = self.entries.write();
            for entry in fetched {
                entries.insert(entry.id, entry);
            }
        }

        let entries = self.entries.read();
        Ok(ids
            .iter()
            .filter_map(|id| entries.get(id).cloned())
            .collect())
    }

    pub fn evict(&self, id: UserId) -> Option<IdentityEntry> {
        self.entries.write().remove(&id)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// What an item renderer shows for its author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorView {
    Resolved {
        name: String,
        avatar_url: Option<String>,
        vip: bool,
    },
    /// Not resolved yet; render the initial as a placeholder avatar.
    Placeholder { initial: char },
}

impl AuthorView {
    /// Embedded author data first, then the cache. Misses are a loading
    /// state, never an error.
    pub fn resolve(author: &AuthorRef, cache: &IdentityCache) -> Self {
        if let Some(first) = author.first_name.as_deref().filter(|name| !name.is_empty()) {
            let name = match author.last_name.as_deref() {
                Some(last) if !last.is_empty() => format!("{first} {last}"),
                _ => first.to_string(),
            };
            return AuthorView::Resolved {
                name,
                avatar_url: author.avatar_url.clone(),
                vip: cache.get(author.id).map(|entry| entry.vip_active).unwrap_or(false),
            };
        }
        match cache.get(author.id) {
            Some(entry) => AuthorView::Resolved {
                name: entry.display_name(),
                avatar_url: entry.avatar_url.clone(),
                vip: entry.vip_active,
            },
            None => AuthorView::Placeholder { initial: '?' },
        }
    }

    pub fn initial(&self) -> char {
        match self {
            AuthorView::Resolved { name, .. } => name
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or('?'),
            AuthorView::Placeholder { initial } => *initial,
        }
    }
}
