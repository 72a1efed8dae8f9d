use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type ItemId = u64;
pub type UserId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Prediction,
    Daily,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Prediction => "prediction",
            FeedKind::Daily => "daily",
        }
    }

    /// REST collection that serves items of this kind.
    pub fn resource(&self) -> &'static str {
        match self {
            FeedKind::Prediction => "predictions",
            FeedKind::Daily => "dailyposts",
        }
    }
}

/// Identity of an item in the merged feed. Ids are only unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub kind: FeedKind,
    pub id: ItemId,
}

impl FeedKey {
    pub fn new(kind: FeedKind, id: ItemId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReactionCategory {
    Like,
    Love,
    Laugh,
    Angry,
    Sad,
    Wow,
}

impl ReactionCategory {
    pub const ALL: [ReactionCategory; 6] = [
        ReactionCategory::Like,
        ReactionCategory::Love,
        ReactionCategory::Laugh,
        ReactionCategory::Angry,
        ReactionCategory::Sad,
        ReactionCategory::Wow,
    ];

    pub fn code(&self) -> u8 {
        match self {
            ReactionCategory::Like => 1,
            ReactionCategory::Love => 2,
            ReactionCategory::Laugh => 3,
            ReactionCategory::Angry => 4,
            ReactionCategory::Sad => 5,
            ReactionCategory::Wow => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ReactionCategory::Like),
            2 => Some(ReactionCategory::Love),
            3 => Some(ReactionCategory::Laugh),
            4 => Some(ReactionCategory::Angry),
            5 => Some(ReactionCategory::Sad),
            6 => Some(ReactionCategory::Wow),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReactionCategory::Like => "like",
            ReactionCategory::Love => "love",
            ReactionCategory::Laugh => "laugh",
            ReactionCategory::Angry => "angry",
            ReactionCategory::Sad => "sad",
            ReactionCategory::Wow => "wow",
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.code() as usize - 1
    }
}

impl TryFrom<u8> for ReactionCategory {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        ReactionCategory::from_code(code).ok_or_else(|| format!("unknown reaction code {code}"))
    }
}

impl From<ReactionCategory> for u8 {
    fn from(category: ReactionCategory) -> Self {
        category.code()
    }
}

/// Engagement figures embedded in a feed item payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_count: u64,
    #[serde(default)]
    pub viewer_reaction: Option<ReactionCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorRef {
    pub id: UserId,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Shared body of predictions and daily posts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: ItemId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub view_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub comment_count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reaction_summary: ReactionSummary,
    #[serde(default)]
    pub author: Option<AuthorRef>,
}

impl Post {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }
}

/// Items that live in a paged stream and can be patched by id.
pub trait Keyed {
    fn item_id(&self) -> ItemId;
}

impl Keyed for Post {
    fn item_id(&self) -> ItemId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    Prediction(Post),
    Daily(Post),
}

impl FeedItem {
    pub fn kind(&self) -> FeedKind {
        match self {
            FeedItem::Prediction(_) => FeedKind::Prediction,
            FeedItem::Daily(_) => FeedKind::Daily,
        }
    }

    pub fn post(&self) -> &Post {
        match self {
            FeedItem::Prediction(post) | FeedItem::Daily(post) => post,
        }
    }

    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.kind(), self.post().id)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.post().created_at()
    }
}

/// Non-blocking message for the view layer (failed fetch, rejected write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub key: Option<FeedKey>,
    pub message: String,
}

impl Notice {
    pub fn new(key: Option<FeedKey>, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
        }
    }
}

/// Reads an explicit `null` as the field's default, same as a missing key.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parses the server's ISO-8601 timestamps. Offsets are honoured; timestamps
/// without one are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
