use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timestamp::{Resolution, TimestampSource};

// Which upstream listing a page came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Posts,
    Reels,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Posts => "/api/instagram/posts",
            Endpoint::Reels => "/api/instagram/user_reels",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Posts => "posts",
            Endpoint::Reels => "reels",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Carousel,
    Reel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarouselItem {
    pub index: usize,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub is_video: bool,
}

/// One listing item after shape normalisation, before any interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPost {
    pub id: String,
    pub code: Option<String>,
    pub caption: String,
    pub taken_at: Option<Value>,
    pub caption_created_at: Option<Value>,
    pub product_type: Option<String>,
    pub media_type: Option<i64>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub like_count: i64,
    pub comment_count: i64,
    pub play_count: i64,
    pub carousel_media_count: u32,
    pub carousel: Vec<CarouselItem>,
}

impl RawPost {
    pub fn classify(&self, endpoint: Endpoint) -> MediaKind {
        if endpoint == Endpoint::Reels || self.product_type.as_deref() == Some("clips") {
            MediaKind::Reel
        } else if self.media_type == Some(8)
            || self.carousel_media_count > 1
            || !self.carousel.is_empty()
        {
            MediaKind::Carousel
        } else if self.media_type == Some(2) || self.video_url.is_some() {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }
}

// Stored post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: String,
    pub account: String,
    pub code: Option<String>,
    pub caption: String,
    pub taken_at: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub kind: MediaKind,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub like_count: i64,
    pub comment_count: i64,
    pub play_count: i64,
    pub carousel: Vec<CarouselItem>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn from_raw(
        account: &str,
        raw: RawPost,
        endpoint: Endpoint,
        resolution: &Resolution,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let kind = raw.classify(endpoint);
        Self {
            post_id: raw.id,
            account: account.to_string(),
            code: raw.code,
            caption: raw.caption,
            taken_at: resolution.instant,
            timestamp_source: resolution.source,
            kind,
            image_url: raw.image_url,
            video_url: raw.video_url,
            like_count: raw.like_count,
            comment_count: raw.comment_count,
            play_count: raw.play_count,
            carousel: raw.carousel,
            first_seen_at: fetched_at,
            updated_at: fetched_at,
        }
    }

    /// Fetch-time fallback, excluded from time-series analytics.
    pub fn timestamp_unresolved(&self) -> bool {
        self.timestamp_source == TimestampSource::FetchTime
    }

    pub fn permalink(&self) -> String {
        match (&self.kind, &self.code) {
            (MediaKind::Reel, Some(code)) => format!("https://www.instagram.com/reel/{}/", code),
            (_, Some(code)) => format!("https://www.instagram.com/p/{}/", code),
            (_, None) => format!("https://www.instagram.com/p/{}/", self.post_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSnapshot {
    pub account: String,
    pub post_id: String,
    pub captured_at: DateTime<Utc>,
    pub like_count: i64,
    pub comment_count: i64,
    pub play_count: i64,
}

impl EngagementSnapshot {
    pub fn of(post: &Post, captured_at: DateTime<Utc>) -> Self {
        Self {
            account: post.account.clone(),
            post_id: post.post_id.clone(),
            captured_at,
            like_count: post.like_count,
            comment_count: post.comment_count,
            play_count: post.play_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    // None means never fetched
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(username: &str) -> Self {
        Self {
            username: normalize_username(username),
            last_fetched_at: None,
        }
    }
}

// "  @NASA " -> "nasa"
pub fn normalize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Full,
    Incremental,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Full => "full",
            FetchMode::Incremental => "incremental",
        }
    }
}

/// One account's unit of work for a single fetch invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub account: Account,
    pub mode: FetchMode,
}

impl FetchTask {
    /// Full when the account was never fetched or a refresh is forced.
    pub fn plan(account: Account, full_refresh: bool) -> Self {
        let mode = if full_refresh || account.last_fetched_at.is_none() {
            FetchMode::Full
        } else {
            FetchMode::Incremental
        };
        Self { account, mode }
    }

    /// Oldest creation time an incremental fetch keeps.
    pub fn cutoff(&self, started_at: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
        match self.mode {
            FetchMode::Full => None,
            FetchMode::Incremental => Some(
                started_at
                    .checked_sub_signed(window)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
        }
    }
}
