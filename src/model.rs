//! Shared data model: feed items, filter sets and per-feed state.
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Items
// ============================================================================

/// Opaque item identifier assigned by the data-access layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single feed entry. Identity is `id` only; the other fields are display data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub image_url: String,
    #[serde(default)]
    pub category_id: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub like_count: u32,
}

impl Item {
    /// Minimal item, mostly useful for tests and the simulated driver.
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            image_url: image_url.into(),
            category_id: None,
            created_at: None,
            like_count: 0,
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Newest,
    Hottest,
    Trending,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortMode::Newest => "newest",
            SortMode::Hottest => "hottest",
            SortMode::Trending => "trending",
        }
    }
}

impl std::str::FromStr for SortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(SortMode::Newest),
            "hottest" => Ok(SortMode::Hottest),
            "trending" => Ok(SortMode::Trending),
            other => Err(format!("unknown sort mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    #[default]
    All,
    Today,
    Week,
    Month,
}

impl TimePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimePeriod::All => "all",
            TimePeriod::Today => "today",
            TimePeriod::Week => "week",
            TimePeriod::Month => "month",
        }
    }
}

impl std::str::FromStr for TimePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(TimePeriod::All),
            "today" => Ok(TimePeriod::Today),
            "week" => Ok(TimePeriod::Week),
            "month" => Ok(TimePeriod::Month),
            other => Err(format!("unknown time period '{other}'")),
        }
    }
}

/// Active filter set of a feed. Any field change invalidates the feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterSet {
    pub category_id: Option<String>,
    pub sort_mode: SortMode,
    pub time_period: TimePeriod,
}

impl FilterSet {
    pub fn new(sort_mode: SortMode) -> Self {
        Self {
            sort_mode,
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    pub fn with_period(mut self, time_period: TimePeriod) -> Self {
        self.time_period = time_period;
        self
    }

    /// Canonical feed identity for this filter set.
    pub fn feed_key(&self) -> FeedKey {
        FeedKey(format!(
            "{}:{}:{}",
            self.category_id.as_deref().unwrap_or("all"),
            self.sort_mode.as_str(),
            self.time_period.as_str()
        ))
    }
}

/// Identity of a logical feed, derived from its filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedKey(pub String);

impl FeedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the filter set this key was derived from.
    ///
    /// Parsed from the right, so a category may itself contain ':'. The
    /// `all` category maps back to no category.
    pub fn filters(&self) -> Option<FilterSet> {
        let mut parts = self.0.rsplitn(3, ':');
        let time_period = parts.next()?.parse().ok()?;
        let sort_mode = parts.next()?.parse().ok()?;
        let category = parts.next()?;
        Some(FilterSet {
            category_id: (category != "all").then(|| category.to_string()),
            sort_mode,
            time_period,
        })
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Feed State
// ============================================================================

/// Loaded state of one feed.
///
/// Only `FeedStateStore` mutates this; consumers receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedState {
    pub items: Vec<Item>,
    pub current_page: u32,
    pub has_more: bool,
    pub filters: FilterSet,
    pub is_initialized: bool,
    /// User-visible fetch failure. Never persisted.
    #[serde(skip)]
    pub error: Option<String>,
}

impl FeedState {
    pub fn new(filters: FilterSet) -> Self {
        Self {
            items: Vec::new(),
            current_page: 1,
            has_more: true,
            filters,
            is_initialized: false,
            error: None,
        }
    }
}

impl Default for FeedState {
    fn default() -> Self {
        Self::new(FilterSet::default())
    }
}

/// One page returned by the data-access layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Item>,
    pub has_more: bool,
}
