//! Core domain model, link normalization and content fingerprints for Newsdesk.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsdesk-core";

/// Summaries derived from article bodies are cut at a word boundary at or before this length.
pub const DERIVED_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    #[default]
    Article,
    Profile,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Profile => "profile",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "article" => Some(Self::Article),
            "profile" => Some(Self::Profile),
            _ => None,
        }
    }
}

/// Retrieval capability a source can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Feed,
    Page,
    Session,
}

impl FetchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feed => "feed",
            Self::Page => "page",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("item has no title")]
    MissingTitle,
    #[error("item has no link")]
    MissingLink,
    #[error("malformed link {link:?}: {reason}")]
    MalformedLink { link: String, reason: String },
}

/// Item as scraped, before identity keys are attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source: String,
    #[serde(default)]
    pub kind: ItemKind,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Upstream-reported modification time, when the source exposes one.
    pub updated_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

impl RawItem {
    pub fn new(source: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            kind: ItemKind::Article,
            title: None,
            summary: None,
            content: None,
            link: None,
            published_at: None,
            updated_at: None,
            fetched_at,
        }
    }

    /// Timestamp an UPDATE records: upstream modification time, then publication, then fetch.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.updated_at
            .or(self.published_at)
            .unwrap_or(self.fetched_at)
    }

    /// Anchor for recency windows.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.fetched_at)
    }
}

/// Canonical form of a link used as the URL identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedUrl(String);

impl NormalizedUrl {
    /// Lowercases scheme and host, drops userinfo, default port, query, fragment and trailing slashes.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingLink);
        }
        let malformed = |reason: String| ValidationError::MalformedLink {
            link: trimmed.to_string(),
            reason,
        };

        let url = Url::parse(trimmed).map_err(|e| malformed(e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| malformed("link has no host".to_string()))?;

        let mut normalized = format!("{}://{}", url.scheme(), host.to_ascii_lowercase());
        if let Some(port) = url.port() {
            normalized.push(':');
            normalized.push_str(&port.to_string());
        }
        normalized.push_str(url.path().trim_end_matches('/'));
        Ok(Self(normalized))
    }

    /// Wraps a value read back from storage, where it was written already normalized.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `hex(sha256(title + summary + link))`, missing fields hashed as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn compute(title: Option<&str>, summary: Option<&str>, link: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(title.unwrap_or_default().as_bytes());
        hasher.update(summary.unwrap_or_default().as_bytes());
        hasher.update(link.unwrap_or_default().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated item carrying its identity keys.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedItem {
    pub raw: RawItem,
    pub link: NormalizedUrl,
    pub fingerprint: ContentFingerprint,
}

impl IdentifiedItem {
    pub fn identify(mut raw: RawItem) -> Result<Self, ValidationError> {
        let title = raw
            .title
            .as_deref()
            .map(collapse_whitespace)
            .filter(|t| !t.is_empty())
            .ok_or(ValidationError::MissingTitle)?;
        raw.title = Some(title);

        let link = raw
            .link
            .as_deref()
            .ok_or(ValidationError::MissingLink)
            .and_then(NormalizedUrl::parse)?;

        raw.summary = raw
            .summary
            .as_deref()
            .map(collapse_whitespace)
            .filter(|s| !s.is_empty());
        if raw.summary.is_none() {
            raw.summary = raw
                .content
                .as_deref()
                .and_then(|c| derive_summary(c, DERIVED_SUMMARY_CHARS));
        }

        let fingerprint = ContentFingerprint::compute(
            raw.title.as_deref(),
            raw.summary.as_deref(),
            Some(link.as_str()),
        );
        Ok(Self {
            raw,
            link,
            fingerprint,
        })
    }

    pub fn title(&self) -> &str {
        self.raw.title.as_deref().unwrap_or_default()
    }
}

/// Persisted article or profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArticle {
    pub id: Uuid,
    pub kind: ItemKind,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub link: NormalizedUrl,
    pub source: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_hash: ContentFingerprint,
}

impl StoredArticle {
    /// Publication time, or first-seen time for rows the source did not date.
    pub fn listed_at(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    OnDemand,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::OnDemand => "on_demand",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "on_demand" => Some(Self::OnDemand),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One run of one source plus its ingestion statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub id: Uuid,
    pub source: String,
    pub trigger: RunTrigger,
    pub query: Option<String>,
    pub method_used: Option<FetchMethod>,
    pub items_found: u32,
    pub items_new: u32,
    pub items_updated: u32,
    pub items_duplicate: u32,
    pub items_flagged: u32,
    pub items_invalid: u32,
    pub duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScrapeSession {
    pub fn begin(
        source: impl Into<String>,
        trigger: RunTrigger,
        query: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            trigger,
            query,
            method_used: None,
            items_found: 0,
            items_new: 0,
            items_updated: 0,
            items_duplicate: 0,
            items_flagged: 0,
            items_invalid: 0,
            duration_ms: 0,
            success: false,
            error_message: None,
            started_at,
            finished_at: None,
        }
    }

    pub fn close(&mut self, finished_at: DateTime<Utc>, error: Option<String>) {
        self.duration_ms = (finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.finished_at = Some(finished_at);
        self.success = error.is_none();
        self.error_message = error;
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max_chars` characters of `content`, cut back to a word boundary.
pub fn derive_summary(content: &str, max_chars: usize) -> Option<String> {
    let collapsed = collapse_whitespace(content);
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.chars().count() <= max_chars {
        return Some(collapsed);
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    let cut = match cut.rfind(' ') {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut.as_str(),
    };
    Some(format!("{}...", cut.trim_end()))
}

/// Title key for near-duplicate comparison: diacritics stripped, case folded, punctuation dropped.
pub fn fold_title(title: &str) -> String {
    title
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d @ %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d.%m.%Y, %H:%M",
    "%d.%m.%Y %H:%M:%S",
];

/// Parses RFC 3339, RFC 2822, or a local wall-clock format interpreted at `local_offset`.
///
/// Labels in front of the date ("Publicat: 28.06.2025 11:24") are skipped.
pub fn parse_timestamp(text: &str, local_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }

    let unlabelled = text
        .find(|c: char| c.is_ascii_digit())
        .map(|idx| text[idx..].trim())
        .unwrap_or(text);
    for candidate in [text, unlabelled] {
        if let Ok(dt) = DateTime::parse_from_rfc3339(candidate) {
            return Some(dt.with_timezone(&Utc));
        }
        for format in NAIVE_TIMESTAMP_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(candidate, format) {
                return local_offset
                    .from_local_datetime(&naive)
                    .single()
                    .map(|dt| dt.with_timezone(&Utc));
            }
        }
    }
    None
}
