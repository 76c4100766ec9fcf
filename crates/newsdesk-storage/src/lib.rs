//! Persistence gateway (in-memory + Postgres) and HTTP fetch utilities for Newsdesk.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use newsdesk_core::{
    fold_title, ContentFingerprint, FetchMethod, ItemKind, NormalizedUrl, RunTrigger,
    ScrapeSession, StoredArticle,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsdesk-storage";

const CONTENT_HASH_CONSTRAINT: &str = "news_articles_content_hash_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueKey {
    Link,
    ContentHash,
}

impl std::fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Link => f.write_str("link"),
            Self::ContentHash => f.write_str("content_hash"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint on {key} violated")]
    Conflict { key: UniqueKey },
    #[error("article {0} not found")]
    NotFound(Uuid),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                let key = match db.constraint() {
                    Some(CONTENT_HASH_CONSTRAINT) => UniqueKey::ContentHash,
                    _ => UniqueKey::Link,
                };
                return Self::Conflict { key };
            }
        }
        Self::Unavailable(err.to_string())
    }
}

/// Insert payload. Timestamps and hash are decided by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
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

/// Content fields rewritten by an UPDATE. `published_at` only fills a missing value.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleChanges {
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: ContentFingerprint,
    pub updated_at: DateTime<Utc>,
}

/// Storage-facing interface of the ingestion pipeline. Both unique keys are enforced here.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn find_by_link(&self, link: &NormalizedUrl) -> Result<Option<StoredArticle>, StoreError>;

    async fn find_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<StoredArticle>, StoreError>;

    /// Rows of `kind` from any of `sources` listed at or after `since`.
    async fn recent_in_sources(
        &self,
        sources: &[String],
        kind: ItemKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredArticle>, StoreError>;

    async fn insert(&self, article: NewArticle) -> Result<StoredArticle, StoreError>;

    async fn update(&self, id: Uuid, changes: ArticleChanges) -> Result<StoredArticle, StoreError>;

    async fn record_session(&self, session: &ScrapeSession) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ArticleFilter {
    pub source: Option<String>,
    pub kind: Option<ItemKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub start_hour: Option<u32>,
    pub end_hour: Option<u32>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl ArticleFilter {
    pub const DEFAULT_PER_PAGE: usize = 20;
    pub const MAX_PER_PAGE: usize = 200;

    pub fn per_page(&self) -> usize {
        self.per_page
            .unwrap_or(Self::DEFAULT_PER_PAGE)
            .clamp(1, Self::MAX_PER_PAGE)
    }

    pub fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    /// Inclusive hour range; wraps past midnight when `start_hour > end_hour`.
    pub fn hour_matches(&self, hour: u32) -> bool {
        match (self.start_hour, self.end_hour) {
            (Some(start), Some(end)) if start <= end => (start..=end).contains(&hour),
            (Some(start), Some(end)) => hour >= start || hour <= end,
            (Some(start), None) => hour >= start,
            (None, Some(end)) => hour <= end,
            (None, None) => true,
        }
    }

    pub fn matches(&self, article: &StoredArticle) -> bool {
        let listed_at = article.listed_at();
        self.source.as_ref().map_or(true, |s| &article.source == s)
            && self.kind.map_or(true, |k| article.kind == k)
            && self.from.map_or(true, |from| listed_at >= from)
            && self.to.map_or(true, |to| listed_at < to)
            && self.hour_matches(listed_at.hour())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticlePage {
    pub items: Vec<StoredArticle>,
    pub total: u64,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

impl ArticlePage {
    fn new(items: Vec<StoredArticle>, total: u64, filter: &ArticleFilter) -> Self {
        let per_page = filter.per_page();
        let total_pages = (total as usize).max(1).div_ceil(per_page);
        Self {
            items,
            total,
            page: filter.page(),
            per_page,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub article: StoredArticle,
    pub rank: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub day: NaiveDate,
    pub source: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyCount {
    pub hour: u32,
    pub count: i64,
}

/// Read-only queries for the presentation layer.
#[async_trait]
pub trait ArticleQueries: Send + Sync {
    async fn list_articles(&self, filter: &ArticleFilter) -> Result<ArticlePage, StoreError>;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError>;
    async fn source_counts(&self) -> Result<Vec<SourceCount>, StoreError>;
    async fn daily_counts(&self, filter: &ArticleFilter) -> Result<Vec<DailyCount>, StoreError>;
    async fn hourly_counts(&self, filter: &ArticleFilter) -> Result<Vec<HourlyCount>, StoreError>;
    async fn recent_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    articles: HashMap<Uuid, StoredArticle>,
    by_link: HashMap<NormalizedUrl, Uuid>,
    by_hash: HashMap<ContentFingerprint, Uuid>,
    sessions: Vec<ScrapeSession>,
}

/// Process-local store with the same uniqueness rules as the Postgres schema.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn article_count(&self) -> usize {
        self.state.lock().await.articles.len()
    }

    pub async fn all_articles(&self) -> Vec<StoredArticle> {
        let state = self.state.lock().await;
        let mut rows = state.articles.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.link.cmp(&b.link)));
        rows
    }

    pub async fn sessions(&self) -> Vec<ScrapeSession> {
        self.state.lock().await.sessions.clone()
    }

    fn sorted_matching(state: &MemoryState, filter: &ArticleFilter) -> Vec<StoredArticle> {
        let mut rows = state
            .articles
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.listed_at()
                .cmp(&a.listed_at())
                .then(b.created_at.cmp(&a.created_at))
        });
        rows
    }
}

fn term_hits(text: Option<&str>, terms: &[String]) -> Vec<usize> {
    let folded = text.map(fold_title).unwrap_or_default();
    let tokens = folded.split_whitespace().collect::<Vec<_>>();
    terms
        .iter()
        .map(|term| tokens.iter().filter(|t| **t == term.as_str()).count())
        .collect()
}

#[async_trait]
impl ArticleStore for InMemoryStore {
    async fn find_by_link(&self, link: &NormalizedUrl) -> Result<Option<StoredArticle>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .by_link
            .get(link)
            .and_then(|id| state.articles.get(id))
            .cloned())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<StoredArticle>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .by_hash
            .get(fingerprint)
            .and_then(|id| state.articles.get(id))
            .cloned())
    }

    async fn recent_in_sources(
        &self,
        sources: &[String],
        kind: ItemKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredArticle>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .articles
            .values()
            .filter(|a| a.kind == kind && sources.contains(&a.source) && a.listed_at() >= since)
            .cloned()
            .collect())
    }

    async fn insert(&self, article: NewArticle) -> Result<StoredArticle, StoreError> {
        let mut state = self.state.lock().await;
        if state.by_link.contains_key(&article.link) {
            return Err(StoreError::Conflict {
                key: UniqueKey::Link,
            });
        }
        if state.by_hash.contains_key(&article.content_hash) {
            return Err(StoreError::Conflict {
                key: UniqueKey::ContentHash,
            });
        }

        let stored = StoredArticle {
            id: Uuid::new_v4(),
            kind: article.kind,
            title: article.title,
            summary: article.summary,
            content: article.content,
            link: article.link,
            source: article.source,
            published_at: article.published_at,
            created_at: article.created_at,
            updated_at: article.updated_at,
            content_hash: article.content_hash,
        };
        state.by_link.insert(stored.link.clone(), stored.id);
        state.by_hash.insert(stored.content_hash.clone(), stored.id);
        state.articles.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: Uuid, changes: ArticleChanges) -> Result<StoredArticle, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(owner) = state.by_hash.get(&changes.content_hash) {
            if *owner != id {
                return Err(StoreError::Conflict {
                    key: UniqueKey::ContentHash,
                });
            }
        }

        let article = state.articles.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let previous_hash = std::mem::replace(&mut article.content_hash, changes.content_hash);
        article.title = changes.title;
        article.summary = changes.summary;
        article.content = changes.content;
        if article.published_at.is_none() {
            article.published_at = changes.published_at;
        }
        article.updated_at = changes.updated_at;
        let updated = article.clone();

        state.by_hash.remove(&previous_hash);
        state.by_hash.insert(updated.content_hash.clone(), id);
        Ok(updated)
    }

    async fn record_session(&self, session: &ScrapeSession) -> Result<(), StoreError> {
        self.state.lock().await.sessions.push(session.clone());
        Ok(())
    }
}

#[async_trait]
impl ArticleQueries for InMemoryStore {
    async fn list_articles(&self, filter: &ArticleFilter) -> Result<ArticlePage, StoreError> {
        let state = self.state.lock().await;
        let rows = Self::sorted_matching(&state, filter);
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip((filter.page() - 1) * filter.per_page())
            .take(filter.per_page())
            .collect();
        Ok(ArticlePage::new(items, total, filter))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let terms = fold_title(query)
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.lock().await;
        let mut hits = Vec::new();
        for article in state.articles.values() {
            let title = term_hits(Some(&article.title), &terms);
            let summary = term_hits(article.summary.as_deref(), &terms);
            let content = term_hits(article.content.as_deref(), &terms);
            let all_terms_present =
                (0..terms.len()).all(|i| title[i] + summary[i] + content[i] > 0);
            if !all_terms_present {
                continue;
            }
            let weighted: usize = (0..terms.len())
                .map(|i| title[i] * 3 + summary[i] * 2 + content[i])
                .sum();
            hits.push(SearchHit {
                article: article.clone(),
                rank: weighted as f64 / terms.len() as f64,
            });
        }
        hits.sort_by(|a, b| {
            b.rank
                .total_cmp(&a.rank)
                .then(b.article.listed_at().cmp(&a.article.listed_at()))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn source_counts(&self) -> Result<Vec<SourceCount>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = std::collections::BTreeMap::<String, i64>::new();
        for article in state.articles.values() {
            *counts.entry(article.source.clone()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(source, count)| SourceCount { source, count })
            .collect())
    }

    async fn daily_counts(&self, filter: &ArticleFilter) -> Result<Vec<DailyCount>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = std::collections::BTreeMap::<(NaiveDate, String), i64>::new();
        for article in state.articles.values().filter(|a| filter.matches(a)) {
            *counts
                .entry((article.listed_at().date_naive(), article.source.clone()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((day, source), count)| DailyCount { day, source, count })
            .collect())
    }

    async fn hourly_counts(&self, filter: &ArticleFilter) -> Result<Vec<HourlyCount>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = std::collections::BTreeMap::<u32, i64>::new();
        for article in state.articles.values().filter(|a| filter.matches(a)) {
            *counts.entry(article.listed_at().hour()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(hour, count)| HourlyCount { hour, count })
            .collect())
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>, StoreError> {
        let state = self.state.lock().await;
        let mut sessions = state.sessions.clone();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }
}

const ARTICLE_COLUMNS: &str = "id, kind, title, summary, content, link, source, published_at, \
     created_at, updated_at, content_hash";
const LISTED_AT: &str = "COALESCE(published_at, created_at)";
const LISTED_HOUR: &str = "EXTRACT(HOUR FROM COALESCE(published_at, created_at) AT TIME ZONE 'UTC')::int";

/// Postgres-backed gateway; uniqueness comes from the schema in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &ArticleFilter) {
        qb.push(" WHERE TRUE");
        if let Some(source) = &filter.source {
            qb.push(" AND source = ").push_bind(source.clone());
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(from) = filter.from {
            qb.push(format!(" AND {LISTED_AT} >= ")).push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(format!(" AND {LISTED_AT} < ")).push_bind(to);
        }
        match (filter.start_hour, filter.end_hour) {
            (Some(start), Some(end)) if start <= end => {
                qb.push(format!(" AND {LISTED_HOUR} BETWEEN "))
                    .push_bind(start as i32)
                    .push(" AND ")
                    .push_bind(end as i32);
            }
            (Some(start), Some(end)) => {
                qb.push(format!(" AND ({LISTED_HOUR} >= "))
                    .push_bind(start as i32)
                    .push(format!(" OR {LISTED_HOUR} <= "))
                    .push_bind(end as i32)
                    .push(")");
            }
            (Some(start), None) => {
                qb.push(format!(" AND {LISTED_HOUR} >= ")).push_bind(start as i32);
            }
            (None, Some(end)) => {
                qb.push(format!(" AND {LISTED_HOUR} <= ")).push_bind(end as i32);
            }
            (None, None) => {}
        }
    }
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn article_from_row(row: &PgRow) -> Result<StoredArticle, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    Ok(StoredArticle {
        id: row.try_get("id")?,
        kind: ItemKind::parse(&kind).ok_or_else(|| decode_error(format!("unknown kind {kind}")))?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        content: row.try_get("content")?,
        link: NormalizedUrl::from_stored(row.try_get::<String, _>("link")?),
        source: row.try_get("source")?,
        published_at: row.try_get("published_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        content_hash: ContentFingerprint::from_stored(row.try_get::<String, _>("content_hash")?),
    })
}

fn count_from_column(row: &PgRow, column: &str) -> Result<u32, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    Ok(u32::try_from(value).unwrap_or(u32::MAX))
}

fn session_from_row(row: &PgRow) -> Result<ScrapeSession, sqlx::Error> {
    let trigger: String = row.try_get("trigger")?;
    let method_used: Option<String> = row.try_get("method_used")?;
    let method_used = match method_used.as_deref() {
        None => None,
        Some("feed") => Some(FetchMethod::Feed),
        Some("page") => Some(FetchMethod::Page),
        Some("session") => Some(FetchMethod::Session),
        Some(other) => return Err(decode_error(format!("unknown fetch method {other}"))),
    };
    let duration_ms: i64 = row.try_get("duration_ms")?;
    Ok(ScrapeSession {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        trigger: RunTrigger::parse(&trigger)
            .ok_or_else(|| decode_error(format!("unknown trigger {trigger}")))?,
        query: row.try_get("query")?,
        method_used,
        items_found: count_from_column(row, "items_found")?,
        items_new: count_from_column(row, "items_new")?,
        items_updated: count_from_column(row, "items_updated")?,
        items_duplicate: count_from_column(row, "items_duplicate")?,
        items_flagged: count_from_column(row, "items_flagged")?,
        items_invalid: count_from_column(row, "items_invalid")?,
        duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
        success: row.try_get("success")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl ArticleStore for PgStore {
    async fn find_by_link(&self, link: &NormalizedUrl) -> Result<Option<StoredArticle>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM news_articles WHERE link = $1"
        ))
        .bind(link.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(article_from_row).transpose()?)
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &ContentFingerprint,
    ) -> Result<Option<StoredArticle>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM news_articles WHERE content_hash = $1"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(article_from_row).transpose()?)
    }

    async fn recent_in_sources(
        &self,
        sources: &[String],
        kind: ItemKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredArticle>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM news_articles \
             WHERE source = ANY($1) AND kind = $2 AND {LISTED_AT} >= $3"
        ))
        .bind(sources.to_vec())
        .bind(kind.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(article_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn insert(&self, article: NewArticle) -> Result<StoredArticle, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO news_articles ({ARTICLE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {ARTICLE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(article.kind.as_str())
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.content)
        .bind(article.link.as_str())
        .bind(&article.source)
        .bind(article.published_at)
        .bind(article.created_at)
        .bind(article.updated_at)
        .bind(article.content_hash.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(article_from_row(&row)?)
    }

    async fn update(&self, id: Uuid, changes: ArticleChanges) -> Result<StoredArticle, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE news_articles \
                SET title = $2, summary = $3, content = $4, \
                    published_at = COALESCE(published_at, $5), \
                    content_hash = $6, updated_at = $7 \
              WHERE id = $1 \
             RETURNING {ARTICLE_COLUMNS}"
        ))
        .bind(id)
        .bind(&changes.title)
        .bind(&changes.summary)
        .bind(&changes.content)
        .bind(changes.published_at)
        .bind(changes.content_hash.as_str())
        .bind(changes.updated_at)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(article_from_row(&row)?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn record_session(&self, session: &ScrapeSession) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_sessions (
                id, source, trigger, query, method_used,
                items_found, items_new, items_updated, items_duplicate, items_flagged, items_invalid,
                duration_ms, success, error_message, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(session.id)
        .bind(&session.source)
        .bind(session.trigger.as_str())
        .bind(&session.query)
        .bind(session.method_used.map(|m| m.as_str()))
        .bind(i64::from(session.items_found))
        .bind(i64::from(session.items_new))
        .bind(i64::from(session.items_updated))
        .bind(i64::from(session.items_duplicate))
        .bind(i64::from(session.items_flagged))
        .bind(i64::from(session.items_invalid))
        .bind(i64::try_from(session.duration_ms).unwrap_or(i64::MAX))
        .bind(session.success)
        .bind(&session.error_message)
        .bind(session.started_at)
        .bind(session.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ArticleQueries for PgStore {
    async fn list_articles(&self, filter: &ArticleFilter) -> Result<ArticlePage, StoreError> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM news_articles");
        Self::push_filters(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ARTICLE_COLUMNS} FROM news_articles"
        ));
        Self::push_filters(&mut qb, filter);
        qb.push(format!(" ORDER BY {LISTED_AT} DESC, created_at DESC LIMIT "))
            .push_bind(filter.per_page() as i64)
            .push(" OFFSET ")
            .push_bind(((filter.page() - 1) * filter.per_page()) as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(article_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ArticlePage::new(
            items,
            u64::try_from(total).unwrap_or_default(),
            filter,
        ))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS}, ts_rank(search_vector, plainto_tsquery('simple', $1)) AS rank \
               FROM news_articles \
              WHERE search_vector @@ plainto_tsquery('simple', $1) \
              ORDER BY rank DESC, {LISTED_AT} DESC \
              LIMIT $2"
        ))
        .bind(query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f32 = row.try_get("rank")?;
            hits.push(SearchHit {
                article: article_from_row(row)?,
                rank: f64::from(rank),
            });
        }
        Ok(hits)
    }

    async fn source_counts(&self) -> Result<Vec<SourceCount>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, COUNT(*) AS count FROM news_articles GROUP BY source ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SourceCount {
                source: row.try_get("source")?,
                count: row.try_get("count")?,
            });
        }
        Ok(out)
    }

    async fn daily_counts(&self, filter: &ArticleFilter) -> Result<Vec<DailyCount>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT ({LISTED_AT} AT TIME ZONE 'UTC')::date AS day, source, COUNT(*) AS count \
             FROM news_articles"
        ));
        Self::push_filters(&mut qb, filter);
        qb.push(" GROUP BY day, source ORDER BY day, source");
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DailyCount {
                day: row.try_get("day")?,
                source: row.try_get("source")?,
                count: row.try_get("count")?,
            });
        }
        Ok(out)
    }

    async fn hourly_counts(&self, filter: &ArticleFilter) -> Result<Vec<HourlyCount>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {LISTED_HOUR} AS hour, COUNT(*) AS count FROM news_articles"
        ));
        Self::push_filters(&mut qb, filter);
        qb.push(" GROUP BY hour ORDER BY hour");
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let hour: i32 = row.try_get("hour")?;
            out.push(HourlyCount {
                hour: u32::try_from(hour).unwrap_or_default(),
                count: row.try_get("count")?,
            });
        }
        Ok(out)
    }

    async fn recent_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>, StoreError> {
        let rows = sqlx::query("SELECT * FROM scrape_sessions ORDER BY started_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Concurrent requests per source unless the source overrides it.
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Request budget per source unless the source overrides it. Each source gets its own bucket.
    pub token_bucket: Option<TokenBucketConfig>,
    pub source_limits: HashMap<String, SourceLimits>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
            source_limits: HashMap::new(),
        }
    }
}

/// Per-source overrides of the fetcher-wide defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLimits {
    pub concurrency: Option<usize>,
    pub token_bucket: Option<TokenBucketConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// `requests_per_minute` spread evenly, with up to `burst` requests back to back. Zero means unlimited.
    pub fn per_minute(requests_per_minute: u32, burst: u32) -> Option<Self> {
        if requests_per_minute == 0 {
            return None;
        }
        Some(Self {
            capacity: burst.max(1),
            refill_every: Duration::from_secs(60) / requests_per_minute,
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// GET request with extra headers (session cookies, accept types).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http fetcher closed")]
    Closed,
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

#[derive(Debug, Clone)]
struct SourceLimiter {
    permits: Arc<Semaphore>,
    bucket: Option<Arc<SimpleTokenBucket>>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    token_bucket: Option<TokenBucketConfig>,
    source_limits: HashMap<String, SourceLimits>,
    per_source: Mutex<HashMap<String, SourceLimiter>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            token_bucket: config.token_bucket,
            source_limits: config.source_limits,
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    /// Effective concurrency and request budget of one source.
    fn limits_for(&self, source: &str) -> (usize, Option<TokenBucketConfig>) {
        let limits = self.source_limits.get(source).copied().unwrap_or_default();
        (
            limits.concurrency.unwrap_or(self.per_source_limit).max(1),
            limits.token_bucket.or(self.token_bucket),
        )
    }

    async fn source_limiter(&self, source: &str) -> SourceLimiter {
        let mut map = self.per_source.lock().await;
        if let Some(limiter) = map.get(source) {
            return limiter.clone();
        }
        let (concurrency, bucket) = self.limits_for(source);
        debug!(source, concurrency, rate_limited = bucket.is_some(), "source limiter created");
        let limiter = SourceLimiter {
            permits: Arc::new(Semaphore::new(concurrency)),
            bucket: bucket.map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every))),
        };
        map.insert(source.to_string(), limiter.clone());
        limiter
    }

    /// Fetches under the global and per-source limits, retrying transient failures with backoff.
    pub async fn fetch(
        &self,
        source: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, HttpError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;
        let limiter = self.source_limiter(source).await;
        let _source = limiter.permits.acquire().await.map_err(|_| HttpError::Closed)?;

        if let Some(bucket) = &limiter.bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source, url = %request.url);
        self.fetch_with_retries(request).instrument(span).await
    }

    async fn fetch_with_retries(&self, request: &FetchRequest) -> Result<FetchedResponse, HttpError> {
        let mut attempt = 0usize;
        loop {
            let mut builder = self.client.get(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "transient request failure");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}
