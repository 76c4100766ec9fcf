//! Ingestion pipeline: source registry, duplicate resolution, write decisions,
//! per-source runs and their schedules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use newsdesk_adapters::{AdapterError, FetchContext, MethodSettings, SourceAdapter, Strategy};
use newsdesk_core::{
    fold_title, ContentFingerprint, FetchMethod, IdentifiedItem, ItemKind, RawItem, RunTrigger,
    ScrapeSession, StoredArticle,
};
use newsdesk_storage::{
    ArticleChanges, ArticleQueries, ArticleStore, HttpClientConfig, HttpFetcher, InMemoryStore,
    NewArticle, PgStore, SourceLimits, StoreError, TokenBucketConfig, UniqueKey,
};
use serde::Deserialize;
use strsim::normalized_levenshtein;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsdesk-sync";

/// Resolution attempts per item before a write conflict is reported as unresolved.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTrigger {
    #[default]
    Poll,
    OnDemand,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_minutes() -> u64 {
    120
}

/// Request limits of one source; unset fields fall back to the fetcher-wide defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    /// Requests allowed back to back before pacing starts.
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimit {
    pub fn source_limits(&self) -> SourceLimits {
        SourceLimits {
            concurrency: self.max_concurrent,
            token_bucket: self
                .requests_per_minute
                .and_then(|rpm| TokenBucketConfig::per_minute(rpm, self.burst.unwrap_or(1))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger: SourceTrigger,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    pub primary: FetchMethod,
    #[serde(default)]
    pub secondary: Option<FetchMethod>,
    #[serde(default)]
    pub strategy: Strategy,
    /// Sources whose recent titles are compared with this source's for near-duplicates.
    #[serde(default)]
    pub related_sources: Vec<String>,
    #[serde(default)]
    pub min_title_chars: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(flatten)]
    pub methods: MethodSettings,
}

impl SourceConfig {
    pub fn is_scheduled(&self) -> bool {
        self.enabled && self.trigger == SourceTrigger::Poll
    }

    /// Sources searched by the near-duplicate tier: this one first, then related ones.
    pub fn scope(&self) -> Vec<String> {
        let mut scope = vec![self.name.clone()];
        for related in &self.related_sources {
            if !scope.contains(related) {
                scope.push(related.clone());
            }
        }
        scope
    }

    pub fn build_adapter(&self) -> Result<SourceAdapter, AdapterError> {
        Ok(SourceAdapter::from_settings(
            &self.name,
            self.strategy,
            self.primary,
            self.secondary,
            &self.methods,
        )?
        .with_min_title_chars(self.min_title_chars))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// Loads and validates a registry file. Relative fixture paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&text, base).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_yaml(text: &str, fixture_base: &Path) -> Result<Self> {
        let mut registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        for source in &mut registry.sources {
            source.methods.resolve_fixtures(fixture_base);
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                bail!("source with an empty name");
            }
            if !names.insert(source.name.as_str()) {
                bail!("duplicate source name {}", source.name);
            }
            if source.interval_minutes == 0 {
                bail!("source {} has a zero interval", source.name);
            }
            if source.rate_limit.and_then(|r| r.max_concurrent) == Some(0) {
                bail!("source {} allows zero concurrent requests", source.name);
            }
            if source.secondary == Some(source.primary) {
                bail!(
                    "source {} uses `{}` as both primary and secondary",
                    source.name,
                    source.primary
                );
            }
            for method in std::iter::once(source.primary).chain(source.secondary) {
                if !source.methods.has(method) {
                    bail!(
                        "source {} uses `{method}` but has no `{method}` settings block",
                        source.name
                    );
                }
            }
        }
        for source in &self.sources {
            for related in &source.related_sources {
                if !names.contains(related.as_str()) {
                    bail!("source {} lists unknown related source {related}", source.name);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Per-source HTTP overrides keyed by source name.
    pub fn source_limits(&self) -> HashMap<String, SourceLimits> {
        self.sources
            .iter()
            .filter_map(|s| s.rate_limit.map(|r| (s.name.clone(), r.source_limits())))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    /// Minimum normalized Levenshtein similarity of folded titles.
    pub threshold: f64,
    pub window_hours: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            window_hours: 48,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Absent means the process-local store.
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub fast_interval: bool,
    pub fast_interval_minutes: u64,
    pub initial_delay_secs: u64,
    pub item_concurrency: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_concurrency: usize,
    /// Default concurrent requests per source.
    pub source_concurrency: usize,
    /// Default request budget per source; zero means unlimited.
    pub source_requests_per_minute: u32,
    pub dedup: DedupConfig,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        None => default,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = DedupConfig::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            sources_path: lookup("NEWSDESK_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            fast_interval: lookup("NEWSDESK_FAST_INTERVAL")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            fast_interval_minutes: parse_or(&lookup, "NEWSDESK_FAST_INTERVAL_MINUTES", 2),
            initial_delay_secs: parse_or(&lookup, "NEWSDESK_INITIAL_DELAY_SECS", 30),
            item_concurrency: parse_or(&lookup, "NEWSDESK_ITEM_CONCURRENCY", 4),
            user_agent: lookup("NEWSDESK_USER_AGENT")
                .unwrap_or_else(|| "newsdesk-bot/0.1".to_string()),
            http_timeout_secs: parse_or(&lookup, "NEWSDESK_HTTP_TIMEOUT_SECS", 20),
            http_concurrency: parse_or(&lookup, "NEWSDESK_HTTP_CONCURRENCY", 16),
            source_concurrency: parse_or(&lookup, "NEWSDESK_SOURCE_CONCURRENCY", 2),
            source_requests_per_minute: parse_or(&lookup, "NEWSDESK_SOURCE_RPM", 0),
            dedup: DedupConfig {
                threshold: parse_or(&lookup, "NEWSDESK_DEDUP_THRESHOLD", defaults.threshold),
                window_hours: parse_or(&lookup, "NEWSDESK_DEDUP_WINDOW_HOURS", defaults.window_hours),
            },
            web_port: parse_or(&lookup, "NEWSDESK_WEB_PORT", 8000),
        }
    }

    /// Interval override applied to every poll source in fast mode.
    pub fn fast_interval_minutes(&self) -> Option<u64> {
        self.fast_interval.then_some(self.fast_interval_minutes.max(1))
    }

    pub fn http_client_config(&self, registry: &SourceRegistry) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.http_concurrency,
            per_source_concurrency: self.source_concurrency,
            token_bucket: TokenBucketConfig::per_minute(self.source_requests_per_minute, 1),
            source_limits: registry.source_limits(),
            ..Default::default()
        }
    }
}

pub struct StoreHandles {
    pub store: Arc<dyn ArticleStore>,
    pub queries: Arc<dyn ArticleQueries>,
    pub backend: &'static str,
}

/// Opens Postgres (running pending migrations) when `DATABASE_URL` is set, else a memory store.
pub async fn open_store(config: &SyncConfig) -> Result<StoreHandles> {
    match &config.database_url {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url).await?);
            store.migrate().await?;
            Ok(StoreHandles {
                store: store.clone(),
                queries: store,
                backend: "postgres",
            })
        }
        None => {
            warn!("DATABASE_URL not set; articles are kept in memory only");
            let store = Arc::new(InMemoryStore::new());
            Ok(StoreHandles {
                store: store.clone(),
                queries: store,
                backend: "memory",
            })
        }
    }
}

/// Classification of one incoming item against stored state.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    New,
    SameUrl(StoredArticle),
    SameContentDifferentUrl(StoredArticle),
    /// Near-identical title from the same or a related source; reported, never merged.
    ProbableDuplicate {
        candidate: StoredArticle,
        similarity: f64,
    },
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::SameUrl(_) => "same_url",
            Self::SameContentDifferentUrl(_) => "same_content_different_url",
            Self::ProbableDuplicate { .. } => "probable_duplicate",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateResolver {
    config: DedupConfig,
}

impl DuplicateResolver {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub async fn resolve(
        &self,
        store: &dyn ArticleStore,
        item: &IdentifiedItem,
        scope: &[String],
    ) -> Result<Verdict, StoreError> {
        if let Some(stored) = store.find_by_link(&item.link).await? {
            return Ok(Verdict::SameUrl(stored));
        }
        if let Some(stored) = store.find_by_fingerprint(&item.fingerprint).await? {
            return Ok(Verdict::SameContentDifferentUrl(stored));
        }
        // Distinct people share names, so profiles stop at the exact tiers.
        if item.raw.kind != ItemKind::Article {
            return Ok(Verdict::New);
        }

        let folded = fold_title(item.title());
        if folded.is_empty() {
            return Ok(Verdict::New);
        }
        let since = item.raw.reference_time() - self.config.window();
        let candidates = store
            .recent_in_sources(scope, ItemKind::Article, since)
            .await?;

        let mut best: Option<(f64, StoredArticle)> = None;
        for candidate in candidates {
            let similarity = normalized_levenshtein(&folded, &fold_title(&candidate.title));
            if similarity < self.config.threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some((score, current)) => {
                    similarity > *score
                        || (similarity == *score && published_earlier(&candidate, current))
                }
            };
            if better {
                best = Some((similarity, candidate));
            }
        }

        Ok(match best {
            Some((similarity, candidate)) => Verdict::ProbableDuplicate {
                candidate,
                similarity,
            },
            None => Verdict::New,
        })
    }
}

/// Undated rows sort after dated ones.
fn published_earlier(a: &StoredArticle, b: &StoredArticle) -> bool {
    match (a.published_at, b.published_at) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Inserted(Uuid),
    Updated(Uuid),
    /// Stored content already matches; nothing written.
    Skipped(Uuid),
    Flagged { candidate: Uuid, similarity: f64 },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("write conflicts for {link} did not settle after {attempts} attempts")]
    Unresolved { link: String, attempts: usize },
}

/// Turns verdicts into INSERT / UPDATE / SKIP / FLAG through the store.
pub struct IngestEngine {
    store: Arc<dyn ArticleStore>,
    resolver: DuplicateResolver,
}

impl IngestEngine {
    pub fn new(store: Arc<dyn ArticleStore>, resolver: DuplicateResolver) -> Self {
        Self { store, resolver }
    }

    pub async fn ingest(
        &self,
        item: &IdentifiedItem,
        scope: &[String],
    ) -> Result<Outcome, IngestError> {
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            let verdict = self
                .resolver
                .resolve(self.store.as_ref(), item, scope)
                .await?;
            debug!(link = %item.link, verdict = verdict.label(), attempt, "resolved");

            match verdict {
                Verdict::New => {
                    let now = Utc::now();
                    let article = NewArticle {
                        kind: item.raw.kind,
                        title: item.title().to_string(),
                        summary: item.raw.summary.clone(),
                        content: item.raw.content.clone(),
                        link: item.link.clone(),
                        source: item.raw.source.clone(),
                        published_at: item.raw.published_at,
                        created_at: now,
                        updated_at: now,
                        content_hash: ContentFingerprint::compute(
                            item.raw.title.as_deref(),
                            item.raw.summary.as_deref(),
                            Some(item.link.as_str()),
                        ),
                    };
                    match self.store.insert(article).await {
                        Ok(stored) => return Ok(Outcome::Inserted(stored.id)),
                        Err(StoreError::Conflict { key }) => {
                            debug!(link = %item.link, %key, "insert lost a race; re-resolving");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Verdict::SameUrl(stored) | Verdict::SameContentDifferentUrl(stored) => {
                    if stored.content_hash == item.fingerprint {
                        return Ok(Outcome::Skipped(stored.id));
                    }
                    let changes = ArticleChanges {
                        title: item.title().to_string(),
                        summary: item.raw.summary.clone(),
                        content: item.raw.content.clone(),
                        published_at: item.raw.published_at,
                        content_hash: ContentFingerprint::compute(
                            item.raw.title.as_deref(),
                            item.raw.summary.as_deref(),
                            Some(stored.link.as_str()),
                        ),
                        updated_at: item.raw.effective_timestamp(),
                    };
                    match self.store.update(stored.id, changes).await {
                        Ok(updated) => return Ok(Outcome::Updated(updated.id)),
                        // Another row already holds this content.
                        Err(StoreError::Conflict {
                            key: UniqueKey::ContentHash,
                        }) => return Ok(Outcome::Skipped(stored.id)),
                        Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound(_)) => {
                            debug!(link = %item.link, "stored row changed underneath; re-resolving");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Verdict::ProbableDuplicate {
                    candidate,
                    similarity,
                } => {
                    warn!(
                        source = %item.raw.source,
                        incoming_title = item.title(),
                        stored_title = %candidate.title,
                        stored_source = %candidate.source,
                        similarity,
                        "probable duplicate flagged for review"
                    );
                    return Ok(Outcome::Flagged {
                        candidate: candidate.id,
                        similarity,
                    });
                }
            }
        }
        Err(IngestError::Unresolved {
            link: item.link.to_string(),
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(ScrapeSession),
    /// The previous run of the source was still active.
    AlreadyRunning,
}

impl RunOutcome {
    pub fn session(&self) -> Option<&ScrapeSession> {
        match self {
            Self::Completed(session) => Some(session),
            Self::AlreadyRunning => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("source {0} needs a query")]
    QueryRequired(String),
}

struct PipelineSource {
    config: SourceConfig,
    adapter: SourceAdapter,
    scope: Vec<String>,
    run_lock: Mutex<()>,
}

pub struct SyncPipeline {
    store: Arc<dyn ArticleStore>,
    http: HttpFetcher,
    engine: IngestEngine,
    sources: BTreeMap<String, PipelineSource>,
    item_concurrency: usize,
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn ArticleStore>, http: HttpFetcher, config: &SyncConfig) -> Self {
        let engine = IngestEngine::new(store.clone(), DuplicateResolver::new(config.dedup));
        Self {
            store,
            http,
            engine,
            sources: BTreeMap::new(),
            item_concurrency: config.item_concurrency.max(1),
        }
    }

    pub fn from_registry(
        registry: &SourceRegistry,
        store: Arc<dyn ArticleStore>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config(registry))?;
        let mut pipeline = Self::new(store, http, config);
        for source in &registry.sources {
            let adapter = source
                .build_adapter()
                .with_context(|| format!("building adapter for {}", source.name))?;
            pipeline.register(source.clone(), adapter);
        }
        Ok(pipeline)
    }

    pub fn register(&mut self, config: SourceConfig, adapter: SourceAdapter) {
        let scope = config.scope();
        self.sources.insert(
            config.name.clone(),
            PipelineSource {
                config,
                adapter,
                scope,
                run_lock: Mutex::new(()),
            },
        );
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.values().map(|s| &s.config)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.get(name).map(|s| &s.config)
    }

    /// Runs one source once. Overlapping runs of the same source are skipped.
    pub async fn run_source(
        &self,
        name: &str,
        trigger: RunTrigger,
        query: Option<&str>,
    ) -> Result<RunOutcome, PipelineError> {
        let source = self
            .sources
            .get(name)
            .ok_or_else(|| PipelineError::UnknownSource(name.to_string()))?;
        let Ok(_guard) = source.run_lock.try_lock() else {
            info!(source = name, trigger = trigger.as_str(), "previous run still active; skipping");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let span = info_span!("scrape_run", source = name, trigger = trigger.as_str());
        let session = self.execute(source, trigger, query).instrument(span).await;
        Ok(RunOutcome::Completed(session))
    }

    /// Runs a source outside its schedule. On-demand sources need a query; poll sources run as manual.
    pub async fn run_on_demand(
        &self,
        name: &str,
        query: Option<&str>,
    ) -> Result<RunOutcome, PipelineError> {
        let source = self
            .source(name)
            .ok_or_else(|| PipelineError::UnknownSource(name.to_string()))?;
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let trigger = match source.trigger {
            SourceTrigger::OnDemand => RunTrigger::OnDemand,
            SourceTrigger::Poll => RunTrigger::Manual,
        };
        if trigger == RunTrigger::OnDemand && query.is_none() {
            return Err(PipelineError::QueryRequired(name.to_string()));
        }
        self.run_source(name, trigger, query).await
    }

    /// Resolves once no run of any source is in flight.
    pub async fn wait_idle(&self) {
        for source in self.sources.values() {
            let _idle = source.run_lock.lock().await;
        }
    }

    /// Runs every enabled poll source concurrently; one session per source.
    pub async fn run_all_once(&self, trigger: RunTrigger) -> Vec<ScrapeSession> {
        let names = self
            .sources()
            .filter(|s| s.is_scheduled())
            .map(|s| s.name.clone())
            .collect::<Vec<_>>();
        let outcomes = join_all(names.iter().map(|n| self.run_source(n, trigger, None))).await;
        outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Ok(RunOutcome::Completed(session)) => Some(session),
                Ok(RunOutcome::AlreadyRunning) => None,
                Err(err) => {
                    error!(error = %err, "source run rejected");
                    None
                }
            })
            .collect()
    }

    async fn execute(
        &self,
        source: &PipelineSource,
        trigger: RunTrigger,
        query: Option<&str>,
    ) -> ScrapeSession {
        let name = source.config.name.as_str();
        let mut session = ScrapeSession::begin(name, trigger, query.map(str::to_string), Utc::now());
        let ctx = FetchContext {
            run_id: session.id,
            source: name,
            fetched_at: session.started_at,
            query,
            http: &self.http,
        };

        let failure = match source.adapter.fetch(&ctx).await {
            Err(err) => {
                warn!(error = %err, "every retrieval method failed");
                Some(err.to_string())
            }
            Ok(batch) => {
                if let Some(reason) = &batch.fallback_reason {
                    info!(method = %batch.method_used, reason = %reason, "used secondary method");
                }
                session.method_used = Some(batch.method_used);
                session.items_found = (batch.items.len() + batch.collapsed) as u32;
                session.items_duplicate = batch.collapsed as u32;
                match self.ingest_batch(&mut session, batch.items, &source.scope).await {
                    Ok(()) => None,
                    Err(err) => {
                        error!(error = %err, "ingestion aborted");
                        Some(err.to_string())
                    }
                }
            }
        };

        session.close(Utc::now(), failure);
        if let Err(err) = self.store.record_session(&session).await {
            error!(error = %err, session = %session.id, "could not record scrape session");
        }
        info!(
            found = session.items_found,
            new = session.items_new,
            updated = session.items_updated,
            duplicate = session.items_duplicate,
            flagged = session.items_flagged,
            invalid = session.items_invalid,
            duration_ms = session.duration_ms,
            success = session.success,
            "scrape run finished"
        );
        session
    }

    async fn ingest_batch(
        &self,
        session: &mut ScrapeSession,
        items: Vec<RawItem>,
        scope: &[String],
    ) -> Result<(), IngestError> {
        let mut identified = Vec::with_capacity(items.len());
        for raw in items {
            match IdentifiedItem::identify(raw) {
                Ok(item) => identified.push(item),
                Err(err) => {
                    session.items_invalid += 1;
                    debug!(error = %err, "dropping invalid item");
                }
            }
        }

        let engine = &self.engine;
        let mut results = stream::iter(identified)
            .map(|item| async move { engine.ingest(&item, scope).await })
            .buffer_unordered(self.item_concurrency);
        while let Some(result) = results.next().await {
            match result? {
                Outcome::Inserted(_) => session.items_new += 1,
                Outcome::Updated(_) => session.items_updated += 1,
                Outcome::Skipped(_) => session.items_duplicate += 1,
                Outcome::Flagged { .. } => session.items_flagged += 1,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSource {
    pub name: String,
    pub every: Duration,
}

/// Enabled poll sources and their intervals; on-demand sources get no entry.
pub fn schedule_plan<'a>(
    sources: impl IntoIterator<Item = &'a SourceConfig>,
    fast_interval_minutes: Option<u64>,
) -> Vec<ScheduledSource> {
    sources
        .into_iter()
        .filter(|s| s.is_scheduled())
        .map(|s| ScheduledSource {
            name: s.name.clone(),
            every: Duration::from_secs(fast_interval_minutes.unwrap_or(s.interval_minutes).max(1) * 60),
        })
        .collect()
}

async fn run_scheduled(pipeline: &SyncPipeline, name: &str) {
    if let Err(err) = pipeline.run_source(name, RunTrigger::Scheduled, None).await {
        error!(source = name, error = %err, "scheduled run rejected");
    }
}

/// Owns one repeating job per scheduled source.
pub struct Orchestrator {
    pipeline: Arc<SyncPipeline>,
    scheduler: JobScheduler,
    plan: Vec<ScheduledSource>,
    jobs: Arc<Mutex<BTreeMap<String, Uuid>>>,
    initial_delay: Duration,
    initial_run: Option<JoinHandle<()>>,
    cancel_initial: Arc<Notify>,
}

impl Orchestrator {
    pub async fn new(pipeline: Arc<SyncPipeline>, config: &SyncConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let plan = schedule_plan(pipeline.sources(), config.fast_interval_minutes());
        Ok(Self {
            pipeline,
            scheduler,
            plan,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            initial_run: None,
            cancel_initial: Arc::new(Notify::new()),
        })
    }

    pub async fn scheduled_sources(&self) -> Vec<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    /// Registers the jobs, starts ticking, and queues one run per source after the initial delay.
    pub async fn start(&mut self) -> Result<()> {
        for entry in &self.plan {
            let pipeline = self.pipeline.clone();
            let name = entry.name.clone();
            let job = Job::new_repeated_async(entry.every, move |_id, _scheduler| {
                let pipeline = pipeline.clone();
                let name = name.clone();
                Box::pin(async move {
                    run_scheduled(&pipeline, &name).await;
                })
            })
            .with_context(|| format!("creating job for {}", entry.name))?;
            let id = self
                .scheduler
                .add(job)
                .await
                .with_context(|| format!("adding job for {}", entry.name))?;
            info!(source = %entry.name, every_secs = entry.every.as_secs(), "source scheduled");
            self.jobs.lock().await.insert(entry.name.clone(), id);
        }
        self.scheduler.start().await.context("starting scheduler")?;

        let pipeline = self.pipeline.clone();
        let jobs = self.jobs.clone();
        let delay = self.initial_delay;
        let cancel = self.cancel_initial.clone();
        self.initial_run = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.notified() => return,
            }
            let names = jobs.lock().await.keys().cloned().collect::<Vec<_>>();
            join_all(names.iter().map(|name| run_scheduled(&pipeline, name))).await;
        }));
        Ok(())
    }

    /// Stops future runs of one source. A run in flight is left to finish.
    pub async fn stop_source(&self, name: &str) -> Result<bool> {
        let Some(id) = self.jobs.lock().await.remove(name) else {
            return Ok(false);
        };
        self.scheduler
            .remove(&id)
            .await
            .with_context(|| format!("removing job for {name}"))?;
        info!(source = name, "source schedule stopped");
        Ok(true)
    }

    /// Stops all jobs and a pending initial run, then waits for runs already in flight to record their sessions.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.jobs.lock().await.clear();
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        self.cancel_initial.notify_one();
        if let Some(handle) = self.initial_run.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "initial run task failed");
            }
        }
        self.pipeline.wait_idle().await;
        info!("scheduler stopped");
        Ok(())
    }
}
