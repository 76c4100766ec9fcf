//! Retrieval methods (feed, page, authenticated session) and the per-source
//! primary/secondary adapter.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use futures::stream::{self, StreamExt};
use newsdesk_core::{
    collapse_whitespace, parse_timestamp, FetchMethod, ItemKind, NormalizedUrl, RawItem,
};
use newsdesk_storage::{FetchRequest, HttpError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsdesk-adapters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Http(HttpError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no items in response")]
    Empty,
    #[error("authenticated session rejected: {0}")]
    SessionRejected(String),
    #[error("reading fixture {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

impl From<HttpError> for FetchError {
    fn from(err: HttpError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}

#[derive(Debug)]
pub struct MethodFailure {
    pub method: FetchMethod,
    pub error: FetchError,
}

impl fmt::Display for MethodFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.method, self.error)
    }
}

fn describe_failures(failures: &[MethodFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("all retrieval methods failed for {source_name}: {}", describe_failures(.failures))]
    Exhausted {
        source_name: String,
        failures: Vec<MethodFailure>,
    },
    #[error("source {source_name} has no `{method}` settings block")]
    MissingSettings {
        source_name: String,
        method: FetchMethod,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Secondary runs only when the primary fails.
    #[default]
    Fallback,
    /// Both run; primary items win on link collisions.
    Combine,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedSettings {
    pub url: String,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageSettings {
    pub url: String,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    pub item_selector: String,
    pub title_selector: String,
    /// Defaults to the item itself when it is an anchor, else its first `a[href]`.
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default)]
    pub summary_selector: Option<String>,
    #[serde(default)]
    pub time_selector: Option<String>,
    /// Attribute holding the timestamp; element text is used when absent.
    #[serde(default)]
    pub time_attribute: Option<String>,
    /// Offset for wall-clock timestamps without a zone.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSettings {
    /// Profile URL with a `{handle}` placeholder.
    pub profile_url_template: String,
    /// Environment variable holding the session cookie header value.
    #[serde(default)]
    pub cookie_env: Option<String>,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    #[serde(default)]
    pub content_selector: Option<String>,
    /// Present only on the page served to signed-out visitors.
    #[serde(default)]
    pub login_wall_selector: Option<String>,
}

fn default_min_paragraph_chars() -> usize {
    20
}

fn default_article_concurrency() -> usize {
    4
}

/// Follow-up fetch of each article's own page for its body and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArticleSettings {
    /// Paragraph elements whose text makes up the body.
    pub content_selector: String,
    /// Shorter paragraphs (captions, share buttons) are left out.
    #[serde(default = "default_min_paragraph_chars")]
    pub min_paragraph_chars: usize,
    /// Captured pages named after the last path segment of each link.
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_article_concurrency")]
    pub concurrency: usize,
}

/// Per-method settings blocks of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MethodSettings {
    #[serde(default)]
    pub feed: Option<FeedSettings>,
    #[serde(default)]
    pub page: Option<PageSettings>,
    #[serde(default)]
    pub session: Option<SessionSettings>,
    #[serde(default)]
    pub article: Option<ArticleSettings>,
}

impl MethodSettings {
    pub fn has(&self, method: FetchMethod) -> bool {
        match method {
            FetchMethod::Feed => self.feed.is_some(),
            FetchMethod::Page => self.page.is_some(),
            FetchMethod::Session => self.session.is_some(),
        }
    }

    /// Makes relative fixture paths relative to `base` (the registry file's directory).
    pub fn resolve_fixtures(&mut self, base: &Path) {
        let fixtures = [
            self.feed.as_mut().and_then(|s| s.fixture.as_mut()),
            self.page.as_mut().and_then(|s| s.fixture.as_mut()),
            self.session.as_mut().and_then(|s| s.fixture.as_mut()),
            self.article.as_mut().and_then(|s| s.fixture_dir.as_mut()),
        ];
        for path in fixtures.into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

pub struct FetchContext<'a> {
    pub run_id: Uuid,
    pub source: &'a str,
    pub fetched_at: DateTime<Utc>,
    /// Lookup key for query-driven sources.
    pub query: Option<&'a str>,
    pub http: &'a HttpFetcher,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    fn method(&self) -> FetchMethod;

    async fn retrieve(&self, ctx: &FetchContext<'_>) -> Result<Vec<RawItem>, FetchError>;
}

async fn load_body(
    ctx: &FetchContext<'_>,
    request: &FetchRequest,
    fixture: Option<&Path>,
) -> Result<String, FetchError> {
    if let Some(path) = fixture {
        debug!(source = ctx.source, path = %path.display(), "reading fixture");
        return tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FetchError::Io {
                path: path.to_path_buf(),
                source,
            });
    }
    let response = ctx.http.fetch(ctx.source, request).await?;
    Ok(response.text())
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, FetchError> {
    Selector::parse(selector)
        .map_err(|e| FetchError::Misconfigured(format!("invalid selector {selector:?}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element.select(selector).find_map(element_text)
}

fn select_first_attr(element: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    element
        .select(selector)
        .find_map(|n| n.value().attr(attr).and_then(text_or_none))
}

/// Text nodes joined with spaces so adjacent block elements do not run together.
fn strip_html(fragment: &str) -> Option<String> {
    let parsed = Html::parse_fragment(fragment);
    text_or_none(&parsed.root_element().text().collect::<Vec<_>>().join(" "))
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    #[serde(rename = "content:encoded")]
    encoded: Option<String>,
}

/// Parses an RSS 2.0 document into raw items.
pub fn parse_feed(
    xml: &str,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawItem>, FetchError> {
    let rss: Rss = quick_xml::de::from_str(xml)
        .map_err(|e| FetchError::Malformed(format!("invalid rss: {e}")))?;
    Ok(rss
        .channel
        .items
        .into_iter()
        .map(|entry| {
            let mut item = RawItem::new(source, fetched_at);
            item.title = entry.title.as_deref().and_then(text_or_none);
            item.link = entry.link.as_deref().and_then(text_or_none);
            item.summary = entry.description.as_deref().and_then(strip_html);
            item.content = entry.encoded.as_deref().and_then(strip_html);
            item.published_at = entry
                .pub_date
                .as_deref()
                .and_then(|d| parse_timestamp(d, Utc.fix()));
            item
        })
        .collect())
}

/// Parses a listing page into raw items using the configured selectors.
pub fn parse_page(
    html: &str,
    settings: &PageSettings,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawItem>, FetchError> {
    let base = Url::parse(&settings.url)
        .map_err(|e| FetchError::Misconfigured(format!("invalid page url {}: {e}", settings.url)))?;
    let offset = FixedOffset::east_opt(settings.utc_offset_minutes * 60).ok_or_else(|| {
        FetchError::Misconfigured(format!(
            "utc offset {} minutes out of range",
            settings.utc_offset_minutes
        ))
    })?;
    let item_sel = parse_selector(&settings.item_selector)?;
    let title_sel = parse_selector(&settings.title_selector)?;
    let link_sel = parse_selector(settings.link_selector.as_deref().unwrap_or("a[href]"))?;
    let summary_sel = settings
        .summary_selector
        .as_deref()
        .map(parse_selector)
        .transpose()?;
    let time_sel = settings
        .time_selector
        .as_deref()
        .map(parse_selector)
        .transpose()?;

    let document = Html::parse_document(html);
    let mut items = Vec::new();
    for node in document.select(&item_sel) {
        let href = if settings.link_selector.is_none() && node.value().name() == "a" {
            node.value().attr("href").and_then(text_or_none)
        } else {
            select_first_attr(node, &link_sel, "href")
        };

        let mut item = RawItem::new(source, fetched_at);
        item.title = select_first_text(node, &title_sel);
        item.link = href.map(|h| match base.join(&h) {
            Ok(resolved) => resolved.to_string(),
            Err(_) => h,
        });
        item.summary = summary_sel
            .as_ref()
            .and_then(|sel| select_first_text(node, sel));
        item.published_at = time_sel.as_ref().and_then(|sel| {
            node.select(sel).find_map(|t| {
                let raw = settings
                    .time_attribute
                    .as_deref()
                    .and_then(|attr| t.value().attr(attr))
                    .map(str::to_string)
                    .or_else(|| element_text(t))?;
                parse_timestamp(&raw, offset)
            })
        });
        items.push(item);
    }
    Ok(items)
}

/// Turns a username, `@handle`, numeric id or profile URL into a profile URL.
pub fn profile_url(template: &str, query: &str) -> Result<String, FetchError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(FetchError::Misconfigured(
            "profile lookup needs a non-empty query".to_string(),
        ));
    }

    if query.starts_with("http://") || query.starts_with("https://") {
        let url = Url::parse(query)
            .map_err(|e| FetchError::Malformed(format!("invalid profile url {query:?}: {e}")))?;
        // Numeric-id profiles are addressed through the query string, which link normalization drops.
        if url.path().ends_with("/profile.php") {
            if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "id") {
                return profile_url(template, &id);
            }
        }
        return Ok(url.to_string());
    }

    let handle = query.trim_start_matches('@');
    let valid = !handle.is_empty()
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(FetchError::Malformed(format!(
            "invalid profile handle {query:?}"
        )));
    }
    Ok(template.replace("{handle}", handle))
}

fn json_name(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Object(map) => map.get("name").and_then(JsonValue::as_str).and_then(text_or_none),
        JsonValue::Array(values) => values.iter().find_map(json_name),
        _ => None,
    }
}

/// First JSON-LD node whose `@type` is one of `types`, searching arrays and `@graph`.
fn find_ld_node<'v>(value: &'v JsonValue, types: &[&str]) -> Option<&'v JsonValue> {
    match value {
        JsonValue::Array(values) => values.iter().find_map(|v| find_ld_node(v, types)),
        JsonValue::Object(map) => {
            let typed = match map.get("@type") {
                Some(JsonValue::String(t)) => types.contains(&t.as_str()),
                Some(JsonValue::Array(ts)) => ts
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .any(|t| types.contains(&t)),
                _ => false,
            };
            if typed {
                return Some(value);
            }
            map.get("@graph").and_then(|g| find_ld_node(g, types))
        }
        _ => None,
    }
}

fn ld_json_nodes(root: ElementRef<'_>) -> Result<Vec<JsonValue>, FetchError> {
    let ld_sel = parse_selector("script[type=\"application/ld+json\"]")?;
    Ok(root
        .select(&ld_sel)
        .filter_map(|script| serde_json::from_str::<JsonValue>(&script.text().collect::<String>()).ok())
        .collect())
}

fn meta_content(root: ElementRef<'_>, property: &str) -> Result<Option<String>, FetchError> {
    let sel = parse_selector(&format!("meta[property=\"{property}\"]"))?;
    Ok(select_first_attr(root, &sel, "content"))
}

/// Parses a profile page (OpenGraph + JSON-LD `Person`) into one profile item.
pub fn parse_profile(
    html: &str,
    lookup_url: &str,
    settings: &SessionSettings,
    source: &str,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawItem>, FetchError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    if let Some(wall) = &settings.login_wall_selector {
        let wall_sel = parse_selector(wall)?;
        if root.select(&wall_sel).next().is_some() {
            return Err(FetchError::SessionRejected(format!(
                "login wall served for {lookup_url}"
            )));
        }
    }

    let meta = |property: &str| meta_content(root, property);
    let person = ld_json_nodes(root)?
        .iter()
        .find_map(|value| find_ld_node(value, &["Person"]).cloned());

    let mut details = Vec::new();
    if let Some(person) = &person {
        for key in ["jobTitle", "worksFor", "homeLocation", "alumniOf"] {
            if let Some(value) = person.get(key).and_then(json_name) {
                details.push(format!("{key}: {value}"));
            }
        }
    }
    if let Some(selector) = &settings.content_selector {
        let sel = parse_selector(selector)?;
        details.extend(root.select(&sel).filter_map(element_text));
    }

    let name = meta("og:title")?.or_else(|| {
        person
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(json_name)
    });
    let Some(name) = name else {
        return Ok(Vec::new());
    };

    let mut item = RawItem::new(source, fetched_at);
    item.kind = ItemKind::Profile;
    item.title = Some(name);
    item.summary = meta("og:description")?.or_else(|| {
        person
            .as_ref()
            .and_then(|p| p.get("description"))
            .and_then(json_name)
    });
    item.content = if details.is_empty() {
        None
    } else {
        Some(details.join("\n"))
    };
    // `og:url` of numeric-id profiles is a `profile.php?id=` link; it goes through the same canonical form as the query.
    item.link = Some(match meta("og:url")? {
        Some(og_url) => profile_url(&settings.profile_url_template, &og_url)
            .unwrap_or_else(|_| lookup_url.to_string()),
        None => lookup_url.to_string(),
    });
    Ok(vec![item])
}

/// What an article's own page adds to its listing entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleDetails {
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

const ARTICLE_LD_TYPES: &[&str] = &["NewsArticle", "Article", "BlogPosting", "ReportageNewsArticle"];

/// Extracts the body and timestamps of one article page.
///
/// Timestamps come from `article:*_time` meta tags first, then JSON-LD
/// `datePublished` / `dateModified`.
pub fn parse_article_page(html: &str, settings: &ArticleSettings) -> Result<ArticleDetails, FetchError> {
    let offset = FixedOffset::east_opt(settings.utc_offset_minutes * 60).ok_or_else(|| {
        FetchError::Misconfigured(format!(
            "utc offset {} minutes out of range",
            settings.utc_offset_minutes
        ))
    })?;
    let content_sel = parse_selector(&settings.content_selector)?;
    let document = Html::parse_document(html);
    let root = document.root_element();

    let paragraphs = root
        .select(&content_sel)
        .filter_map(element_text)
        .filter(|text| text.chars().count() >= settings.min_paragraph_chars)
        .collect::<Vec<_>>();

    let nodes = ld_json_nodes(root)?;
    let article = nodes
        .iter()
        .find_map(|value| find_ld_node(value, ARTICLE_LD_TYPES));
    let ld_time = |key: &str| {
        article
            .and_then(|a| a.get(key))
            .and_then(JsonValue::as_str)
            .and_then(|raw| parse_timestamp(raw, offset))
    };
    let meta_time = |property: &str| -> Result<Option<DateTime<Utc>>, FetchError> {
        Ok(meta_content(root, property)?.and_then(|raw| parse_timestamp(&raw, offset)))
    };

    Ok(ArticleDetails {
        content: if paragraphs.is_empty() {
            None
        } else {
            Some(paragraphs.join("\n\n"))
        },
        published_at: meta_time("article:published_time")?.or_else(|| ld_time("datePublished")),
        modified_at: meta_time("article:modified_time")?.or_else(|| ld_time("dateModified")),
    })
}

/// Fixture file standing in for an article page: the link's last path segment plus `.html`.
pub fn article_fixture_name(link: &str) -> String {
    let segment = Url::parse(link).ok().and_then(|url| {
        url.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
    });
    let stem = segment.unwrap_or_else(|| "index".to_string());
    if stem.ends_with(".html") {
        stem
    } else {
        format!("{stem}.html")
    }
}

/// Fetches article pages for a batch. A page that fails to load or parse leaves its item as listed.
pub struct ArticleEnricher {
    settings: ArticleSettings,
}

impl ArticleEnricher {
    pub fn new(settings: ArticleSettings) -> Self {
        Self { settings }
    }

    pub async fn enrich(&self, ctx: &FetchContext<'_>, items: Vec<RawItem>) -> Vec<RawItem> {
        let total = items.len();
        let enriched = stream::iter(items)
            .map(|item| self.enrich_one(ctx, item))
            .buffered(self.settings.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        let with_content = enriched.iter().filter(|item| item.content.is_some()).count();
        info!(source = ctx.source, total, with_content, "article pages fetched");
        enriched
    }

    async fn enrich_one(&self, ctx: &FetchContext<'_>, mut item: RawItem) -> RawItem {
        if item.kind != ItemKind::Article || item.title.is_none() {
            return item;
        }
        let Some(link) = item.link.clone() else {
            return item;
        };

        let fixture = self
            .settings
            .fixture_dir
            .as_deref()
            .map(|dir| dir.join(article_fixture_name(&link)));
        let request = FetchRequest::get(&link).header(
            "Accept",
            "text/html,application/xhtml+xml;q=0.9,*/*;q=0.5",
        );
        let details = match load_body(ctx, &request, fixture.as_deref()).await {
            Ok(html) => parse_article_page(&html, &self.settings),
            Err(err) => Err(err),
        };

        match details {
            Ok(details) => {
                debug!(source = ctx.source, link = %link, has_content = details.content.is_some(), "article page parsed");
                if details.content.is_some() {
                    item.content = details.content;
                }
                if details.modified_at.is_some() {
                    item.updated_at = details.modified_at;
                }
                if item.published_at.is_none() {
                    item.published_at = details.published_at;
                }
            }
            Err(err) => {
                debug!(source = ctx.source, link = %link, error = %err, "article page unavailable; keeping listing entry");
            }
        }
        item
    }
}

pub struct FeedRetriever {
    settings: FeedSettings,
}

impl FeedRetriever {
    pub fn new(settings: FeedSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Retriever for FeedRetriever {
    fn method(&self) -> FetchMethod {
        FetchMethod::Feed
    }

    async fn retrieve(&self, ctx: &FetchContext<'_>) -> Result<Vec<RawItem>, FetchError> {
        let request = FetchRequest::get(&self.settings.url).header(
            "Accept",
            "application/rss+xml, application/xml;q=0.9, */*;q=0.5",
        );
        let body = load_body(ctx, &request, self.settings.fixture.as_deref()).await?;
        parse_feed(&body, ctx.source, ctx.fetched_at)
    }
}

pub struct PageRetriever {
    settings: PageSettings,
}

impl PageRetriever {
    pub fn new(settings: PageSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Retriever for PageRetriever {
    fn method(&self) -> FetchMethod {
        FetchMethod::Page
    }

    async fn retrieve(&self, ctx: &FetchContext<'_>) -> Result<Vec<RawItem>, FetchError> {
        let request = FetchRequest::get(&self.settings.url);
        let body = load_body(ctx, &request, self.settings.fixture.as_deref()).await?;
        parse_page(&body, &self.settings, ctx.source, ctx.fetched_at)
    }
}

pub struct SessionRetriever {
    settings: SessionSettings,
}

impl SessionRetriever {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Retriever for SessionRetriever {
    fn method(&self) -> FetchMethod {
        FetchMethod::Session
    }

    async fn retrieve(&self, ctx: &FetchContext<'_>) -> Result<Vec<RawItem>, FetchError> {
        let query = ctx.query.ok_or_else(|| {
            FetchError::Misconfigured("session lookups run only with a query".to_string())
        })?;
        let url = profile_url(&self.settings.profile_url_template, query)?;

        let mut request =
            FetchRequest::get(&url).header("Accept-Language", "ro-RO,ro;q=0.9,en;q=0.8");
        if let Some(var) = &self.settings.cookie_env {
            match std::env::var(var) {
                Ok(cookie) if !cookie.trim().is_empty() => {
                    request = request.header("Cookie", cookie.trim());
                }
                _ => warn!(source = ctx.source, env = %var, "session cookie not set; fetching signed out"),
            }
        }

        let body = load_body(ctx, &request, self.settings.fixture.as_deref()).await?;
        parse_profile(&body, &url, &self.settings, ctx.source, ctx.fetched_at)
    }
}

/// Builds the retriever a source names for `method`.
pub fn retriever_for(
    source_name: &str,
    method: FetchMethod,
    settings: &MethodSettings,
) -> Result<Box<dyn Retriever>, AdapterError> {
    let missing = || AdapterError::MissingSettings {
        source_name: source_name.to_string(),
        method,
    };
    let retriever: Box<dyn Retriever> = match method {
        FetchMethod::Feed => Box::new(FeedRetriever::new(settings.feed.clone().ok_or_else(missing)?)),
        FetchMethod::Page => Box::new(PageRetriever::new(settings.page.clone().ok_or_else(missing)?)),
        FetchMethod::Session => Box::new(SessionRetriever::new(
            settings.session.clone().ok_or_else(missing)?,
        )),
    };
    Ok(retriever)
}

/// Items from one adapter run, de-duplicated by normalized link.
#[derive(Debug, Clone)]
pub struct Batch {
    pub items: Vec<RawItem>,
    pub method_used: FetchMethod,
    /// Why the primary method was not used, when it was not.
    pub fallback_reason: Option<String>,
    /// Items dropped because an earlier item had the same normalized link.
    pub collapsed: usize,
}

/// Keeps the first item per normalized link. Items whose link does not normalize pass through.
pub fn collapse_by_link(items: Vec<RawItem>) -> (Vec<RawItem>, usize) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(items.len());
    let mut collapsed = 0;
    for item in items {
        let key = item
            .link
            .as_deref()
            .and_then(|link| NormalizedUrl::parse(link).ok());
        if let Some(key) = key {
            if !seen.insert(key) {
                collapsed += 1;
                continue;
            }
        }
        kept.push(item);
    }
    (kept, collapsed)
}

pub struct SourceAdapter {
    source_name: String,
    strategy: Strategy,
    min_title_chars: usize,
    primary: Box<dyn Retriever>,
    secondary: Option<Box<dyn Retriever>>,
    article: Option<ArticleEnricher>,
}

impl SourceAdapter {
    pub fn new(
        source_name: impl Into<String>,
        strategy: Strategy,
        primary: Box<dyn Retriever>,
        secondary: Option<Box<dyn Retriever>>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            strategy,
            min_title_chars: 0,
            primary,
            secondary,
            article: None,
        }
    }

    pub fn from_settings(
        source_name: &str,
        strategy: Strategy,
        primary: FetchMethod,
        secondary: Option<FetchMethod>,
        settings: &MethodSettings,
    ) -> Result<Self, AdapterError> {
        let primary = retriever_for(source_name, primary, settings)?;
        let secondary = secondary
            .map(|method| retriever_for(source_name, method, settings))
            .transpose()?;
        let adapter = Self::new(source_name, strategy, primary, secondary);
        Ok(match &settings.article {
            Some(article) => adapter.with_article_pages(article.clone()),
            None => adapter,
        })
    }

    /// Adds the per-article page fetch after listing retrieval.
    pub fn with_article_pages(mut self, settings: ArticleSettings) -> Self {
        self.article = Some(ArticleEnricher::new(settings));
        self
    }

    /// Items with shorter titles are treated as navigation noise and dropped.
    pub fn with_min_title_chars(mut self, min_title_chars: usize) -> Self {
        self.min_title_chars = min_title_chars;
        self
    }

    pub fn secondary_method(&self) -> Option<FetchMethod> {
        self.secondary.as_ref().map(|s| s.method())
    }

    async fn attempt(
        &self,
        retriever: &dyn Retriever,
        ctx: &FetchContext<'_>,
    ) -> Result<Vec<RawItem>, FetchError> {
        let mut items = retriever.retrieve(ctx).await?;
        let retrieved = items.len();
        if self.min_title_chars > 0 {
            items.retain(|item| {
                item.title
                    .as_deref()
                    .map_or(true, |t| t.chars().count() >= self.min_title_chars)
            });
        }
        debug!(
            run_id = %ctx.run_id,
            source = %self.source_name,
            method = %retriever.method(),
            retrieved,
            kept = items.len(),
            "retrieval finished"
        );
        if items.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(items)
    }

    fn exhausted(&self, failures: Vec<MethodFailure>) -> AdapterError {
        AdapterError::Exhausted {
            source_name: self.source_name.clone(),
            failures,
        }
    }

    pub async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Batch, AdapterError> {
        let mut batch = self.fetch_listing(ctx).await?;
        if let Some(article) = &self.article {
            batch.items = article.enrich(ctx, batch.items).await;
        }
        Ok(batch)
    }

    async fn fetch_listing(&self, ctx: &FetchContext<'_>) -> Result<Batch, AdapterError> {
        let primary_method = self.primary.method();
        match self.strategy {
            Strategy::Fallback => {
                let primary_error = match self.attempt(self.primary.as_ref(), ctx).await {
                    Ok(items) => return Ok(finish_batch(items, primary_method, None)),
                    Err(err) => err,
                };
                warn!(
                    source = %self.source_name,
                    method = %primary_method,
                    error = %primary_error,
                    "primary retrieval failed"
                );

                let Some(secondary) = &self.secondary else {
                    return Err(self.exhausted(vec![MethodFailure {
                        method: primary_method,
                        error: primary_error,
                    }]));
                };
                match self.attempt(secondary.as_ref(), ctx).await {
                    Ok(items) => {
                        info!(
                            source = %self.source_name,
                            method = %secondary.method(),
                            items = items.len(),
                            "secondary retrieval used"
                        );
                        Ok(finish_batch(
                            items,
                            secondary.method(),
                            Some(format!("{primary_method}: {primary_error}")),
                        ))
                    }
                    Err(secondary_error) => Err(self.exhausted(vec![
                        MethodFailure {
                            method: primary_method,
                            error: primary_error,
                        },
                        MethodFailure {
                            method: secondary.method(),
                            error: secondary_error,
                        },
                    ])),
                }
            }
            Strategy::Combine => {
                let secondary_attempt = async {
                    match &self.secondary {
                        Some(secondary) => Some(self.attempt(secondary.as_ref(), ctx).await),
                        None => None,
                    }
                };
                let (primary_result, secondary_result) =
                    tokio::join!(self.attempt(self.primary.as_ref(), ctx), secondary_attempt);
                let secondary_method = self.secondary_method();

                match (primary_result, secondary_result) {
                    (Ok(mut items), Some(Ok(extra))) => {
                        items.extend(extra);
                        Ok(finish_batch(items, primary_method, None))
                    }
                    (Ok(items), Some(Err(err))) => {
                        warn!(source = %self.source_name, error = %err, "secondary retrieval failed");
                        Ok(finish_batch(items, primary_method, None))
                    }
                    (Ok(items), None) => Ok(finish_batch(items, primary_method, None)),
                    (Err(primary_error), Some(Ok(items))) => {
                        warn!(source = %self.source_name, error = %primary_error, "primary retrieval failed");
                        let method = secondary_method.unwrap_or(primary_method);
                        Ok(finish_batch(
                            items,
                            method,
                            Some(format!("{primary_method}: {primary_error}")),
                        ))
                    }
                    (Err(primary_error), secondary_result) => {
                        let mut failures = vec![MethodFailure {
                            method: primary_method,
                            error: primary_error,
                        }];
                        if let (Some(method), Some(Err(error))) = (secondary_method, secondary_result) {
                            failures.push(MethodFailure { method, error });
                        }
                        Err(self.exhausted(failures))
                    }
                }
            }
        }
    }
}

fn finish_batch(items: Vec<RawItem>, method_used: FetchMethod, fallback_reason: Option<String>) -> Batch {
    let (items, collapsed) = collapse_by_link(items);
    Batch {
        items,
        method_used,
        fallback_reason,
        collapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsdesk_storage::HttpClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(rel: &str) -> String {
        std::fs::read_to_string(workspace_root().join("fixtures").join(rel)).expect("fixture")
    }

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-04T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn raw(title: &str, link: &str) -> RawItem {
        let mut item = RawItem::new("Test", fetched_at());
        item.title = Some(title.to_string());
        item.link = Some(link.to_string());
        item
    }

    fn biziday_settings() -> PageSettings {
        PageSettings {
            url: "https://www.biziday.ro/".into(),
            fixture: None,
            item_selector: "li.article".into(),
            title_selector: "h2.post-title".into(),
            link_selector: Some("a.post-url".into()),
            summary_selector: Some(".news-content p".into()),
            time_selector: Some("time.timeago".into()),
            time_attribute: Some("datetime".into()),
            utc_offset_minutes: 120,
        }
    }

    fn session_settings() -> SessionSettings {
        SessionSettings {
            profile_url_template: "https://www.facebook.com/{handle}".into(),
            cookie_env: None,
            fixture: None,
            content_selector: Some(".profile-intro span".into()),
            login_wall_selector: Some("form#login_form".into()),
        }
    }

    struct Stub {
        method: FetchMethod,
        result: Result<Vec<RawItem>, &'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl Stub {
        fn boxed(method: FetchMethod, result: Result<Vec<RawItem>, &'static str>) -> (Box<dyn Retriever>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    method,
                    result,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl Retriever for Stub {
        fn method(&self) -> FetchMethod {
            self.method
        }

        async fn retrieve(&self, _ctx: &FetchContext<'_>) -> Result<Vec<RawItem>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(items) => Ok(items.clone()),
                Err(msg) => Err(FetchError::Malformed(msg.to_string())),
            }
        }
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("http client")
    }

    fn ctx<'a>(http: &'a HttpFetcher, query: Option<&'a str>) -> FetchContext<'a> {
        FetchContext {
            run_id: Uuid::new_v4(),
            source: "Test",
            fetched_at: fetched_at(),
            query,
            http,
        }
    }

    #[test]
    fn feed_items_carry_text_summaries_and_rfc2822_dates() {
        let items = parse_feed(&fixture("adevarul/rss.xml"), "Adevarul", fetched_at()).unwrap();
        assert_eq!(items.len(), 4);
        let first = &items[0];
        assert_eq!(first.title.as_deref(), Some("Guvernul aprobă bugetul pentru anul viitor"));
        assert_eq!(
            first.link.as_deref(),
            Some("https://adevarul.ro/politica/guvernul-aproba-bugetul-2345.html?utm_source=rss&utm_medium=feed")
        );
        assert_eq!(
            first.summary.as_deref(),
            Some("Executivul a adoptat proiectul de buget în ședința de miercuri.")
        );
        assert_eq!(
            first.published_at,
            Some(DateTime::parse_from_rfc3339("2026-03-04T07:15:00Z").unwrap().with_timezone(&Utc))
        );
        assert_eq!(first.source, "Adevarul");
    }

    #[test]
    fn feed_content_encoded_becomes_the_body() {
        let items = parse_feed(&fixture("adevarul/rss.xml"), "Adevarul", fetched_at()).unwrap();
        assert_eq!(items[0].content, None);
        assert_eq!(
            items[1].content.as_deref(),
            Some("Meteorologii au emis o avertizare de cod galben pentru Maramureș și Suceava. Stratul de zăpadă poate depăși 30 de centimetri.")
        );
    }

    #[test]
    fn malformed_feed_is_a_fetch_error() {
        let err = parse_feed("<html><body>not a feed</body></html>", "Adevarul", fetched_at()).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[test]
    fn page_items_resolve_relative_links_and_parse_times() {
        let items = parse_page(&fixture("biziday/homepage.html"), &biziday_settings(), "Biziday", fetched_at()).unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(
            items[0].link.as_deref(),
            Some("https://www.biziday.ro/banca-nationala-mentine-dobanda-de-politica-monetara/")
        );
        assert_eq!(
            items[0].summary.as_deref(),
            Some("Consiliul de administrație al BNR a decis menținerea ratei dobânzii la 6,50%.")
        );
        assert_eq!(
            items[0].published_at,
            Some(DateTime::parse_from_rfc3339("2026-03-04T07:03:11Z").unwrap().with_timezone(&Utc))
        );
        assert_eq!(items[2].title, None);
        assert_eq!(items[3].published_at, None);
    }

    #[test]
    fn page_wall_clock_times_use_the_configured_offset() {
        let settings = PageSettings {
            url: "https://adevarul.ro/".into(),
            fixture: None,
            item_selector: "article.article-card".into(),
            title_selector: "a.title".into(),
            link_selector: Some("a.title".into()),
            summary_selector: Some(".summary".into()),
            time_selector: Some(".date".into()),
            time_attribute: None,
            utc_offset_minutes: 120,
        };
        let items = parse_page(&fixture("adevarul/homepage.html"), &settings, "Adevarul", fetched_at()).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(
            items[1].published_at,
            Some(DateTime::parse_from_rfc3339("2026-03-04T08:02:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn invalid_selectors_are_configuration_errors() {
        let mut settings = biziday_settings();
        settings.item_selector = "li[".into();
        let err = parse_page("<html></html>", &settings, "Biziday", fetched_at()).unwrap_err();
        assert!(matches!(err, FetchError::Misconfigured(_)));
    }

    #[test]
    fn profile_queries_normalize_to_profile_urls() {
        let template = "https://www.facebook.com/{handle}";
        assert_eq!(profile_url(template, "ana.popescu").unwrap(), "https://www.facebook.com/ana.popescu");
        assert_eq!(profile_url(template, "@ana.popescu").unwrap(), "https://www.facebook.com/ana.popescu");
        assert_eq!(profile_url(template, "100012345678").unwrap(), "https://www.facebook.com/100012345678");
        assert_eq!(
            profile_url(template, "https://www.facebook.com/profile.php?id=100012345678").unwrap(),
            "https://www.facebook.com/100012345678"
        );
        assert_eq!(
            profile_url(template, "https://www.facebook.com/ana.popescu/").unwrap(),
            "https://www.facebook.com/ana.popescu/"
        );
        assert!(matches!(profile_url(template, "ana popescu"), Err(FetchError::Malformed(_))));
        assert!(matches!(profile_url(template, "  "), Err(FetchError::Misconfigured(_))));
    }

    #[test]
    fn profile_page_becomes_one_profile_item() {
        let items = parse_profile(
            &fixture("facebook/profile.html"),
            "https://www.facebook.com/ana.popescu",
            &session_settings(),
            "Facebook",
            fetched_at(),
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        let profile = &items[0];
        assert_eq!(profile.kind, ItemKind::Profile);
        assert_eq!(profile.title.as_deref(), Some("Ana Popescu"));
        assert_eq!(profile.link.as_deref(), Some("https://www.facebook.com/ana.popescu/"));
        let content = profile.content.as_deref().unwrap();
        assert!(content.contains("jobTitle: Editor economic"));
        assert!(content.contains("worksFor: Biziday"));
        assert!(content.contains("Absolventă a Universității din București"));
    }

    fn numeric_profile_page(name: &str, id: &str) -> String {
        format!(
            r#"<html><head>
<meta property="og:title" content="{name}">
<meta property="og:url" content="https://www.facebook.com/profile.php?id={id}">
</head><body></body></html>"#
        )
    }

    #[test]
    fn numeric_id_profiles_keep_distinct_identity_links() {
        let settings = session_settings();
        let mut links = Vec::new();
        for (name, id) in [("Ana Popescu", "100011111111"), ("Ion Ionescu", "100022222222")] {
            let lookup = profile_url(&settings.profile_url_template, id).unwrap();
            let items = parse_profile(&numeric_profile_page(name, id), &lookup, &settings, "Facebook", fetched_at()).unwrap();
            let link = items[0].link.clone().unwrap();
            assert_eq!(link, format!("https://www.facebook.com/{id}"));
            links.push(NormalizedUrl::parse(&link).unwrap());
        }
        assert_ne!(links[0], links[1]);
    }

    #[test]
    fn unparseable_og_url_keeps_the_lookup_url() {
        let html = r#"<html><head><meta property="og:title" content="Ana Popescu"><meta property="og:url" content="not a url"></head></html>"#;
        let items = parse_profile(html, "https://www.facebook.com/ana.popescu", &session_settings(), "Facebook", fetched_at()).unwrap();
        assert_eq!(items[0].link.as_deref(), Some("https://www.facebook.com/ana.popescu"));
    }

    fn article_settings() -> ArticleSettings {
        ArticleSettings {
            content_selector: "div.post-content p".into(),
            min_paragraph_chars: 20,
            fixture_dir: None,
            utc_offset_minutes: 120,
            concurrency: 2,
        }
    }

    #[test]
    fn article_page_supplies_body_and_meta_times() {
        let details = parse_article_page(
            &fixture("biziday/articles/banca-nationala-mentine-dobanda-de-politica-monetara.html"),
            &article_settings(),
        )
        .unwrap();
        let content = details.content.unwrap();
        assert!(content.starts_with("Consiliul de administrație al BNR"));
        assert!(content.ends_with("inflații încă ridicate."));
        assert!(!content.contains("Foto: BNR"));
        assert_eq!(
            details.published_at,
            Some(DateTime::parse_from_rfc3339("2026-03-04T07:03:11Z").unwrap().with_timezone(&Utc))
        );
        assert_eq!(
            details.modified_at,
            Some(DateTime::parse_from_rfc3339("2026-03-04T08:20:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn article_times_fall_back_to_json_ld_in_local_time() {
        let details = parse_article_page(&fixture("biziday/articles/vremea-se-raceste.html"), &article_settings()).unwrap();
        assert_eq!(
            details.content.as_deref(),
            Some("Meteorologii anunță o răcire accentuată începând de joi, cu temperaturi maxime de 2 grade.")
        );
        assert_eq!(
            details.published_at,
            Some(DateTime::parse_from_rfc3339("2026-03-03T16:45:00Z").unwrap().with_timezone(&Utc))
        );
        assert_eq!(
            details.modified_at,
            Some(DateTime::parse_from_rfc3339("2026-03-04T06:10:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn article_fixture_names_follow_the_last_path_segment() {
        assert_eq!(
            article_fixture_name("https://www.biziday.ro/vremea-se-raceste/?ref=home"),
            "vremea-se-raceste.html"
        );
        assert_eq!(
            article_fixture_name("https://adevarul.ro/politica/guvernul-aproba-bugetul-2345.html"),
            "guvernul-aproba-bugetul-2345.html"
        );
        assert_eq!(article_fixture_name("https://adevarul.ro/"), "index.html");
    }

    #[test]
    fn login_wall_is_a_rejected_session() {
        let err = parse_profile(
            &fixture("facebook/login_wall.html"),
            "https://www.facebook.com/ana.popescu",
            &session_settings(),
            "Facebook",
            fetched_at(),
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::SessionRejected(_)));
    }

    #[test]
    fn batch_collapses_links_that_normalize_together() {
        let (items, collapsed) = collapse_by_link(vec![
            raw("Stire X", "http://site/a?utm=1"),
            raw("Stire X bis", "http://site/a"),
            raw("Alta", "http://site/b"),
            raw("Fara link valid", "not a url"),
        ]);
        assert_eq!(collapsed, 1);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].title.as_deref(), Some("Stire X"));
    }

    #[tokio::test]
    async fn primary_success_skips_secondary() {
        let http = http();
        let (primary, _) = Stub::boxed(FetchMethod::Page, Ok(vec![raw("Stire", "http://site/a")]));
        let (secondary, secondary_calls) = Stub::boxed(FetchMethod::Feed, Ok(vec![raw("Alta", "http://site/b")]));
        let adapter = SourceAdapter::new("Test", Strategy::Fallback, primary, Some(secondary));
        let batch = adapter.fetch(&ctx(&http, None)).await.unwrap();
        assert_eq!(batch.method_used, FetchMethod::Page);
        assert!(batch.fallback_reason.is_none());
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_error_falls_back_to_secondary() {
        let http = http();
        let (primary, _) = Stub::boxed(FetchMethod::Page, Err("markup changed"));
        let (secondary, secondary_calls) = Stub::boxed(FetchMethod::Feed, Ok(vec![raw("Stire", "http://site/a")]));
        let adapter = SourceAdapter::new("Test", Strategy::Fallback, primary, Some(secondary));
        let batch = adapter.fetch(&ctx(&http, None)).await.unwrap();
        assert_eq!(batch.method_used, FetchMethod::Feed);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 1);
        assert!(batch.fallback_reason.unwrap().contains("markup changed"));
    }

    #[tokio::test]
    async fn empty_primary_falls_back_to_secondary() {
        let http = http();
        let (primary, _) = Stub::boxed(FetchMethod::Feed, Ok(vec![]));
        let (secondary, _) = Stub::boxed(FetchMethod::Page, Ok(vec![raw("Stire", "http://site/a")]));
        let adapter = SourceAdapter::new("Test", Strategy::Fallback, primary, Some(secondary));
        let batch = adapter.fetch(&ctx(&http, None)).await.unwrap();
        assert_eq!(batch.method_used, FetchMethod::Page);
        assert!(batch.fallback_reason.unwrap().contains("no items"));
    }

    #[tokio::test]
    async fn both_failing_exhausts_the_adapter() {
        let http = http();
        let (primary, _) = Stub::boxed(FetchMethod::Page, Err("timeout"));
        let (secondary, _) = Stub::boxed(FetchMethod::Feed, Err("bad xml"));
        let adapter = SourceAdapter::new("Test", Strategy::Fallback, primary, Some(secondary));
        let err = adapter.fetch(&ctx(&http, None)).await.unwrap_err();
        match err {
            AdapterError::Exhausted { failures, .. } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].method, FetchMethod::Page);
                assert_eq!(failures[1].method, FetchMethod::Feed);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn combine_prefers_primary_items_on_link_collisions() {
        let http = http();
        let (primary, _) = Stub::boxed(
            FetchMethod::Feed,
            Ok(vec![raw("Din feed", "https://adevarul.ro/a.html?utm_source=rss")]),
        );
        let (secondary, _) = Stub::boxed(
            FetchMethod::Page,
            Ok(vec![
                raw("De pe prima pagina", "https://adevarul.ro/a.html"),
                raw("Doar pe pagina", "https://adevarul.ro/b.html"),
            ]),
        );
        let adapter = SourceAdapter::new("Adevarul", Strategy::Combine, primary, Some(secondary));
        let batch = adapter.fetch(&ctx(&http, None)).await.unwrap();
        assert_eq!(batch.method_used, FetchMethod::Feed);
        assert_eq!(batch.collapsed, 1);
        let titles = batch.items.iter().filter_map(|i| i.title.as_deref()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Din feed", "Doar pe pagina"]);
    }

    #[tokio::test]
    async fn short_titles_are_dropped_before_the_empty_check() {
        let http = http();
        let (primary, _) = Stub::boxed(FetchMethod::Feed, Ok(vec![raw("RSS", "https://adevarul.ro/rss")]));
        let (secondary, _) = Stub::boxed(FetchMethod::Page, Ok(vec![raw("Leul se depreciaza", "https://adevarul.ro/b")]));
        let adapter = SourceAdapter::new("Adevarul", Strategy::Fallback, primary, Some(secondary))
            .with_min_title_chars(10);
        let batch = adapter.fetch(&ctx(&http, None)).await.unwrap();
        assert_eq!(batch.method_used, FetchMethod::Page);
    }

    #[tokio::test]
    async fn session_retriever_requires_a_query() {
        let http = http();
        let mut settings = session_settings();
        settings.fixture = Some(workspace_root().join("fixtures/facebook/profile.html"));
        let retriever = SessionRetriever::new(settings);
        assert!(matches!(
            retriever.retrieve(&ctx(&http, None)).await,
            Err(FetchError::Misconfigured(_))
        ));
        let items = retriever.retrieve(&ctx(&http, Some("@ana.popescu"))).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn missing_settings_block_is_reported() {
        let err = SourceAdapter::from_settings(
            "Biziday",
            Strategy::Fallback,
            FetchMethod::Page,
            Some(FetchMethod::Feed),
            &MethodSettings {
                page: Some(biziday_settings()),
                ..Default::default()
            },
        )
        .err()
        .expect("feed block missing");
        assert!(matches!(
            err,
            AdapterError::MissingSettings {
                method: FetchMethod::Feed,
                ..
            }
        ));
    }
}
