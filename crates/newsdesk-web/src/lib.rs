//! JSON API over stored articles and scrape sessions, plus on-demand source runs.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use newsdesk_storage::{ArticleFilter, ArticleQueries, DailyCount, HourlyCount, SourceCount, StoreError};
use newsdesk_sync::{PipelineError, RunOutcome, SyncPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "newsdesk-web";

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;
const DEFAULT_SESSION_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub queries: Arc<dyn ArticleQueries>,
    /// Absent when the server runs read-only.
    pub pipeline: Option<Arc<SyncPipeline>>,
}

impl AppState {
    pub fn new(queries: Arc<dyn ArticleQueries>) -> Self {
        Self {
            queries,
            pipeline: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    q: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RunRequest {
    query: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    total_articles: i64,
    sources: Vec<SourceCount>,
    daily: Vec<DailyCount>,
}

#[derive(Debug, Serialize)]
struct ChartData {
    daily: Vec<DailyCount>,
    hourly: Vec<HourlyCount>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/articles", get(articles_handler))
        .route("/api/search", get(search_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/chart-data", get(chart_data_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/sources/{name}/run", post(run_source_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn articles_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ArticleFilter>,
) -> Response {
    match state.queries.list_articles(&filter).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => store_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "query parameter `q` is required");
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);
    match state.queries.search(q, limit).await {
        Ok(hits) => Json(hits).into_response(),
        Err(err) => store_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let sources = match state.queries.source_counts().await {
        Ok(rows) => rows,
        Err(err) => return store_error(err),
    };
    let daily = match state.queries.daily_counts(&ArticleFilter::default()).await {
        Ok(rows) => rows,
        Err(err) => return store_error(err),
    };
    Json(StatsResponse {
        total_articles: sources.iter().map(|s| s.count).sum(),
        sources,
        daily,
    })
    .into_response()
}

async fn chart_data_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ArticleFilter>,
) -> Response {
    let daily = match state.queries.daily_counts(&filter).await {
        Ok(rows) => rows,
        Err(err) => return store_error(err),
    };
    match state.queries.hourly_counts(&filter).await {
        Ok(hourly) => Json(ChartData { daily, hourly }).into_response(),
        Err(err) => store_error(err),
    }
}

async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_SESSION_LIMIT).clamp(1, 500);
    match state.queries.recent_sessions(limit).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => store_error(err),
    }
}

async fn run_source_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let Some(pipeline) = &state.pipeline else {
        return api_error(StatusCode::SERVICE_UNAVAILABLE, "source runs are disabled on this server");
    };
    let request = if body.is_empty() {
        RunRequest::default()
    } else {
        match serde_json::from_slice::<RunRequest>(&body) {
            Ok(request) => request,
            Err(err) => return api_error(StatusCode::BAD_REQUEST, &format!("invalid body: {err}")),
        }
    };

    match pipeline.run_on_demand(&name, request.query.as_deref()).await {
        Ok(RunOutcome::Completed(session)) => Json(session).into_response(),
        Ok(RunOutcome::AlreadyRunning) => {
            api_error(StatusCode::CONFLICT, &format!("source {name} is already running"))
        }
        Err(err @ PipelineError::UnknownSource(_)) => api_error(StatusCode::NOT_FOUND, &err.to_string()),
        Err(err @ PipelineError::QueryRequired(_)) => api_error(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "query failed");
    let status = match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Conflict { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use newsdesk_core::{ContentFingerprint, ItemKind, NormalizedUrl};
    use newsdesk_storage::{ArticleStore, InMemoryStore, NewArticle};
    use newsdesk_sync::{SourceRegistry, SyncConfig};
    use serde_json::Value;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let rows = [
            ("Biziday", "Banca Națională menține dobânda", "https://www.biziday.ro/bnr", 7),
            ("Biziday", "Trafic restricționat pe A1", "https://www.biziday.ro/a1", 23),
            ("Adevarul", "Guvernul aprobă bugetul", "https://adevarul.ro/buget", 9),
        ];
        for (source, title, link, hour) in rows {
            let link = NormalizedUrl::parse(link).unwrap();
            let at = Utc.with_ymd_and_hms(2026, 3, 4, hour, 0, 0).single().unwrap();
            store
                .insert(NewArticle {
                    kind: ItemKind::Article,
                    title: title.to_string(),
                    summary: Some(format!("Rezumat: {title}")),
                    content: None,
                    content_hash: ContentFingerprint::compute(Some(title), None, Some(link.as_str())),
                    link,
                    source: source.to_string(),
                    published_at: Some(at),
                    created_at: at,
                    updated_at: at,
                })
                .await
                .unwrap();
        }
        store
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(AppState::new(Arc::new(InMemoryStore::new())));
        let (status, body) = get_json(app, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn articles_filter_by_source_and_wrapping_hours() {
        let app = app(AppState::new(seeded_store().await));
        let (status, body) = get_json(app.clone(), "/api/articles?source=Biziday").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["items"][0]["title"], "Trafic restricționat pe A1");

        let (_, body) = get_json(app, "/api/articles?start_hour=22&end_hour=8").await;
        let titles = body["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["title"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["Trafic restricționat pe A1", "Banca Națională menține dobânda"]);
    }

    #[tokio::test]
    async fn search_requires_a_query_and_ranks_hits() {
        let app = app(AppState::new(seeded_store().await));
        let (status, _) = get_json(app.clone(), "/api/search?q=%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get_json(app, "/api/search?q=bugetul").await;
        assert_eq!(status, StatusCode::OK);
        let hits = body.as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["article"]["source"], "Adevarul");
        assert!(hits[0]["rank"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn stats_and_chart_data_aggregate_counts() {
        let app = app(AppState::new(seeded_store().await));
        let (_, stats) = get_json(app.clone(), "/api/stats").await;
        assert_eq!(stats["total_articles"], 3);
        assert_eq!(stats["sources"].as_array().unwrap().len(), 2);

        let (status, chart) = get_json(app, "/api/chart-data?source=Biziday").await;
        assert_eq!(status, StatusCode::OK);
        let hours = chart["hourly"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["hour"].as_u64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(hours, vec![7, 23]);
        assert_eq!(chart["daily"][0]["count"], 2);
    }

    fn pipeline_state(store: Arc<InMemoryStore>) -> AppState {
        let fixtures = workspace_root().join("fixtures");
        let yaml = r#"
sources:
  - name: Adevarul
    primary: feed
    min_title_chars: 10
    feed:
      url: https://adevarul.ro/rss/
      fixture: adevarul/rss.xml
  - name: Facebook
    trigger: on_demand
    primary: session
    session:
      profile_url_template: "https://www.facebook.com/{handle}"
      fixture: facebook/profile.html
"#;
        let registry = SourceRegistry::from_yaml(yaml, &fixtures).unwrap();
        let pipeline = SyncPipeline::from_registry(&registry, store.clone(), &SyncConfig::default()).unwrap();
        AppState::new(store).with_pipeline(Arc::new(pipeline))
    }

    #[tokio::test]
    async fn run_endpoint_ingests_and_reports_the_session() {
        let store = Arc::new(InMemoryStore::new());
        let app = app(pipeline_state(store.clone()));

        let (status, session) = post_json(app.clone(), "/api/sources/Adevarul/run", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["success"], true);
        assert_eq!(session["method_used"], "feed");
        assert_eq!(session["items_new"], 2);
        assert_eq!(session["items_duplicate"], 1);

        let (_, sessions) = get_json(app, "/api/sessions").await;
        assert_eq!(sessions.as_array().unwrap().len(), 1);
        assert_eq!(store.article_count().await, 2);
    }

    #[tokio::test]
    async fn on_demand_sources_need_a_query() {
        let store = Arc::new(InMemoryStore::new());
        let app = app(pipeline_state(store.clone()));

        let (status, body) = post_json(app.clone(), "/api/sources/Facebook/run", json!({ "query": "  " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "source Facebook needs a query");

        let (status, session) =
            post_json(app.clone(), "/api/sources/Facebook/run", json!({ "query": "@ana.popescu" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["trigger"], "on_demand");
        assert_eq!(session["query"], "@ana.popescu");
        assert_eq!(session["items_new"], 1);

        let (status, _) = post_json(app, "/api/sources/Nimeni/run", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn read_only_servers_refuse_runs() {
        let app = app(AppState::new(Arc::new(InMemoryStore::new())));
        let (status, body) = post_json(app, "/api/sources/Adevarul/run", json!({})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("disabled"));
    }
}
