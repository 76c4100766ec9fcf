use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use newsdesk_adapters::{
    AdapterError, ArticleSettings, FeedSettings, FetchContext, FetchError, MethodSettings, PageSettings,
    SourceAdapter, Strategy,
};
use newsdesk_core::FetchMethod;
use newsdesk_storage::{HttpClientConfig, HttpFetcher};
use uuid::Uuid;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn adevarul_settings() -> MethodSettings {
    MethodSettings {
        feed: Some(FeedSettings {
            url: "https://adevarul.ro/rss/".into(),
            fixture: Some(fixtures().join("adevarul/rss.xml")),
        }),
        page: Some(PageSettings {
            url: "https://adevarul.ro/".into(),
            fixture: Some(fixtures().join("adevarul/homepage.html")),
            item_selector: "article.article-card".into(),
            title_selector: "a.title".into(),
            link_selector: Some("a.title".into()),
            summary_selector: Some(".summary".into()),
            time_selector: Some(".date".into()),
            time_attribute: None,
            utc_offset_minutes: 120,
        }),
        session: None,
        article: None,
    }
}

fn fetched_at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-04T10:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn combine_merges_feed_and_homepage_fixtures() {
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let adapter = SourceAdapter::from_settings(
        "Adevarul",
        Strategy::Combine,
        FetchMethod::Feed,
        Some(FetchMethod::Page),
        &adevarul_settings(),
    )
    .unwrap()
    .with_min_title_chars(10);

    let ctx = FetchContext {
        run_id: Uuid::new_v4(),
        source: "Adevarul",
        fetched_at: fetched_at(),
        query: None,
        http: &http,
    };
    let batch = adapter.fetch(&ctx).await.unwrap();

    assert_eq!(batch.method_used, FetchMethod::Feed);
    assert_eq!(batch.collapsed, 2);
    let titles = batch
        .items
        .iter()
        .filter_map(|i| i.title.as_deref())
        .collect::<Vec<_>>();
    assert_eq!(
        titles,
        vec![
            "Guvernul aprobă bugetul pentru anul viitor",
            "Ninsori abundente în nordul țării",
            "Leul se depreciază în raport cu euro",
        ]
    );
}

#[tokio::test]
async fn missing_page_fixture_falls_back_to_feed() {
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let mut settings = adevarul_settings();
    if let Some(page) = settings.page.as_mut() {
        page.fixture = Some(fixtures().join("adevarul/missing.html"));
    }
    let adapter = SourceAdapter::from_settings(
        "Adevarul",
        Strategy::Fallback,
        FetchMethod::Page,
        Some(FetchMethod::Feed),
        &settings,
    )
    .unwrap();

    let ctx = FetchContext {
        run_id: Uuid::new_v4(),
        source: "Adevarul",
        fetched_at: fetched_at(),
        query: None,
        http: &http,
    };
    let batch = adapter.fetch(&ctx).await.unwrap();
    assert_eq!(batch.method_used, FetchMethod::Feed);
    assert_eq!(batch.items.len(), 3);
    assert!(batch.fallback_reason.unwrap().starts_with("page:"));
}

#[tokio::test]
async fn missing_fixtures_everywhere_exhaust_the_source() {
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let mut settings = adevarul_settings();
    if let Some(page) = settings.page.as_mut() {
        page.fixture = Some(fixtures().join("adevarul/missing.html"));
    }
    if let Some(feed) = settings.feed.as_mut() {
        feed.fixture = Some(fixtures().join("adevarul/missing.xml"));
    }
    let adapter = SourceAdapter::from_settings(
        "Adevarul",
        Strategy::Fallback,
        FetchMethod::Page,
        Some(FetchMethod::Feed),
        &settings,
    )
    .unwrap();

    let ctx = FetchContext {
        run_id: Uuid::new_v4(),
        source: "Adevarul",
        fetched_at: fetched_at(),
        query: None,
        http: &http,
    };
    match adapter.fetch(&ctx).await {
        Err(AdapterError::Exhausted { failures, .. }) => {
            assert!(failures
                .iter()
                .all(|f| matches!(f.error, FetchError::Io { .. })));
        }
        other => panic!("expected exhaustion, got {:?}", other.map(|b| b.items.len())),
    }
}

#[tokio::test]
async fn article_pages_fill_in_bodies_and_modification_times() {
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let settings = MethodSettings {
        page: Some(PageSettings {
            url: "https://www.biziday.ro/".into(),
            fixture: Some(fixtures().join("biziday/homepage.html")),
            item_selector: "li.article".into(),
            title_selector: "h2.post-title".into(),
            link_selector: Some("a.post-url".into()),
            summary_selector: Some(".news-content p".into()),
            time_selector: Some("time.timeago".into()),
            time_attribute: Some("datetime".into()),
            utc_offset_minutes: 120,
        }),
        article: Some(ArticleSettings {
            content_selector: "div.post-content p".into(),
            min_paragraph_chars: 20,
            fixture_dir: Some(fixtures().join("biziday/articles")),
            utc_offset_minutes: 120,
            concurrency: 2,
        }),
        ..Default::default()
    };
    let adapter = SourceAdapter::from_settings("Biziday", Strategy::Fallback, FetchMethod::Page, None, &settings).unwrap();

    let ctx = FetchContext {
        run_id: Uuid::new_v4(),
        source: "Biziday",
        fetched_at: fetched_at(),
        query: None,
        http: &http,
    };
    let batch = adapter.fetch(&ctx).await.unwrap();
    assert_eq!(batch.items.len(), 4);

    let bnr = &batch.items[0];
    assert!(bnr.content.as_deref().unwrap().contains("inflații încă ridicate"));
    assert_eq!(
        bnr.updated_at,
        Some(DateTime::parse_from_rfc3339("2026-03-04T08:20:00Z").unwrap().with_timezone(&Utc))
    );
    assert_eq!(
        bnr.published_at,
        Some(DateTime::parse_from_rfc3339("2026-03-04T07:03:11Z").unwrap().with_timezone(&Utc))
    );

    // No captured page: the listing entry is kept as is.
    let traffic = &batch.items[1];
    assert_eq!(traffic.content, None);
    assert_eq!(traffic.updated_at, None);

    let weather = &batch.items[3];
    assert!(weather.content.as_deref().unwrap().starts_with("Meteorologii anunță"));
    assert_eq!(
        weather.published_at,
        Some(DateTime::parse_from_rfc3339("2026-03-03T16:45:00Z").unwrap().with_timezone(&Utc))
    );
}
