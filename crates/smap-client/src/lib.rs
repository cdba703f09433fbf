//! Upstream Salesmap history client: fixed-window rate limiting, fail-soft page
//! fetches and cursor-chained collection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use smap_core::{CursorPage, EntityKind, HistoryRecord};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "smap-client";

pub const DEFAULT_BASE_URL: &str = "https://salesmap.kr";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    /// Upstream published quota: 100 calls per 12 seconds.
    fn default() -> Self {
        Self {
            max_calls: 100,
            window: Duration::from_millis(12_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit: RateLimitConfig,
    /// Share one limiter across every collection in the process instead of
    /// one per collection run.
    pub shared_rate_limit: bool,
    pub collect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: Some("smap-attribution/0.1".to_string()),
            rate_limit: RateLimitConfig::default(),
            shared_rate_limit: false,
            collect_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SMAP_API_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            timeout: Duration::from_secs(env_parse("SMAP_HTTP_TIMEOUT_SECS", 20)),
            user_agent: std::env::var("SMAP_USER_AGENT").ok().or(defaults.user_agent),
            rate_limit: RateLimitConfig {
                max_calls: env_parse("SMAP_RATE_LIMIT_MAX_CALLS", defaults.rate_limit.max_calls),
                window: Duration::from_millis(env_parse("SMAP_RATE_LIMIT_WINDOW_MS", 12_000)),
            },
            shared_rate_limit: std::env::var("SMAP_SHARED_RATE_LIMIT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            collect_timeout: std::env::var("SMAP_COLLECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Time source for the limiter; swapped for a manual clock in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fixed-window limiter: at most `max_calls` admissions per window. A burst of
/// up to twice the limit can straddle a window boundary.
pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let window_start = clock.now();
        Self {
            max_calls: config.max_calls.max(1),
            window: config.window,
            clock,
            state: Mutex::new(WindowState {
                window_start,
                count: 0,
            }),
        }
    }

    /// Wait until the current window has room, then consume one admission.
    pub async fn allow(&self) {
        // Held across the wait: callers of a shared limiter queue behind the reset.
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.window_start);

        if elapsed >= self.window {
            state.count = 0;
            state.window_start = now;
        }

        if state.count >= self.max_calls {
            let wait = self.window.saturating_sub(elapsed);
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, "rate limit window full; waiting");
                self.clock.sleep(wait).await;
            }
            state.count = 0;
            state.window_start = self.clock.now();
        }

        state.count += 1;
    }
}

/// One upstream page request. Implementations never fail: problems surface as
/// an empty terminal page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, kind: EntityKind, token: &str, cursor: Option<&str>) -> CursorPage;
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed history page from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl PageFetcher {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn page_url(&self, kind: EntityKind) -> String {
        format!("{}/api/v2/{}/history", self.base_url, kind.as_str())
    }

    async fn try_fetch(
        &self,
        kind: EntityKind,
        token: &str,
        cursor: Option<&str>,
    ) -> Result<CursorPage, FetchError> {
        let url = self.page_url(kind);
        let mut request = self
            .client
            .get(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(token);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(%url, "upstream reported rate limit exceeded");
            }
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        parse_page(kind, &body).map_err(|reason| FetchError::Malformed { url, reason })
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch(&self, kind: EntityKind, token: &str, cursor: Option<&str>) -> CursorPage {
        match self.try_fetch(kind, token, cursor).await {
            Ok(page) => page,
            Err(err) => {
                warn!(kind = kind.as_str(), cursor, error = %err, "history page fetch failed; treating as empty last page");
                CursorPage::empty()
            }
        }
    }
}

/// Normalize `{data: {<kind>HistoryList: [...], nextCursor}}` into a page.
pub fn parse_page(kind: EntityKind, body: &[u8]) -> Result<CursorPage, String> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let mut data = envelope.data.ok_or_else(|| "missing `data` object".to_string())?;
    let items = match data.get_mut(kind.list_key()).map(JsonValue::take) {
        Some(JsonValue::Array(items)) => items,
        Some(_) => return Err(format!("`{}` is not an array", kind.list_key())),
        None => return Err(format!("missing `{}`", kind.list_key())),
    };

    // Unreadable records are skipped one by one; the page and its cursor survive.
    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let record_id = item
            .get("id")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        match HistoryRecord::from_wire(kind, item) {
            Ok(record) => records.push(record),
            Err(err) => warn!(
                kind = kind.as_str(),
                index,
                record_id = %record_id,
                error = %err,
                "skipping unreadable history record"
            ),
        }
    }
    let next_cursor = data
        .get("nextCursor")
        .and_then(JsonValue::as_str)
        .filter(|c| !c.is_empty())
        .map(ToString::to_string);
    Ok(CursorPage {
        records,
        next_cursor,
    })
}

#[derive(Debug, Clone)]
pub struct CollectedHistory {
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub pages: usize,
    pub records: Vec<HistoryRecord>,
}

/// Drains a cursor chain one page at a time.
pub struct HistoryCollector {
    source: Arc<dyn PageSource>,
    limiter: Arc<RateLimiter>,
}

impl HistoryCollector {
    pub fn new(source: Arc<dyn PageSource>, limiter: Arc<RateLimiter>) -> Self {
        Self { source, limiter }
    }

    /// Collector with its own limiter, scoped to this collector's runs.
    pub fn with_fresh_limiter(source: Arc<dyn PageSource>, config: RateLimitConfig) -> Self {
        Self::new(source, Arc::new(RateLimiter::new(config)))
    }

    pub async fn collect_all(
        &self,
        kind: EntityKind,
        token: &str,
        start_cursor: Option<&str>,
    ) -> Vec<HistoryRecord> {
        self.collect(kind, token, start_cursor).await.records
    }

    /// Terminates only once the source returns no cursor. Records are kept in
    /// page-visit order without deduplication.
    pub async fn collect(
        &self,
        kind: EntityKind,
        token: &str,
        start_cursor: Option<&str>,
    ) -> CollectedHistory {
        let run_id = Uuid::new_v4();
        let span = info_span!("collect_history", %run_id, kind = kind.as_str());

        async move {
            let mut records = Vec::new();
            let mut pages = 0usize;
            let mut cursor = start_cursor.filter(|c| !c.is_empty()).map(ToString::to_string);

            loop {
                self.limiter.allow().await;
                let page = self.source.fetch(kind, token, cursor.as_deref()).await;
                pages += 1;
                debug!(page = pages, records = page.records.len(), "history page received");
                records.extend(page.records);

                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }

            info!(pages, records = records.len(), "history collection finished");
            CollectedHistory {
                run_id,
                kind,
                pages,
                records,
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use axum::{
        extract::Query,
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use chrono::{TimeZone, Utc};
    use smap_core::FieldValue;
    use tokio::net::TcpListener;

    struct ManualClock {
        base: Instant,
        offset: StdMutex<Duration>,
        sleeps: StdMutex<Vec<Duration>>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: StdMutex::new(Duration::ZERO),
                sleeps: StdMutex::new(Vec::new()),
            })
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }

        fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            self.advance(duration);
        }
    }

    fn record(id: &str, entity: &str) -> HistoryRecord {
        HistoryRecord {
            id: id.to_string(),
            entity_id: entity.to_string(),
            record_type: "editField".to_string(),
            field_name: "이름".to_string(),
            field_value: FieldValue::Text(id.to_string()),
            owner_id: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().unwrap(),
        }
    }

    /// Pages keyed by the cursor that requests them.
    struct ScriptedPages {
        pages: HashMap<Option<String>, CursorPage>,
        calls: StdMutex<Vec<Option<String>>>,
    }

    impl ScriptedPages {
        fn chain(page_count: usize) -> Self {
            let mut pages = HashMap::new();
            for i in 0..page_count {
                let key = if i == 0 { None } else { Some(format!("c{i}")) };
                let next = (i + 1 < page_count).then(|| format!("c{}", i + 1));
                pages.insert(
                    key,
                    CursorPage {
                        records: vec![record(&format!("r{i}"), "p1")],
                        next_cursor: next,
                    },
                );
            }
            Self {
                pages,
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Option<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedPages {
        async fn fetch(&self, _kind: EntityKind, _token: &str, cursor: Option<&str>) -> CursorPage {
            let key = cursor.map(ToString::to_string);
            self.calls.lock().unwrap().push(key.clone());
            self.pages.get(&key).cloned().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn limiter_forces_wait_before_call_over_quota() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(RateLimitConfig::default(), clock.clone());

        for _ in 0..100 {
            limiter.allow().await;
        }
        assert!(clock.sleeps().is_empty());
        assert_eq!(limiter.state.lock().await.count, 100);

        limiter.allow().await;
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(12_000)]);
        assert_eq!(limiter.state.lock().await.count, 1);
    }

    #[tokio::test]
    async fn limiter_waits_only_for_remainder_of_window() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            RateLimitConfig {
                max_calls: 2,
                window: Duration::from_secs(10),
            },
            clock.clone(),
        );
        limiter.allow().await;
        limiter.allow().await;
        clock.advance(Duration::from_secs(4));
        limiter.allow().await;
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(6)]);
    }

    #[tokio::test]
    async fn limiter_resets_after_window_without_waiting() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            RateLimitConfig {
                max_calls: 3,
                window: Duration::from_secs(12),
            },
            clock.clone(),
        );
        for _ in 0..3 {
            limiter.allow().await;
        }
        clock.advance(Duration::from_secs(12));
        limiter.allow().await;
        assert!(clock.sleeps().is_empty());
        assert_eq!(limiter.state.lock().await.count, 1);
    }

    #[tokio::test]
    async fn collector_concatenates_pages_in_visit_order() {
        let source = Arc::new(ScriptedPages::chain(3));
        let collector = HistoryCollector::new(
            source.clone(),
            Arc::new(RateLimiter::with_clock(RateLimitConfig::default(), ManualClock::new())),
        );

        let collected = collector.collect(EntityKind::People, "token-123456", None).await;
        let ids = collected.records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);
        assert_eq!(collected.pages, 3);
        assert_eq!(
            source.calls(),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[tokio::test]
    async fn collector_single_terminal_page_is_one_call() {
        let source = Arc::new(ScriptedPages::chain(1));
        let collector = HistoryCollector::new(
            source.clone(),
            Arc::new(RateLimiter::with_clock(RateLimitConfig::default(), ManualClock::new())),
        );
        let records = collector.collect_all(EntityKind::Organization, "token-123456", Some("")).await;
        assert_eq!(records.len(), 1);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn collector_stays_within_quota_over_long_chains() {
        let clock = ManualClock::new();
        let source = Arc::new(ScriptedPages::chain(250));
        let collector = HistoryCollector::new(
            source,
            Arc::new(RateLimiter::with_clock(RateLimitConfig::default(), clock.clone())),
        );
        let records = collector.collect_all(EntityKind::People, "token-123456", None).await;
        assert_eq!(records.len(), 250);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(12_000), Duration::from_millis(12_000)]
        );
    }

    #[tokio::test]
    async fn collector_keeps_duplicates_across_pages() {
        let mut source = ScriptedPages::chain(2);
        if let Some(page) = source.pages.get_mut(&Some("c1".to_string())) {
            page.records = vec![record("r0", "p1")];
        }
        let collector = HistoryCollector::new(
            Arc::new(source),
            Arc::new(RateLimiter::with_clock(RateLimitConfig::default(), ManualClock::new())),
        );
        let records = collector.collect_all(EntityKind::People, "token-123456", None).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], records[1]);
    }

    async fn upstream_handler(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer good-token-123" {
            return (AxumStatus::UNAUTHORIZED, "nope").into_response();
        }
        match params.get("cursor").map(String::as_str) {
            None => Json(serde_json::json!({
                "data": {
                    "peopleHistoryList": [{
                        "id": "h1",
                        "peopleId": "p1",
                        "type": "editField",
                        "fieldName": "utm_source",
                        "fieldValue": "google",
                        "ownerId": "u1",
                        "createdAt": "2024-01-01T00:00:00.000Z"
                    }],
                    "nextCursor": "second"
                }
            }))
            .into_response(),
            Some("second") => Json(serde_json::json!({
                "data": {"peopleHistoryList": [], "nextCursor": null}
            }))
            .into_response(),
            Some("broken") => "{not json".into_response(),
            Some("mixed") => Json(serde_json::json!({
                "data": {
                    "peopleHistoryList": [
                        {"id": "bad", "peopleId": "p1", "fieldName": null, "createdAt": "2024-01-01T00:00:00Z"},
                        {"id": "h2", "peopleId": "p1", "fieldName": "utm_medium", "fieldValue": "cpc", "createdAt": "2024-01-01T00:00:10Z"}
                    ],
                    "nextCursor": "tail"
                }
            }))
            .into_response(),
            Some("tail") => Json(serde_json::json!({
                "data": {
                    "peopleHistoryList": [
                        {"id": "h3", "peopleId": "p2", "fieldName": "이름", "fieldValue": "김철수", "createdAt": "2024-01-02T00:00:00Z"}
                    ],
                    "nextCursor": null
                }
            }))
            .into_response(),
            Some(_) => (AxumStatus::INTERNAL_SERVER_ERROR, "boom").into_response(),
        }
    }

    async fn spawn_upstream() -> String {
        let router = Router::new().route("/api/v2/people/history", get(upstream_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher_for(base_url: String) -> PageFetcher {
        PageFetcher::new(&ClientConfig {
            base_url,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetcher_parses_page_and_cursor() {
        let fetcher = fetcher_for(spawn_upstream().await);
        let page = fetcher.fetch(EntityKind::People, "good-token-123", None).await;
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].entity_id, "p1");
        assert_eq!(page.next_cursor.as_deref(), Some("second"));

        let last = fetcher
            .fetch(EntityKind::People, "good-token-123", Some("second"))
            .await;
        assert!(last.records.is_empty());
        assert_eq!(last.next_cursor, None);
    }

    #[tokio::test]
    async fn fetcher_fails_soft_on_status_and_malformed_body() {
        let fetcher = fetcher_for(spawn_upstream().await);
        for cursor in [Some("explode"), Some("broken")] {
            let page = fetcher.fetch(EntityKind::People, "good-token-123", cursor).await;
            assert_eq!(page, CursorPage::empty());
        }
        let unauthorized = fetcher.fetch(EntityKind::People, "bad-token-000", None).await;
        assert_eq!(unauthorized, CursorPage::empty());
        let unknown_route = fetcher
            .fetch(EntityKind::Organization, "good-token-123", None)
            .await;
        assert_eq!(unknown_route, CursorPage::empty());
    }

    #[tokio::test]
    async fn collection_continues_past_an_unreadable_record() {
        let fetcher = Arc::new(fetcher_for(spawn_upstream().await));
        let collector = HistoryCollector::new(
            fetcher,
            Arc::new(RateLimiter::with_clock(RateLimitConfig::default(), ManualClock::new())),
        );
        let collected = collector
            .collect(EntityKind::People, "good-token-123", Some("mixed"))
            .await;
        let ids = collected.records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["h2", "h3"]);
        assert_eq!(collected.pages, 2);
    }

    #[test]
    fn parse_page_skips_bad_records_and_keeps_cursor() {
        let page = parse_page(
            EntityKind::People,
            br#"{"data":{"peopleHistoryList":[
                {"id":"bad","peopleId":"p1","fieldName":null,"createdAt":"2024-01-01T00:00:00Z"},
                {"id":"both","peopleId":"p1","organizationId":"o1","fieldName":"utm_source","fieldValue":"google","createdAt":"2024-01-01T00:00:00Z"}
            ],"nextCursor":"next-page"}}"#,
        )
        .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "both");
        assert_eq!(page.records[0].entity_id, "p1");
        assert_eq!(page.next_cursor.as_deref(), Some("next-page"));
    }

    #[test]
    fn parse_page_rejects_missing_list() {
        let err = parse_page(EntityKind::People, br#"{"data":{"organizationHistoryList":[]}}"#)
            .unwrap_err();
        assert!(err.contains("peopleHistoryList"));
        let page = parse_page(
            EntityKind::Organization,
            br#"{"data":{"organizationHistoryList":[],"nextCursor":""}}"#,
        )
        .unwrap();
        assert_eq!(page.next_cursor, None);
    }
}
