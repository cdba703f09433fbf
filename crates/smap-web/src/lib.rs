//! Axum + Askama front end: the drained history API and the attribution UI.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use smap_attribution::{records_for_entity, AttributionAnalyzer};
use smap_client::{ClientConfig, HistoryCollector, PageFetcher, PageSource, RateLimiter};
use smap_core::{EntityKind, HistoryRecord, UtmTouch};
use smap_export::{workbook_bytes, DisplayFormat, ExportConfig, ExportProjector};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "smap-web";

const MIN_TOKEN_LEN: usize = 10;
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn PageSource>,
    pub client: ClientConfig,
    pub projector: ExportProjector,
    shared_limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    pub fn new(source: Arc<dyn PageSource>, client: ClientConfig, projector: ExportProjector) -> Self {
        let shared_limiter = client
            .shared_rate_limit
            .then(|| Arc::new(RateLimiter::new(client.rate_limit)));
        Self {
            source,
            client,
            projector,
            shared_limiter,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let client = ClientConfig::from_env();
        let export = ExportConfig::from_env();
        let projector = ExportProjector::new(
            AttributionAnalyzer::new(export.load_field_names()?),
            DisplayFormat::new(export.display_offset),
        );
        let source: Arc<dyn PageSource> = Arc::new(PageFetcher::new(&client)?);
        Ok(Self::new(source, client, projector))
    }

    /// A shared limiter when configured, otherwise one scoped to this request.
    fn collector(&self) -> HistoryCollector {
        match &self.shared_limiter {
            Some(limiter) => HistoryCollector::new(self.source.clone(), limiter.clone()),
            None => HistoryCollector::with_fresh_limiter(self.source.clone(), self.client.rate_limit),
        }
    }

    async fn collect(
        &self,
        kind: EntityKind,
        token: &str,
        cursor: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, CollectTimedOut> {
        let collector = self.collector();
        let fut = collector.collect_all(kind, token, cursor);
        match self.client.collect_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                warn!(kind = kind.as_str(), timeout_secs = limit.as_secs(), "history collection timed out");
                CollectTimedOut
            }),
            None => Ok(fut.await),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CollectTimedOut;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("인증이 필요합니다.")]
    Missing,
    #[error("유효하지 않은 토큰입니다.")]
    Invalid,
}

/// Extract the bearer token from an `Authorization` header value. Only a
/// length check is applied.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Missing)?;
    let rest = value.strip_prefix("Bearer ").ok_or(AuthError::Missing)?;
    let token = rest.split(' ').next().unwrap_or_default();
    validate_token(token)?;
    Ok(token)
}

pub fn validate_token(token: &str) -> Result<(), AuthError> {
    if token.chars().count() < MIN_TOKEN_LEN {
        return Err(AuthError::Invalid);
    }
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct CursorQuery {
    cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnalyzeForm {
    token: String,
    #[serde(default)]
    cursor: Option<String>,
    kind: String,
    #[serde(default)]
    entity: Option<String>,
}

impl AnalyzeForm {
    fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref().filter(|c| !c.trim().is_empty())
    }

    fn entity(&self) -> Option<&str> {
        self.entity.as_deref().filter(|e| !e.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
struct EntityRowView {
    entity_id: String,
    name: String,
    email: String,
    touch_count: usize,
    conversion_days: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct TouchView {
    time: String,
    source: String,
    medium: String,
    campaign: String,
    content: String,
}

#[derive(Debug, Clone)]
struct RecordView {
    id: String,
    entity_id: String,
    record_type: String,
    field_name: String,
    field_value: String,
    owner_id: String,
    created_at: String,
}

#[derive(Debug, Clone)]
struct EntityDetailView {
    entity_id: String,
    name: String,
    email: String,
    deal_created_at: String,
    conversion_days: String,
    first_touch: String,
    pre_deal_touch: String,
    touches: Vec<TouchView>,
    history: Vec<RecordView>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    error: String,
    token: String,
    cursor: String,
    kind: String,
}

#[derive(Template)]
#[template(path = "analysis.html")]
struct AnalysisTemplate {
    kind: String,
    token: String,
    cursor: String,
    total_records: usize,
    utm_entities: usize,
    entities: Vec<EntityRowView>,
    detail: Option<EntityDetailView>,
    raw_json: String,
}

#[derive(Template)]
#[template(path = "message.html")]
struct MessageTemplate {
    title: String,
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(healthz_handler))
        .route("/analyze", post(analyze_handler))
        .route("/export", post(export_handler))
        .route("/history", get(people_history_handler))
        .route("/api/v2/{kind}/history", get(history_api_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| {
        std::env::var("SMAP_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000)
    });
    let state = AppState::from_env()?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving attribution explorer");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn index_handler() -> Response {
    render_html(IndexTemplate {
        error: String::new(),
        token: String::new(),
        cursor: String::new(),
        kind: EntityKind::People.as_str().to_string(),
    })
}

async fn people_history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CursorQuery>,
    headers: HeaderMap,
) -> Response {
    history_api(&state, EntityKind::People, query, &headers).await
}

async fn history_api_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(kind): AxumPath<String>,
    Query(query): Query<CursorQuery>,
    headers: HeaderMap,
) -> Response {
    match kind.parse::<EntityKind>() {
        Ok(kind) => history_api(&state, kind, query, &headers).await,
        Err(err) => json_failure(StatusCode::NOT_FOUND, &err.to_string()),
    }
}

async fn history_api(state: &AppState, kind: EntityKind, query: CursorQuery, headers: &HeaderMap) -> Response {
    let token = match bearer_token(headers) {
        Ok(token) => token,
        Err(err) => return auth_error(err),
    };

    let records = match state.collect(kind, token, query.cursor.as_deref()).await {
        Ok(records) => records,
        Err(CollectTimedOut) => {
            return json_failure(StatusCode::GATEWAY_TIMEOUT, "upstream history collection timed out")
        }
    };

    Json(serde_json::json!({
        "success": true,
        "data": history_data(kind, &records),
    }))
    .into_response()
}

/// The drained collection in upstream `data` shape, with the cursor exhausted.
fn history_data(kind: EntityKind, records: &[HistoryRecord]) -> JsonValue {
    let list = records
        .iter()
        .map(|r| r.to_wire_json(kind))
        .collect::<Vec<_>>();
    let mut data = serde_json::Map::new();
    data.insert(kind.list_key().to_string(), JsonValue::Array(list));
    data.insert("nextCursor".to_string(), JsonValue::Null);
    JsonValue::Object(data)
}

async fn analyze_handler(State(state): State<Arc<AppState>>, Form(form): Form<AnalyzeForm>) -> Response {
    let (kind, records) = match collect_for_form(&state, &form).await {
        Ok(collected) => collected,
        Err(resp) => return resp,
    };

    let analyzer = state.projector.analyzer();
    let format = state.projector.format();
    let selected = form.entity();
    let all = analyzer.analyze_all(&records);

    let entities = all
        .iter()
        .map(|e| EntityRowView {
            entity_id: e.entity_id.clone(),
            name: e.identity.name.clone().unwrap_or_default(),
            email: e.identity.email.clone().unwrap_or_default(),
            touch_count: e.summary.utm_touches.len(),
            conversion_days: e
                .summary
                .conversion_days
                .map(|d| d.to_string())
                .unwrap_or_default(),
            selected: selected == Some(e.entity_id.as_str()),
        })
        .collect::<Vec<_>>();

    let detail = selected.and_then(|id| all.iter().find(|e| e.entity_id == id)).map(|e| {
        let history = records_for_entity(&records, &e.entity_id)
            .into_iter()
            .map(|r| RecordView {
                id: r.id.clone(),
                entity_id: r.entity_id.clone(),
                record_type: r.record_type.clone(),
                field_name: r.field_name.clone(),
                field_value: r.field_value.display(),
                owner_id: r.owner_id.clone().unwrap_or_default(),
                created_at: format.time(r.created_at),
            })
            .collect();
        EntityDetailView {
            entity_id: e.entity_id.clone(),
            name: e.identity.name.clone().unwrap_or_default(),
            email: e.identity.email.clone().unwrap_or_default(),
            deal_created_at: e
                .summary
                .deal_created_at
                .map(|ts| format.time(ts))
                .unwrap_or_default(),
            conversion_days: e
                .summary
                .conversion_days
                .map(|d| d.to_string())
                .unwrap_or_default(),
            first_touch: touch_text(format, e.summary.first_touch.as_ref()),
            pre_deal_touch: touch_text(format, e.summary.pre_deal_touch.as_ref()),
            touches: e
                .summary
                .utm_touches
                .iter()
                .map(|t| touch_view(format, t))
                .collect(),
            history,
        }
    });

    render_html(AnalysisTemplate {
        kind: kind.as_str().to_string(),
        token: form.token.clone(),
        cursor: form.cursor().unwrap_or_default().to_string(),
        total_records: records.len(),
        utm_entities: all.iter().filter(|e| e.has_utm).count(),
        entities,
        detail,
        raw_json: serde_json::to_string_pretty(&history_data(kind, &records)).unwrap_or_default(),
    })
}

async fn export_handler(State(state): State<Arc<AppState>>, Form(form): Form<AnalyzeForm>) -> Response {
    let (kind, records) = match collect_for_form(&state, &form).await {
        Ok(collected) => collected,
        Err(resp) => return resp,
    };

    let set = match state.projector.build(&records) {
        Ok(set) => set,
        Err(err) => {
            let mut resp = render_html(MessageTemplate {
                title: "Nothing to export".to_string(),
                message: err.to_string(),
            });
            *resp.status_mut() = StatusCode::UNPROCESSABLE_ENTITY;
            return resp;
        }
    };

    match workbook_bytes(&set) {
        Ok(bytes) => {
            info!(kind = kind.as_str(), rows = set.len(), partial = set.is_partial(), "export downloaded");
            (
                [
                    (header::CONTENT_TYPE, XLSX_MIME.to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{kind}_attribution.xlsx\""),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn collect_for_form(
    state: &AppState,
    form: &AnalyzeForm,
) -> Result<(EntityKind, Vec<HistoryRecord>), Response> {
    let kind = form.kind.parse::<EntityKind>();
    let validated = validate_token(form.token.trim()).map_err(|e| e.to_string());
    let kind = match (kind, validated) {
        (Ok(kind), Ok(())) => kind,
        (Err(err), _) => return Err(index_error(form, StatusCode::BAD_REQUEST, err.to_string())),
        (_, Err(message)) => return Err(index_error(form, StatusCode::UNAUTHORIZED, message)),
    };

    match state.collect(kind, form.token.trim(), form.cursor()).await {
        Ok(records) => Ok((kind, records)),
        Err(CollectTimedOut) => Err(index_error(
            form,
            StatusCode::GATEWAY_TIMEOUT,
            "upstream history collection timed out".to_string(),
        )),
    }
}

fn index_error(form: &AnalyzeForm, status: StatusCode, error: String) -> Response {
    let mut resp = render_html(IndexTemplate {
        error,
        token: form.token.clone(),
        cursor: form.cursor().unwrap_or_default().to_string(),
        kind: form.kind.clone(),
    });
    *resp.status_mut() = status;
    resp
}

fn touch_text(format: &DisplayFormat, touch: Option<&UtmTouch>) -> String {
    touch
        .map(|t| format!("{} ({})", format.touch_summary(t), format.time(t.created_at)))
        .unwrap_or_default()
}

fn touch_view(format: &DisplayFormat, touch: &UtmTouch) -> TouchView {
    let cell = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    TouchView {
        time: format.time(touch.created_at),
        source: cell(&touch.source),
        medium: cell(&touch.medium),
        campaign: cell(&touch.campaign),
        content: cell(&touch.content),
    }
}

fn auth_error(err: AuthError) -> Response {
    json_failure(StatusCode::UNAUTHORIZED, &err.to_string())
}

fn json_failure(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "message": message,
        })),
    )
        .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
