//! HTTP API: routing, handlers, shared state, and the ban middleware.
//!
//! Handlers are thin: resolve the time window, check the entity filter, call
//! the HA client or the import cache, normalize, respond. All fallibility
//! funnels through [`ApiError`].

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::auth::{AccessGate, BanStore, CredentialStore};
use crate::config::Config;
use crate::error::ApiError;
use crate::ha::HaClient;
use crate::import_cache::{ImportCache, ImportSession, parse_upload};
use crate::model::{
    AttributeExportDocument, AttributeHistoryResponse, AttributeQuery, DetailSnapshot,
    EntityExportDocument, ExportFormat, ExportQuery, HistoryRangeResponse,
    HistoryResponse, ImportData, ImportKind, ImportResponse, LoginRequest, LoginResponse,
    RangeQuery, RawHistoryRecord, TimestampQuery, parse_ts,
};
use crate::normalize::{entity_domain, normalize_attribute_history, normalize_entity_history};

/// Upload size cap. Exported archives are small; this is generous.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Fetch window used to find the record preceding a detail timestamp.
const DETAIL_LOOKBACK_MINUTES: i64 = 5;

/// Shared application state, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ha: HaClient,
    pub imports: ImportCache,
    pub gate: AccessGate,
    pub credentials: CredentialStore,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let ha = HaClient::new(&config.home_assistant.url, &config.home_assistant.api_token);
        let gate = AccessGate::new(BanStore::new(&config.ban_file), &config.safe_ips);
        let credentials = CredentialStore::new(&config.users_file);
        AppState {
            config: Arc::new(config),
            ha,
            imports: ImportCache::new(),
            gate,
            credentials,
        }
    }
}

/// Client IP resolved by the ban middleware, available to handlers via
/// request extensions.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/login", post(login))
        .route("/api/config", get(public_config))
        .route("/api/entities", get(entities))
        .route("/api/history/:entity_id", get(entity_history))
        .route("/api/attribute-history/:entity_id", get(attribute_history))
        .route("/api/details/:entity_id", get(entity_details))
        .route("/api/history-range/:entity_id", get(history_range))
        .route("/api/import", post(import_upload))
        .route("/api/details/imported/:import_id", get(imported_details))
        .route(
            "/api/imported/attribute-history/:import_id",
            get(imported_attribute_history),
        )
        .route("/api/import/:import_id", delete(delete_import))
        .route("/api/export/entity/:entity_id", get(export_entity))
        .route("/api/export/attribute/:entity_id", get(export_attribute))
        .layer(middleware::from_fn_with_state(state.clone(), access_gate))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Ban enforcement, applied over every route. Banned IPs are rejected before
/// any handler runs; the resolved IP is stashed for the login handler.
async fn access_gate(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(&req);
    state.gate.check(&ip)?;
    req.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(req).await)
}

/// Source IP of a request: the last `X-Forwarded-For` hop when present,
/// else the socket peer address.
///
/// The expected deployment sits behind a single ingress proxy, which appends
/// the real peer address to whatever the client sent. Only that rightmost
/// hop is trustworthy; earlier hops are client-controlled and honoring them
/// would let a banned client spoof an exempt address.
fn client_ip(req: &Request<Body>) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(last) = forwarded.rsplit(',').next() {
            let last = last.trim();
            if !last.is_empty() {
                return last.to_string();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[instrument(skip(state, body))]
async fn login(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if !state.credentials.enabled() {
        info!("No users configured, authentication disabled");
        return Ok(Json(LoginResponse {
            status: "ok".to_string(),
            user: body.username,
        }));
    }

    if state.credentials.verify(&body.username, &body.password) {
        info!(user = %body.username, "Login succeeded");
        return Ok(Json(LoginResponse {
            status: "ok".to_string(),
            user: body.username,
        }));
    }

    state.gate.note_failure(&ip);
    Err(ApiError::InvalidCredentials)
}

#[instrument(skip(state))]
async fn public_config(State(state): State<AppState>) -> Json<crate::config::PublicConfig> {
    Json(state.config.public())
}

#[instrument(skip(state))]
async fn entities(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::model::EntitySummary>>, ApiError> {
    let all = state.ha.entities_summary().await?;
    let visible: Vec<_> = all
        .into_iter()
        .filter(|e| state.config.is_entity_allowed(&e.entity_id))
        .collect();
    Ok(Json(visible))
}

#[instrument(skip(state))]
async fn entity_history(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    ensure_allowed(&state, &entity_id)?;
    let (start, end) = resolve_range(&state, query.start.as_deref(), query.end.as_deref())?;
    let records = state.ha.get_history(&entity_id, start, end).await?;
    let payload = normalize_entity_history(&entity_id, &records);
    Ok(Json(HistoryResponse {
        domain: entity_domain(&entity_id).to_string(),
        entity_id,
        start: start.to_rfc3339(),
        end: end.to_rfc3339(),
        count: payload.len(),
        payload,
    }))
}

#[instrument(skip(state))]
async fn attribute_history(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Query(query): Query<AttributeQuery>,
) -> Result<Json<AttributeHistoryResponse>, ApiError> {
    ensure_allowed(&state, &entity_id)?;
    let key = require_key(query.key)?;
    let (start, end) = resolve_range(&state, query.start.as_deref(), query.end.as_deref())?;
    let records = state.ha.get_history(&entity_id, start, end).await?;
    let payload = normalize_attribute_history(&key, &records);
    Ok(Json(AttributeHistoryResponse {
        entity_id,
        key,
        start: start.to_rfc3339(),
        end: end.to_rfc3339(),
        count: payload.len(),
        payload,
    }))
}

/// Full attribute map of an entity at (or immediately preceding) one instant,
/// found by fetching a short window ending at that instant and taking the
/// last record.
#[instrument(skip(state))]
async fn entity_details(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Query(query): Query<TimestampQuery>,
) -> Result<Json<DetailSnapshot>, ApiError> {
    ensure_allowed(&state, &entity_id)?;
    let instant = match query.timestamp.as_deref() {
        Some(raw) => parse_instant(raw)?,
        None => Utc::now(),
    };
    let window_start = instant - Duration::minutes(DETAIL_LOOKBACK_MINUTES);
    let records = state.ha.get_history(&entity_id, window_start, instant).await?;

    let snapshot = records
        .iter()
        .rev()
        .find(|r| r.timestamp().is_some())
        .map(|r| DetailSnapshot {
            timestamp: r.timestamp().map(|ts| ts.to_string()),
            state: r.state.clone(),
            attributes: r.attributes.clone(),
        })
        .unwrap_or_else(DetailSnapshot::empty);
    Ok(Json(snapshot))
}

#[instrument(skip(state))]
async fn history_range(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<HistoryRangeResponse>, ApiError> {
    ensure_allowed(&state, &entity_id)?;
    let (earliest, latest) = state.ha.history_range(&entity_id).await?;
    Ok(Json(HistoryRangeResponse {
        entity_id,
        earliest,
        latest: latest.to_rfc3339(),
    }))
}

#[instrument(skip(state, multipart))]
async fn import_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ImportResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::ImportParse(e.to_string()))?
    {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.json").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::ImportParse(e.to_string()))?;
        let session = parse_upload(&bytes)?;
        info!(%filename, entity_id = %session.entity_id, kind = ?session.kind, "Import accepted");
        return Ok(Json(import_response(&state, filename, session)));
    }
    Err(ApiError::BadRequest("No file in upload".to_string()))
}

fn import_response(state: &AppState, filename: String, session: ImportSession) -> ImportResponse {
    let kind = session.kind;
    let data = ImportData {
        import_id: String::new(),
        entity_id: session.entity_id.clone(),
        key: session.key.clone(),
        start: session.start.clone(),
        end: session.end.clone(),
        count: session.payload.len(),
        payload: session.payload.clone(),
        attributes: session.attributes.clone(),
    };
    let import_id = state.imports.create(session);
    ImportResponse {
        kind,
        filename,
        data: ImportData { import_id, ..data },
    }
}

#[instrument(skip(state))]
async fn imported_details(
    State(state): State<AppState>,
    Path(import_id): Path<String>,
    Query(query): Query<TimestampQuery>,
) -> Result<Json<DetailSnapshot>, ApiError> {
    let session = state
        .imports
        .lookup(&import_id)
        .ok_or(ApiError::SessionNotFound)?;
    let raw = query
        .timestamp
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Missing timestamp parameter".to_string()))?;
    let instant = parse_instant(raw)?;
    Ok(Json(session.snapshot_at(instant)))
}

/// Attribute drill-down inside an import session, no live fetch involved.
///
/// Attribute sessions already hold the one series they were exported with;
/// entity sessions rebuild the requested attribute's series from the stored
/// per-timestamp attribute maps. Both are then sliced to the window.
#[instrument(skip(state))]
async fn imported_attribute_history(
    State(state): State<AppState>,
    Path(import_id): Path<String>,
    Query(query): Query<AttributeQuery>,
) -> Result<Json<AttributeHistoryResponse>, ApiError> {
    let session = state
        .imports
        .lookup(&import_id)
        .ok_or(ApiError::SessionNotFound)?;
    let start = query.start.as_deref().map(parse_instant).transpose()?;
    let end = query.end.as_deref().map(parse_instant).transpose()?;

    let (key, payload) = match session.kind {
        ImportKind::Attribute => {
            let key = session.key.clone().unwrap_or_default();
            (key, session.payload.window(start, end))
        }
        ImportKind::Entity => {
            let key = require_key(query.key)?;
            let attributes = session.attributes.as_deref().unwrap_or(&[]);
            let records: Vec<RawHistoryRecord> = session
                .payload
                .timestamps()
                .iter()
                .zip(attributes)
                .map(|(ts, attrs)| RawHistoryRecord {
                    state: None,
                    attributes: attrs.clone(),
                    last_changed: Some(ts.clone()),
                    last_updated: None,
                })
                .collect();
            let payload = normalize_attribute_history(&key, &records).window(start, end);
            (key, payload)
        }
    };

    Ok(Json(AttributeHistoryResponse {
        entity_id: session.entity_id.clone(),
        key,
        start: query.start.unwrap_or_else(|| session.start.clone()),
        end: query.end.unwrap_or_else(|| session.end.clone()),
        count: payload.len(),
        payload,
    }))
}

/// Deleting an id that is already gone is success: the memory is free
/// either way, and the closing-tab beacon may race an explicit delete.
#[instrument(skip(state))]
async fn delete_import(
    State(state): State<AppState>,
    Path(import_id): Path<String>,
) -> Json<Value> {
    state.imports.delete(&import_id);
    Json(json!({ "status": "ok" }))
}

#[instrument(skip(state))]
async fn export_entity(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    ensure_allowed(&state, &entity_id)?;
    let (start, end) = resolve_range(&state, query.start.as_deref(), query.end.as_deref())?;
    let records = state.ha.get_history(&entity_id, start, end).await?;

    // Only timestamped records make it into the payload; the attributes
    // array must stay parallel to it.
    let kept: Vec<&RawHistoryRecord> =
        records.iter().filter(|r| r.timestamp().is_some()).collect();
    let payload = normalize_entity_history(&entity_id, &records);
    let attributes: Vec<Value> = kept.iter().map(|r| r.attributes.clone()).collect();

    let doc = EntityExportDocument {
        kind: ImportKind::Entity,
        entity_id: entity_id.clone(),
        start: start.to_rfc3339(),
        end: end.to_rfc3339(),
        payload,
        attributes,
    };
    let body = serde_json::to_vec(&doc).map_err(|e| ApiError::Internal(e.into()))?;
    attachment_response(&export_filename(&entity_id, None, start, end), query.format, body)
}

#[instrument(skip(state))]
async fn export_attribute(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    ensure_allowed(&state, &entity_id)?;
    let key = require_key(query.key.clone())?;
    let (start, end) = resolve_range(&state, query.start.as_deref(), query.end.as_deref())?;
    let records = state.ha.get_history(&entity_id, start, end).await?;
    let payload = normalize_attribute_history(&key, &records);

    let doc = AttributeExportDocument {
        kind: ImportKind::Attribute,
        entity_id: entity_id.clone(),
        key: key.clone(),
        start: start.to_rfc3339(),
        end: end.to_rfc3339(),
        payload,
    };
    let body = serde_json::to_vec(&doc).map_err(|e| ApiError::Internal(e.into()))?;
    attachment_response(
        &export_filename(&entity_id, Some(&key), start, end),
        query.format,
        body,
    )
}

fn ensure_allowed(state: &AppState, entity_id: &str) -> Result<(), ApiError> {
    if state.config.is_entity_allowed(entity_id) {
        Ok(())
    } else {
        Err(ApiError::EntityNotAllowed)
    }
}

fn require_key(key: Option<String>) -> Result<String, ApiError> {
    match key {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(ApiError::BadRequest("Missing key parameter".to_string())),
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    parse_ts(raw).ok_or_else(|| ApiError::BadRequest(format!("Invalid date format: {raw}")))
}

/// Resolve the `[start, end]` window. Missing `end` means now; missing
/// `start` means `end` minus the configured default history depth.
fn resolve_range(
    state: &AppState,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let end = match end {
        Some(raw) => parse_instant(raw)?,
        None => Utc::now(),
    };
    let start = match start {
        Some(raw) => parse_instant(raw)?,
        None => end - Duration::days(i64::from(state.config.app.default_history_days)),
    };
    Ok((start, end))
}

fn export_filename(
    entity_id: &str,
    key: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    let middle = match key {
        Some(key) => format!("{entity_id}_{key}"),
        None => entity_id.to_string(),
    };
    format!(
        "history_{middle}_{}_{}",
        start.format("%Y%m%d_%H%M"),
        end.format("%Y%m%d_%H%M")
    )
}

fn attachment_response(
    basename: &str,
    format: ExportFormat,
    json: Vec<u8>,
) -> Result<Response, ApiError> {
    let (filename, content_type, body) = match format {
        ExportFormat::Json => (format!("{basename}.json"), "application/json", json),
        ExportFormat::Zip => {
            let archive =
                crate::import_cache::zip_single_entry(&format!("{basename}.json"), &json)?;
            (format!("{basename}.zip"), "application/zip", archive)
        }
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}
