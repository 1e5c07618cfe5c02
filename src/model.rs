//! Data models for Hearth.
//!
//! The central type is [`ChartSeriesPayload`]: every history endpoint, export
//! document, and import session funnels into one of its three shapes. All
//! parallel sequences inside a payload are index-aligned with `timestamps`;
//! [`ChartSeriesPayload::validate`] checks that invariant for data that
//! arrives from outside (uploads).
//!
//! Entity attributes are kept as [`serde_json::Value`] throughout: that is
//! already the recursive scalar / sequence / mapping tree the drill-down UI
//! walks, so no bespoke tree type is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One observation from the Home Assistant history API.
///
/// Produced externally (live fetch or import document); read-only to the
/// normalizer. The `state` is always a string on the wire, even for numeric
/// sensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHistoryRecord {
    #[serde(default)]
    pub state: Option<String>,

    /// Arbitrarily nested attribute map (scalar | sequence | mapping).
    #[serde(default)]
    pub attributes: Value,

    #[serde(default)]
    pub last_changed: Option<String>,

    #[serde(default)]
    pub last_updated: Option<String>,
}

impl RawHistoryRecord {
    /// The record's timestamp: `last_changed`, falling back to `last_updated`.
    ///
    /// Minimal-response history entries omit `last_changed`; records with
    /// neither field are skipped by consumers.
    pub fn timestamp(&self) -> Option<&str> {
        self.last_changed.as_deref().or(self.last_updated.as_deref())
    }
}

/// Raw entity state from `GET /api/states`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaEntityState {
    pub entity_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
}

/// One row of the entity selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity_id: String,
    pub friendly_name: String,
    pub domain: String,
    pub state: String,
    #[serde(default)]
    pub icon: String,
}

/// Canonical chart-ready history, tagged by shape.
///
/// # Invariant
///
/// Every parallel sequence has the same length as `timestamps`, and index `i`
/// across all sequences refers to the same instant. Timestamps are ISO-8601
/// strings passed through from the source records, ascending, duplicates
/// preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChartSeriesPayload {
    /// All non-null states parsed as finite numbers.
    Numeric {
        timestamps: Vec<String>,
        states: Vec<Option<f64>>,
    },

    /// Composite shape for `climate.*` entities: four series on one axis.
    Climate {
        timestamps: Vec<String>,
        current_temperature: Vec<Option<f64>>,
        /// Setpoint temperature.
        temperature: Vec<Option<f64>>,
        ext_current_temperature: Vec<Option<f64>>,
        /// 1 while the HVAC action reports heating, else 0.
        is_heating: Vec<u8>,
    },

    /// Raw string states, no coercion.
    Text {
        timestamps: Vec<String>,
        states: Vec<Option<String>>,
    },
}

impl ChartSeriesPayload {
    pub fn timestamps(&self) -> &[String] {
        match self {
            ChartSeriesPayload::Numeric { timestamps, .. }
            | ChartSeriesPayload::Climate { timestamps, .. }
            | ChartSeriesPayload::Text { timestamps, .. } => timestamps,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps().is_empty()
    }

    /// Check the parallel-sequence invariant. Used on imported documents,
    /// which cannot be trusted to be well-formed.
    pub fn validate(&self) -> Result<(), String> {
        let n = self.len();
        let check = |name: &str, len: usize| {
            if len == n {
                Ok(())
            } else {
                Err(format!(
                    "sequence '{name}' has {len} entries but 'timestamps' has {n}"
                ))
            }
        };
        match self {
            ChartSeriesPayload::Numeric { states, .. } => check("states", states.len()),
            ChartSeriesPayload::Text { states, .. } => check("states", states.len()),
            ChartSeriesPayload::Climate {
                current_temperature,
                temperature,
                ext_current_temperature,
                is_heating,
                ..
            } => {
                check("current_temperature", current_temperature.len())?;
                check("temperature", temperature.len())?;
                check("ext_current_temperature", ext_current_temperature.len())?;
                check("is_heating", is_heating.len())
            }
        }
    }

    /// Restrict the payload to timestamps within `[start, end]`.
    ///
    /// Entries whose timestamp fails to parse are kept as-is rather than
    /// silently dropped.
    pub fn window(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        if start.is_none() && end.is_none() {
            return self.clone();
        }
        let keep: Vec<usize> = self
            .timestamps()
            .iter()
            .enumerate()
            .filter(|(_, ts)| match parse_ts(ts) {
                Some(t) => start.is_none_or(|s| t >= s) && end.is_none_or(|e| t <= e),
                None => true,
            })
            .map(|(i, _)| i)
            .collect();
        self.select(&keep)
    }

    fn select(&self, keep: &[usize]) -> Self {
        fn pick<T: Clone>(values: &[T], keep: &[usize]) -> Vec<T> {
            keep.iter().map(|&i| values[i].clone()).collect()
        }
        match self {
            ChartSeriesPayload::Numeric { timestamps, states } => ChartSeriesPayload::Numeric {
                timestamps: pick(timestamps, keep),
                states: pick(states, keep),
            },
            ChartSeriesPayload::Text { timestamps, states } => ChartSeriesPayload::Text {
                timestamps: pick(timestamps, keep),
                states: pick(states, keep),
            },
            ChartSeriesPayload::Climate {
                timestamps,
                current_temperature,
                temperature,
                ext_current_temperature,
                is_heating,
            } => ChartSeriesPayload::Climate {
                timestamps: pick(timestamps, keep),
                current_temperature: pick(current_temperature, keep),
                temperature: pick(temperature, keep),
                ext_current_temperature: pick(ext_current_temperature, keep),
                is_heating: pick(is_heating, keep),
            },
        }
    }
}

/// Parse an ISO-8601 timestamp as it appears in history records.
pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Full attribute map of an entity at (or immediately preceding) one instant.
///
/// Derived on demand, never cached beyond the request. An empty snapshot
/// (`timestamp: null`, `attributes: {}`) means nothing was recorded at or
/// before the requested instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailSnapshot {
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub attributes: Value,
}

impl DetailSnapshot {
    pub fn empty() -> Self {
        DetailSnapshot {
            timestamp: None,
            state: None,
            attributes: Value::Object(Default::default()),
        }
    }
}

/// Discriminates the two export/import document shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    Entity,
    Attribute,
}

fn kind_entity() -> ImportKind {
    ImportKind::Entity
}

fn kind_attribute() -> ImportKind {
    ImportKind::Attribute
}

/// Downloadable document for a full entity history.
///
/// `attributes` carries the complete per-record attribute map, parallel to
/// the payload's `timestamps`, so an import of this document supports
/// drill-down detail lookups offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityExportDocument {
    #[serde(default = "kind_entity")]
    pub kind: ImportKind,
    pub entity_id: String,
    pub start: String,
    pub end: String,
    #[serde(flatten)]
    pub payload: ChartSeriesPayload,
    pub attributes: Vec<Value>,
}

/// Downloadable document for a single attribute's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeExportDocument {
    #[serde(default = "kind_attribute")]
    pub kind: ImportKind,
    pub entity_id: String,
    /// Dotted attribute path, e.g. `specific_states.smart_pi.error`.
    pub key: String,
    pub start: String,
    pub end: String,
    #[serde(flatten)]
    pub payload: ChartSeriesPayload,
}

/// Response for the entity history endpoint: window metadata plus the
/// flattened payload.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub entity_id: String,
    pub domain: String,
    pub start: String,
    pub end: String,
    pub count: usize,
    #[serde(flatten)]
    pub payload: ChartSeriesPayload,
}

/// Response for attribute history endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AttributeHistoryResponse {
    pub entity_id: String,
    pub key: String,
    pub start: String,
    pub end: String,
    pub count: usize,
    #[serde(flatten)]
    pub payload: ChartSeriesPayload,
}

/// Response for `GET /api/history-range/:entity_id`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRangeResponse {
    pub entity_id: String,
    pub earliest: Option<String>,
    pub latest: String,
}

/// Response for `POST /api/import`.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResponse {
    #[serde(rename = "type")]
    pub kind: ImportKind,
    pub filename: String,
    pub data: ImportData,
}

/// Body of an import response: the stored payload plus the id the client
/// uses for follow-up session requests.
#[derive(Debug, Clone, Serialize)]
pub struct ImportData {
    pub import_id: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub start: String,
    pub end: String,
    pub count: usize,
    #[serde(flatten)]
    pub payload: ChartSeriesPayload,
    /// Per-timestamp raw attributes, entity imports only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<Value>>,
}

/// Query parameters for history and export endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Query parameters for attribute history endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct AttributeQuery {
    pub key: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Query parameters for detail snapshot endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct TimestampQuery {
    pub timestamp: Option<String>,
}

/// Query parameters for export endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub key: Option<String>,
    #[serde(default)]
    pub format: ExportFormat,
}

/// Export container format, selectable via the `format` query flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Zip,
}

/// Request body for `POST /api/login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Response for a successful login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub status: String,
    pub user: String,
}
