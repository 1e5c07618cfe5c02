//! In-memory registry of uploaded (offline) history datasets.
//!
//! Each upload becomes an [`ImportSession`] keyed by an unguessable random
//! id. Sessions are never mutated after creation, only inserted whole and
//! removed whole, so a single map-wide mutex held for the duration of one
//! read or write is the entire locking story. Nothing here expires by time:
//! cleanup happens only when the client says so (explicit delete, or the
//! best-effort beacon a closing tab fires), and deleting an id that is
//! already gone is success from the caller's point of view, since the memory
//! is free either way.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde_json::Value;
use tracing::info;

use crate::error::ApiError;
use crate::model::{
    AttributeExportDocument, ChartSeriesPayload, DetailSnapshot, EntityExportDocument, ImportKind,
    parse_ts,
};

/// Length of generated import ids.
const IMPORT_ID_LEN: usize = 32;

/// Magic bytes of a zip archive.
const ZIP_MAGIC: &[u8] = b"PK";

/// Cap on the decompressed size of an uploaded archive entry. Exports are a
/// few megabytes at most; anything larger is a hostile archive, not data.
const MAX_DECOMPRESSED_BYTES: u64 = 50 * 1024 * 1024;

/// One uploaded dataset held in server memory.
#[derive(Debug, Clone)]
pub struct ImportSession {
    pub kind: ImportKind,
    pub entity_id: String,
    /// Attribute path, attribute sessions only.
    pub key: Option<String>,
    pub start: String,
    pub end: String,
    pub payload: ChartSeriesPayload,
    /// Full per-timestamp attribute maps, entity sessions only. Parallel to
    /// the payload's timestamps; powers offline drill-down.
    pub attributes: Option<Vec<Value>>,
    /// Parsed timestamp axis for snapshot search. Entries that fail to
    /// parse are unsearchable but keep their index so alignment holds.
    parsed_timestamps: Vec<Option<DateTime<Utc>>>,
}

impl ImportSession {
    fn new(
        kind: ImportKind,
        entity_id: String,
        key: Option<String>,
        start: String,
        end: String,
        payload: ChartSeriesPayload,
        attributes: Option<Vec<Value>>,
    ) -> Self {
        let parsed_timestamps = payload.timestamps().iter().map(|ts| parse_ts(ts)).collect();
        ImportSession {
            kind,
            entity_id,
            key,
            start,
            end,
            payload,
            attributes,
            parsed_timestamps,
        }
    }

    fn from_entity_document(doc: EntityExportDocument) -> Result<Self, ApiError> {
        doc.payload.validate().map_err(ApiError::ImportParse)?;
        if doc.attributes.len() != doc.payload.len() {
            return Err(ApiError::ImportParse(format!(
                "'attributes' has {} entries but 'timestamps' has {}",
                doc.attributes.len(),
                doc.payload.len()
            )));
        }
        Ok(ImportSession::new(
            ImportKind::Entity,
            doc.entity_id,
            None,
            doc.start,
            doc.end,
            doc.payload,
            Some(doc.attributes),
        ))
    }

    fn from_attribute_document(doc: AttributeExportDocument) -> Result<Self, ApiError> {
        doc.payload.validate().map_err(ApiError::ImportParse)?;
        if matches!(doc.payload, ChartSeriesPayload::Climate { .. }) {
            return Err(ApiError::ImportParse(
                "attribute documents carry numeric or text series only".to_string(),
            ));
        }
        Ok(ImportSession::new(
            ImportKind::Attribute,
            doc.entity_id,
            Some(doc.key),
            doc.start,
            doc.end,
            doc.payload,
            None,
        ))
    }

    /// Attribute snapshot at the exact timestamp if present, else at the
    /// nearest timestamp not after it (last-known-value). Requests before
    /// the first stored timestamp get an empty snapshot, not an error.
    pub fn snapshot_at(&self, instant: DateTime<Utc>) -> DetailSnapshot {
        let mut best: Option<usize> = None;
        for (i, ts) in self.parsed_timestamps.iter().enumerate() {
            match ts {
                Some(t) if *t <= instant => best = Some(i),
                _ => {}
            }
        }
        let Some(i) = best else {
            return DetailSnapshot::empty();
        };
        DetailSnapshot {
            timestamp: Some(self.payload.timestamps()[i].clone()),
            state: self.state_at(i),
            attributes: self
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get(i).cloned())
                .unwrap_or_else(|| Value::Object(Default::default())),
        }
    }

    fn state_at(&self, i: usize) -> Option<String> {
        match &self.payload {
            ChartSeriesPayload::Numeric { states, .. } => {
                states.get(i).copied().flatten().map(|v| v.to_string())
            }
            ChartSeriesPayload::Text { states, .. } => states.get(i).cloned().flatten(),
            ChartSeriesPayload::Climate { .. } => None,
        }
    }
}

/// Process-wide cache of import sessions.
#[derive(Clone, Default)]
pub struct ImportCache {
    sessions: Arc<Mutex<HashMap<String, ImportSession>>>,
}

impl ImportCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session under a fresh unguessable id and return the id.
    pub fn create(&self, session: ImportSession) -> String {
        let id = generate_import_id();
        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session);
        info!(import_id = %id, "Import session created");
        id
    }

    /// Read-only fetch. `None` is the normal stale-id case (tab closed and
    /// reopened), not a fault.
    pub fn lookup(&self, id: &str) -> Option<ImportSession> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Remove a session, freeing its memory immediately. Returns whether
    /// the id was present; callers treat both outcomes as success.
    pub fn delete(&self, id: &str) -> bool {
        let existed = self.sessions.lock().unwrap().remove(id).is_some();
        info!(import_id = %id, existed, "Import session deleted");
        existed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn generate_import_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(IMPORT_ID_LEN)
        .map(char::from)
        .collect()
}

/// Parse an uploaded export document into a session.
///
/// Accepts either a plain JSON document or a zip archive containing exactly
/// one file with such JSON. Every malformation maps to an `ImportParse`
/// error with a human-readable reason.
pub fn parse_upload(bytes: &[u8]) -> Result<ImportSession, ApiError> {
    let json_bytes: Vec<u8> = if bytes.starts_with(ZIP_MAGIC) {
        unzip_single_entry(bytes)?
    } else {
        bytes.to_vec()
    };

    let value: Value = serde_json::from_slice(&json_bytes)
        .map_err(|e| ApiError::ImportParse(format!("not a valid JSON document: {e}")))?;

    let kind = match value.get("kind").and_then(Value::as_str) {
        Some("entity") => ImportKind::Entity,
        Some("attribute") => ImportKind::Attribute,
        Some(other) => {
            return Err(ApiError::ImportParse(format!(
                "unknown document kind '{other}'"
            )));
        }
        // Older exports carry no kind marker; the attribute path is the tell.
        None if value.get("key").is_some() => ImportKind::Attribute,
        None => ImportKind::Entity,
    };

    match kind {
        ImportKind::Entity => {
            let doc: EntityExportDocument = serde_json::from_value(value)
                .map_err(|e| ApiError::ImportParse(format!("invalid entity export: {e}")))?;
            ImportSession::from_entity_document(doc)
        }
        ImportKind::Attribute => {
            let doc: AttributeExportDocument = serde_json::from_value(value)
                .map_err(|e| ApiError::ImportParse(format!("invalid attribute export: {e}")))?;
            ImportSession::from_attribute_document(doc)
        }
    }
}

/// Extract the contents of a zip archive that must hold exactly one file.
fn unzip_single_entry(bytes: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ApiError::ImportParse(format!("unreadable archive: {e}")))?;
    if archive.len() != 1 {
        return Err(ApiError::ImportParse(format!(
            "archive must contain exactly one file, found {}",
            archive.len()
        )));
    }
    let entry = archive
        .by_index(0)
        .map_err(|e| ApiError::ImportParse(format!("unreadable archive entry: {e}")))?;
    if entry.size() > MAX_DECOMPRESSED_BYTES {
        return Err(ApiError::ImportParse(format!(
            "archive entry decompresses to {} bytes, limit is {MAX_DECOMPRESSED_BYTES}",
            entry.size()
        )));
    }
    // The declared size can lie, so the read itself is capped too.
    let mut contents = Vec::new();
    entry
        .take(MAX_DECOMPRESSED_BYTES + 1)
        .read_to_end(&mut contents)
        .map_err(|e| ApiError::ImportParse(format!("unreadable archive entry: {e}")))?;
    if contents.len() as u64 > MAX_DECOMPRESSED_BYTES {
        return Err(ApiError::ImportParse(format!(
            "archive entry exceeds the {MAX_DECOMPRESSED_BYTES} byte limit"
        )));
    }
    Ok(contents)
}

/// Wrap a document in a fresh single-entry zip archive.
pub fn zip_single_entry(name: &str, data: &[u8]) -> Result<Vec<u8>, ApiError> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(name, zip::write::FileOptions::default())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("zip write failed: {e}")))?;
    writer
        .write_all(data)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("zip write failed: {e}")))?;
    let cursor = writer
        .finish()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("zip write failed: {e}")))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity_doc_json() -> String {
        json!({
            "kind": "entity",
            "entity_id": "sensor.temperature",
            "start": "2024-01-15T00:00:00+00:00",
            "end": "2024-01-16T00:00:00+00:00",
            "type": "numeric",
            "timestamps": [
                "2024-01-15T00:00:10+00:00",
                "2024-01-15T00:00:20+00:00"
            ],
            "states": [20.5, 21.0],
            "attributes": [
                {"unit_of_measurement": "°C", "battery": 90},
                {"unit_of_measurement": "°C", "battery": 89}
            ]
        })
        .to_string()
    }

    #[test]
    fn test_create_then_lookup_returns_stored_payload() {
        let cache = ImportCache::new();
        let session = parse_upload(entity_doc_json().as_bytes()).unwrap();
        let payload = session.payload.clone();

        let id = cache.create(session);
        assert_eq!(id.len(), IMPORT_ID_LEN);

        let found = cache.lookup(&id).expect("session should exist");
        assert_eq!(found.payload, payload);
        assert_eq!(found.entity_id, "sensor.temperature");
    }

    #[test]
    fn test_delete_then_lookup_is_not_found() {
        let cache = ImportCache::new();
        let id = cache.create(parse_upload(entity_doc_json().as_bytes()).unwrap());

        assert!(cache.delete(&id));
        assert!(cache.lookup(&id).is_none());
        // Second delete reports absence but is not an error.
        assert!(!cache.delete(&id));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_sessions_do_not_collide() {
        let cache = ImportCache::new();
        let a = cache.create(parse_upload(entity_doc_json().as_bytes()).unwrap());
        let b = cache.create(parse_upload(entity_doc_json().as_bytes()).unwrap());
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_snapshot_last_known_value_rule() {
        let doc = json!({
            "kind": "entity",
            "entity_id": "sensor.x",
            "start": "2024-01-15T00:00:00+00:00",
            "end": "2024-01-16T00:00:00+00:00",
            "type": "numeric",
            "timestamps": [
                "2024-01-15T00:00:10+00:00",
                "2024-01-15T00:00:20+00:00"
            ],
            "states": [1.0, 2.0],
            "attributes": [{"at": 10}, {"at": 20}]
        });
        let session = parse_upload(doc.to_string().as_bytes()).unwrap();

        // Between the two stored instants: the earlier one wins.
        let mid = parse_ts("2024-01-15T00:00:15+00:00").unwrap();
        let snap = session.snapshot_at(mid);
        assert_eq!(snap.attributes, json!({"at": 10}));
        assert_eq!(snap.timestamp.as_deref(), Some("2024-01-15T00:00:10+00:00"));

        // Exact match.
        let exact = parse_ts("2024-01-15T00:00:20+00:00").unwrap();
        assert_eq!(session.snapshot_at(exact).attributes, json!({"at": 20}));

        // Before the first stored timestamp: empty snapshot, no error.
        let early = parse_ts("2024-01-15T00:00:05+00:00").unwrap();
        assert_eq!(session.snapshot_at(early), DetailSnapshot::empty());
    }

    #[test]
    fn test_parse_rejects_missing_required_keys() {
        let missing_timestamps = json!({
            "kind": "entity",
            "entity_id": "sensor.x",
            "start": "a", "end": "b",
            "type": "numeric",
            "states": [1.0],
            "attributes": [{}]
        });
        let err = parse_upload(missing_timestamps.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, ApiError::ImportParse(_)));

        let mismatched = json!({
            "kind": "entity",
            "entity_id": "sensor.x",
            "start": "a", "end": "b",
            "type": "numeric",
            "timestamps": ["2024-01-15T00:00:10+00:00"],
            "states": [],
            "attributes": [{}]
        });
        let err = parse_upload(mismatched.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, ApiError::ImportParse(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_upload(b"not json at all"),
            Err(ApiError::ImportParse(_))
        ));
    }

    #[test]
    fn test_attribute_document_parses() {
        let doc = json!({
            "kind": "attribute",
            "entity_id": "climate.living_room",
            "key": "smart_pi.error_integral",
            "start": "2024-01-15T00:00:00+00:00",
            "end": "2024-01-16T00:00:00+00:00",
            "type": "numeric",
            "timestamps": ["2024-01-15T00:00:10+00:00"],
            "states": [0.25]
        });
        let session = parse_upload(doc.to_string().as_bytes()).unwrap();
        assert_eq!(session.kind, ImportKind::Attribute);
        assert_eq!(session.key.as_deref(), Some("smart_pi.error_integral"));
        assert!(session.attributes.is_none());
    }

    #[test]
    fn test_zip_round_trip_and_entry_count_rules() {
        let doc = entity_doc_json();
        let zipped = zip_single_entry("export.json", doc.as_bytes()).unwrap();
        assert!(zipped.starts_with(ZIP_MAGIC));

        let session = parse_upload(&zipped).unwrap();
        assert_eq!(session.entity_id, "sensor.temperature");

        // Two entries is a malformed upload.
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("a.json", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(doc.as_bytes()).unwrap();
        writer
            .start_file("b.json", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(doc.as_bytes()).unwrap();
        let two = writer.finish().unwrap().into_inner();
        assert!(matches!(
            parse_upload(&two),
            Err(ApiError::ImportParse(_))
        ));
    }

    #[test]
    fn test_oversize_archive_entry_is_rejected() {
        // Compresses to almost nothing but would expand past the cap.
        let huge = vec![b' '; (MAX_DECOMPRESSED_BYTES + 1) as usize];
        let zipped = zip_single_entry("big.json", &huge).unwrap();
        assert!((zipped.len() as u64) < MAX_DECOMPRESSED_BYTES);

        let err = parse_upload(&zipped).unwrap_err();
        assert!(matches!(err, ApiError::ImportParse(_)));
    }

    #[test]
    fn test_import_ids_are_alphanumeric() {
        let id = generate_import_id();
        assert_eq!(id.len(), IMPORT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
