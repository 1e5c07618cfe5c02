//! History normalization: raw Home Assistant records in, chart-ready
//! payloads out.
//!
//! Pure functions of their inputs; callers (the HA client and the import
//! parser) guarantee records arrive sorted ascending by timestamp, so nothing
//! here re-sorts. Duplicate consecutive timestamps pass through unmodified.
//!
//! Classification:
//! - `climate.*` entities always produce the composite climate shape;
//! - otherwise, if every non-null state parses as a finite number the series
//!   is numeric (all-null series count as numeric so empty toggles still
//!   chart), else it stays text.
//!
//! `"unknown"`, `"unavailable"` and empty states become nulls in both
//! variants; the charting frontend renders nulls as gaps.

use serde_json::Value;

use crate::model::{ChartSeriesPayload, RawHistoryRecord};

/// State strings Home Assistant uses for "no value".
const NULL_STATES: &[&str] = &["unknown", "unavailable", ""];

/// Attribute holding the HVAC action on climate entities.
const HVAC_ACTION_ATTR: &str = "hvac_action";

/// HVAC action value that counts as heating.
const HEATING_ACTION: &str = "heating";

/// The domain prefix of an entity id (`climate.living_room` -> `climate`).
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id.split_once('.').map(|(d, _)| d).unwrap_or("")
}

/// Walk a dotted path through an attribute tree.
///
/// Returns `None` when any segment is missing or an intermediate value is
/// not a mapping.
pub fn walk_path<'a>(attributes: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = attributes;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Coerce a JSON value to a finite number.
///
/// Booleans map to 0/1 so toggle-like attributes stay chartable; strings are
/// parsed; anything else (or a non-finite result) is not numeric.
pub fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => numeric_state(s),
        _ => None,
    }
}

fn numeric_state(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// A state string with null markers mapped to `None`.
fn effective_state(record: &RawHistoryRecord) -> Option<&str> {
    record
        .state
        .as_deref()
        .filter(|s| !NULL_STATES.contains(s))
}

/// Normalize an entity's state history into exactly one payload variant.
pub fn normalize_entity_history(
    entity_id: &str,
    records: &[RawHistoryRecord],
) -> ChartSeriesPayload {
    if entity_domain(entity_id) == "climate" {
        return climate_payload(records);
    }

    let mut timestamps = Vec::new();
    let mut states: Vec<Option<&str>> = Vec::new();
    for record in records {
        let Some(ts) = record.timestamp() else {
            continue;
        };
        timestamps.push(ts.to_string());
        states.push(effective_state(record));
    }

    let all_numeric = states
        .iter()
        .flatten()
        .all(|s| numeric_state(s).is_some());

    if all_numeric {
        ChartSeriesPayload::Numeric {
            timestamps,
            states: states.iter().map(|s| s.and_then(numeric_state)).collect(),
        }
    } else {
        ChartSeriesPayload::Text {
            timestamps,
            states: states.iter().map(|s| s.map(str::to_string)).collect(),
        }
    }
}

/// Composite payload for `climate.*` entities.
///
/// The exterior temperature historically lives either under
/// `specific_states.ext_current_temperature` or directly in the attributes;
/// both spots are checked, null when absent.
fn climate_payload(records: &[RawHistoryRecord]) -> ChartSeriesPayload {
    let mut timestamps = Vec::new();
    let mut current_temperature = Vec::new();
    let mut temperature = Vec::new();
    let mut ext_current_temperature = Vec::new();
    let mut is_heating = Vec::new();

    for record in records {
        let Some(ts) = record.timestamp() else {
            continue;
        };
        timestamps.push(ts.to_string());

        let attrs = &record.attributes;
        current_temperature.push(attr_numeric(attrs, "current_temperature"));
        temperature.push(attr_numeric(attrs, "temperature"));

        let ext = walk_path(attrs, "specific_states.ext_current_temperature")
            .or_else(|| walk_path(attrs, "ext_current_temperature"));
        ext_current_temperature.push(ext.and_then(coerce_numeric));

        let heating = walk_path(attrs, HVAC_ACTION_ATTR)
            .and_then(Value::as_str)
            .is_some_and(|action| action == HEATING_ACTION);
        is_heating.push(u8::from(heating));
    }

    ChartSeriesPayload::Climate {
        timestamps,
        current_temperature,
        temperature,
        ext_current_temperature,
        is_heating,
    }
}

fn attr_numeric(attributes: &Value, key: &str) -> Option<f64> {
    walk_path(attributes, key).and_then(coerce_numeric)
}

/// Normalize a single named attribute's value series.
///
/// Same classification as entity states but over the extracted values; only
/// numeric/text are possible here (no climate composite). Composite values
/// (sequences, mappings) chart as their JSON encoding in a text series.
pub fn normalize_attribute_history(key: &str, records: &[RawHistoryRecord]) -> ChartSeriesPayload {
    let mut timestamps = Vec::new();
    let mut values: Vec<Option<&Value>> = Vec::new();
    for record in records {
        let Some(ts) = record.timestamp() else {
            continue;
        };
        timestamps.push(ts.to_string());
        values.push(walk_path(&record.attributes, key).filter(|v| !v.is_null()));
    }

    let all_numeric = values
        .iter()
        .flatten()
        .all(|v| coerce_numeric(v).is_some());

    if all_numeric {
        ChartSeriesPayload::Numeric {
            timestamps,
            states: values.iter().map(|v| v.and_then(coerce_numeric)).collect(),
        }
    } else {
        ChartSeriesPayload::Text {
            timestamps,
            states: values.iter().map(|v| v.map(value_to_text)).collect(),
        }
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(ts: &str, state: Option<&str>, attributes: Value) -> RawHistoryRecord {
        RawHistoryRecord {
            state: state.map(str::to_string),
            attributes,
            last_changed: Some(ts.to_string()),
            last_updated: None,
        }
    }

    #[test]
    fn test_all_numeric_states_produce_numeric_variant() {
        let records = vec![
            record("2024-01-15T10:00:00+00:00", Some("20.5"), Value::Null),
            record("2024-01-15T11:00:00+00:00", Some("unknown"), Value::Null),
            record("2024-01-15T12:00:00+00:00", Some("21"), Value::Null),
        ];
        let payload = normalize_entity_history("sensor.temperature", &records);
        match payload {
            ChartSeriesPayload::Numeric { timestamps, states } => {
                assert_eq!(timestamps.len(), 3);
                assert_eq!(states, vec![Some(20.5), None, Some(21.0)]);
            }
            other => panic!("expected numeric, got {other:?}"),
        }
    }

    #[test]
    fn test_one_text_state_makes_whole_series_text() {
        let records = vec![
            record("2024-01-15T10:00:00+00:00", Some("20.5"), Value::Null),
            record("2024-01-15T11:00:00+00:00", Some("open"), Value::Null),
        ];
        let payload = normalize_entity_history("binary_sensor.door", &records);
        match payload {
            ChartSeriesPayload::Text { states, .. } => {
                assert_eq!(states, vec![Some("20.5".into()), Some("open".into())]);
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_null_markers_become_nulls_in_text_too() {
        let records = vec![
            record("2024-01-15T10:00:00+00:00", Some("open"), Value::Null),
            record("2024-01-15T11:00:00+00:00", Some("unavailable"), Value::Null),
        ];
        match normalize_entity_history("binary_sensor.door", &records) {
            ChartSeriesPayload::Text { states, .. } => {
                assert_eq!(states, vec![Some("open".into()), None]);
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_all_null_series_is_numeric() {
        let records = vec![record(
            "2024-01-15T10:00:00+00:00",
            Some("unknown"),
            Value::Null,
        )];
        assert!(matches!(
            normalize_entity_history("sensor.x", &records),
            ChartSeriesPayload::Numeric { .. }
        ));
    }

    #[test]
    fn test_empty_input_yields_empty_payload() {
        let payload = normalize_entity_history("sensor.x", &[]);
        assert!(payload.is_empty());
        let climate = normalize_entity_history("climate.x", &[]);
        assert!(climate.is_empty());
        assert!(matches!(climate, ChartSeriesPayload::Climate { .. }));
    }

    #[test]
    fn test_climate_heating_flag() {
        let records = vec![
            record(
                "2024-01-15T10:00:00+00:00",
                Some("heat"),
                json!({
                    "current_temperature": 20.0,
                    "temperature": 21.0,
                    "hvac_action": "heating",
                    "specific_states": {"ext_current_temperature": 5.0},
                }),
            ),
            record(
                "2024-01-15T11:00:00+00:00",
                Some("heat"),
                json!({
                    "current_temperature": 20.5,
                    "temperature": 21.0,
                    "hvac_action": "idle",
                    "ext_current_temperature": 5.1,
                }),
            ),
        ];
        match normalize_entity_history("climate.living_room", &records) {
            ChartSeriesPayload::Climate {
                current_temperature,
                temperature,
                ext_current_temperature,
                is_heating,
                ..
            } => {
                assert_eq!(current_temperature, vec![Some(20.0), Some(20.5)]);
                assert_eq!(temperature, vec![Some(21.0), Some(21.0)]);
                // Found in specific_states first, then the attribute root.
                assert_eq!(ext_current_temperature, vec![Some(5.0), Some(5.1)]);
                assert_eq!(is_heating, vec![1, 0]);
            }
            other => panic!("expected climate, got {other:?}"),
        }
    }

    #[test]
    fn test_climate_missing_attributes_become_nulls() {
        let records = vec![record("2024-01-15T10:00:00+00:00", Some("off"), json!({}))];
        match normalize_entity_history("climate.bare", &records) {
            ChartSeriesPayload::Climate {
                current_temperature,
                ext_current_temperature,
                is_heating,
                ..
            } => {
                assert_eq!(current_temperature, vec![None]);
                assert_eq!(ext_current_temperature, vec![None]);
                // Null action means not heating.
                assert_eq!(is_heating, vec![0]);
            }
            other => panic!("expected climate, got {other:?}"),
        }
    }

    #[test]
    fn test_attribute_history_walks_dotted_paths() {
        let records = vec![
            record(
                "2024-01-15T10:00:00+00:00",
                None,
                json!({"smart_pi": {"error_integral": 0.25}}),
            ),
            record("2024-01-15T11:00:00+00:00", None, json!({"smart_pi": {}})),
        ];
        match normalize_attribute_history("smart_pi.error_integral", &records) {
            ChartSeriesPayload::Numeric { states, .. } => {
                assert_eq!(states, vec![Some(0.25), None]);
            }
            other => panic!("expected numeric, got {other:?}"),
        }
    }

    #[test]
    fn test_boolean_attribute_is_numeric() {
        let records = vec![
            record("2024-01-15T10:00:00+00:00", None, json!({"active": true})),
            record("2024-01-15T11:00:00+00:00", None, json!({"active": false})),
        ];
        match normalize_attribute_history("active", &records) {
            ChartSeriesPayload::Numeric { states, .. } => {
                assert_eq!(states, vec![Some(1.0), Some(0.0)]);
            }
            other => panic!("expected numeric, got {other:?}"),
        }
    }

    #[test]
    fn test_composite_attribute_values_chart_as_text() {
        let records = vec![record(
            "2024-01-15T10:00:00+00:00",
            None,
            json!({"modes": ["heat", "off"]}),
        )];
        match normalize_attribute_history("modes", &records) {
            ChartSeriesPayload::Text { states, .. } => {
                assert_eq!(states, vec![Some(r#"["heat","off"]"#.into())]);
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_timestamps_pass_through() {
        let records = vec![
            record("2024-01-15T10:00:00+00:00", Some("1"), Value::Null),
            record("2024-01-15T10:00:00+00:00", Some("2"), Value::Null),
        ];
        let payload = normalize_entity_history("sensor.x", &records);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.timestamps()[0], payload.timestamps()[1]);
    }

    #[test]
    fn test_records_without_timestamps_are_skipped() {
        let mut no_ts = record("unused", Some("1"), Value::Null);
        no_ts.last_changed = None;
        let records = vec![no_ts, record("2024-01-15T10:00:00+00:00", Some("2"), Value::Null)];
        assert_eq!(normalize_entity_history("sensor.x", &records).len(), 1);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let records = vec![
            record("2024-01-15T10:00:00+00:00", Some("20.5"), Value::Null),
            record("2024-01-15T11:00:00+00:00", Some("unknown"), Value::Null),
        ];
        let first = serde_json::to_string(&normalize_entity_history("sensor.t", &records)).unwrap();
        let second =
            serde_json::to_string(&normalize_entity_history("sensor.t", &records)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_walk_path_misses() {
        let attrs = json!({"a": {"b": 1}});
        assert_eq!(walk_path(&attrs, "a.b"), Some(&json!(1)));
        assert!(walk_path(&attrs, "a.b.c").is_none());
        assert!(walk_path(&attrs, "missing").is_none());
        assert!(walk_path(&Value::Null, "a").is_none());
    }

    #[test]
    fn test_coerce_numeric_rejects_non_finite() {
        assert_eq!(coerce_numeric(&json!("NaN")), None);
        assert_eq!(coerce_numeric(&json!("inf")), None);
        assert_eq!(coerce_numeric(&json!(" 42 ")), Some(42.0));
        assert_eq!(coerce_numeric(&json!(null)), None);
    }
}
