use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::geometry::Feature;
use crate::publish::write_bytes_atomic;

/// Outcome of one merge: joined features plus what was dropped along the way.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub features: Vec<Feature>,
    pub dropped: Vec<SyncError>,
    pub skipped_entries: usize,
}

/// Joins attribute records to geometries by a natural key, 1:1.
#[derive(Debug, Clone)]
pub struct GeoJoinMerger {
    attribute_key: String,
    geometry_key: String,
}

impl GeoJoinMerger {
    pub fn new(attribute_key: impl Into<String>, geometry_key: impl Into<String>) -> Self {
        Self {
            attribute_key: attribute_key.into(),
            geometry_key: geometry_key.into(),
        }
    }

    /// Records with zero or several matching geometries are dropped with a warning.
    ///
    /// On a field-name clash the geometry's own attribute wins over the record's.
    pub fn merge(&self, geometries: &[Feature], records: Vec<Map<String, Value>>) -> MergeOutcome {
        let mut index: HashMap<String, Vec<&Feature>> = HashMap::new();
        for feature in geometries {
            if let Some(key) = feature.attribute_str(&self.geometry_key) {
                index.entry(key).or_default().push(feature);
            }
        }

        let mut outcome = MergeOutcome::default();
        for record in records {
            let Some(value) = key_string(record.get(&self.attribute_key)) else {
                warn!(key = %self.attribute_key, "attribute record without join key, skipping");
                outcome.skipped_entries += 1;
                continue;
            };
            match index.get(&value).map(Vec::as_slice) {
                Some([geometry]) => {
                    let mut attributes = record;
                    attributes.extend(geometry.attributes.clone());
                    outcome.features.push(Feature {
                        attributes,
                        geometry: geometry.geometry.clone(),
                    });
                }
                Some(matches) if matches.len() > 1 => {
                    warn!(key = %self.attribute_key, value = %value, matches = matches.len(), "ambiguous join key, dropping record");
                    outcome.dropped.push(SyncError::JoinMismatch {
                        key: self.attribute_key.clone(),
                        value,
                    });
                }
                _ => {
                    warn!(key = %self.attribute_key, value = %value, "no geometry for join key, dropping record");
                    outcome.dropped.push(SyncError::JoinMismatch {
                        key: self.attribute_key.clone(),
                        value,
                    });
                }
            }
        }
        info!(
            merged = outcome.features.len(),
            dropped = outcome.dropped.len(),
            skipped = outcome.skipped_entries,
            "join finished"
        );
        outcome
    }
}

fn key_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Normalizes one attribute document into a list of objects.
///
/// Accepts an array, a single object, or either of those encoded a second time as a
/// JSON string. Non-object entries are counted and skipped.
pub fn normalize_records(
    source_name: &str,
    document: Value,
) -> Result<(Vec<Map<String, Value>>, usize), SyncError> {
    let document = match document {
        Value::String(inner) => serde_json::from_str(&inner).map_err(|err| SyncError::Parse {
            source_name: source_name.to_string(),
            message: format!("double-encoded JSON: {err}"),
        })?,
        other => other,
    };
    let entries = match document {
        Value::Array(items) => items,
        Value::Object(map) => vec![Value::Object(map)],
        other => {
            return Err(SyncError::Parse {
                source_name: source_name.to_string(),
                message: format!("top level must be an array or object, found {}", type_name(&other)),
            });
        }
    };
    let mut records = Vec::with_capacity(entries.len());
    let mut skipped = 0;
    for (position, entry) in entries.into_iter().enumerate() {
        match entry {
            Value::Object(map) => records.push(map),
            other => {
                warn!(source = source_name, position, kind = type_name(&other), "skipping non-object entry");
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

pub fn read_attribute_file(path: &Path) -> Result<(Vec<Map<String, Value>>, usize), SyncError> {
    let source_name = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    let document: Value = serde_json::from_str(&raw).map_err(|err| SyncError::Parse {
        source_name: source_name.clone(),
        message: err.to_string(),
    })?;
    normalize_records(&source_name, document)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn to_feature_collection(features: &[Feature]) -> Value {
    json!({
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::4326"}},
        "features": features.iter().map(Feature::to_geojson).collect::<Vec<_>>(),
    })
}

pub fn write_feature_collection(path: &Path, features: &[Feature]) -> Result<(), SyncError> {
    let body = serde_json::to_vec_pretty(&to_feature_collection(features))
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &body)
}

/// Reads a FeatureCollection; malformed features are skipped with a warning.
pub fn read_feature_collection(path: &Path) -> Result<Vec<Feature>, SyncError> {
    let source_name = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    let document: Value = serde_json::from_str(&raw).map_err(|err| SyncError::Parse {
        source_name: source_name.clone(),
        message: err.to_string(),
    })?;
    let items = document
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Parse {
            source_name: source_name.clone(),
            message: "missing features array".to_string(),
        })?;
    let mut features = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        match Feature::from_geojson(item) {
            Ok(feature) => features.push(feature),
            Err(err) => warn!(source = %source_name, position, error = %err, "skipping malformed feature"),
        }
    }
    Ok(features)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::geometry::Geometry;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn point_feature(name: &str, x: f64) -> Feature {
        Feature {
            attributes: object(json!({"SEC_NAME": name, "SEC_CODE": 7})),
            geometry: Geometry::Point { x, y: 1.0 },
        }
    }

    #[test]
    fn double_encoded_object_becomes_single_record() {
        let document = Value::String(r#"{"section_name":"A"}"#.to_string());
        let (records, skipped) = normalize_records("a.json", document).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn non_object_entries_are_skipped() {
        let (records, skipped) =
            normalize_records("a.json", json!([{"section_name": "A"}, 3, "x"])).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn scalar_top_level_is_a_parse_error() {
        let err = normalize_records("a.json", json!(42)).unwrap_err();
        assert_matches!(err, SyncError::Parse { .. });
    }

    #[test]
    fn ambiguous_key_is_dropped() {
        let geometries = vec![point_feature("A", 1.0), point_feature("A", 2.0)];
        let merger = GeoJoinMerger::new("section_name", "SEC_NAME");
        let outcome = merger.merge(&geometries, vec![object(json!({"section_name": "A"}))]);
        assert!(outcome.features.is_empty());
        assert_matches!(&outcome.dropped[..], [SyncError::JoinMismatch { .. }]);
    }

    #[test]
    fn merged_record_keeps_geometry_attributes() {
        let geometries = vec![point_feature("A", 1.0)];
        let merger = GeoJoinMerger::new("section_name", "SEC_NAME");
        let outcome = merger.merge(
            &geometries,
            vec![object(json!({"section_name": "A", "basin": "Nile"}))],
        );
        let feature = &outcome.features[0];
        assert_eq!(feature.attribute_str("SEC_CODE").as_deref(), Some("7"));
        assert_eq!(feature.attribute_str("basin").as_deref(), Some("Nile"));
    }

    #[test]
    fn geometry_attribute_wins_on_field_clash() {
        let geometries = vec![point_feature("A", 1.0)];
        let merger = GeoJoinMerger::new("section_name", "SEC_NAME");
        let outcome = merger.merge(
            &geometries,
            vec![object(json!({"section_name": "A", "SEC_CODE": 99, "basin": "Nile"}))],
        );
        let feature = &outcome.features[0];
        assert_eq!(feature.attribute_str("SEC_CODE").as_deref(), Some("7"));
        assert_eq!(feature.attribute_str("section_name").as_deref(), Some("A"));
    }

    #[test]
    fn feature_collection_survives_a_file_round() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("merged_data.geojson");
        let features = vec![point_feature("A", 1.0)];
        write_feature_collection(&path, &features).unwrap();
        assert_eq!(read_feature_collection(&path).unwrap(), features);
    }
}
