use std::fs;

use serde_json::{Map, Value, json};

use flood_impact_sync::error::SyncError;
use flood_impact_sync::geometry::{Feature, Geometry};
use flood_impact_sync::merge::{
    GeoJoinMerger, read_attribute_file, read_feature_collection, write_feature_collection,
};

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn section(name: &str, x: f64) -> Feature {
    Feature {
        attributes: object(json!({"SEC_NAME": name})),
        geometry: Geometry::Polygon(vec![vec![
            [x, 0.0],
            [x, 1.0],
            [x + 1.0, 1.0],
            [x + 1.0, 0.0],
            [x, 0.0],
        ]]),
    }
}

#[test]
fn unmatched_record_is_dropped_and_matched_one_joined() {
    let temp = tempfile::tempdir().unwrap();
    let json_path = temp.path().join("sections.json");
    fs::write(
        &json_path,
        r#"[
            {"section_name": "A", "time_period": "2025-01-09 00:00,2025-01-09 06:00", "discharge": "1.2,3.4"},
            {"section_name": "B", "time_period": "2025-01-09 00:00", "discharge": "9.9"}
        ]"#,
    )
    .unwrap();
    let (records, skipped) = read_attribute_file(&json_path).unwrap();
    assert_eq!(skipped, 0);

    let merger = GeoJoinMerger::new("section_name", "SEC_NAME");
    let outcome = merger.merge(&[section("A", 0.0)], records);
    assert_eq!(outcome.features.len(), 1);
    assert_eq!(outcome.features[0].attribute_str("discharge").as_deref(), Some("1.2,3.4"));
    assert!(matches!(
        &outcome.dropped[..],
        [SyncError::JoinMismatch { value, .. }] if value == "B"
    ));
}

#[test]
fn merging_twice_writes_identical_output() {
    let temp = tempfile::tempdir().unwrap();
    let geometries = vec![section("A", 0.0), section("C", 2.0)];
    let records = vec![
        object(json!({"section_name": "C", "basin": "Juba"})),
        object(json!({"section_name": "A", "basin": "Tana"})),
    ];
    let merger = GeoJoinMerger::new("section_name", "SEC_NAME");

    let first = temp.path().join("first.geojson");
    let second = temp.path().join("second.geojson");
    write_feature_collection(&first, &merger.merge(&geometries, records.clone()).features).unwrap();
    write_feature_collection(&second, &merger.merge(&geometries, records).features).unwrap();

    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    let features = read_feature_collection(&first).unwrap();
    assert_eq!(features[0].attribute_str("basin").as_deref(), Some("Juba"));
    assert_eq!(features[1].geometry.kind(), "Polygon");
}
