use std::fs;

use assert_matches::assert_matches;

use flood_impact_sync::config::{Config, ConfigLoader, Location, Sink};
use flood_impact_sync::domain::FileBundle;
use flood_impact_sync::error::SyncError;
use flood_impact_sync::loader::MappingMode;

#[test]
fn configured_job_overrides_builtin() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("floodsync.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "jobs": [
                {
                    "name": "sectors",
                    "targets": [
                        {
                            "name": "sector_data",
                            "location": {"kind": "static", "dir": "/srv/sections"},
                            "bundle": {"mode": "suffixes", "base_name": "sections", "critical": [".shp", ".shx", ".dbf"]},
                            "sink": {
                                "kind": "table",
                                "mode": "derived",
                                "schema": {
                                    "table": "sector_data",
                                    "columns": [
                                        {"column": "sec_code", "source": "SEC_CODE", "kind": "integer"},
                                        {"column": "geom", "source": "", "kind": "point"}
                                    ]
                                }
                            }
                        }
                    ]
                },
                {
                    "name": "hazard-extra",
                    "source": {"root": "/srv/fp", "dir_template": "{YYYY}/{MM}/{DD}/{HH}"},
                    "targets": [
                        {
                            "name": "flood_depth",
                            "location": {"kind": "dated"},
                            "bundle": {"mode": "suffixes", "base_name": "depth_{date}", "critical": [".tif"]},
                            "sink": {"kind": "catalog", "product": "flood_depth"}
                        }
                    ]
                }
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.jobs.len(), 7);
    let sectors = resolved.job("sectors").unwrap();
    assert_matches!(&sectors.targets[0].location, Location::Static { dir } if dir == "/srv/sections");
    assert_matches!(
        &sectors.targets[0].sink,
        Sink::Table { mode: MappingMode::Derived, schema } if schema.columns.len() == 2
    );
    let extra = resolved.job("hazard-extra").unwrap();
    assert!(!extra.publish_on_partial);
    assert_matches!(&extra.targets[0].bundle, FileBundle::Suffixes { optional, .. } if optional.is_empty());
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let err = ConfigLoader::resolve(Some(&temp.path().join("absent.json"))).unwrap_err();
    assert_matches!(err, SyncError::ConfigRead(_));
}

#[test]
fn malformed_json_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("floodsync.json");
    fs::write(&path, "{ jobs: ").unwrap();
    assert_matches!(ConfigLoader::resolve(Some(&path)), Err(SyncError::ConfigParse(_)));
}

#[test]
fn dated_target_without_source_is_rejected() {
    let config: Config = serde_json::from_str(
        r#"{"jobs": [{
            "name": "broken",
            "targets": [{
                "name": "t",
                "location": {"kind": "dated", "subdir": "HMC"},
                "bundle": {"mode": "listing", "extension": ".tif"},
                "sink": {"kind": "directory"}
            }]
        }]}"#,
    )
    .unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(SyncError::InvalidJob { ref job, .. }) if job == "broken"
    );
}
