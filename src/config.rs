use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{FileBundle, PathTemplate};
use crate::error::SyncError;
use crate::loader::{ColumnKind, ColumnSpec, MappingMode, TableSchema};
use crate::mapfile::{LayerType, ibew_layer_types};
use crate::publish::PublishMode;
use crate::remote::RemoteEndpoint;
use crate::retry::RetryPolicy;

pub const DEFAULT_LOOKBACK_DAYS: u32 = 7;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WORKSPACE: &str = "floodwatch";
pub const DEFAULT_IBEW_REMOTE_BASE: &str =
    "fp-eastafrica/storage/impact_assessment/fp_impact_forecast/nwp_multimodel-det/merged";
pub const MERGED_OUTPUT: &str = "merged_data.geojson";

/// Keys usable as `$KEY` prefixes in job paths.
pub const PATH_KEYS: [&str; 5] = [
    "REMOTE_FOLDER_BASE",
    "IBEW_REMOTE_BASE",
    "SHAPEFILE_REMOTE_DIR",
    "JSON_REMOTE_DIR",
    "FLOODSYNC_OUTPUT_DIR",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Sftp,
    /// Remote layout mirrored on a mounted filesystem.
    Local,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
    pub workspace: String,
}

/// Everything read from the environment for one process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub transport: Transport,
    pub remote: Option<RemoteEndpoint>,
    pub local_root: PathBuf,
    pub paths: HashMap<String, String>,
    pub catalog: Option<CatalogSettings>,
    pub workspace_root: Utf8PathBuf,
    pub output_dir: PathBuf,
    pub database: PathBuf,
    pub lookback_days: u32,
    pub served_dir: Option<PathBuf>,
    pub mapfile: Option<PathBuf>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let parse_number = |key: &str, default: u64| -> Result<u64, SyncError> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| SyncError::Config(format!("{key} must be a number, got {raw:?}"))),
                None => Ok(default),
            }
        };

        let transport = match get("FLOODSYNC_TRANSPORT").as_deref() {
            None | Some("sftp") => Transport::Sftp,
            Some("local") => Transport::Local,
            Some(other) => {
                return Err(SyncError::Config(format!(
                    "FLOODSYNC_TRANSPORT must be sftp or local, got {other:?}"
                )));
            }
        };
        let timeout = Duration::from_secs(parse_number("FLOODSYNC_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?);

        let remote = match transport {
            Transport::Sftp => Some(RemoteEndpoint {
                host: get("SFTP_HOST").ok_or_else(|| SyncError::Config("SFTP_HOST".to_string()))?,
                port: u16::try_from(parse_number("SFTP_PORT", 22)?)
                    .map_err(|_| SyncError::Config("SFTP_PORT out of range".to_string()))?,
                username: get("SFTP_USERNAME")
                    .ok_or_else(|| SyncError::Config("SFTP_USERNAME".to_string()))?,
                password: get("SFTP_PASSWORD").unwrap_or_default(),
                timeout,
            }),
            Transport::Local => None,
        };

        let workspace_root = match get("FLOODSYNC_WORKSPACE_ROOT") {
            Some(root) => Utf8PathBuf::from(root),
            None => default_workspace_root()?,
        };
        let output_dir = get("FLOODSYNC_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("output"));
        let database = get("FLOODSYNC_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|| output_dir.join("floodsync.sqlite"));

        let mut paths = HashMap::new();
        for key in PATH_KEYS {
            if let Some(value) = get(key) {
                paths.insert(key.to_string(), value);
            }
        }
        paths
            .entry("IBEW_REMOTE_BASE".to_string())
            .or_insert_with(|| DEFAULT_IBEW_REMOTE_BASE.to_string());
        paths
            .entry("FLOODSYNC_OUTPUT_DIR".to_string())
            .or_insert_with(|| output_dir.display().to_string());

        let catalog = get("GEOSERVER_URL").map(|primary| CatalogSettings {
            urls: std::iter::once(primary)
                .chain(get("GEOSERVER_FALLBACK_URL"))
                .collect(),
            username: get("GEOSERVER_USERNAME").unwrap_or_default(),
            password: get("GEOSERVER_PASSWORD").unwrap_or_default(),
            workspace: get("GEOSERVER_WORKSPACE").unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()),
        });

        let lookback = parse_number("FLOODSYNC_LOOKBACK_DAYS", u64::from(DEFAULT_LOOKBACK_DAYS))?;
        Ok(Self {
            transport,
            remote,
            local_root: get("FLOODSYNC_LOCAL_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/")),
            paths,
            catalog,
            workspace_root,
            output_dir,
            database,
            lookback_days: u32::try_from(lookback)
                .map_err(|_| SyncError::Config("FLOODSYNC_LOOKBACK_DAYS out of range".to_string()))?,
            served_dir: get("FLOODSYNC_SERVED_DIR").map(PathBuf::from),
            mapfile: get("FLOODSYNC_MAPFILE").map(PathBuf::from),
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    /// Replaces a leading `$KEY` with the configured path for that key.
    pub fn expand(&self, raw: &str) -> Result<String, SyncError> {
        let Some(reference) = raw.strip_prefix('$') else {
            return Ok(raw.to_string());
        };
        let (key, rest) = reference.split_once('/').unwrap_or((reference, ""));
        let base = self
            .paths
            .get(key)
            .ok_or_else(|| SyncError::Config(key.to_string()))?;
        Ok(crate::domain::join_remote(base, rest))
    }
}

fn default_workspace_root() -> Result<Utf8PathBuf, SyncError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.cache_dir().join("floodsync").join("workspaces")).ok()
        })
        .ok_or_else(|| SyncError::Filesystem("unable to resolve cache directory".to_string()))
}

/// Where a dated job looks for data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub root: String,
    pub dir_template: PathTemplate,
    #[serde(default)]
    pub required_subdirs: Vec<String>,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub cycle_hour: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    /// Inside the resolved dated directory.
    Dated {
        #[serde(default)]
        subdir: String,
    },
    /// A fixed remote directory.
    Static { dir: String },
    /// A local directory (e.g. the output of an earlier job).
    Local { dir: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sink {
    Table {
        schema: TableSchema,
        #[serde(default)]
        mode: MappingMode,
    },
    Forecast {
        #[serde(default = "default_forecast_table")]
        table: String,
        #[serde(default = "default_code_field")]
        code_field: String,
        #[serde(default = "default_name_field")]
        name_field: String,
        #[serde(default)]
        extra_series: Vec<String>,
    },
    Catalog { product: String },
    Directory {
        #[serde(default)]
        mode: PublishMode,
    },
    MergeGeometry,
    MergeAttributes,
}

fn default_forecast_table() -> String {
    "sector_forecast".to_string()
}

fn default_code_field() -> String {
    "SEC_CODE".to_string()
}

fn default_name_field() -> String {
    "section_name".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub location: Location,
    pub bundle: FileBundle,
    pub sink: Sink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub attribute_key: String,
    pub geometry_key: String,
    #[serde(default = "default_merge_output")]
    pub output: String,
}

fn default_merge_output() -> String {
    MERGED_OUTPUT.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapfileSpec {
    pub data_prefix: String,
    #[serde(default = "ibew_layer_types")]
    pub layers: Vec<LayerType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub merge: Option<MergeSpec>,
    #[serde(default)]
    pub mapfile: Option<MapfileSpec>,
    /// Run catalog/directory sinks even when some critical bundle failed.
    #[serde(default)]
    pub publish_on_partial: bool,
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |message: &str| SyncError::InvalidJob {
            job: self.name.clone(),
            message: message.to_string(),
        };
        if self.targets.is_empty() {
            return Err(invalid("job has no targets"));
        }
        let mut geometry = 0;
        let mut attributes = 0;
        for target in &self.targets {
            if matches!(target.location, Location::Dated { .. }) && self.source.is_none() {
                return Err(invalid(&format!(
                    "target {} reads a dated directory but the job has no source",
                    target.name
                )));
            }
            match &target.sink {
                Sink::Table { schema, .. } => schema.validate()?,
                Sink::MergeGeometry => geometry += 1,
                Sink::MergeAttributes => attributes += 1,
                _ => {}
            }
        }
        if (geometry > 0 || attributes > 0) && self.merge.is_none() {
            return Err(invalid("merge targets need a merge section"));
        }
        if self.merge.is_some() && (geometry != 1 || attributes == 0) {
            return Err(invalid(
                "merge needs exactly one geometry target and at least one attribute target",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub jobs: Vec<JobSpec>,
}

impl ResolvedConfig {
    pub fn job(&self, name: &str) -> Result<&JobSpec, SyncError> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .ok_or_else(|| SyncError::UnknownJob(name.to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist; the default `floodsync.json` is optional.
    pub fn resolve(path: Option<&Path>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from("floodsync.json"),
        };
        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config {
                schema_version: None,
                jobs: Vec::new(),
            });
        }
        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    /// Configured jobs replace built-ins of the same name.
    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let mut jobs = builtin_jobs();
        for job in config.jobs {
            match jobs.iter_mut().find(|existing| existing.name == job.name) {
                Some(existing) => *existing = job,
                None => jobs.push(job),
            }
        }
        for job in &jobs {
            job.validate()?;
        }
        Ok(ResolvedConfig {
            schema_version,
            jobs,
        })
    }
}

/// Impact layer descriptor and destination table.
pub fn impact_layers() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Population", "affected_population"),
        ("GDP", "impacted_gdp"),
        ("Crops", "affected_crops"),
        ("KmRoads", "affected_roads"),
        ("Displaced", "displaced_population"),
        ("Livestock", "affected_livestock"),
        ("Grazing", "affected_grazing_land"),
    ]
}

pub fn impact_schema(table: &str) -> TableSchema {
    TableSchema::new(
        table,
        vec![
            ColumnSpec::new("gid_0", "GID_0", ColumnKind::Text),
            ColumnSpec::new("name_0", "NAME_0", ColumnKind::Text),
            ColumnSpec::new("name_1", "NAME_1", ColumnKind::Text),
            ColumnSpec::new("engtype_1", "ENGTYPE_1", ColumnKind::Text),
            ColumnSpec::new("lack_cc", "LACK_CC", ColumnKind::Float),
            ColumnSpec::new("cod", "COD", ColumnKind::Text),
            ColumnSpec::new("stock", "stock", ColumnKind::Float),
            ColumnSpec::new("flood_tot", "flood_tot", ColumnKind::Float),
            ColumnSpec::new("flood_perc", "flood_perc", ColumnKind::Float),
            ColumnSpec::geometry("geom", ColumnKind::MultiPolygon),
        ],
    )
}

pub fn sector_schema() -> TableSchema {
    let text = |column: &str, source: &str| ColumnSpec::new(column, source, ColumnKind::Text);
    let float = |column: &str, source: &str| ColumnSpec::new(column, source, ColumnKind::Float);
    TableSchema::new(
        "sector_data",
        vec![
            ColumnSpec::new("sec_code", "SEC_CODE", ColumnKind::Integer),
            text("sec_name", "SEC_NAME"),
            text("basin", "BASIN"),
            text("domain", "DOMAIN"),
            text("admin_b_l1", "ADMIN_B_L1"),
            text("admin_b_l2", "ADMIN_B_L2"),
            text("admin_b_l3", "ADMIN_B_L3"),
            text("sec_rs", "SEC_RS"),
            float("area", "AREA"),
            float("lat", "LAT"),
            float("lon", "LON"),
            float("q_thr1", "Q_THR1"),
            float("q_thr2", "Q_THR2"),
            float("q_thr3", "Q_THR3"),
            float("cat", "cat"),
            ColumnSpec::geometry("geom", ColumnKind::Point),
        ],
    )
    .with_batch_size(100)
}

pub fn forecast_schema(table: &str) -> TableSchema {
    TableSchema::new(
        table,
        vec![
            ColumnSpec::new("sec_code", "sec_code", ColumnKind::Integer),
            ColumnSpec::new("section_name", "section_name", ColumnKind::Text),
            ColumnSpec::new("model_type", "model_type", ColumnKind::Text),
            ColumnSpec::new("time_point", "time_point", ColumnKind::Text),
            ColumnSpec::new("forecast_value", "forecast_value", ColumnKind::Float),
        ],
    )
    .with_batch_size(1000)
}

fn dated_source(root: &str, dir_template: &str, lookback_days: Option<u32>) -> SourceSpec {
    SourceSpec {
        root: root.to_string(),
        dir_template: PathTemplate::new(dir_template),
        required_subdirs: Vec::new(),
        lookback_days,
        cycle_hour: 0,
    }
}

pub fn builtin_jobs() -> Vec<JobSpec> {
    let impact_targets = impact_layers()
        .into_iter()
        .map(|(descriptor, table)| TargetSpec {
            name: table.to_string(),
            location: Location::Dated {
                subdir: String::new(),
            },
            bundle: FileBundle::shapefile(format!("{{date}}0000_FPimpacts-{descriptor}")),
            sink: Sink::Table {
                schema: impact_schema(table),
                mode: MappingMode::Direct,
            },
        })
        .collect();

    let mut hazard_source = dated_source("$REMOTE_FOLDER_BASE", "{YYYY}/{MM}/{DD}/{HH}/0000", None);
    hazard_source.required_subdirs = vec!["HMC".to_string()];
    let mut hazard_targets = vec![TargetSpec {
        name: "flood_hazard".to_string(),
        location: Location::Dated {
            subdir: String::new(),
        },
        bundle: FileBundle::single("flood_hazard_map_floodproofs_{date}0000", ".tif"),
        sink: Sink::Catalog {
            product: "flood_hazard".to_string(),
        },
    }];
    for group in ["group1", "group2", "group4"] {
        hazard_targets.push(TargetSpec {
            name: format!("{group}_alert"),
            location: Location::Dated {
                subdir: "HMC".to_string(),
            },
            bundle: FileBundle::single(format!("{group}_mosaic_alert_level"), ".tif"),
            sink: Sink::Catalog {
                product: format!("{group}_alert"),
            },
        });
    }

    let ibew_targets = ibew_layer_types()
        .into_iter()
        .map(|layer| TargetSpec {
            name: layer.code.clone(),
            location: Location::Dated {
                subdir: String::new(),
            },
            bundle: FileBundle::shapefile(format!("{{date}}0000_FPimpacts-{}", layer.code)),
            sink: Sink::Directory {
                mode: PublishMode::AtomicRename,
            },
        })
        .collect();

    vec![
        JobSpec {
            name: "impact-layers".to_string(),
            source: Some(dated_source("$REMOTE_FOLDER_BASE", "{YYYY}/{MM}/{DD}/{HH}", None)),
            targets: impact_targets,
            merge: None,
            mapfile: None,
            publish_on_partial: false,
        },
        JobSpec {
            name: "sectors".to_string(),
            source: None,
            targets: vec![TargetSpec {
                name: "sector_data".to_string(),
                location: Location::Static {
                    dir: "$SHAPEFILE_REMOTE_DIR".to_string(),
                },
                bundle: FileBundle::shapefile("fp_sections_igad"),
                sink: Sink::Table {
                    schema: sector_schema(),
                    mode: MappingMode::Derived,
                },
            }],
            merge: None,
            mapfile: None,
            publish_on_partial: false,
        },
        JobSpec {
            name: "timeseries-merge".to_string(),
            source: None,
            targets: vec![
                TargetSpec {
                    name: "sector_geometry".to_string(),
                    location: Location::Static {
                        dir: "$SHAPEFILE_REMOTE_DIR".to_string(),
                    },
                    bundle: FileBundle::shapefile("fp_sections_igad"),
                    sink: Sink::MergeGeometry,
                },
                TargetSpec {
                    name: "timeseries_json".to_string(),
                    location: Location::Static {
                        dir: "$JSON_REMOTE_DIR".to_string(),
                    },
                    bundle: FileBundle::Listing {
                        extension: ".json".to_string(),
                    },
                    sink: Sink::MergeAttributes,
                },
            ],
            merge: Some(MergeSpec {
                attribute_key: "section_name".to_string(),
                geometry_key: "SEC_NAME".to_string(),
                output: MERGED_OUTPUT.to_string(),
            }),
            mapfile: None,
            publish_on_partial: false,
        },
        JobSpec {
            name: "forecast-load".to_string(),
            source: None,
            targets: vec![TargetSpec {
                name: "sector_forecast".to_string(),
                location: Location::Local {
                    dir: "$FLOODSYNC_OUTPUT_DIR".to_string(),
                },
                bundle: FileBundle::single("merged_data", ".geojson"),
                sink: Sink::Forecast {
                    table: default_forecast_table(),
                    code_field: default_code_field(),
                    name_field: default_name_field(),
                    extra_series: Vec::new(),
                },
            }],
            merge: None,
            mapfile: None,
            publish_on_partial: false,
        },
        JobSpec {
            name: "hazard-rasters".to_string(),
            source: Some(hazard_source),
            targets: hazard_targets,
            merge: None,
            mapfile: None,
            publish_on_partial: false,
        },
        JobSpec {
            name: "ibew-layers".to_string(),
            source: Some(dated_source("$IBEW_REMOTE_BASE", "{YYYY}/{MM}/{DD}/{HH}", Some(1))),
            targets: ibew_targets,
            merge: None,
            mapfile: Some(MapfileSpec {
                data_prefix: "shapefiles/ibew_shapefiles".to_string(),
                layers: ibew_layer_types(),
            }),
            publish_on_partial: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            pairs
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn local_transport_needs_no_sftp_credentials() {
        let settings = Settings::from_lookup(lookup(&[
            ("FLOODSYNC_TRANSPORT", "local"),
            ("FLOODSYNC_WORKSPACE_ROOT", "/tmp/ws"),
            ("REMOTE_FOLDER_BASE", "/data/fp"),
        ]))
        .unwrap();
        assert_eq!(settings.transport, Transport::Local);
        assert!(settings.remote.is_none());
        assert_eq!(settings.lookback_days, DEFAULT_LOOKBACK_DAYS);
        assert_eq!(settings.expand("$REMOTE_FOLDER_BASE/2025").unwrap(), "/data/fp/2025");
        assert_matches!(settings.expand("$JSON_REMOTE_DIR"), Err(SyncError::Config(_)));
    }

    #[test]
    fn sftp_transport_requires_host() {
        let result = Settings::from_lookup(lookup(&[("FLOODSYNC_WORKSPACE_ROOT", "/tmp/ws")]));
        assert_matches!(result, Err(SyncError::Config(ref key)) if key == "SFTP_HOST");
    }

    #[test]
    fn catalog_urls_keep_primary_first() {
        let settings = Settings::from_lookup(lookup(&[
            ("SFTP_HOST", "sftp.example"),
            ("SFTP_USERNAME", "u"),
            ("FLOODSYNC_WORKSPACE_ROOT", "/tmp/ws"),
            ("GEOSERVER_URL", "http://a"),
            ("GEOSERVER_FALLBACK_URL", "http://b"),
        ]))
        .unwrap();
        let catalog = settings.catalog.unwrap();
        assert_eq!(catalog.urls, vec!["http://a", "http://b"]);
        assert_eq!(catalog.workspace, DEFAULT_WORKSPACE);
        assert_eq!(settings.remote.unwrap().port, 22);
    }

    #[test]
    fn builtin_jobs_are_valid() {
        let resolved = ConfigLoader::resolve_config(Config {
            schema_version: None,
            jobs: Vec::new(),
        })
        .unwrap();
        assert_eq!(resolved.jobs.len(), 6);
        assert_eq!(resolved.job("impact-layers").unwrap().targets.len(), 7);
        assert_matches!(resolved.job("nope"), Err(SyncError::UnknownJob(_)));
    }
}
