use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::bundle::{BundleFetcher, BundleResult};
use crate::catalog::{CatalogClient, CatalogPublisher, PublishedEntry};
use crate::config::{JobSpec, Location, MergeSpec, Settings, Sink, TargetSpec, forecast_schema};
use crate::domain::{PathTemplate, RunContext, date_stamp, join_remote};
use crate::error::SyncError;
use crate::forecast::SeriesExtractor;
use crate::geometry::Feature;
use crate::loader::{LoadSummary, MappingMode, SourceRecord, StoreLoader, TableSchema};
use crate::mapfile::MapfileExtender;
use crate::merge::{GeoJoinMerger, read_attribute_file, read_feature_collection, write_feature_collection};
use crate::publish::{PublishMode, publish_file};
use crate::remote::{LocalDirSource, RemoteFileSource, RemoteSession};
use crate::resolver::{DateFallbackResolver, ResolvedDate};
use crate::vector::read_shapefile;
use crate::workspace::{RunLock, Workspace};

const SKIPPED_PARTIAL: &str = "skipped: a critical bundle failed and publish_on_partial is off";
const NOTHING_JOINED: &str = "no records joined";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Parse,
    Merge,
    Load,
    Publish,
    Mirror,
    Mapfile,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Parse => "parse",
            Stage::Merge => "merge",
            Stage::Load => "load",
            Stage::Publish => "publish",
            Stage::Mirror => "mirror",
            Stage::Mapfile => "mapfile",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub target: String,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub run_id: String,
    pub outcome: Outcome,
    pub data_date: NaiveDate,
    pub used_fallback_date: bool,
    pub succeeded_targets: Vec<String>,
    pub failed_targets: Vec<TargetFailure>,
    pub loaded: Vec<(String, LoadSummary)>,
    pub published: Vec<PublishedEntry>,
    pub preserved: Vec<PathBuf>,
}

impl JobReport {
    /// The error a run with zero successful targets maps to.
    pub fn failure(&self) -> Option<SyncError> {
        (self.outcome == Outcome::Failed).then(|| SyncError::NoSuccessfulTargets(self.job.clone()))
    }
}

struct Fetched<'j> {
    target: &'j TargetSpec,
    bundle: BundleResult,
}

/// Composes resolve, fetch, merge, load and publish for one job at a time.
pub struct PipelineRunner<S: RemoteFileSource, C: CatalogClient> {
    settings: Settings,
    source: S,
    catalog: Option<C>,
}

impl<S: RemoteFileSource, C: CatalogClient> PipelineRunner<S, C> {
    pub fn new(settings: Settings, source: S, catalog: Option<C>) -> Self {
        Self {
            settings,
            source,
            catalog,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs one job. `Err` means the run could not start or find data; target
    /// failures are reported inside the returned [`JobReport`].
    pub fn run(&self, job: &JobSpec, today: Option<NaiveDate>) -> Result<JobReport, SyncError> {
        job.validate()?;
        let _lock = RunLock::acquire(&self.settings.workspace_root, &job.name)?;
        let mut ctx = RunContext::new(&job.name, Utc::now(), today);
        if let Some(source) = &job.source {
            ctx.cycle_hour = source.cycle_hour;
        }
        info!(job = %ctx.job, run_id = %ctx.run_id, today = %ctx.today, "job started");

        let mut workspace = Workspace::create(&self.settings.workspace_root, &ctx)?;
        let needs_remote = job.source.is_some()
            || job
                .targets
                .iter()
                .any(|target| !matches!(target.location, Location::Local { .. }));
        let mut session = if needs_remote {
            Some(self.source.connect()?)
        } else {
            None
        };

        let resolved = match (&job.source, session.as_deref()) {
            (Some(source), Some(remote)) => {
                let root = self.settings.expand(&source.root)?;
                let template = PathTemplate::new(join_remote(&root, source.dir_template.as_str()));
                let resolver = DateFallbackResolver::new(
                    template,
                    source.lookback_days.unwrap_or(self.settings.lookback_days),
                )
                .with_cycle_hour(source.cycle_hour)
                .with_required_subdirs(source.required_subdirs.clone());
                Some(resolver.resolve(&job.name, remote, ctx.today)?)
            }
            _ => None,
        };
        let data_date = resolved.as_ref().map_or(ctx.today, |r| r.date);
        let used_fallback_date = resolved.as_ref().is_some_and(|r| r.is_fallback);

        let mut report = JobReport {
            job: job.name.clone(),
            run_id: ctx.run_id.clone(),
            outcome: Outcome::Failed,
            data_date,
            used_fallback_date,
            succeeded_targets: Vec::new(),
            failed_targets: Vec::new(),
            loaded: Vec::new(),
            published: Vec::new(),
            preserved: Vec::new(),
        };

        let mut fetched = Vec::new();
        for target in &job.targets {
            match self.fetch_target(&ctx, target, resolved.as_ref(), session.as_deref(), &workspace) {
                Ok(bundle) if bundle.complete => fetched.push(Fetched { target, bundle }),
                Ok(bundle) => fail(
                    &mut report,
                    target,
                    Stage::Fetch,
                    bundle.failure.unwrap_or_else(|| "bundle incomplete".to_string()),
                ),
                Err(err @ SyncError::Connection(_)) if !is_local(target) => {
                    error!(job = %job.name, target = %target.name, error = %err, "remote connection lost");
                    return Err(err);
                }
                Err(err) => fail(&mut report, target, Stage::Fetch, err.to_string()),
            }
        }

        let partial = !report.failed_targets.is_empty();
        let mut loader = None;
        let mut merge_inputs = Vec::new();
        for item in &fetched {
            let target = item.target;
            match &target.sink {
                Sink::Table { schema, mode } => {
                    let result = records_from_shapefile(&item.bundle)
                        .map_err(|err| (Stage::Parse, err))
                        .and_then(|records| self.load(&mut loader, schema, *mode, &records));
                    record_load(&mut report, target, &schema.table, result);
                }
                Sink::Forecast {
                    table,
                    code_field,
                    name_field,
                    extra_series,
                } => {
                    let schema = forecast_schema(table);
                    let extractor =
                        SeriesExtractor::default().with_extra_fields(extra_series.clone());
                    let result = forecast_records(&item.bundle, &extractor, code_field, name_field)
                        .map_err(|err| (Stage::Parse, err))
                        .and_then(|records| {
                            self.load(&mut loader, &schema, MappingMode::Derived, &records)
                        });
                    record_load(&mut report, target, table, result);
                }
                Sink::Catalog { product } => {
                    if partial && !job.publish_on_partial {
                        fail(&mut report, target, Stage::Publish, SKIPPED_PARTIAL.to_string());
                        continue;
                    }
                    match self.publish_raster(product, data_date, ctx.cycle_hour, &item.bundle) {
                        Ok(entry) => {
                            report.published.push(entry);
                            succeed(&mut report, target, Stage::Publish);
                        }
                        Err(err) => fail(&mut report, target, Stage::Publish, err.to_string()),
                    }
                }
                Sink::Directory { mode } => {
                    if partial && !job.publish_on_partial {
                        fail(&mut report, target, Stage::Mirror, SKIPPED_PARTIAL.to_string());
                        continue;
                    }
                    match self.mirror_bundle(data_date, &item.bundle, *mode) {
                        Ok(()) => succeed(&mut report, target, Stage::Mirror),
                        Err(err) => fail(&mut report, target, Stage::Mirror, err.to_string()),
                    }
                }
                Sink::MergeGeometry | Sink::MergeAttributes => merge_inputs.push(item),
            }
        }

        if let Some(merge) = &job.merge {
            self.run_merge(&mut report, job, merge, &merge_inputs, &mut workspace);
        }

        if let (Some(spec), Some(path)) = (&job.mapfile, &self.settings.mapfile) {
            let mirrored = job.targets.iter().any(|target| {
                matches!(target.sink, Sink::Directory { .. })
                    && report.succeeded_targets.contains(&target.name)
            });
            if mirrored {
                let extender = MapfileExtender::new(spec.data_prefix.clone(), spec.layers.clone());
                if let Err(err) = extender.extend_file(path, data_date) {
                    error!(job = %job.name, stage = %Stage::Mapfile, error = %err, "mapfile update failed");
                    report.failed_targets.push(TargetFailure {
                        target: "mapfile".to_string(),
                        stage: Stage::Mapfile,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if let Some(session) = session.as_mut() {
            session.close();
        }
        match workspace.finish() {
            Ok(cleanup) => report.preserved = cleanup.preserved,
            Err(err) => {
                warn!(job = %job.name, stage = %Stage::Cleanup, error = %err, "workspace cleanup incomplete");
                report.failed_targets.push(TargetFailure {
                    target: "workspace".to_string(),
                    stage: Stage::Cleanup,
                    reason: err.to_string(),
                });
            }
        }

        report.outcome = match (report.succeeded_targets.is_empty(), report.failed_targets.is_empty()) {
            (true, _) => Outcome::Failed,
            (false, true) => Outcome::Success,
            (false, false) => Outcome::Partial,
        };
        let succeeded = report.succeeded_targets.len();
        let failed = report.failed_targets.len();
        match report.outcome {
            Outcome::Success => {
                info!(job = %job.name, date = %data_date, fallback = used_fallback_date, succeeded, "job finished");
            }
            Outcome::Partial => {
                warn!(job = %job.name, date = %data_date, fallback = used_fallback_date, succeeded, failed, "job finished with failures");
            }
            Outcome::Failed => {
                error!(job = %job.name, date = %data_date, fallback = used_fallback_date, failed, "job produced no successful targets");
            }
        }
        Ok(report)
    }

    fn fetch_target(
        &self,
        ctx: &RunContext,
        target: &TargetSpec,
        resolved: Option<&ResolvedDate>,
        session: Option<&dyn RemoteSession>,
        workspace: &Workspace,
    ) -> Result<BundleResult, SyncError> {
        let date = resolved.map_or(ctx.today, |r| r.date);
        let dest = workspace.subdir(&target.name)?;
        let fetch_from = |session: &dyn RemoteSession, dir: &str| {
            info!(job = %ctx.job, target = %target.name, stage = %Stage::Fetch, path = %dir, "fetching bundle");
            BundleFetcher::new(session).fetch(dir, &target.bundle, date, ctx.cycle_hour, &dest)
        };
        match &target.location {
            Location::Local { dir } => {
                let dir = self.settings.expand(dir)?;
                let local = LocalDirSource::new(PathBuf::from(&dir)).connect()?;
                fetch_from(&*local, "")
            }
            Location::Dated { subdir } => {
                let (Some(resolved), Some(session)) = (resolved, session) else {
                    return Err(SyncError::Config(format!("{}: no dated source", target.name)));
                };
                fetch_from(session, &join_remote(&resolved.path, subdir))
            }
            Location::Static { dir } => {
                let session = session
                    .ok_or_else(|| SyncError::Connection("no remote session".to_string()))?;
                fetch_from(session, &self.settings.expand(dir)?)
            }
        }
    }

    fn load(
        &self,
        loader: &mut Option<StoreLoader>,
        schema: &TableSchema,
        mode: MappingMode,
        records: &[SourceRecord],
    ) -> Result<LoadSummary, (Stage, SyncError)> {
        if loader.is_none() {
            *loader =
                Some(StoreLoader::open(&self.settings.database).map_err(|err| (Stage::Load, err))?);
        }
        let Some(loader) = loader.as_mut() else {
            return Err((Stage::Load, SyncError::Store("store not opened".to_string())));
        };
        loader
            .replace(schema, mode, records)
            .map_err(|err| (Stage::Load, err))
    }

    fn publish_raster(
        &self,
        product: &str,
        date: NaiveDate,
        hour: u32,
        bundle: &BundleResult,
    ) -> Result<PublishedEntry, SyncError> {
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| SyncError::Config("GEOSERVER_URL".to_string()))?;
        let file = bundle
            .files
            .values()
            .next()
            .ok_or_else(|| SyncError::NotFound(format!("{product}: no raster in bundle")))?;
        CatalogPublisher::new(catalog).publish(product, date, hour, file)
    }

    fn mirror_bundle(
        &self,
        date: NaiveDate,
        bundle: &BundleResult,
        mode: PublishMode,
    ) -> Result<(), SyncError> {
        let served = self
            .settings
            .served_dir
            .as_ref()
            .ok_or_else(|| SyncError::Config("FLOODSYNC_SERVED_DIR".to_string()))?;
        let dir = served.join(date_stamp(date));
        for path in bundle.files.values() {
            let name = path
                .file_name()
                .ok_or_else(|| SyncError::Filesystem(format!("{}: no file name", path.display())))?;
            publish_file(path, &dir.join(name), mode)?;
        }
        info!(dir = %dir.display(), files = bundle.files.len(), "bundle mirrored");
        Ok(())
    }

    fn run_merge(
        &self,
        report: &mut JobReport,
        job: &JobSpec,
        merge: &MergeSpec,
        inputs: &[&Fetched<'_>],
        workspace: &mut Workspace,
    ) {
        let geometry = inputs
            .iter()
            .find(|item| matches!(item.target.sink, Sink::MergeGeometry));
        let attributes: Vec<&&Fetched<'_>> = inputs
            .iter()
            .filter(|item| matches!(item.target.sink, Sink::MergeAttributes))
            .collect();
        let Some(geometry) = geometry else {
            for item in attributes {
                fail(report, item.target, Stage::Merge, "geometry bundle unavailable".to_string());
            }
            return;
        };
        let features = match records_from_shapefile(&geometry.bundle) {
            Ok(records) => records
                .into_iter()
                .filter_map(|record| {
                    record.geometry.map(|geometry| Feature {
                        attributes: record.attributes,
                        geometry,
                    })
                })
                .collect::<Vec<_>>(),
            Err(err) => {
                fail(report, geometry.target, Stage::Parse, err.to_string());
                for item in attributes {
                    fail(report, item.target, Stage::Merge, "geometry bundle unreadable".to_string());
                }
                return;
            }
        };

        let mut records = Vec::new();
        let mut readable = Vec::new();
        for item in &attributes {
            let mut parsed_any = false;
            for path in item.bundle.files.values() {
                match read_attribute_file(path) {
                    Ok((mut parsed, _skipped)) => {
                        parsed_any = true;
                        records.append(&mut parsed);
                    }
                    Err(err) => {
                        warn!(job = %job.name, path = %path.display(), error = %err, "skipping unreadable attribute file");
                    }
                }
            }
            if parsed_any {
                readable.push(item.target);
            } else {
                fail(report, item.target, Stage::Parse, "no readable attribute files".to_string());
            }
        }
        if readable.is_empty() {
            fail(report, geometry.target, Stage::Merge, "no attribute records to join".to_string());
            return;
        }

        let merger = GeoJoinMerger::new(merge.attribute_key.clone(), merge.geometry_key.clone());
        let outcome = merger.merge(&features, records);
        if outcome.features.is_empty() {
            warn!(job = %job.name, stage = %Stage::Merge, dropped = outcome.dropped.len(), "no records joined, keeping previous output");
            fail(report, geometry.target, Stage::Merge, NOTHING_JOINED.to_string());
            for target in readable {
                fail(report, target, Stage::Merge, NOTHING_JOINED.to_string());
            }
            return;
        }
        let written = workspace
            .subdir("merge")
            .map(|dir| dir.join(&merge.output))
            .and_then(|artifact| {
                write_feature_collection(&artifact, &outcome.features).map(|()| artifact)
            });
        match written {
            Ok(artifact) => {
                let destination = self.settings.output_dir.join(&merge.output);
                workspace.preserve(&artifact, &destination);
                info!(job = %job.name, stage = %Stage::Merge, features = outcome.features.len(), dropped = outcome.dropped.len(), path = %destination.display(), "merged output staged");
                succeed(report, geometry.target, Stage::Merge);
                for target in readable {
                    succeed(report, target, Stage::Merge);
                }
            }
            Err(err) => {
                fail(report, geometry.target, Stage::Merge, err.to_string());
                for target in readable {
                    fail(report, target, Stage::Merge, err.to_string());
                }
            }
        }
    }
}

fn record_load(
    report: &mut JobReport,
    target: &TargetSpec,
    table: &str,
    result: Result<LoadSummary, (Stage, SyncError)>,
) {
    match result {
        Ok(summary) => {
            report.loaded.push((table.to_string(), summary));
            succeed(report, target, Stage::Load);
        }
        Err((stage, err)) => fail(report, target, stage, err.to_string()),
    }
}

fn is_local(target: &TargetSpec) -> bool {
    matches!(target.location, Location::Local { .. })
}

fn succeed(report: &mut JobReport, target: &TargetSpec, stage: Stage) {
    info!(job = %report.job, target = %target.name, stage = %stage, "target succeeded");
    report.succeeded_targets.push(target.name.clone());
}

fn fail(report: &mut JobReport, target: &TargetSpec, stage: Stage, reason: String) {
    error!(job = %report.job, target = %target.name, stage = %stage, reason = %reason, "target failed");
    report.failed_targets.push(TargetFailure {
        target: target.name.clone(),
        stage,
        reason,
    });
}

fn shapefile_path(bundle: &BundleResult) -> Result<&Path, SyncError> {
    bundle
        .file(".shp")
        .ok_or_else(|| SyncError::NotFound("bundle has no .shp file".to_string()))
}

fn records_from_shapefile(bundle: &BundleResult) -> Result<Vec<SourceRecord>, SyncError> {
    let layer = read_shapefile(shapefile_path(bundle)?)?;
    Ok(layer.features.into_iter().map(SourceRecord::from).collect())
}

fn forecast_records(
    bundle: &BundleResult,
    extractor: &SeriesExtractor,
    code_field: &str,
    name_field: &str,
) -> Result<Vec<SourceRecord>, SyncError> {
    let path = bundle
        .files
        .values()
        .next()
        .ok_or_else(|| SyncError::NotFound("forecast bundle is empty".to_string()))?;
    let features = read_feature_collection(path)?;
    Ok(extractor.rows(&features, code_field, name_field))
}
