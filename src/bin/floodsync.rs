use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::error;
use tracing_subscriber::EnvFilter;

use flood_impact_sync::catalog::{CatalogEndpoint, GeoServerHttpClient};
use flood_impact_sync::config::{ConfigLoader, Settings, Transport};
use flood_impact_sync::error::SyncError;
use flood_impact_sync::output::{JsonOutput, OutputMode, print_summary};
use flood_impact_sync::remote::{LocalDirSource, RemoteFileSource, SftpSource};
use flood_impact_sync::runner::PipelineRunner;

#[derive(Parser)]
#[command(name = "floodsync")]
#[command(about = "Fetch flood-impact data from the forecast host, load it and publish it")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one or more jobs")]
    Run(RunArgs),
    #[command(about = "List configured jobs")]
    Jobs(JobsArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(required = true)]
    jobs: Vec<String>,

    /// Start date for the fallback search (defaults to today, UTC).
    #[arg(long)]
    date: Option<NaiveDate>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct JobsArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::Config(_)
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::InvalidJob { .. }
        | SyncError::UnknownJob(_)
        | SyncError::Template { .. } => 2,
        SyncError::Connection(_) | SyncError::NoDataAvailable { .. } => 3,
        SyncError::NoSuccessfulTargets(_) => 4,
        SyncError::JobLocked(_) => 5,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_jobs(args),
        Commands::Jobs(args) => {
            let resolved = ConfigLoader::resolve(args.config.as_deref())?;
            if args.json {
                JsonOutput::print_jobs(&resolved.jobs).into_diagnostic()?;
            } else {
                for job in &resolved.jobs {
                    println!("{} ({} targets)", job.name, job.targets.len());
                }
            }
            Ok(())
        }
    }
}

fn run_jobs(args: RunArgs) -> miette::Result<()> {
    let resolved = ConfigLoader::resolve(args.config.as_deref())?;
    let jobs = args
        .jobs
        .iter()
        .map(|name| resolved.job(name))
        .collect::<Result<Vec<_>, _>>()?;
    let settings = Settings::from_env()?;
    let output_mode = if args.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let source: Box<dyn RemoteFileSource> = match (settings.transport, &settings.remote) {
        (Transport::Sftp, Some(endpoint)) => {
            Box::new(SftpSource::new(endpoint.clone(), settings.retry.clone()))
        }
        (Transport::Sftp, None) => return Err(SyncError::Config("SFTP_HOST".to_string()).into()),
        (Transport::Local, _) => Box::new(LocalDirSource::new(settings.local_root.clone())),
    };
    let catalog = match &settings.catalog {
        Some(catalog) => Some(GeoServerHttpClient::new(
            CatalogEndpoint {
                urls: catalog.urls.clone(),
                username: catalog.username.clone(),
                password: catalog.password.clone(),
                workspace: catalog.workspace.clone(),
                timeout: settings.timeout,
            },
            settings.retry.clone(),
        )?),
        None => None,
    };
    let runner = PipelineRunner::new(settings, source, catalog);

    let mut reports = Vec::new();
    let mut first_error = None;
    for job in jobs {
        let failure = match runner.run(job, args.date) {
            Ok(report) => {
                if output_mode == OutputMode::Human {
                    print_summary(&report).into_diagnostic()?;
                }
                let failure = report.failure();
                reports.push(report);
                failure
            }
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            error!(job = %job.name, error = %err, "job failed");
            first_error.get_or_insert(err);
        }
    }
    if output_mode == OutputMode::Json {
        JsonOutput::print_reports(&reports).into_diagnostic()?;
    }
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
