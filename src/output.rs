use std::io::{self, Write};

use serde::Serialize;

use crate::config::JobSpec;
use crate::runner::{JobReport, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_reports(reports: &[JobReport]) -> io::Result<()> {
        Self::print_json(&reports)
    }

    pub fn print_jobs(jobs: &[JobSpec]) -> io::Result<()> {
        Self::print_json(&jobs)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Plain-text run summary, one block per job.
pub fn render_summary(report: &JobReport) -> String {
    let mut out = String::new();
    let status = match report.outcome {
        Outcome::Success => "ok",
        Outcome::Partial => "partial",
        Outcome::Failed => "failed",
    };
    let fallback = if report.used_fallback_date {
        " (fallback)"
    } else {
        ""
    };
    out.push_str(&format!(
        "{} [{status}] date {}{fallback}, run {}\n",
        report.job, report.data_date, report.run_id
    ));
    for target in &report.succeeded_targets {
        out.push_str(&format!("  ok     {target}\n"));
    }
    for failure in &report.failed_targets {
        out.push_str(&format!(
            "  failed {} at {}: {}\n",
            failure.target, failure.stage, failure.reason
        ));
    }
    for (table, summary) in &report.loaded {
        out.push_str(&format!(
            "  table  {table}: {} deleted, {} inserted in {} batches\n",
            summary.deleted, summary.inserted, summary.batches
        ));
    }
    for entry in &report.published {
        out.push_str(&format!("  entry  {} ({:?})", entry.entry, entry.state));
        if let Some(warning) = &entry.metadata_warning {
            out.push_str(&format!(" metadata: {warning}"));
        }
        out.push('\n');
    }
    for path in &report.preserved {
        out.push_str(&format!("  output {}\n", path.display()));
    }
    out
}

pub fn print_summary(report: &JobReport) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(render_summary(report).as_bytes())
}
