use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::{BatchReport, RecipeStatus};
use crate::error::SitepackError;
use crate::pipeline::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub recipe: String,
    pub site_id: String,
    pub coordinate: [f64; 2],
    pub fragment: Option<String>,
    pub archive: Option<String>,
    pub consistent: bool,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_validation(result: &ValidationResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn to_bytes<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
        let mut json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
        json.push(b'\n');
        Ok(json)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = Self::to_bytes(value)?;
        let mut stdout = io::stdout();
        stdout.write_all(&json)?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub fn print_report_summary(report: &BatchReport) {
    for outcome in &report.outcomes {
        let site = outcome.site_id.as_deref().unwrap_or("-");
        match outcome.status {
            RecipeStatus::Succeeded => println!(
                "ok      {site:<12} {}",
                outcome.archive.as_deref().unwrap_or_default()
            ),
            RecipeStatus::Failed => println!(
                "failed  {site:<12} {} [{}] {}",
                outcome.recipe,
                outcome.error_kind.as_deref().unwrap_or("Error"),
                outcome.message.as_deref().unwrap_or_default()
            ),
        }
    }
    println!(
        "{} recipes: {} succeeded, {} failed",
        report.total, report.succeeded, report.failed
    );
}

pub fn print_validation_summary(result: &ValidationResult) {
    println!(
        "recipe {} ok: site {} at ({}, {})",
        result.recipe, result.site_id, result.coordinate[0], result.coordinate[1]
    );
    if let Some(fragment) = &result.fragment {
        println!("fragment {fragment} is consistent");
    }
    if let Some(archive) = &result.archive {
        println!("package {archive} matches");
    }
}

/// `sitepack_YYYY-MM-DD.log` under `dir`, one file per UTC day.
pub fn log_file_path(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!("sitepack_{}.log", at.format("%Y-%m-%d")))
}

/// Opens the day's log file for appending, creating `dir` as needed.
pub fn open_log_file(dir: &Path, at: DateTime<Utc>) -> Result<File, SitepackError> {
    fs::create_dir_all(dir)
        .map_err(|err| SitepackError::Filesystem(format!("log dir {}: {err}", dir.display())))?;
    let path = log_file_path(dir, at);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| SitepackError::Filesystem(format!("log file {}: {err}", path.display())))
}
