use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info};

use crate::error::SitepackError;
use crate::locator::SourceFetcher;
use crate::netcdf::NetcdfToolkit;
use crate::pipeline::{Pipeline, ProgressEvent, ProgressSink};
use crate::recipe::RecipeLoader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeOutcome {
    pub recipe: String,
    pub site_id: Option<String>,
    pub status: RecipeStatus,
    pub archive: Option<String>,
    pub error_kind: Option<String>,
    pub message: Option<String>,
    #[serde(skip)]
    pub exit_code: u8,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<RecipeOutcome>,
}

impl BatchReport {
    /// Exit code of the first failure, or 0 when every recipe succeeded.
    pub fn exit_code(&self) -> u8 {
        self.outcomes
            .iter()
            .find(|outcome| outcome.status == RecipeStatus::Failed)
            .map(|outcome| outcome.exit_code)
            .unwrap_or(0)
    }
}

/// The recipe files named by a run: one file, or every recipe in a directory
/// sorted by name.
pub fn collect_recipes(
    file: Option<&Path>,
    dir: Option<&Path>,
) -> Result<Vec<PathBuf>, SitepackError> {
    match (file, dir) {
        (Some(file), None) => Ok(vec![file.to_path_buf()]),
        (None, Some(dir)) => RecipeLoader::discover(dir),
        _ => Err(SitepackError::ConfigParse(
            "exactly one of --file or --dir is required".to_string(),
        )),
    }
}

/// Runs every recipe in order. A failing recipe is recorded and the batch
/// moves on.
pub fn run_batch<T: NetcdfToolkit, F: SourceFetcher>(
    pipeline: &Pipeline<T, F>,
    recipes: &[PathBuf],
    sink: &dyn ProgressSink,
) -> BatchReport {
    let mut report = BatchReport {
        total: recipes.len(),
        ..BatchReport::default()
    };
    for (index, path) in recipes.iter().enumerate() {
        sink.event(ProgressEvent {
            message: format!(
                "phase=Recipe; {}/{}; {}",
                index + 1,
                recipes.len(),
                path.display()
            ),
            elapsed: None,
        });
        let outcome = run_one(pipeline, path, sink);
        match outcome.status {
            RecipeStatus::Succeeded => report.succeeded += 1,
            RecipeStatus::Failed => report.failed += 1,
        }
        report.outcomes.push(outcome);
    }
    info!(
        total = report.total,
        succeeded = report.succeeded,
        failed = report.failed,
        "batch finished"
    );
    report
}

fn run_one<T: NetcdfToolkit, F: SourceFetcher>(
    pipeline: &Pipeline<T, F>,
    path: &Path,
    sink: &dyn ProgressSink,
) -> RecipeOutcome {
    let recipe_name = path.display().to_string();
    let mut site_id = None;
    let result = RecipeLoader::load(path).and_then(|recipe| {
        site_id = Some(recipe.site_id.to_string());
        pipeline.run(&recipe, sink)
    });
    match result {
        Ok(site) => RecipeOutcome {
            recipe: recipe_name,
            site_id,
            status: RecipeStatus::Succeeded,
            archive: Some(site.archive.display().to_string()),
            error_kind: None,
            message: None,
            exit_code: 0,
        },
        Err(err) => {
            error!(recipe = %recipe_name, kind = err.kind(), error = %err, "recipe failed");
            RecipeOutcome {
                recipe: recipe_name,
                site_id,
                status: RecipeStatus::Failed,
                archive: None,
                error_kind: Some(err.kind().to_string()),
                message: Some(err.to_string()),
                exit_code: err.exit_code(),
            }
        }
    }
}
