use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use lsp_sitepack::batch::{self, BatchReport};
use lsp_sitepack::config::ConfigLoader;
use lsp_sitepack::error::SitepackError;
use lsp_sitepack::locator::HttpFetcher;
use lsp_sitepack::metadata;
use lsp_sitepack::netcdf::NcoToolkit;
use lsp_sitepack::output::{
    JsonOutput, OutputMode, ValidationResult, open_log_file, print_report_summary,
    print_validation_summary,
};
use lsp_sitepack::package;
use lsp_sitepack::pipeline::{LogSink, Pipeline, ProgressSink};
use lsp_sitepack::recipe::RecipeLoader;
use lsp_sitepack::store::Store;

#[derive(Parser)]
#[command(name = "sitepack")]
#[command(about = "Build single-point forcing and surface-data packages for land-sites runs")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Also write logs to a dated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build site packages from one recipe or a directory of recipes")]
    Run(RunArgs),
    #[command(about = "Validate a recipe and, optionally, an emitted fragment or package")]
    Validate(ValidateArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(short = 'f', long, conflicts_with = "dir", required_unless_present = "dir")]
    file: Option<PathBuf>,

    #[arg(short = 'd', long)]
    dir: Option<PathBuf>,

    #[arg(short = 'm', long)]
    machine: Option<String>,

    #[arg(long)]
    config: Option<String>,

    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long)]
    recipe: PathBuf,

    #[arg(long)]
    fragment: Option<PathBuf>,

    #[arg(long)]
    archive: Option<PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<SitepackError>() {
                return ExitCode::from(err.exit_code());
            }
            ExitCode::from(1)
        }
    }
}

fn init_tracing(log_dir: Option<&Path>) -> miette::Result<()> {
    let file_layer = match log_dir {
        Some(dir) => {
            let file = open_log_file(dir, Utc::now())?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn run() -> miette::Result<u8> {
    let cli = Cli::parse();
    init_tracing(cli.log_dir.as_deref())?;

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Run(args) => run_batch(args, output_mode),
        Commands::Validate(args) => run_validate(args, output_mode).map(|()| 0),
    }
}

fn run_batch(args: RunArgs, output_mode: OutputMode) -> miette::Result<u8> {
    let machine = ConfigLoader::resolve(args.config.as_deref(), args.machine.as_deref())?;
    let recipes = batch::collect_recipes(args.file.as_deref(), args.dir.as_deref())?;
    let toolkit = NcoToolkit::new(machine.nco.bin_dir.clone(), machine.nco.timeout)
        .with_reader(machine.nco.reader);
    let fetcher = HttpFetcher::new()?;
    let pipeline = Pipeline::new(machine, toolkit, fetcher).with_output(args.output);

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &LogSink,
    };
    let report = batch::run_batch(&pipeline, &recipes, sink);

    if let Some(path) = &args.report {
        write_report(&report, path)?;
    }
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Human => print_report_summary(&report),
    }
    Ok(report.exit_code())
}

fn write_report(report: &BatchReport, path: &std::path::Path) -> miette::Result<()> {
    let bytes = JsonOutput::to_bytes(report).into_diagnostic()?;
    let path = camino::Utf8PathBuf::from_path_buf(path.to_path_buf())
        .map_err(|_| SitepackError::Filesystem("invalid report path".to_string()))?;
    Store::write_bytes_atomic(&path, &bytes)?;
    Ok(())
}

fn run_validate(args: ValidateArgs, output_mode: OutputMode) -> miette::Result<()> {
    let recipe = RecipeLoader::load(&args.recipe)?;
    let manifest = match &args.archive {
        Some(path) => Some(package::verify_archive(path)?),
        None => None,
    };
    if let Some(fragment_path) = &args.fragment {
        let fragment = metadata::load_fragment(fragment_path)?;
        metadata::validate(&fragment, &recipe, manifest.as_ref())?;
    } else if let Some(manifest) = &manifest {
        if manifest.site_id != recipe.site_id {
            return Err(SitepackError::InconsistentMetadata(format!(
                "package site id {} does not match recipe site id {}",
                manifest.site_id, recipe.site_id
            ))
            .into());
        }
    }

    let result = ValidationResult {
        recipe: args.recipe.display().to_string(),
        site_id: recipe.site_id.to_string(),
        coordinate: [recipe.coordinate.lat, recipe.coordinate.lon],
        fragment: args.fragment.as_ref().map(|path| path.display().to_string()),
        archive: args.archive.as_ref().map(|path| path.display().to_string()),
        consistent: true,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_validation(&result).into_diagnostic()?,
        OutputMode::Human => print_validation_summary(&result),
    }
    Ok(())
}
