//! One recipe, end to end: locate, subset, generate, assemble, package and
//! register. Every check that can fail on the inputs runs before anything is
//! written, and nothing leaves the scratch area until the final publish.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::MachineConfig;
use crate::domain::{DatasetCategory, SiteId};
use crate::error::SitepackError;
use crate::forcing::ForcingAssembler;
use crate::locator::{DatasetLocator, ResolvedDataset, SourceFetcher};
use crate::metadata::{self, SiteMetadataFragment};
use crate::netcdf::NetcdfToolkit;
use crate::package::{ArtifactKind, GeneratedArtifact, Manifest, PackageBuilder, StagedPackage};
use crate::recipe::SiteRecipe;
use crate::store::Store;
use crate::subset::{SpatialSubsetter, SubsetWindow};
use crate::tools::{DOMAIN_TOOL, DomainArtifact, SURFACE_TOOL, SurfaceRequest, ToolOrchestrator};

pub const DEFAULT_OUTPUT_DIR: &str = "output";
const PARAMETER_DIR: &str = "lnd/clm2/paramdata";
const SCRIP_DIR: &str = "share/scripgrids";
const MAPPING_DIR: &str = "lnd/clm2/mappingdata/maps";
const SHARED_SOURCE: &str = "shared";
/// Surface height variable of the topography forcing file.
pub const TOPOGRAPHY_VARIABLE: &str = "TOPO";

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Reports progress through `tracing`.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn event(&self, _event: ProgressEvent) {}
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, pinned by `SOURCE_DATE_EPOCH` when that is set.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        std::env::var("SOURCE_DATE_EPOCH")
            .ok()
            .and_then(|value| value.trim().parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteOutcome {
    pub site_id: SiteId,
    pub archive: PathBuf,
    pub metadata_dir: PathBuf,
    pub manifest: Manifest,
    #[serde(skip)]
    pub fragment: SiteMetadataFragment,
}

pub struct Pipeline<T: NetcdfToolkit, F: SourceFetcher> {
    machine: MachineConfig,
    toolkit: T,
    fetcher: F,
    clock: Box<dyn Clock>,
    output_override: Option<PathBuf>,
}

impl<T: NetcdfToolkit, F: SourceFetcher> Pipeline<T, F> {
    pub fn new(machine: MachineConfig, toolkit: T, fetcher: F) -> Self {
        Self {
            machine,
            toolkit,
            fetcher,
            clock: Box::new(SystemClock),
            output_override: None,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Output directory used for every recipe, overriding the recipe's own.
    pub fn with_output(mut self, output: Option<PathBuf>) -> Self {
        self.output_override = output;
        self
    }

    pub fn output_root(&self, recipe: &SiteRecipe) -> PathBuf {
        self.output_override
            .clone()
            .or_else(|| recipe.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }

    pub fn run(
        &self,
        recipe: &SiteRecipe,
        sink: &dyn ProgressSink,
    ) -> Result<SiteOutcome, SitepackError> {
        let started = Instant::now();
        let site = &recipe.site_id;
        let phase = |name: &str, detail: String| {
            sink.event(ProgressEvent {
                message: format!("phase={name}; site={site}; {detail}"),
                elapsed: Some(started.elapsed()),
            });
        };
        let tolerance = self.machine.mesh_tolerance_km;

        check_required_categories(recipe)?;
        check_local_files(recipe)?;

        phase("Locate", format!("{} sources", recipe.sources.len()));
        let locator = DatasetLocator::new(&self.toolkit, &self.fetcher, &self.machine.download_dir);
        let datasets = locator.locate(recipe)?;

        phase("Subset", "computing cell windows".to_string());
        let subsetter = SpatialSubsetter::new(&self.toolkit, tolerance);
        let mut windows = Vec::new();
        for dataset in datasets.iter().filter(|d| d.category != DatasetCategory::Atmosphere) {
            windows.push((dataset, subsetter.window(dataset, recipe.coordinate)?));
        }
        let atmosphere = find(&datasets, DatasetCategory::Atmosphere)?;
        let assembler = ForcingAssembler::new(&self.toolkit, tolerance);
        let forcing_plan = assembler.plan(recipe, &atmosphere.path)?;

        let orchestrator =
            ToolOrchestrator::new(&self.machine.domain_generator, &self.machine.surface_generator);
        orchestrator.ensure_installed()?;

        let store = Store::new(&self.output_root(recipe))?;
        let scratch = store.scratch(site, self.machine.keep_scratch)?;
        let work = scratch.path();
        let inputdata = work.join("inputdata");
        let mut package = PackageBuilder::new(
            site.clone(),
            recipe.version.clone(),
            recipe.coordinate,
            recipe.profile,
        );
        package.record_sources(&datasets);

        phase("Extract", format!("{} gridded sources", windows.len()));
        let mut surface_subset = None;
        for (dataset, window) in &windows {
            if dataset.category == DatasetCategory::Surface {
                let output = work.join("subset").join(format!("surface_{site}.nc"));
                subsetter.extract(&dataset.path, window, &output)?;
                surface_subset = Some(output);
                continue;
            }
            package.add(self.extract_ancillary(&subsetter, dataset, window, recipe, &inputdata)?);
        }
        let surface_subset = surface_subset.ok_or_else(|| SitepackError::DatasetNotFound {
            category: DatasetCategory::Surface.to_string(),
            location: recipe.origin.clone(),
        })?;

        phase("Generate", "domain and surface data".to_string());
        let tool_dir = work.join("tools");
        std::fs::create_dir_all(&tool_dir)
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        let (domain, domain_producer) = match &recipe.shared.domain {
            Some(path) => {
                info!(path = %path.display(), "using prebuilt domain");
                (DomainArtifact::prebuilt(path, site), SHARED_SOURCE)
            }
            None => (
                orchestrator.generate_domain(site, recipe.coordinate, &tool_dir)?,
                DOMAIN_TOOL,
            ),
        };
        let surface_source = find(&datasets, DatasetCategory::Surface)?;
        let raw_dir = surface_source
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let surface = orchestrator.generate_surface(
            &domain,
            recipe.coordinate,
            &SurfaceRequest {
                source: &surface_subset,
                raw_dir: &raw_dir,
                overrides: &recipe.overrides,
                scrip: recipe.shared.scrip.as_deref(),
                mapping: recipe.shared.mapping.as_deref(),
            },
            &tool_dir,
        )?;
        let grid = site.grid_name();
        package.add(stage(
            domain.path(),
            &inputdata,
            format!("share/domains/{grid}/domain.lnd.{grid}.nc"),
            ArtifactKind::Domain,
            domain_producer,
        )?);
        package.add(stage(
            &surface.path,
            &inputdata,
            format!(
                "{}/{grid}/surfdata_{grid}.nc",
                DatasetCategory::Surface.package_dir()
            ),
            ArtifactKind::Surface,
            SURFACE_TOOL,
        )?);

        if let Some(scrip) = &recipe.shared.scrip {
            package.add(stage(
                scrip,
                &inputdata,
                format!("{SCRIP_DIR}/{grid}/{}", file_name(scrip)),
                ArtifactKind::Scrip,
                SHARED_SOURCE,
            )?);
        }
        if let Some(mapping) = &recipe.shared.mapping {
            package.add(stage(
                mapping,
                &inputdata,
                format!("{MAPPING_DIR}/{grid}/{}", file_name(mapping)),
                ArtifactKind::Mapping,
                SHARED_SOURCE,
            )?);
        }

        for parameter in &recipe.parameter_files {
            package.add(stage(
                parameter,
                &inputdata,
                format!("{PARAMETER_DIR}/{}", file_name(parameter)),
                ArtifactKind::Parameter,
                "copy",
            )?);
        }

        phase("Forcing", format!("{}-{}", recipe.start_year, recipe.end_year));
        let streams = assembler.assemble(&forcing_plan, recipe, work)?;
        for stream in &streams {
            package.add(GeneratedArtifact {
                kind: ArtifactKind::Forcing,
                category: Some(DatasetCategory::Atmosphere),
                group: Some(stream.group),
                relative_path: stream.relative_path.clone(),
                path: stream.path.clone(),
                produced_by: "forcing-assembler".to_string(),
            });
        }

        phase("Package", Store::archive_name(site, &recipe.version));
        let staged = package.build(&store, work, self.clock.now())?;

        phase("Metadata", "building site fragment".to_string());
        let fragment = metadata::build_fragment(
            recipe,
            &staged.manifest,
            &streams,
            self.machine.publication_base_url.as_deref(),
        )?;
        metadata::validate(&fragment, recipe, Some(&staged.manifest))?;
        let staged_metadata = work.join("site_metadata");
        metadata::write_fragment(&fragment, &staged_metadata)?;

        phase("Publish", "moving outputs into place".to_string());
        let manifest = staged.manifest.clone();
        let metadata_dir = store.metadata_dir(site);
        let archive = publish(staged, &staged_metadata, &metadata_dir, work)?;

        info!(
            site = %site,
            archive = %archive.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "site package complete"
        );
        Ok(SiteOutcome {
            site_id: site.clone(),
            archive,
            metadata_dir: metadata_dir.into_std_path_buf(),
            manifest,
            fragment,
        })
    }

    fn extract_ancillary(
        &self,
        subsetter: &SpatialSubsetter<'_>,
        dataset: &ResolvedDataset,
        window: &SubsetWindow,
        recipe: &SiteRecipe,
        inputdata: &Path,
    ) -> Result<GeneratedArtifact, SitepackError> {
        let relative_path = format!(
            "{}/{}_{}.nc",
            dataset.category.package_dir(),
            dataset.source_stem(),
            recipe.site_id
        );
        let path = inputdata.join(&relative_path);
        subsetter.extract(&dataset.path, window, &path)?;
        if let (DatasetCategory::Topography, Some(elevation)) = (dataset.category, recipe.elevation) {
            // the site's own elevation replaces the grid-cell mean
            self.toolkit
                .fill_variable(&path, TOPOGRAPHY_VARIABLE, elevation)?;
            self.toolkit
                .annotate(&path, &[("site_elevation".to_string(), elevation.to_string())])?;
        }
        Ok(GeneratedArtifact {
            kind: ArtifactKind::Ancillary,
            category: Some(dataset.category),
            group: None,
            relative_path,
            path,
            produced_by: "subsetter".to_string(),
        })
    }
}

fn find(
    datasets: &[ResolvedDataset],
    category: DatasetCategory,
) -> Result<&ResolvedDataset, SitepackError> {
    datasets
        .iter()
        .find(|dataset| dataset.category == category)
        .ok_or_else(|| SitepackError::DatasetNotFound {
            category: category.to_string(),
            location: "recipe".to_string(),
        })
}

/// Recipes built in code bypass the loader's profile check.
fn check_required_categories(recipe: &SiteRecipe) -> Result<(), SitepackError> {
    let missing: Vec<String> = recipe
        .profile
        .required_categories()
        .iter()
        .filter(|category| !recipe.sources.contains_key(*category))
        .map(ToString::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SitepackError::IncompletePackage { missing })
    }
}

fn check_local_files(recipe: &SiteRecipe) -> Result<(), SitepackError> {
    let parameters = recipe
        .parameter_files
        .iter()
        .map(|path| ("parameter_files", path.as_path()));
    for (category, path) in parameters.chain(recipe.shared.entries()) {
        if !path.is_file() {
            return Err(SitepackError::DatasetNotFound {
                category: category.to_string(),
                location: path.display().to_string(),
            });
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Publishes the metadata, then the archive. If the archive cannot be moved
/// into place the new metadata is removed and any earlier metadata restored,
/// so the fragment never points at an archive that is not there.
fn publish(
    staged: StagedPackage,
    staged_metadata: &Path,
    metadata_dir: &Utf8Path,
    work: &Path,
) -> Result<PathBuf, SitepackError> {
    let previous = work.join("previous_metadata");
    let had_previous = metadata_dir.as_std_path().is_dir();
    if had_previous {
        fs::rename(metadata_dir.as_std_path(), &previous)
            .map_err(|err| SitepackError::Filesystem(format!("set aside {metadata_dir}: {err}")))?;
    }
    let restore = || {
        if had_previous {
            if let Err(err) = fs::rename(&previous, metadata_dir.as_std_path()) {
                warn!(dir = %metadata_dir, error = %err, "could not restore previous metadata");
            }
        }
    };

    if let Err(err) = Store::publish_dir(staged_metadata, metadata_dir) {
        restore();
        return Err(err);
    }
    match staged.publish() {
        Ok(archive) => Ok(archive),
        Err(err) => {
            if let Err(remove) = fs::remove_dir_all(metadata_dir.as_std_path()) {
                warn!(dir = %metadata_dir, error = %remove, "could not remove unpublished metadata");
            }
            restore();
            Err(err)
        }
    }
}

fn stage(
    source: &Path,
    inputdata: &Path,
    relative_path: String,
    kind: ArtifactKind,
    produced_by: &str,
) -> Result<GeneratedArtifact, SitepackError> {
    let path = inputdata.join(&relative_path);
    Store::copy_file(source, &path)?;
    Ok(GeneratedArtifact {
        kind,
        category: match kind {
            ArtifactKind::Surface => Some(DatasetCategory::Surface),
            _ => None,
        },
        group: None,
        relative_path,
        path,
        produced_by: produced_by.to_string(),
    })
}
