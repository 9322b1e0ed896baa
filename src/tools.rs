//! Domain and surface-data generators run as bounded external processes.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::ToolSpec;
use crate::domain::{Coordinate, SiteId, SurfaceOverrides};
use crate::error::{ToolFailure, ToolFailureKind};
use crate::process::{self, Invocation};

pub const DOMAIN_TOOL: &str = "domain-generator";
pub const SURFACE_TOOL: &str = "surface-generator";
const OVERRIDES_SPLICE: &str = "{overrides}";

/// Domain file for one site, either generated by
/// [`ToolOrchestrator::generate_domain`] or supplied prebuilt by the recipe.
/// Surface generation cannot start without one.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainArtifact {
    path: PathBuf,
    site_id: SiteId,
}

impl DomainArtifact {
    pub fn prebuilt(path: &Path, site_id: &SiteId) -> Self {
        Self {
            path: path.to_path_buf(),
            site_id: site_id.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceArtifact {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SurfaceRequest<'a> {
    pub source: &'a Path,
    pub raw_dir: &'a Path,
    pub overrides: &'a SurfaceOverrides,
    pub scrip: Option<&'a Path>,
    pub mapping: Option<&'a Path>,
}

#[derive(Debug, Clone)]
struct Programs {
    domain: PathBuf,
    surface: PathBuf,
}

pub struct ToolOrchestrator<'a> {
    domain: &'a ToolSpec,
    surface: &'a ToolSpec,
    programs: OnceCell<Programs>,
}

impl<'a> ToolOrchestrator<'a> {
    pub fn new(domain: &'a ToolSpec, surface: &'a ToolSpec) -> Self {
        Self {
            domain,
            surface,
            programs: OnceCell::new(),
        }
    }

    /// Verifies both generators are executable. Safe to call repeatedly; the
    /// lookup runs once per orchestrator.
    pub fn ensure_installed(&self) -> Result<(), ToolFailure> {
        self.programs().map(|_| ())
    }

    fn programs(&self) -> Result<&Programs, ToolFailure> {
        if let Some(programs) = self.programs.get() {
            return Ok(programs);
        }
        let domain = locate(DOMAIN_TOOL, self.domain)?;
        let surface = locate(SURFACE_TOOL, self.surface)?;
        info!(domain = %domain.display(), surface = %surface.display(), "generators available");
        Ok(self.programs.get_or_init(|| Programs { domain, surface }))
    }

    pub fn generate_domain(
        &self,
        site: &SiteId,
        coordinate: Coordinate,
        work_dir: &Path,
    ) -> Result<DomainArtifact, ToolFailure> {
        let programs = self.programs()?;
        let output = work_dir.join(format!("domain.lnd.{}.nc", site.grid_name()));
        let mut values = placeholders(site, coordinate, &output);
        values.insert("raw_dir", work_dir.display().to_string());
        let args = expand_args(&self.domain.args, &values, &[]);
        self.invoke(DOMAIN_TOOL, &programs.domain, self.domain, args, work_dir, &output)?;
        Ok(DomainArtifact {
            path: output,
            site_id: site.clone(),
        })
    }

    pub fn generate_surface(
        &self,
        domain: &DomainArtifact,
        coordinate: Coordinate,
        request: &SurfaceRequest<'_>,
        work_dir: &Path,
    ) -> Result<SurfaceArtifact, ToolFailure> {
        let programs = self.programs()?;
        let site = domain.site_id();
        let output = work_dir.join(format!("surfdata_{}.nc", site.grid_name()));
        let mut values = placeholders(site, coordinate, &output);
        values.insert("domain", domain.path().display().to_string());
        values.insert("source", request.source.display().to_string());
        values.insert("raw_dir", request.raw_dir.display().to_string());
        if let Some(scrip) = request.scrip {
            values.insert("scrip", scrip.display().to_string());
        }
        if let Some(mapping) = request.mapping {
            values.insert("mapping", mapping.display().to_string());
        }
        let args = expand_args(&self.surface.args, &values, &request.overrides.to_args());
        self.invoke(SURFACE_TOOL, &programs.surface, self.surface, args, work_dir, &output)?;
        Ok(SurfaceArtifact { path: output })
    }

    fn invoke(
        &self,
        tool: &str,
        program: &Path,
        spec: &ToolSpec,
        args: Vec<String>,
        work_dir: &Path,
        expected: &Path,
    ) -> Result<(), ToolFailure> {
        info!(tool, args = ?args, "running generator");
        let invocation = Invocation::new(tool, program, args)
            .with_env(&spec.env)
            .with_cwd(work_dir)
            .with_timeout(spec.timeout);
        let output = process::run(&invocation)?;
        if !expected.is_file() {
            let diagnostics = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(ToolFailure::new(
                tool,
                &invocation.args,
                ToolFailureKind::MissingOutput(expected.display().to_string()),
                diagnostics,
            ));
        }
        Ok(())
    }
}

fn locate(tool: &str, spec: &ToolSpec) -> Result<PathBuf, ToolFailure> {
    process::resolve_program(&spec.program).ok_or_else(|| {
        ToolFailure::new(
            tool,
            &[],
            ToolFailureKind::NotInstalled,
            format!("{} not found", spec.program.display()),
        )
    })
}

fn placeholders(site: &SiteId, coordinate: Coordinate, output: &Path) -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        ("site", site.to_string()),
        ("grid", site.grid_name()),
        ("lat", coordinate.lat.to_string()),
        ("lon", coordinate.lon.to_string()),
        ("output", output.display().to_string()),
    ])
}

/// Substitutes `{name}` placeholders in every argument. A bare `{overrides}`
/// argument expands to zero or more override flags.
pub fn expand_args(
    template: &[String],
    values: &BTreeMap<&str, String>,
    overrides: &[String],
) -> Vec<String> {
    let mut args = Vec::with_capacity(template.len());
    for arg in template {
        if arg == OVERRIDES_SPLICE {
            args.extend(overrides.iter().cloned());
            continue;
        }
        let mut expanded = arg.clone();
        for (name, value) in values {
            expanded = expanded.replace(&format!("{{{name}}}"), value);
        }
        args.push(expanded);
    }
    args
}
