#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use lsp_sitepack::config::{MachineConfig, NcoSettings, ToolSpec, default_domain_args, default_surface_args};
use lsp_sitepack::error::SitepackError;
use lsp_sitepack::grid::{DimensionRange, GridDescriptor, GridLayout, TimeAxis};
use lsp_sitepack::locator::SourceFetcher;
use lsp_sitepack::netcdf::{HeaderReader, NetcdfToolkit};
use lsp_sitepack::pipeline::{FixedClock, Pipeline};

pub type Annotations = Rc<RefCell<Vec<(PathBuf, Vec<(String, String)>)>>>;
pub type Fills = Rc<RefCell<Vec<(PathBuf, String, f64)>>>;

/// Stands in for the NCO utilities. "NetCDF" files are JSON grid descriptors;
/// extraction slices the coordinate axes and concatenation joins time values.
#[derive(Default, Clone)]
pub struct FakeToolkit {
    pub annotations: Annotations,
    pub fills: Fills,
}

fn read_descriptor(path: &Path) -> Result<GridDescriptor, SitepackError> {
    let content = fs::read_to_string(path)
        .map_err(|err| SitepackError::Netcdf(format!("{}: {err}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|err| SitepackError::Netcdf(format!("{}: {err}", path.display())))
}

fn write_descriptor(path: &Path, descriptor: &GridDescriptor) -> Result<(), SitepackError> {
    let content = serde_json::to_vec_pretty(descriptor)
        .map_err(|err| SitepackError::Netcdf(err.to_string()))?;
    fs::write(path, content).map_err(|err| SitepackError::Filesystem(err.to_string()))
}

fn span(ranges: &[DimensionRange], dim: &str, len: usize) -> std::ops::RangeInclusive<usize> {
    match ranges.iter().find(|range| range.dim == dim) {
        Some(range) => range.start..=range.end,
        None => 0..=len - 1,
    }
}

fn slice(values: &[f64], ranges: &[DimensionRange], dim: &str) -> Vec<f64> {
    values[span(ranges, dim, values.len())].to_vec()
}

/// Row-major 2-D slice; returns the values and the new column count.
fn slice_2d(
    values: &[f64],
    ncols: usize,
    rows: std::ops::RangeInclusive<usize>,
    cols: std::ops::RangeInclusive<usize>,
) -> Vec<f64> {
    rows.flat_map(|row| cols.clone().map(move |col| values[row * ncols + col]))
        .collect()
}

impl NetcdfToolkit for FakeToolkit {
    fn describe(&self, path: &Path) -> Result<GridDescriptor, SitepackError> {
        read_descriptor(path)
    }

    fn extract(
        &self,
        source: &Path,
        ranges: &[DimensionRange],
        output: &Path,
    ) -> Result<(), SitepackError> {
        let mut descriptor = read_descriptor(source)?;
        match &mut descriptor.layout {
            GridLayout::Regular {
                lat_dim,
                lon_dim,
                lat,
                lon,
                ..
            } => {
                *lat = slice(lat, ranges, lat_dim);
                *lon = slice(lon, ranges, lon_dim);
            }
            GridLayout::Curvilinear {
                row_dim,
                col_dim,
                ncols,
                lat,
                lon,
            } => {
                let nrows = lat.len() / *ncols;
                let rows = span(ranges, row_dim, nrows);
                let cols = span(ranges, col_dim, *ncols);
                *lat = slice_2d(lat, *ncols, rows.clone(), cols.clone());
                *lon = slice_2d(lon, *ncols, rows, cols.clone());
                *ncols = cols.count();
            }
            GridLayout::Unstructured { cell_dim, lat, lon } => {
                *lat = slice(lat, ranges, cell_dim);
                *lon = slice(lon, ranges, cell_dim);
            }
        }
        write_descriptor(output, &descriptor)
    }

    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<(), SitepackError> {
        let first = inputs
            .first()
            .ok_or_else(|| SitepackError::Netcdf("nothing to concatenate".to_string()))?;
        let mut merged = read_descriptor(first)?;
        let units = merged.time.as_ref().and_then(|time| time.units.clone());
        let mut values = Vec::new();
        for input in inputs {
            if let Some(time) = read_descriptor(input)?.time {
                values.extend(time.values);
            }
        }
        merged.time = Some(TimeAxis { units, values });
        write_descriptor(output, &merged)
    }

    fn annotate(&self, path: &Path, attributes: &[(String, String)]) -> Result<(), SitepackError> {
        if !path.is_file() {
            return Err(SitepackError::Netcdf(format!("{} does not exist", path.display())));
        }
        self.annotations
            .borrow_mut()
            .push((path.to_path_buf(), attributes.to_vec()));
        Ok(())
    }

    fn fill_variable(&self, path: &Path, variable: &str, value: f64) -> Result<(), SitepackError> {
        if !path.is_file() {
            return Err(SitepackError::Netcdf(format!("{} does not exist", path.display())));
        }
        self.fills
            .borrow_mut()
            .push((path.to_path_buf(), variable.to_string(), value));
        Ok(())
    }
}

/// Serves downloads from a local directory, keyed by the URL's last segment.
pub struct DirFetcher {
    pub root: PathBuf,
}

impl SourceFetcher for DirFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), SitepackError> {
        let name = url.rsplit('/').next().unwrap_or(url);
        let source = self.root.join(name);
        if !source.is_file() {
            return Err(SitepackError::DownloadStatus {
                status: 404,
                message: url.to_string(),
            });
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        }
        fs::copy(&source, destination).map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

pub const TIME_UNITS: &str = "days since 1991-01-01 00:00:00";
const NOLEAP_MONTHS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// First and last three-hourly record of a month on the noleap calendar,
/// in days since 1991.
pub fn month_values(year: i32, month: u32) -> Vec<f64> {
    let before: u32 = NOLEAP_MONTHS[..month as usize - 1].iter().sum();
    let start = f64::from((year - 1991) * 365) + f64::from(before);
    vec![start, start + f64::from(NOLEAP_MONTHS[month as usize - 1]) - 0.125]
}

pub fn regular_layout() -> GridLayout {
    GridLayout::Regular {
        lat_dim: "lat".to_string(),
        lon_dim: "lon".to_string(),
        lat: vec![59.75, 60.25],
        lon: vec![10.75, 11.25],
        lat_bounds: None,
        lon_bounds: None,
    }
}

pub fn grid_on(layout: &GridLayout, time: Option<Vec<f64>>) -> GridDescriptor {
    GridDescriptor {
        layout: layout.clone(),
        calendar: Some("noleap".to_string()),
        time: time.map(|values| TimeAxis {
            units: Some(TIME_UNITS.to_string()),
            values,
        }),
    }
}

pub fn regular_grid(time: Option<Vec<f64>>) -> GridDescriptor {
    grid_on(&regular_layout(), time)
}

pub fn write_grid(path: &Path, descriptor: &GridDescriptor) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_vec_pretty(descriptor).unwrap()).unwrap();
}

pub const STREAM_DIRS: [(&str, &str); 3] = [("solar", "Solar"), ("precip", "Precip"), ("tpqw", "TPQW")];

/// A scratch workspace holding source data, generator scripts and recipes.
pub struct Workspace {
    pub temp: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root().join("data")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root().join("output")
    }

    /// Writes twelve monthly files per group for each year, each holding
    /// the first and last record of its month.
    pub fn write_forcing(&self, start_year: i32, end_year: i32) {
        self.write_forcing_on(start_year, end_year, &regular_layout());
    }

    pub fn write_forcing_on(&self, start_year: i32, end_year: i32, layout: &GridLayout) {
        for (_, dir) in STREAM_DIRS {
            for year in start_year..=end_year {
                for month in 1..=12u32 {
                    write_grid(
                        &self.forcing_file(dir, year, month),
                        &grid_on(layout, Some(month_values(year, month))),
                    );
                }
            }
        }
    }

    pub fn forcing_file(&self, group_dir: &str, year: i32, month: u32) -> PathBuf {
        self.data_dir()
            .join("atm")
            .join(group_dir)
            .join(format!("{year:04}-{month:02}.nc"))
    }

    pub fn write_surface(&self) -> PathBuf {
        self.write_surface_on(&regular_layout())
    }

    pub fn write_surface_on(&self, layout: &GridLayout) -> PathBuf {
        let path = self.data_dir().join("surface").join("surfdata_0.5x0.5.nc");
        write_grid(&path, &grid_on(layout, None));
        path
    }

    /// A time-invariant gridded file under `data/ancillary`.
    pub fn write_ancillary(&self, file_name: &str) -> PathBuf {
        let path = self.data_dir().join("ancillary").join(file_name);
        write_grid(&path, &regular_grid(None));
        path
    }

    pub fn write_recipe(&self, file_name: &str, site: &str, lat: f64, lon: f64, years: (i32, i32)) -> PathBuf {
        self.write_recipe_with(file_name, site, lat, lon, years, "")
    }

    /// Like `write_recipe`; `extra` is appended verbatim and may carry
    /// top-level keys or further `datasets` entries indented by two spaces.
    pub fn write_recipe_with(
        &self,
        file_name: &str,
        site: &str,
        lat: f64,
        lon: f64,
        years: (i32, i32),
        extra: &str,
    ) -> PathBuf {
        let recipes = self.root().join("recipes");
        fs::create_dir_all(&recipes).unwrap();
        let mut streams = String::new();
        for (key, dir) in STREAM_DIRS {
            streams.push_str(&format!("      {key}: \"{dir}/{{year}}-{{month}}.nc\"\n"));
        }
        let content = format!(
            "site_id: {site}\n\
             name: Site {site}\n\
             group: NorESM\n\
             coordinates:\n  lat: {lat}\n  lon: {lon}\n\
             elevation: 1210\n\
             start_year: {start}\n\
             end_year: {end}\n\
             version: 1.0.0\n\
             datasets:\n\
             \x20 atmosphere:\n\
             \x20   path: {atm}\n\
             \x20   source_tag: GSWP3\n\
             \x20   streams:\n{streams}\
             \x20 surface:\n\
             \x20   path: {surface}\n\
             {extra}",
            start = years.0,
            end = years.1,
            atm = self.data_dir().join("atm").display(),
            surface = self.data_dir().join("surface").join("surfdata_0.5x0.5.nc").display(),
        );
        let path = recipes.join(file_name);
        fs::write(&path, content).unwrap();
        path
    }

    /// Writes an executable script that creates whatever follows `--output`.
    /// The values of `--source` and `--domain` are in `$src` and `$dom`.
    #[cfg(unix)]
    pub fn write_generator(&self, name: &str, content: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = self.root().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        let script = format!(
            "#!/bin/sh\n\
             out=\"\"; src=\"\"; dom=\"\"\n\
             while [ $# -gt 0 ]; do\n\
             \x20 case \"$1\" in\n\
             \x20   --output) out=\"$2\" ;;\n\
             \x20   --source) src=\"$2\" ;;\n\
             \x20   --domain) dom=\"$2\" ;;\n\
             \x20 esac\n\
             \x20 shift\n\
             done\n\
             {content}\n"
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    pub fn machine(&self) -> MachineConfig {
        let domain = self.write_generator("gen_domain", "printf 'domain\\n' > \"$out\"");
        let surface = self.write_generator("mksurfdata", "printf 'surface\\n' > \"$out\"");
        machine_with(domain, surface, &self.root().join("cache"))
    }
}

pub fn machine_with(domain: PathBuf, surface: PathBuf, download_dir: &Path) -> MachineConfig {
    let tool = |program: PathBuf, args: Vec<String>| ToolSpec {
        program,
        args,
        env: BTreeMap::new(),
        timeout: Duration::from_secs(30),
    };
    MachineConfig {
        name: "test".to_string(),
        domain_generator: tool(domain, default_domain_args()),
        surface_generator: tool(surface, default_surface_args()),
        nco: NcoSettings {
            bin_dir: None,
            timeout: Duration::from_secs(30),
            reader: HeaderReader::default(),
        },
        download_dir: download_dir.to_path_buf(),
        mesh_tolerance_km: 100.0,
        keep_scratch: false,
        publication_base_url: Some("https://data.example.org/sites".to_string()),
    }
}

pub fn pipeline(machine: MachineConfig, fetcher_root: &Path) -> Pipeline<FakeToolkit, DirFetcher> {
    pipeline_with(machine, fetcher_root, FakeToolkit::default())
}

pub fn pipeline_with(
    machine: MachineConfig,
    fetcher_root: &Path,
    toolkit: FakeToolkit,
) -> Pipeline<FakeToolkit, DirFetcher> {
    Pipeline::new(
        machine,
        toolkit,
        DirFetcher {
            root: fetcher_root.to_path_buf(),
        },
    )
    .with_clock(Box::new(FixedClock(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    )))
}
