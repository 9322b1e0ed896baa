//! NetCDF access through the NCO/netCDF command line utilities.
//!
//! Headers and coordinate values come either from `ncdump` CDL output or,
//! with the `native-netcdf` feature, straight from libnetcdf. Cell
//! extraction, record concatenation and variable edits are delegated to
//! `ncks`, `ncrcat`, `ncap2` and `ncatted`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::SitepackError;
use crate::grid::{DimensionRange, GridDescriptor, GridLayout, TimeAxis};
use crate::process::{self, Invocation};

#[cfg(feature = "native-netcdf")]
mod native;

/// Coordinate variable pairs recognised on source grids, in lookup order.
const COORDINATE_PAIRS: [(&str, &str); 5] = [
    ("lat", "lon"),
    ("latitude", "longitude"),
    ("LATIXY", "LONGXY"),
    ("yc", "xc"),
    ("nav_lat", "nav_lon"),
];

const NUMERIC_TYPES: [&str; 13] = [
    "byte", "ubyte", "char", "short", "ushort", "int", "uint", "long", "int64", "uint64", "float",
    "real", "double",
];

pub trait NetcdfToolkit {
    /// Reads the grid layout, calendar and time axis of a file.
    fn describe(&self, path: &Path) -> Result<GridDescriptor, SitepackError>;

    /// Writes the hyperslab of `source` selected by `ranges` to `output`.
    fn extract(
        &self,
        source: &Path,
        ranges: &[DimensionRange],
        output: &Path,
    ) -> Result<(), SitepackError>;

    /// Concatenates files along their record (time) dimension.
    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<(), SitepackError>;

    /// Sets global text attributes in place.
    fn annotate(&self, path: &Path, attributes: &[(String, String)]) -> Result<(), SitepackError>;

    /// Overwrites every value of `variable` with `value`, in place.
    fn fill_variable(&self, path: &Path, variable: &str, value: f64) -> Result<(), SitepackError>;
}

/// Where file headers and coordinate values are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderReader {
    Ncdump,
    #[cfg(feature = "native-netcdf")]
    Native,
}

impl HeaderReader {
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "ncdump" => Ok(HeaderReader::Ncdump),
            #[cfg(feature = "native-netcdf")]
            "native" => Ok(HeaderReader::Native),
            #[cfg(not(feature = "native-netcdf"))]
            "native" => Err("reader `native` needs the native-netcdf feature".to_string()),
            other => Err(format!("unknown header reader `{other}`")),
        }
    }
}

impl Default for HeaderReader {
    fn default() -> Self {
        #[cfg(feature = "native-netcdf")]
        {
            HeaderReader::Native
        }
        #[cfg(not(feature = "native-netcdf"))]
        {
            HeaderReader::Ncdump
        }
    }
}

#[derive(Debug, Clone)]
pub struct NcoToolkit {
    bin_dir: Option<PathBuf>,
    timeout: Duration,
    reader: HeaderReader,
}

impl NcoToolkit {
    pub fn new(bin_dir: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin_dir,
            timeout,
            reader: HeaderReader::default(),
        }
    }

    pub fn with_reader(mut self, reader: HeaderReader) -> Self {
        self.reader = reader;
        self
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    fn run(&self, name: &str, args: Vec<String>) -> Result<String, SitepackError> {
        let invocation = Invocation::new(name, self.program(name), args).with_timeout(self.timeout);
        Ok(process::run(&invocation)?.stdout)
    }

    fn dump(&self, path: &Path, args: &[&str]) -> Result<FileSummary, SitepackError> {
        let mut full: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        full.push(path.display().to_string());
        let text = self.run("ncdump", full)?;
        Ok(FileSummary::from_cdl(&text))
    }

    /// Header plus the values of the coordinate, bounds and time variables.
    pub fn summarize(&self, path: &Path) -> Result<FileSummary, SitepackError> {
        match self.reader {
            HeaderReader::Ncdump => {
                let mut summary = self.dump(path, &["-h"])?;
                if let Some((lat, lon)) = summary.coordinate_pair() {
                    let wanted = summary.wanted_variables(&lat, &lon).join(",");
                    summary.data = self.dump(path, &["-v", &wanted])?.data;
                }
                Ok(summary)
            }
            #[cfg(feature = "native-netcdf")]
            HeaderReader::Native => native::summarize(path),
        }
    }
}

impl NetcdfToolkit for NcoToolkit {
    fn describe(&self, path: &Path) -> Result<GridDescriptor, SitepackError> {
        let summary = self.summarize(path)?;
        let (lat_name, lon_name) = summary.coordinate_pair().ok_or_else(|| {
            SitepackError::Netcdf(format!("{}: no latitude/longitude variables", path.display()))
        })?;
        debug!(
            path = %path.display(),
            lat = %lat_name,
            lon = %lon_name,
            reader = ?self.reader,
            "read coordinates"
        );
        summary
            .descriptor(&lat_name, &lon_name)
            .map_err(|err| SitepackError::Netcdf(format!("{}: {err}", path.display())))
    }

    fn extract(
        &self,
        source: &Path,
        ranges: &[DimensionRange],
        output: &Path,
    ) -> Result<(), SitepackError> {
        let mut args = vec!["-O".to_string()];
        for range in ranges {
            args.push("-d".to_string());
            args.push(format!("{},{},{}", range.dim, range.start, range.end));
        }
        args.push(source.display().to_string());
        args.push(output.display().to_string());
        self.run("ncks", args).map(|_| ())
    }

    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<(), SitepackError> {
        let mut args = vec!["-O".to_string()];
        args.extend(inputs.iter().map(|path| path.display().to_string()));
        args.push(output.display().to_string());
        self.run("ncrcat", args).map(|_| ())
    }

    fn annotate(&self, path: &Path, attributes: &[(String, String)]) -> Result<(), SitepackError> {
        let mut args = vec!["-O".to_string(), "-h".to_string()];
        for (name, value) in attributes {
            args.push("-a".to_string());
            args.push(format!("{name},global,o,c,{value}"));
        }
        args.push(path.display().to_string());
        self.run("ncatted", args).map(|_| ())
    }

    fn fill_variable(&self, path: &Path, variable: &str, value: f64) -> Result<(), SitepackError> {
        let file = path.display().to_string();
        let args = vec![
            "-O".to_string(),
            "-s".to_string(),
            format!("{variable}={variable}*0+{value:?}"),
            file.clone(),
            file,
        ];
        self.run("ncap2", args).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSummary {
    pub name: String,
    pub dims: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Dimensions, declarations and attributes of one file, plus the values of
/// whichever variables were read.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileSummary {
    pub dimensions: BTreeMap<String, usize>,
    pub variables: Vec<VariableSummary>,
    pub global_attributes: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<f64>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Dimensions,
    Variables,
    Data,
}

impl FileSummary {
    /// Parses the subset of CDL that `ncdump` prints for headers and numeric data.
    pub fn from_cdl(text: &str) -> Self {
        let mut doc = FileSummary::default();
        let mut section = Section::Preamble;
        let mut pending = String::new();

        for raw in text.lines() {
            let line = strip_comment(raw).trim();
            match line {
                "dimensions:" => {
                    section = Section::Dimensions;
                    continue;
                }
                "variables:" => {
                    section = Section::Variables;
                    continue;
                }
                "data:" => {
                    section = Section::Data;
                    continue;
                }
                "" | "}" => continue,
                _ => {}
            }
            match section {
                Section::Preamble => {}
                Section::Dimensions => doc.parse_dimension(line),
                Section::Variables => doc.parse_declaration(line),
                Section::Data => {
                    pending.push_str(line);
                    pending.push(' ');
                    if line.ends_with(';') {
                        doc.parse_data(&pending);
                        pending.clear();
                    }
                }
            }
        }
        doc
    }

    fn parse_dimension(&mut self, line: &str) {
        let Some((name, value)) = line.trim_end_matches(';').split_once('=') else {
            return;
        };
        let value = value.trim();
        let size = if value.starts_with("UNLIMITED") {
            // "UNLIMITED ; // (248 currently)" loses its count to the comment strip
            0
        } else {
            value.parse().unwrap_or(0)
        };
        self.dimensions.insert(name.trim().to_string(), size);
    }

    fn parse_declaration(&mut self, line: &str) {
        let body = line.trim_end_matches(';').trim();
        if let Some((target, value)) = body.split_once('=') {
            let Some((var, attr)) = target.trim().split_once(':') else {
                return;
            };
            let value = unquote(value.trim());
            if var.is_empty() {
                self.global_attributes.insert(attr.to_string(), value);
            } else if let Some(variable) = self.variables.iter_mut().find(|v| v.name == var) {
                variable.attributes.insert(attr.to_string(), value);
            }
            return;
        }
        let Some((kind, rest)) = body.split_once(char::is_whitespace) else {
            return;
        };
        if !NUMERIC_TYPES.contains(&kind) && kind != "string" {
            return;
        }
        let rest = rest.trim();
        let (name, dims) = match rest.split_once('(') {
            Some((name, dims)) => (
                name.trim(),
                dims.trim_end_matches(')')
                    .split(',')
                    .map(|dim| dim.trim().to_string())
                    .filter(|dim| !dim.is_empty())
                    .collect(),
            ),
            None => (rest, Vec::new()),
        };
        self.variables.push(VariableSummary {
            name: name.to_string(),
            dims,
            attributes: BTreeMap::new(),
        });
    }

    fn parse_data(&mut self, statement: &str) {
        let Some((name, values)) = statement.trim().trim_end_matches(';').split_once('=') else {
            return;
        };
        if values.contains('"') {
            return;
        }
        let parsed = values
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(parse_number)
            .collect();
        self.data.insert(name.trim().to_string(), parsed);
    }

    pub fn variable(&self, name: &str) -> Option<&VariableSummary> {
        self.variables.iter().find(|variable| variable.name == name)
    }

    pub fn coordinate_pair(&self) -> Option<(String, String)> {
        COORDINATE_PAIRS
            .iter()
            .find(|(lat, lon)| self.variable(lat).is_some() && self.variable(lon).is_some())
            .map(|(lat, lon)| (lat.to_string(), lon.to_string()))
    }

    pub fn time_variable(&self) -> Option<&VariableSummary> {
        self.variable("time").filter(|variable| variable.dims.len() == 1)
    }

    /// Cell-edge variable of a coordinate: its `bounds` attribute, or the
    /// conventional `<name>_bnds` when declared.
    pub fn bounds_variable(&self, coordinate: &str) -> Option<&VariableSummary> {
        let declared = self
            .variable(coordinate)?
            .attributes
            .get("bounds")
            .and_then(|name| self.variable(name));
        declared.or_else(|| {
            [format!("{coordinate}_bnds"), format!("{coordinate}_bounds")]
                .iter()
                .find_map(|name| self.variable(name))
        })
    }

    /// Variables whose values `descriptor` needs.
    pub fn wanted_variables(&self, lat_name: &str, lon_name: &str) -> Vec<String> {
        let mut wanted = vec![lat_name.to_string(), lon_name.to_string()];
        for coordinate in [lat_name, lon_name] {
            if let Some(bounds) = self.bounds_variable(coordinate) {
                wanted.push(bounds.name.clone());
            }
        }
        if let Some(time) = self.time_variable() {
            wanted.push(time.name.clone());
        }
        wanted
    }

    fn outer_bounds(&self, coordinate: &str) -> Option<[f64; 2]> {
        let values = self.data.get(&self.bounds_variable(coordinate)?.name)?;
        let (min, max) = values
            .iter()
            .filter(|value| value.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
                (min.min(*value), max.max(*value))
            });
        (min < max).then_some([min, max])
    }

    /// Derives the grid layout from the dimensions of the coordinate variables.
    pub fn descriptor(&self, lat_name: &str, lon_name: &str) -> Result<GridDescriptor, String> {
        let lat_var = self
            .variable(lat_name)
            .ok_or_else(|| format!("variable {lat_name} not declared"))?;
        let lon_var = self
            .variable(lon_name)
            .ok_or_else(|| format!("variable {lon_name} not declared"))?;
        let lat = self
            .data
            .get(lat_name)
            .cloned()
            .ok_or_else(|| format!("no values for {lat_name}"))?;
        let lon = self
            .data
            .get(lon_name)
            .cloned()
            .ok_or_else(|| format!("no values for {lon_name}"))?;

        let layout = match (lat_var.dims.as_slice(), lon_var.dims.as_slice()) {
            ([lat_dim], [lon_dim]) if lat_dim != lon_dim => GridLayout::Regular {
                lat_dim: lat_dim.clone(),
                lon_dim: lon_dim.clone(),
                lat,
                lon,
                lat_bounds: self.outer_bounds(lat_name),
                lon_bounds: self.outer_bounds(lon_name),
            },
            ([cell], [other]) if cell == other => GridLayout::Unstructured {
                cell_dim: cell.clone(),
                lat,
                lon,
            },
            ([row, col], [row2, col2]) if row == row2 && col == col2 => {
                let ncols = match self.dimensions.get(col).copied() {
                    Some(n) if n > 0 => n,
                    _ => return Err(format!("dimension {col} has no size")),
                };
                GridLayout::Curvilinear {
                    row_dim: row.clone(),
                    col_dim: col.clone(),
                    ncols,
                    lat,
                    lon,
                }
            }
            (lat_dims, lon_dims) => {
                return Err(format!(
                    "unsupported coordinate shapes {lat_name}{lat_dims:?} / {lon_name}{lon_dims:?}"
                ));
            }
        };

        let time_var = self.time_variable();
        let time = time_var.and_then(|variable| {
            self.data.get(&variable.name).map(|values| TimeAxis {
                units: variable.attributes.get("units").cloned(),
                values: values.clone(),
            })
        });
        Ok(GridDescriptor {
            layout,
            calendar: time_var.and_then(|variable| variable.attributes.get("calendar").cloned()),
            time,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut previous = '\0';
    for (index, ch) in line.char_indices() {
        match ch {
            '"' if previous != '\\' => in_string = !in_string,
            '/' if !in_string && previous == '/' => return &line[..index - 1],
            _ => {}
        }
        previous = ch;
    }
    line
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Parses one CDL number; `_` (fill) and unreadable values become NaN.
fn parse_number(value: &str) -> f64 {
    if value == "_" {
        return f64::NAN;
    }
    value
        .parse()
        .or_else(|_| {
            value
                .trim_end_matches(['f', 'F', 's', 'S', 'b', 'B', 'l', 'L', 'u', 'U'])
                .parse()
        })
        .unwrap_or(f64::NAN)
}
