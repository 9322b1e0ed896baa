//! Grid descriptors and nearest-cell lookup.
//!
//! Regular grids are searched per axis. Curvilinear and unstructured grids are
//! treated as point clouds and searched by great-circle distance. Ties always
//! resolve to the lower index so repeated runs select the same cell.

use serde::{Deserialize, Serialize};

use crate::domain::Coordinate;

const EARTH_RADIUS_KM: f64 = 6371.0;
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridDescriptor {
    pub layout: GridLayout,
    #[serde(default)]
    pub calendar: Option<String>,
    #[serde(default)]
    pub time: Option<TimeAxis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridLayout {
    Regular {
        lat_dim: String,
        lon_dim: String,
        lat: Vec<f64>,
        lon: Vec<f64>,
        /// Outer cell edges from the coordinate's bounds variable, as (min, max).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lat_bounds: Option<[f64; 2]>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lon_bounds: Option<[f64; 2]>,
    },
    Curvilinear {
        row_dim: String,
        col_dim: String,
        ncols: usize,
        lat: Vec<f64>,
        lon: Vec<f64>,
    },
    Unstructured {
        cell_dim: String,
        lat: Vec<f64>,
        lon: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAxis {
    #[serde(default)]
    pub units: Option<String>,
    pub values: Vec<f64>,
}

impl TimeAxis {
    pub fn is_strictly_increasing(&self) -> bool {
        self.values.windows(2).all(|pair| pair[1] > pair[0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellIndex {
    Regular { row: usize, col: usize },
    Curvilinear { row: usize, col: usize },
    Unstructured { cell: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellMatch {
    pub index: CellIndex,
    pub center: Coordinate,
}

pub trait NearestCell {
    /// Returns the enclosing cell, or a description of why the target is
    /// outside the grid.
    fn nearest(&self, target: Coordinate) -> Result<CellMatch, String>;
}

impl GridDescriptor {
    pub fn kind(&self) -> &'static str {
        match self.layout {
            GridLayout::Regular { .. } => "regular",
            GridLayout::Curvilinear { .. } => "curvilinear",
            GridLayout::Unstructured { .. } => "unstructured",
        }
    }

    /// Spacing of a regular grid as (dlat, dlon).
    pub fn spacing(&self) -> Option<(f64, f64)> {
        match &self.layout {
            GridLayout::Regular {
                lat,
                lon,
                lat_bounds,
                lon_bounds,
                ..
            } => Some((axis_width(lat, *lat_bounds), axis_width(lon, *lon_bounds))),
            _ => None,
        }
    }

    /// Centre of the first cell of a regular grid.
    pub fn origin(&self) -> Option<Coordinate> {
        match &self.layout {
            GridLayout::Regular { lat, lon, .. } => {
                Some(Coordinate::new(*lat.first()?, *lon.first()?))
            }
            _ => None,
        }
    }

    /// Picks the lookup strategy this grid supports.
    pub fn locator(&self, tolerance_km: f64) -> Result<Box<dyn NearestCell + '_>, String> {
        match &self.layout {
            GridLayout::Regular {
                lat,
                lon,
                lat_bounds,
                lon_bounds,
                ..
            } => {
                if lat.is_empty() || lon.is_empty() {
                    return Err("grid has an empty coordinate axis".to_string());
                }
                Ok(Box::new(RegularGrid {
                    lat,
                    lon,
                    lat_bounds: *lat_bounds,
                    lon_bounds: *lon_bounds,
                    tolerance_km,
                }))
            }
            GridLayout::Curvilinear { lat, lon, ncols, .. } => {
                if lat.len() != lon.len() || *ncols == 0 || lat.len() % ncols != 0 {
                    return Err("curvilinear coordinates do not form a grid".to_string());
                }
                Ok(Box::new(PointCloud {
                    lat,
                    lon,
                    ncols: Some(*ncols),
                    tolerance_km,
                }))
            }
            GridLayout::Unstructured { lat, lon, .. } => {
                if lat.len() != lon.len() || lat.is_empty() {
                    return Err("mesh coordinates are empty or mismatched".to_string());
                }
                Ok(Box::new(PointCloud {
                    lat,
                    lon,
                    ncols: None,
                    tolerance_km,
                }))
            }
        }
    }

    /// Dimension ranges selecting exactly one cell.
    pub fn hyperslab(&self, index: CellIndex) -> Vec<DimensionRange> {
        match (&self.layout, index) {
            (GridLayout::Regular { lat_dim, lon_dim, .. }, CellIndex::Regular { row, col }) => {
                vec![DimensionRange::single(lat_dim, row), DimensionRange::single(lon_dim, col)]
            }
            (
                GridLayout::Curvilinear {
                    row_dim, col_dim, ..
                },
                CellIndex::Curvilinear { row, col },
            ) => vec![DimensionRange::single(row_dim, row), DimensionRange::single(col_dim, col)],
            (GridLayout::Unstructured { cell_dim, .. }, CellIndex::Unstructured { cell }) => {
                vec![DimensionRange::single(cell_dim, cell)]
            }
            _ => Vec::new(),
        }
    }
}

/// Inclusive index range along one named dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionRange {
    pub dim: String,
    pub start: usize,
    pub end: usize,
}

impl DimensionRange {
    pub fn single(dim: &str, index: usize) -> Self {
        Self {
            dim: dim.to_string(),
            start: index,
            end: index,
        }
    }
}

/// Axes with a single value and no bounds have no extent of their own, so
/// the selected centre must then lie within `tolerance_km` of the target.
pub struct RegularGrid<'a> {
    lat: &'a [f64],
    lon: &'a [f64],
    lat_bounds: Option<[f64; 2]>,
    lon_bounds: Option<[f64; 2]>,
    tolerance_km: f64,
}

impl NearestCell for RegularGrid<'_> {
    fn nearest(&self, target: Coordinate) -> Result<CellMatch, String> {
        let row = self.nearest_lat(target.lat)?;
        let col = self.nearest_lon(target.lon)?;
        let center = Coordinate::new(self.lat[row], normalize_lon(self.lon[col]));
        let lat_extent = axis_extent(self.lat, self.lat_bounds);
        let lon_extent = axis_extent(self.lon, self.lon_bounds);
        if lat_extent.is_none() || lon_extent.is_none() {
            let distance = haversine_km(target, center);
            if distance > self.tolerance_km {
                return Err(format!(
                    "single-cell axis centred {distance:.1} km away, tolerance is {} km",
                    self.tolerance_km
                ));
            }
        }
        Ok(CellMatch {
            index: CellIndex::Regular { row, col },
            center,
        })
    }
}

impl RegularGrid<'_> {
    fn nearest_lat(&self, target: f64) -> Result<usize, String> {
        if let Some((lower, upper)) = axis_extent(self.lat, self.lat_bounds) {
            let lower = lower.max(-90.0);
            let upper = upper.min(90.0);
            let inside = if upper >= 90.0 - EPSILON {
                target >= lower - EPSILON && target <= 90.0
            } else {
                target >= lower - EPSILON && target < upper - EPSILON
            };
            if !inside {
                return Err(format!(
                    "latitude {target} outside cell extent [{lower}, {upper})"
                ));
            }
        }
        nearest_index(self.lat, |value| (value - target).abs())
            .ok_or_else(|| "latitude axis has no valid values".to_string())
    }

    fn nearest_lon(&self, target: f64) -> Result<usize, String> {
        let (_, max) = axis_bounds(self.lon);
        let extent = axis_extent(self.lon, self.lon_bounds);
        let upper_edge = extent.map(|(_, upper)| upper).unwrap_or(max).max(max);
        let target = if upper_edge > 180.0 + EPSILON {
            target.rem_euclid(360.0)
        } else {
            normalize_lon(target)
        };
        if let Some((lower, upper)) = extent {
            let periodic = upper - lower >= 360.0 - EPSILON;
            if !periodic && (target < lower - EPSILON || target >= upper - EPSILON) {
                return Err(format!(
                    "longitude {target} outside cell extent [{lower}, {upper})"
                ));
            }
        }
        nearest_index(self.lon, |value| angular_distance(value, target))
            .ok_or_else(|| "longitude axis has no valid values".to_string())
    }
}

pub struct PointCloud<'a> {
    lat: &'a [f64],
    lon: &'a [f64],
    ncols: Option<usize>,
    tolerance_km: f64,
}

impl NearestCell for PointCloud<'_> {
    fn nearest(&self, target: Coordinate) -> Result<CellMatch, String> {
        let mut best: Option<(usize, f64)> = None;
        for (index, (lat, lon)) in self.lat.iter().zip(self.lon.iter()).enumerate() {
            if !lat.is_finite() || !lon.is_finite() {
                continue;
            }
            let distance = haversine_km(target, Coordinate::new(*lat, *lon));
            if best.map(|(_, current)| distance < current).unwrap_or(true) {
                best = Some((index, distance));
            }
        }
        let (flat, distance) = best.ok_or_else(|| "mesh has no valid points".to_string())?;
        if distance > self.tolerance_km {
            return Err(format!(
                "nearest point is {distance:.1} km away, tolerance is {} km",
                self.tolerance_km
            ));
        }
        let index = match self.ncols {
            Some(ncols) => CellIndex::Curvilinear {
                row: flat / ncols,
                col: flat % ncols,
            },
            None => CellIndex::Unstructured { cell: flat },
        };
        Ok(CellMatch {
            index,
            center: Coordinate::new(self.lat[flat], normalize_lon(self.lon[flat])),
        })
    }
}

fn nearest_index(values: &[f64], distance: impl Fn(f64) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, value) in values.iter().enumerate() {
        if !value.is_finite() {
            continue;
        }
        let d = distance(*value);
        if best.map(|(_, current)| d < current).unwrap_or(true) {
            best = Some((index, d));
        }
    }
    best.map(|(index, _)| index)
}

fn axis_step(values: &[f64]) -> f64 {
    match values {
        [first, second, ..] => (second - first).abs(),
        _ => 0.0,
    }
}

/// Outer edges of an axis: the bounds variable when present, otherwise half
/// a step past the outermost centres. `None` for a lone centre.
fn axis_extent(values: &[f64], bounds: Option<[f64; 2]>) -> Option<(f64, f64)> {
    if let Some([a, b]) = bounds {
        return Some((a.min(b), a.max(b)));
    }
    if values.len() < 2 {
        return None;
    }
    let step = axis_step(values);
    let (min, max) = axis_bounds(values);
    Some((min - step / 2.0, max + step / 2.0))
}

fn axis_width(values: &[f64], bounds: Option<[f64; 2]>) -> f64 {
    match (values.len(), bounds) {
        (1, Some([a, b])) => (b - a).abs(),
        _ => axis_step(values),
    }
}

fn axis_bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .filter(|value| value.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
            (min.min(*value), max.max(*value))
        })
}

pub fn normalize_lon(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lon > 0.0 {
        180.0
    } else {
        wrapped
    }
}

fn angular_distance(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}
