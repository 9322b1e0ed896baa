use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::domain::{Coordinate, DatasetCategory};
use crate::error::SitepackError;
use crate::grid::{CellIndex, DimensionRange, GridDescriptor, GridLayout};
use crate::locator::ResolvedDataset;
use crate::netcdf::NetcdfToolkit;

/// The single grid cell enclosing a site, as index ranges on the source grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsetWindow {
    pub category: DatasetCategory,
    pub ranges: Vec<DimensionRange>,
    pub cell: CellIndex,
    pub selected: Coordinate,
}

pub struct SpatialSubsetter<'a> {
    toolkit: &'a dyn NetcdfToolkit,
    tolerance_km: f64,
}

impl<'a> SpatialSubsetter<'a> {
    pub fn new(toolkit: &'a dyn NetcdfToolkit, tolerance_km: f64) -> Self {
        Self {
            toolkit,
            tolerance_km,
        }
    }

    pub fn window(
        &self,
        dataset: &ResolvedDataset,
        target: Coordinate,
    ) -> Result<SubsetWindow, SitepackError> {
        let grid = dataset.grid.as_ref().ok_or_else(|| {
            SitepackError::Netcdf(format!(
                "{} has no grid descriptor",
                dataset.path.display()
            ))
        })?;
        compute_window(dataset.category, grid, target, self.tolerance_km)
    }

    /// Writes the window of `source` to `output`.
    pub fn extract(
        &self,
        source: &Path,
        window: &SubsetWindow,
        output: &Path,
    ) -> Result<(), SitepackError> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        }
        debug!(
            category = %window.category,
            source = %source.display(),
            ranges = ?window.ranges,
            "extracting cell"
        );
        self.toolkit.extract(source, &window.ranges, output)?;
        if !output.is_file() {
            return Err(SitepackError::Netcdf(format!(
                "extraction of {} produced no file",
                source.display()
            )));
        }
        Ok(())
    }
}

/// Finds the enclosing cell of `target` on `grid`. Targets outside the grid
/// are rejected, never clamped to the nearest edge.
pub fn compute_window(
    category: DatasetCategory,
    grid: &GridDescriptor,
    target: Coordinate,
    tolerance_km: f64,
) -> Result<SubsetWindow, SitepackError> {
    let out_of_domain = |detail: String| SitepackError::CoordinateOutOfDomain {
        category: category.to_string(),
        lat: target.lat,
        lon: target.lon,
        detail,
    };
    let locator = grid.locator(tolerance_km).map_err(|detail| {
        SitepackError::Netcdf(format!("{category} grid: {detail}"))
    })?;
    let cell = locator.nearest(target).map_err(out_of_domain)?;
    let ranges = grid.hyperslab(cell.index);
    for range in &ranges {
        let len = dimension_len(grid, &range.dim);
        if range.start > range.end || range.end >= len {
            return Err(SitepackError::Netcdf(format!(
                "{category} window {}[{}..={}] exceeds length {len}",
                range.dim, range.start, range.end
            )));
        }
    }
    debug!(
        category = %category,
        grid = grid.kind(),
        lat = cell.center.lat,
        lon = cell.center.lon,
        "selected cell"
    );
    Ok(SubsetWindow {
        category,
        ranges,
        cell: cell.index,
        selected: cell.center,
    })
}

fn dimension_len(grid: &GridDescriptor, dim: &str) -> usize {
    match &grid.layout {
        GridLayout::Regular {
            lat_dim, lat, lon, ..
        } => {
            if dim == lat_dim {
                lat.len()
            } else {
                lon.len()
            }
        }
        GridLayout::Curvilinear {
            row_dim, ncols, lat, ..
        } => {
            if dim == row_dim {
                lat.len() / ncols
            } else {
                *ncols
            }
        }
        GridLayout::Unstructured { lat, .. } => lat.len(),
    }
}
