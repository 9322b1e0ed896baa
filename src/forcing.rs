//! Assembly of the per-group atmospheric forcing streams for one site.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::calendar::{Calendar, CalendarDate, TimeUnits};
use crate::domain::{Coordinate, DatasetCategory, SiteId, StreamGroup, TimeInterpolation};
use crate::error::SitepackError;
use crate::grid::GridDescriptor;
use crate::netcdf::NetcdfToolkit;
use crate::recipe::SiteRecipe;
use crate::subset::{SpatialSubsetter, SubsetWindow, compute_window};

pub const MONTHS: std::ops::RangeInclusive<u32> = 1..=12;

/// One assembled stream file, with the time alignment the data model must use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForcingStream {
    pub group: StreamGroup,
    pub relative_path: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub interpolation: TimeInterpolation,
    pub offset_seconds: i64,
    pub variables: Vec<(String, String)>,
    pub start_year: i32,
    pub end_year: i32,
    pub source_tag: String,
}

#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub group: StreamGroup,
    pub files: Vec<PathBuf>,
    pub window: SubsetWindow,
}

#[derive(Debug, Clone)]
pub struct ForcingPlan {
    pub groups: Vec<GroupPlan>,
}

pub fn stream_file_name(site: &SiteId, group: StreamGroup, start: i32, end: i32) -> String {
    format!("{site}.{group}.{start}-{end}.nc")
}

pub fn stream_relative_path(site: &SiteId, group: StreamGroup, start: i32, end: i32) -> String {
    format!(
        "{}/{}/{}",
        DatasetCategory::Atmosphere.package_dir(),
        site.grid_name(),
        stream_file_name(site, group, start, end)
    )
}

/// Expands a monthly file pattern for one year and month.
pub fn monthly_path(root: &Path, pattern: &str, year: i32, month: u32) -> PathBuf {
    root.join(
        pattern
            .replace("{year}", &format!("{year:04}"))
            .replace("{month}", &format!("{month:02}")),
    )
}

pub struct ForcingAssembler<'a> {
    toolkit: &'a dyn NetcdfToolkit,
    tolerance_km: f64,
}

impl<'a> ForcingAssembler<'a> {
    pub fn new(toolkit: &'a dyn NetcdfToolkit, tolerance_km: f64) -> Self {
        Self {
            toolkit,
            tolerance_km,
        }
    }

    /// Checks that every month of every requested year exists for every
    /// group and that each file's records fall in the month its name claims,
    /// then computes each group's cell from its first monthly file.
    /// Nothing is written.
    pub fn plan(&self, recipe: &SiteRecipe, root: &Path) -> Result<ForcingPlan, SitepackError> {
        let mut groups = Vec::with_capacity(StreamGroup::ALL.len());
        for group in StreamGroup::ALL {
            let pattern = recipe
                .atmosphere
                .patterns
                .get(&group)
                .map(String::as_str)
                .unwrap_or_else(|| group.default_pattern());
            let mut files = Vec::new();
            let mut months = Vec::new();
            for year in recipe.years() {
                let mut missing = Vec::new();
                for month in MONTHS {
                    let path = monthly_path(root, pattern, year, month);
                    if path.is_file() {
                        files.push(path);
                        months.push((year, month));
                    } else {
                        missing.push(format!("{month:02}"));
                    }
                }
                if !missing.is_empty() {
                    return Err(SitepackError::TemporalCoverage {
                        group: group.to_string(),
                        year,
                        detail: format!(
                            "months {} missing under {}",
                            missing.join(","),
                            root.display()
                        ),
                    });
                }
            }
            let first = files.first().ok_or_else(|| SitepackError::TemporalCoverage {
                group: group.to_string(),
                year: recipe.start_year,
                detail: "no monthly files".to_string(),
            })?;
            let grid = self.toolkit.describe(first)?;
            for (index, (path, (year, month))) in files.iter().zip(&months).enumerate() {
                let descriptor = if index == 0 {
                    grid.clone()
                } else {
                    self.toolkit.describe(path)?
                };
                check_month(group, *year, *month, path, &descriptor)?;
            }
            let window = compute_window(
                DatasetCategory::Atmosphere,
                &grid,
                recipe.coordinate,
                self.tolerance_km,
            )?;
            groups.push(GroupPlan {
                group,
                files,
                window,
            });
        }
        Ok(ForcingPlan { groups })
    }

    /// Subsets every monthly file of the plan and concatenates them along
    /// time into one annotated file per group below `work_dir`.
    pub fn assemble(
        &self,
        plan: &ForcingPlan,
        recipe: &SiteRecipe,
        work_dir: &Path,
    ) -> Result<Vec<ForcingStream>, SitepackError> {
        let subsetter = SpatialSubsetter::new(self.toolkit, self.tolerance_km);
        let mut streams = Vec::with_capacity(plan.groups.len());
        for group_plan in &plan.groups {
            let group = group_plan.group;
            let monthly_dir = work_dir.join("forcing").join(group.as_str());
            let mut pieces = Vec::with_capacity(group_plan.files.len());
            for (index, source) in group_plan.files.iter().enumerate() {
                let piece = monthly_dir.join(format!("{index:05}.nc"));
                subsetter.extract(source, &group_plan.window, &piece)?;
                pieces.push(piece);
            }

            let relative_path =
                stream_relative_path(&recipe.site_id, group, recipe.start_year, recipe.end_year);
            let output = work_dir.join("inputdata").join(&relative_path);
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
            }
            self.toolkit.concatenate(&pieces, &output)?;
            self.toolkit.annotate(
                &output,
                &stream_attributes(group, recipe, group_plan.window.selected),
            )?;
            self.verify_time_axis(group, recipe, &output)?;
            fs::remove_dir_all(&monthly_dir)
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?;

            info!(
                group = %group,
                months = pieces.len(),
                path = %relative_path,
                "assembled forcing stream"
            );
            streams.push(ForcingStream {
                group,
                relative_path,
                path: output,
                interpolation: group.interpolation(),
                offset_seconds: group.offset_seconds(),
                variables: group
                    .variables()
                    .iter()
                    .map(|(file, model)| (file.to_string(), model.to_string()))
                    .collect(),
                start_year: recipe.start_year,
                end_year: recipe.end_year,
                source_tag: recipe.atmosphere.source_tag.clone(),
            });
        }
        Ok(streams)
    }

    fn verify_time_axis(
        &self,
        group: StreamGroup,
        recipe: &SiteRecipe,
        output: &Path,
    ) -> Result<(), SitepackError> {
        let descriptor = self.toolkit.describe(output)?;
        let time = descriptor.time.ok_or_else(|| {
            SitepackError::Netcdf(format!("{} has no time axis", output.display()))
        })?;
        if time.values.is_empty() || !time.is_strictly_increasing() {
            return Err(SitepackError::TemporalCoverage {
                group: group.to_string(),
                year: recipe.start_year,
                detail: "concatenated time axis is not strictly increasing".to_string(),
            });
        }
        Ok(())
    }
}

/// The first and last record of a monthly file must lie within that month.
/// Files whose time encoding cannot be decoded are not checked.
fn check_month(
    group: StreamGroup,
    year: i32,
    month: u32,
    path: &Path,
    descriptor: &GridDescriptor,
) -> Result<(), SitepackError> {
    let mislabelled = |detail: String| SitepackError::TemporalCoverage {
        group: group.to_string(),
        year,
        detail: format!("{year:04}-{month:02}: {detail} in {}", path.display()),
    };
    let time = descriptor
        .time
        .as_ref()
        .filter(|time| !time.values.is_empty())
        .ok_or_else(|| mislabelled("no time records".to_string()))?;
    let units = time.units.as_deref().and_then(TimeUnits::parse);
    let calendar = Calendar::parse(descriptor.calendar.as_deref());
    let (Some(units), Some(calendar)) = (units, calendar) else {
        debug!(
            path = %path.display(),
            units = ?time.units,
            calendar = ?descriptor.calendar,
            "time encoding not decodable, month not checked"
        );
        return Ok(());
    };

    let start = CalendarDate::month_start(year, month);
    let end = start.next_month_start();
    let (first, last) = time
        .values
        .iter()
        .filter(|value| value.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), value| {
            (min.min(*value), max.max(*value))
        });
    let (Some(first), Some(last)) = (
        units.decode(first, calendar),
        units.decode(last, calendar),
    ) else {
        return Err(mislabelled("time values cannot be decoded".to_string()));
    };
    if first < start || last > end {
        return Err(mislabelled(format!("records span {first} to {last}")));
    }
    Ok(())
}

fn stream_attributes(
    group: StreamGroup,
    recipe: &SiteRecipe,
    selected: Coordinate,
) -> Vec<(String, String)> {
    vec![
        ("site_id".to_string(), recipe.site_id.to_string()),
        ("stream_group".to_string(), group.to_string()),
        ("tintalgo".to_string(), group.interpolation().to_string()),
        ("offset".to_string(), group.offset_seconds().to_string()),
        ("forcing_source".to_string(), recipe.atmosphere.source_tag.clone()),
        (
            "selected_cell".to_string(),
            format!("{},{}", selected.lat, selected.lon),
        ),
    ]
}
