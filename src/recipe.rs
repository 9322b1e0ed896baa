use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{
    Coordinate, DatasetCategory, OutputProfile, SiteId, StreamGroup, SurfaceOverrides, VersionTag,
};
use crate::error::{RecipeValidationError, SitepackError};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RecipeDocument {
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub coordinates: Option<CoordinateEntry>,
    #[serde(default)]
    pub elevation: Option<f64>,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
    #[serde(default)]
    pub version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub datasets: Option<BTreeMap<String, SourceEntry>>,
    #[serde(default)]
    pub parameter_files: Option<Vec<String>>,
    #[serde(default)]
    pub overrides: Option<SurfaceOverrides>,
    #[serde(default)]
    pub shared: Option<SharedEntry>,
    #[serde(default)]
    pub output: Option<OutputEntry>,
}

/// Prebuilt grid files reused instead of being generated per run.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SharedEntry {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub scrip: Option<String>,
    #[serde(default)]
    pub mapping: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CoordinateEntry {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SourceEntry {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source_tag: Option<String>,
    #[serde(default)]
    pub streams: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OutputEntry {
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SourceRef {
    Local(PathBuf),
    Remote(String),
}

impl SourceRef {
    pub fn describe(&self) -> String {
        match self {
            SourceRef::Local(path) => path.display().to_string(),
            SourceRef::Remote(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtmosphereLayout {
    pub source_tag: String,
    pub patterns: BTreeMap<StreamGroup, String>,
}

impl Default for AtmosphereLayout {
    fn default() -> Self {
        Self {
            source_tag: "GSWP3".to_string(),
            patterns: StreamGroup::ALL
                .into_iter()
                .map(|group| (group, group.default_pattern().to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SharedFiles {
    pub domain: Option<PathBuf>,
    pub scrip: Option<PathBuf>,
    pub mapping: Option<PathBuf>,
}

impl SharedFiles {
    /// (field name, path) of every file given.
    pub fn entries(&self) -> Vec<(&'static str, &Path)> {
        [
            ("shared.domain", &self.domain),
            ("shared.scrip", &self.scrip),
            ("shared.mapping", &self.mapping),
        ]
        .into_iter()
        .filter_map(|(field, path)| path.as_deref().map(|path| (field, path)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteRecipe {
    pub origin: String,
    pub site_id: SiteId,
    pub name: String,
    pub group: Option<String>,
    pub coordinate: Coordinate,
    pub elevation: Option<f64>,
    pub start_year: i32,
    pub end_year: i32,
    pub version: VersionTag,
    pub profile: OutputProfile,
    pub sources: BTreeMap<DatasetCategory, SourceRef>,
    pub atmosphere: AtmosphereLayout,
    pub parameter_files: Vec<PathBuf>,
    pub overrides: SurfaceOverrides,
    pub shared: SharedFiles,
    pub output_dir: Option<PathBuf>,
}

impl SiteRecipe {
    pub fn years(&self) -> impl Iterator<Item = i32> {
        self.start_year..=self.end_year
    }

    pub fn ancillary_categories(&self) -> Vec<DatasetCategory> {
        self.sources
            .keys()
            .copied()
            .filter(DatasetCategory::is_ancillary)
            .collect()
    }
}

pub struct RecipeLoader;

impl RecipeLoader {
    pub fn load(path: &Path) -> Result<SiteRecipe, SitepackError> {
        let origin = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        if !is_recipe_file(path) {
            return Err(RecipeValidationError::Unreadable {
                recipe: origin,
                message: "not a .yml or .yaml file".to_string(),
            }
            .into());
        }
        let content = fs::read_to_string(path).map_err(|err| RecipeValidationError::Unreadable {
            recipe: origin.clone(),
            message: err.to_string(),
        })?;
        let base_dir = path.parent().map(Path::to_path_buf);
        Ok(Self::parse(&content, &origin, base_dir.as_deref())?)
    }

    pub fn parse(
        content: &str,
        origin: &str,
        base_dir: Option<&Path>,
    ) -> Result<SiteRecipe, RecipeValidationError> {
        let document: RecipeDocument =
            serde_yaml::from_str(content).map_err(|err| RecipeValidationError::Unreadable {
                recipe: origin.to_string(),
                message: err.to_string(),
            })?;
        Self::resolve(document, origin, base_dir)
    }

    pub fn resolve(
        document: RecipeDocument,
        origin: &str,
        base_dir: Option<&Path>,
    ) -> Result<SiteRecipe, RecipeValidationError> {
        let missing = |field: &str| RecipeValidationError::MissingField {
            recipe: origin.to_string(),
            field: field.to_string(),
        };
        let out_of_range = |field: &str, value: String| RecipeValidationError::OutOfRange {
            recipe: origin.to_string(),
            field: field.to_string(),
            value,
        };
        let invalid = |field: &str, message: String| RecipeValidationError::InvalidValue {
            recipe: origin.to_string(),
            field: field.to_string(),
            message,
        };

        let site_id = non_empty(document.site_id)
            .ok_or_else(|| missing("site_id"))?
            .parse::<SiteId>()
            .map_err(|message| invalid("site_id", message))?;
        let name = non_empty(document.name).ok_or_else(|| missing("name"))?;
        let group = non_empty(document.group);

        let coordinates = document.coordinates.ok_or_else(|| missing("coordinates"))?;
        let lat = coordinates.lat.ok_or_else(|| missing("coordinates.lat"))?;
        let lon = coordinates.lon.ok_or_else(|| missing("coordinates.lon"))?;
        if !(-90.0..=90.0).contains(&lat) {
            return Err(out_of_range("coordinates.lat", lat.to_string()));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(out_of_range("coordinates.lon", lon.to_string()));
        }

        let start_year = document.start_year.ok_or_else(|| missing("start_year"))?;
        let end_year = document.end_year.ok_or_else(|| missing("end_year"))?;
        if !(1..=9999).contains(&start_year) {
            return Err(out_of_range("start_year", start_year.to_string()));
        }
        if !(1..=9999).contains(&end_year) {
            return Err(out_of_range("end_year", end_year.to_string()));
        }
        if start_year > end_year {
            return Err(out_of_range(
                "end_year",
                format!("{end_year} is before start_year {start_year}"),
            ));
        }

        let version = document
            .version
            .as_ref()
            .and_then(scalar_to_string)
            .ok_or_else(|| missing("version"))?
            .parse::<VersionTag>()
            .map_err(|message| invalid("version", message))?;

        let profile = match document.profile.as_deref().map(str::trim) {
            None | Some("") => OutputProfile::default(),
            Some("forcing") => OutputProfile::Forcing,
            Some("complete") => OutputProfile::Complete,
            Some(other) => {
                return Err(invalid(
                    "profile",
                    format!("expected forcing or complete, got {other:?}"),
                ));
            }
        };

        let entries = document.datasets.ok_or_else(|| missing("datasets"))?;
        if entries.is_empty() {
            return Err(missing("datasets"));
        }

        let mut sources = BTreeMap::new();
        let mut atmosphere = AtmosphereLayout::default();
        for (key, entry) in entries {
            let category = key.parse::<DatasetCategory>().map_err(|category| {
                RecipeValidationError::UnknownCategory {
                    recipe: origin.to_string(),
                    category,
                }
            })?;
            let field = format!("datasets.{}", category.as_str());
            let source = match (non_empty(entry.path), non_empty(entry.url)) {
                (Some(path), None) => SourceRef::Local(resolve_path(&path, base_dir)),
                (None, Some(url)) => SourceRef::Remote(url),
                (Some(_), Some(_)) => {
                    return Err(invalid(&field, "give either path or url, not both".to_string()));
                }
                (None, None) => return Err(missing(&format!("{field}.path"))),
            };

            if category == DatasetCategory::Atmosphere {
                if matches!(source, SourceRef::Remote(_)) {
                    return Err(invalid(
                        &field,
                        "atmospheric forcing must be a local directory".to_string(),
                    ));
                }
                if let Some(tag) = non_empty(entry.source_tag) {
                    atmosphere.source_tag = tag;
                }
                for (stream, pattern) in entry.streams.unwrap_or_default() {
                    let group = StreamGroup::ALL
                        .into_iter()
                        .find(|group| group.recipe_key() == stream.trim().to_lowercase())
                        .ok_or_else(|| {
                            invalid(&format!("{field}.streams"), format!("unknown group {stream:?}"))
                        })?;
                    if !pattern.contains("{year}") || !pattern.contains("{month}") {
                        return Err(invalid(
                            &format!("{field}.streams.{stream}"),
                            "pattern needs {year} and {month}".to_string(),
                        ));
                    }
                    atmosphere.patterns.insert(group, pattern);
                }
            }
            sources.insert(category, source);
        }

        for category in profile.required_categories() {
            if !sources.contains_key(category) {
                return Err(missing(&format!("datasets.{}", category.as_str())));
            }
        }

        let parameter_files = document
            .parameter_files
            .unwrap_or_default()
            .into_iter()
            .filter(|path| !path.trim().is_empty())
            .map(|path| resolve_path(&path, base_dir))
            .collect();

        let shared = document.shared.unwrap_or_default();
        let shared_path = |raw: Option<String>| non_empty(raw).map(|raw| resolve_path(&raw, base_dir));
        let shared = SharedFiles {
            domain: shared_path(shared.domain),
            scrip: shared_path(shared.scrip),
            mapping: shared_path(shared.mapping),
        };

        if let Some(elevation) = document.elevation {
            if !elevation.is_finite() || !(-500.0..=9000.0).contains(&elevation) {
                return Err(out_of_range("elevation", elevation.to_string()));
            }
        }

        let output_dir = document
            .output
            .and_then(|output| non_empty(output.directory))
            .map(|dir| resolve_path(&dir, base_dir));

        Ok(SiteRecipe {
            origin: origin.to_string(),
            site_id,
            name,
            group,
            coordinate: Coordinate::new(lat, lon),
            elevation: document.elevation,
            start_year,
            end_year,
            version,
            profile,
            sources,
            atmosphere,
            parameter_files,
            overrides: document.overrides.unwrap_or_default(),
            shared,
            output_dir,
        })
    }

    /// Lists recipe documents in a directory, sorted by file name.
    pub fn discover(dir: &Path) -> Result<Vec<PathBuf>, SitepackError> {
        let entries = fs::read_dir(dir)
            .map_err(|err| SitepackError::Filesystem(format!("read {}: {err}", dir.display())))?;
        let mut recipes = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?
                .path();
            if path.is_file() && is_recipe_file(&path) {
                recipes.push(path);
            }
        }
        recipes.sort();
        Ok(recipes)
    }
}

pub fn is_recipe_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml"))
        .unwrap_or(false)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => non_empty(Some(text.clone())),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    };
    match base_dir {
        Some(base) if expanded.is_relative() => base.join(expanded),
        _ => expanded,
    }
}
