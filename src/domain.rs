use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SiteId(String);

impl SiteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Grid name used by the platform for single-point cases, e.g. `1x1_FNS`.
    pub fn grid_name(&self) -> String {
        format!("1x1_{}", self.0)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SiteId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !is_valid {
            return Err(format!(
                "site id must be ASCII alphanumerics, '-' or '_': {value:?}"
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for SiteId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SiteId> for String {
    fn from(value: SiteId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionTag(String);

impl VersionTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VersionTag {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let pattern = Regex::new(r"^\d+\.\d+\.\d+$").map_err(|err| err.to_string())?;
        let trimmed = value.trim();
        if !pattern.is_match(trimmed) {
            return Err(format!("expected MAJOR.MINOR.PATCH, got {value:?}"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for VersionTag {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionTag> for String {
    fn from(value: VersionTag) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn approx_eq(&self, other: &Coordinate, tolerance: f64) -> bool {
        (self.lat - other.lat).abs() <= tolerance && (self.lon - other.lon).abs() <= tolerance
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetCategory {
    Atmosphere,
    Surface,
    Fire,
    Population,
    Urban,
    AerosolDeposition,
    Lightning,
    Topography,
}

impl DatasetCategory {
    pub const ALL: [DatasetCategory; 8] = [
        DatasetCategory::Atmosphere,
        DatasetCategory::Surface,
        DatasetCategory::Fire,
        DatasetCategory::Population,
        DatasetCategory::Urban,
        DatasetCategory::AerosolDeposition,
        DatasetCategory::Lightning,
        DatasetCategory::Topography,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetCategory::Atmosphere => "atmosphere",
            DatasetCategory::Surface => "surface",
            DatasetCategory::Fire => "fire",
            DatasetCategory::Population => "population",
            DatasetCategory::Urban => "urban",
            DatasetCategory::AerosolDeposition => "aerosol_deposition",
            DatasetCategory::Lightning => "lightning",
            DatasetCategory::Topography => "topography",
        }
    }

    /// Ancillary categories are subset and shipped as-is.
    pub fn is_ancillary(&self) -> bool {
        !matches!(self, DatasetCategory::Atmosphere | DatasetCategory::Surface)
    }

    /// Directory of the subset file below the archive's `inputdata/` root.
    pub fn package_dir(&self) -> &'static str {
        match self {
            DatasetCategory::Atmosphere => "atm/datm7/CLM1PT_data",
            DatasetCategory::Surface => "lnd/clm2/surfdata_map",
            DatasetCategory::Fire | DatasetCategory::Population => "lnd/clm2/firedata",
            DatasetCategory::Urban => "lnd/clm2/urbandata",
            DatasetCategory::AerosolDeposition => "atm/cam/chem/trop_mozart_aero/aero",
            DatasetCategory::Lightning => "atm/datm7/NASA_LIS",
            DatasetCategory::Topography => "atm/datm7/topo_forcing",
        }
    }
}

impl fmt::Display for DatasetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DatasetCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        DatasetCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputProfile {
    #[default]
    Forcing,
    Complete,
}

impl OutputProfile {
    pub fn required_categories(&self) -> &'static [DatasetCategory] {
        match self {
            OutputProfile::Forcing => &[DatasetCategory::Atmosphere, DatasetCategory::Surface],
            OutputProfile::Complete => &[
                DatasetCategory::Atmosphere,
                DatasetCategory::Surface,
                DatasetCategory::Fire,
                DatasetCategory::Population,
                DatasetCategory::Urban,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropPolicy {
    #[default]
    Keep,
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceOverrides {
    #[serde(default)]
    pub force_irrigation: bool,
    #[serde(default)]
    pub crop_policy: CropPolicy,
    #[serde(default)]
    pub pft_override: bool,
    #[serde(default)]
    pub soil_override: bool,
}

impl SurfaceOverrides {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.force_irrigation {
            args.push("--force-irrigation".to_string());
        }
        if self.crop_policy == CropPolicy::Remove {
            args.push("--no-crop".to_string());
        }
        if self.pft_override {
            args.push("--pft-override".to_string());
        }
        if self.soil_override {
            args.push("--soil-override".to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamGroup {
    Solar,
    Precip,
    #[serde(rename = "TPQW")]
    Tpqw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInterpolation {
    Coszen,
    Nearest,
    Linear,
}

impl fmt::Display for TimeInterpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInterpolation::Coszen => write!(f, "coszen"),
            TimeInterpolation::Nearest => write!(f, "nearest"),
            TimeInterpolation::Linear => write!(f, "linear"),
        }
    }
}

impl StreamGroup {
    pub const ALL: [StreamGroup; 3] = [StreamGroup::Solar, StreamGroup::Precip, StreamGroup::Tpqw];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamGroup::Solar => "Solar",
            StreamGroup::Precip => "Precip",
            StreamGroup::Tpqw => "TPQW",
        }
    }

    pub fn recipe_key(&self) -> &'static str {
        match self {
            StreamGroup::Solar => "solar",
            StreamGroup::Precip => "precip",
            StreamGroup::Tpqw => "tpqw",
        }
    }

    pub fn interpolation(&self) -> TimeInterpolation {
        match self {
            StreamGroup::Solar => TimeInterpolation::Coszen,
            StreamGroup::Precip => TimeInterpolation::Nearest,
            StreamGroup::Tpqw => TimeInterpolation::Linear,
        }
    }

    /// Offset in seconds applied by the data model when aligning records.
    /// Interval-averaged fluxes are stamped at the end of their half-hour.
    pub fn offset_seconds(&self) -> i64 {
        match self {
            StreamGroup::Solar | StreamGroup::Precip => -1800,
            StreamGroup::Tpqw => 0,
        }
    }

    /// Pairs of (file variable, model field).
    pub fn variables(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            StreamGroup::Solar => &[("FSDS", "Faxa_swdn")],
            StreamGroup::Precip => &[("PRECTmms", "Faxa_precn")],
            StreamGroup::Tpqw => &[
                ("TBOT", "Sa_tbot"),
                ("WIND", "Sa_wind"),
                ("QBOT", "Sa_shum"),
                ("PSRF", "Sa_pbot"),
                ("FLDS", "Faxa_lwdn"),
            ],
        }
    }

    pub fn default_pattern(&self) -> &'static str {
        match self {
            StreamGroup::Solar => "Solar3Hrly/clmforc.GSWP3.c2011.0.5x0.5.Solr.{year}-{month}.nc",
            StreamGroup::Precip => {
                "Precip3Hrly/clmforc.GSWP3.c2011.0.5x0.5.Prec.{year}-{month}.nc"
            }
            StreamGroup::Tpqw => "TPHWL3Hrly/clmforc.GSWP3.c2011.0.5x0.5.TPQWL.{year}-{month}.nc",
        }
    }
}

impl fmt::Display for StreamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
