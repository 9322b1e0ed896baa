use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SitepackError {
    #[error(transparent)]
    #[diagnostic(code(sitepack::recipe))]
    RecipeValidation(#[from] RecipeValidationError),

    #[error("dataset not found for category {category}: {location}")]
    #[diagnostic(code(sitepack::dataset_not_found))]
    DatasetNotFound { category: String, location: String },

    #[error("coordinate ({lat}, {lon}) is outside the {category} grid: {detail}")]
    #[diagnostic(code(sitepack::out_of_domain))]
    CoordinateOutOfDomain {
        category: String,
        lat: f64,
        lon: f64,
        detail: String,
    },

    #[error(transparent)]
    #[diagnostic(code(sitepack::external_tool))]
    ExternalTool(#[from] ToolFailure),

    #[error("forcing group {group} has no data for year {year}: {detail}")]
    #[diagnostic(code(sitepack::temporal_coverage))]
    TemporalCoverage {
        group: String,
        year: i32,
        detail: String,
    },

    #[error("inconsistent site metadata: {0}")]
    #[diagnostic(code(sitepack::inconsistent_metadata))]
    InconsistentMetadata(String),

    #[error("package is missing required artifacts: {}", missing.join(", "))]
    IncompletePackage { missing: Vec<String> },

    #[error("missing config file sitepack.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("machine not defined in config: {0}")]
    UnknownMachine(String),

    #[error("download failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("unreadable NetCDF metadata: {0}")]
    Netcdf(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SitepackError {
    /// Stable name of the error kind, used in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SitepackError::RecipeValidation(_) => "RecipeValidationError",
            SitepackError::DatasetNotFound { .. } => "DatasetNotFoundError",
            SitepackError::CoordinateOutOfDomain { .. } => "CoordinateOutOfDomainError",
            SitepackError::ExternalTool(_) => "ExternalToolFailure",
            SitepackError::TemporalCoverage { .. } => "TemporalCoverageError",
            SitepackError::InconsistentMetadata(_) => "InconsistentMetadataError",
            SitepackError::IncompletePackage { .. } => "IncompletePackageError",
            SitepackError::MissingConfig
            | SitepackError::ConfigRead(_)
            | SitepackError::ConfigParse(_)
            | SitepackError::UnknownMachine(_) => "ConfigError",
            SitepackError::DownloadHttp(_) | SitepackError::DownloadStatus { .. } => {
                "DownloadError"
            }
            SitepackError::Netcdf(_) => "NetcdfError",
            SitepackError::Filesystem(_) => "FilesystemError",
        }
    }

    /// Process exit code reported for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            SitepackError::RecipeValidation(_)
            | SitepackError::DatasetNotFound { .. }
            | SitepackError::CoordinateOutOfDomain { .. }
            | SitepackError::TemporalCoverage { .. }
            | SitepackError::MissingConfig
            | SitepackError::UnknownMachine(_) => 2,
            SitepackError::ExternalTool(_) => 3,
            SitepackError::InconsistentMetadata(_) => 4,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecipeValidationError {
    #[error("recipe {recipe}: missing field `{field}`")]
    MissingField { recipe: String, field: String },

    #[error("recipe {recipe}: `{field}` out of range: {value}")]
    OutOfRange {
        recipe: String,
        field: String,
        value: String,
    },

    #[error("recipe {recipe}: unknown dataset category `{category}`")]
    UnknownCategory { recipe: String, category: String },

    #[error("recipe {recipe}: invalid `{field}`: {message}")]
    InvalidValue {
        recipe: String,
        field: String,
        message: String,
    },

    #[error("recipe {recipe}: {message}")]
    Unreadable { recipe: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailureKind {
    NotInstalled,
    Spawn,
    ExitStatus(Option<i32>),
    MissingOutput(String),
    Timeout { seconds: u64 },
}

impl fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolFailureKind::NotInstalled => write!(f, "not installed"),
            ToolFailureKind::Spawn => write!(f, "could not be started"),
            ToolFailureKind::ExitStatus(Some(code)) => write!(f, "exited with status {code}"),
            ToolFailureKind::ExitStatus(None) => write!(f, "terminated by signal"),
            ToolFailureKind::MissingOutput(path) => write!(f, "did not produce {path}"),
            ToolFailureKind::Timeout { seconds } => write!(f, "timed out after {seconds}s"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("external tool {tool} {kind}: {diagnostics}")]
pub struct ToolFailure {
    pub tool: String,
    pub args: Vec<String>,
    pub kind: ToolFailureKind,
    pub diagnostics: String,
}

impl ToolFailure {
    pub fn new(tool: &str, args: &[String], kind: ToolFailureKind, diagnostics: String) -> Self {
        Self {
            tool: tool.to_string(),
            args: args.to_vec(),
            kind,
            diagnostics,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ToolFailureKind::Timeout { .. })
    }
}
