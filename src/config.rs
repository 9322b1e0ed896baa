use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SitepackError;
use crate::netcdf::HeaderReader;
use crate::store::Store;

pub const DEFAULT_CONFIG_FILE: &str = "sitepack.json";
pub const DEFAULT_MESH_TOLERANCE_KM: f64 = 100.0;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_NCO_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub default_machine: Option<String>,
    #[serde(default)]
    pub publication: Option<PublicationEntry>,
    #[serde(default)]
    pub machines: BTreeMap<String, MachineEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PublicationEntry {
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MachineEntry {
    #[serde(default)]
    pub domain_generator: Option<ToolEntry>,
    #[serde(default)]
    pub surface_generator: Option<ToolEntry>,
    #[serde(default)]
    pub nco: Option<NcoEntry>,
    #[serde(default)]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub mesh_tolerance_km: Option<f64>,
    #[serde(default)]
    pub keep_scratch: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ToolEntry {
    pub program: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NcoEntry {
    #[serde(default)]
    pub bin_dir: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// `ncdump` or `native`.
    #[serde(default)]
    pub reader: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NcoSettings {
    pub bin_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub reader: HeaderReader,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub name: String,
    pub domain_generator: ToolSpec,
    pub surface_generator: ToolSpec,
    pub nco: NcoSettings,
    pub download_dir: PathBuf,
    pub mesh_tolerance_km: f64,
    pub keep_scratch: bool,
    pub publication_base_url: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>, machine: Option<&str>) -> Result<MachineConfig, SitepackError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SitepackError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SitepackError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SitepackError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config, machine, config_path.parent())
    }

    /// Selects a machine and fills in defaults. Relative program and directory
    /// paths resolve against `base_dir`, normally the config file's directory.
    pub fn resolve_config(
        mut config: Config,
        machine: Option<&str>,
        base_dir: Option<&Path>,
    ) -> Result<MachineConfig, SitepackError> {
        let name = match machine.or(config.default_machine.as_deref()) {
            Some(name) => name.to_string(),
            None if config.machines.len() == 1 => config
                .machines
                .keys()
                .next()
                .cloned()
                .unwrap_or_default(),
            None => {
                return Err(SitepackError::ConfigParse(
                    "no machine selected and no default_machine set".to_string(),
                ));
            }
        };
        let entry = config
            .machines
            .remove(&name)
            .ok_or_else(|| SitepackError::UnknownMachine(name.clone()))?;

        let domain_generator = entry
            .domain_generator
            .ok_or_else(|| missing(&name, "domain_generator"))
            .map(|tool| tool_spec(tool, default_domain_args(), base_dir))?;
        let surface_generator = entry
            .surface_generator
            .ok_or_else(|| missing(&name, "surface_generator"))
            .map(|tool| tool_spec(tool, default_surface_args(), base_dir))?;

        let nco = entry.nco.unwrap_or_default();
        let reader = match nco.reader.as_deref() {
            Some(reader) => HeaderReader::parse(reader)
                .map_err(|err| SitepackError::ConfigParse(format!("machine {name}: {err}")))?,
            None => HeaderReader::default(),
        };
        let nco = NcoSettings {
            bin_dir: nco.bin_dir.map(|dir| resolve_path(&dir, base_dir)),
            timeout: Duration::from_secs(nco.timeout_secs.unwrap_or(DEFAULT_NCO_TIMEOUT_SECS)),
            reader,
        };

        let download_dir = match entry.download_dir {
            Some(dir) => resolve_path(&dir, base_dir),
            None => Store::default_cache_root()?.into_std_path_buf(),
        };

        let mesh_tolerance_km = entry
            .mesh_tolerance_km
            .unwrap_or(DEFAULT_MESH_TOLERANCE_KM);
        if !(mesh_tolerance_km.is_finite() && mesh_tolerance_km > 0.0) {
            return Err(SitepackError::ConfigParse(format!(
                "machine {name}: mesh_tolerance_km must be positive"
            )));
        }

        Ok(MachineConfig {
            name,
            domain_generator,
            surface_generator,
            nco,
            download_dir,
            mesh_tolerance_km,
            keep_scratch: entry.keep_scratch.unwrap_or(false),
            publication_base_url: config
                .publication
                .and_then(|publication| publication.base_url)
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
        })
    }
}

/// Arguments passed to the domain generator when the config gives none.
pub fn default_domain_args() -> Vec<String> {
    [
        "--site", "{site}", "--lat", "{lat}", "--lon", "{lon}", "--dx", "0.01", "--dy", "0.01",
        "--output", "{output}",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// Arguments passed to the surface generator when the config gives none.
pub fn default_surface_args() -> Vec<String> {
    [
        "--res", "usrspec", "--grid", "{grid}", "--domain", "{domain}", "--source", "{source}",
        "--raw-dir", "{raw_dir}", "--output", "{output}", "{overrides}",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn tool_spec(entry: ToolEntry, default_args: Vec<String>, base_dir: Option<&Path>) -> ToolSpec {
    let program = if entry.program.contains('/') {
        resolve_path(&entry.program, base_dir)
    } else {
        PathBuf::from(&entry.program)
    };
    ToolSpec {
        program,
        args: entry.args.unwrap_or(default_args),
        env: entry.env,
        timeout: Duration::from_secs(entry.timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)),
    }
}

fn missing(machine: &str, field: &str) -> SitepackError {
    SitepackError::ConfigParse(format!("machine {machine}: missing {field}"))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(raw);
    match base_dir {
        Some(base) if path.is_relative() && !base.as_os_str().is_empty() => base.join(path),
        _ => path,
    }
}
