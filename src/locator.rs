use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::DatasetCategory;
use crate::error::SitepackError;
use crate::fs_util::{gunzip_file, sha256_bytes};
use crate::grid::GridDescriptor;
use crate::netcdf::NetcdfToolkit;
use crate::recipe::{SiteRecipe, SourceRef};

const MAX_ATTEMPTS: usize = 3;
const BASE_DELAY_MS: u64 = 200;

pub trait SourceFetcher {
    /// Downloads `url` to `destination`, replacing any existing file.
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), SitepackError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, SitepackError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("lsp-sitepack/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SitepackError::DownloadHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| SitepackError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SitepackError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .map(|body| body.chars().take(200).collect())
            .unwrap_or_else(|_| "download request failed".to_string());
        Err(SitepackError::DownloadStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, SitepackError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let mut attempt = 1usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_ATTEMPTS && is_retryable_status(status) {
                        warn!(status, attempt, "transient download status, retrying");
                        thread::sleep(backoff(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_ATTEMPTS && is_retryable_error(&err) {
                        warn!(error = %err, attempt, "transient download error, retrying");
                        thread::sleep(backoff(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Err(SitepackError::DownloadHttp(err.to_string()));
                }
            }
        }
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), SitepackError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let mut response = Self::handle_status(response)?;
        let parent = destination
            .parent()
            .ok_or_else(|| SitepackError::Filesystem("invalid download path".to_string()))?;
        fs::create_dir_all(parent).map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("sitepack-download")
            .tempfile_in(parent)
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, temp.as_file_mut())
            .map_err(|err| SitepackError::DownloadHttp(err.to_string()))?;
        temp.persist(destination)
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn backoff(attempt: usize) -> Duration {
    Duration::from_millis(BASE_DELAY_MS * attempt as u64)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetOrigin {
    Local { path: String },
    Downloaded { url: String },
}

impl DatasetOrigin {
    pub fn describe(&self) -> &str {
        match self {
            DatasetOrigin::Local { path } => path,
            DatasetOrigin::Downloaded { url } => url,
        }
    }
}

/// A dataset category bound to a concrete local file, or directory for the
/// atmospheric root.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDataset {
    pub category: DatasetCategory,
    pub path: PathBuf,
    pub origin: DatasetOrigin,
    pub grid: Option<GridDescriptor>,
}

impl ResolvedDataset {
    /// File stem of the original source, without `.gz` or `.nc`.
    pub fn source_stem(&self) -> String {
        let name = match &self.origin {
            DatasetOrigin::Local { .. } => self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            DatasetOrigin::Downloaded { url } => url
                .split(['?', '#'])
                .next()
                .unwrap_or(url)
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        let stem = name.strip_suffix(".nc").unwrap_or(name);
        if stem.is_empty() {
            self.category.to_string()
        } else {
            stem.to_string()
        }
    }
}

pub struct DatasetLocator<'a> {
    toolkit: &'a dyn NetcdfToolkit,
    fetcher: &'a dyn SourceFetcher,
    cache_dir: &'a Path,
}

impl<'a> DatasetLocator<'a> {
    pub fn new(
        toolkit: &'a dyn NetcdfToolkit,
        fetcher: &'a dyn SourceFetcher,
        cache_dir: &'a Path,
    ) -> Self {
        Self {
            toolkit,
            fetcher,
            cache_dir,
        }
    }

    /// Resolves every source named by the recipe, in category order.
    pub fn locate(&self, recipe: &SiteRecipe) -> Result<Vec<ResolvedDataset>, SitepackError> {
        recipe
            .sources
            .iter()
            .map(|(category, source)| self.resolve(*category, source))
            .collect()
    }

    pub fn resolve(
        &self,
        category: DatasetCategory,
        source: &SourceRef,
    ) -> Result<ResolvedDataset, SitepackError> {
        let not_found = || SitepackError::DatasetNotFound {
            category: category.to_string(),
            location: source.describe(),
        };
        let (path, origin) = match source {
            SourceRef::Local(path) => {
                let exists = if category == DatasetCategory::Atmosphere {
                    path.is_dir()
                } else {
                    path.is_file()
                };
                if !exists {
                    return Err(not_found());
                }
                let origin = DatasetOrigin::Local {
                    path: path.display().to_string(),
                };
                (path.clone(), origin)
            }
            SourceRef::Remote(url) => {
                let path = self.download(url).map_err(|err| {
                    warn!(category = %category, url = %url, error = %err, "download failed");
                    not_found()
                })?;
                (path, DatasetOrigin::Downloaded { url: url.clone() })
            }
        };

        let grid = if category == DatasetCategory::Atmosphere {
            None
        } else {
            let grid = self.toolkit.describe(&path)?;
            debug!(
                category = %category,
                kind = grid.kind(),
                spacing = ?grid.spacing(),
                origin = ?grid.origin(),
                calendar = ?grid.calendar,
                "read grid"
            );
            Some(grid)
        };
        Ok(ResolvedDataset {
            category,
            path,
            origin,
            grid,
        })
    }

    fn download(&self, url: &str) -> Result<PathBuf, SitepackError> {
        let (name, gzipped) = cache_file_name(url);
        let target = self.cache_dir.join(&name);
        if target.is_file() {
            info!(url = %url, path = %target.display(), "using cached download");
            return Ok(target);
        }
        info!(url = %url, "downloading");
        if gzipped {
            let gz_path = self.cache_dir.join(format!("{name}.gz"));
            self.fetcher.fetch(url, &gz_path)?;
            gunzip_file(&gz_path, &target)?;
            fs::remove_file(&gz_path).map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        } else {
            self.fetcher.fetch(url, &target)?;
        }
        Ok(target)
    }
}

/// Cache entry name for a URL: a short digest of the full URL keeps equally
/// named files from different hosts apart.
pub fn cache_file_name(url: &str) -> (String, bool) {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("download.nc");
    let (stem, gzipped) = match last.strip_suffix(".gz") {
        Some(stem) => (stem, true),
        None => (last, false),
    };
    let digest = sha256_bytes(url.as_bytes());
    (format!("{}-{stem}", &digest[..12]), gzipped)
}
