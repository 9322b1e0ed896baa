use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::{Builder, TempDir};

use crate::domain::{SiteId, VersionTag};
use crate::error::SitepackError;

/// Output tree of one run: published archives, metadata fragments and the
/// per-recipe scratch areas.
#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
}

impl Store {
    pub fn new(output_root: &Path) -> Result<Self, SitepackError> {
        let output_root = Utf8PathBuf::from_path_buf(output_root.to_path_buf())
            .map_err(|_| SitepackError::Filesystem("invalid output path".to_string()))?;
        Ok(Self { output_root })
    }

    /// Shared download cache used when the machine config sets none.
    pub fn default_cache_root() -> Result<Utf8PathBuf, SitepackError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("lsp-sitepack")).ok()
            })
            .ok_or_else(|| {
                SitepackError::Filesystem("unable to resolve cache directory".to_string())
            })
    }

    pub fn archive_name(site: &SiteId, version: &VersionTag) -> String {
        format!("inputdata_version{version}_{site}.tar")
    }

    pub fn archive_path(&self, site: &SiteId, version: &VersionTag) -> Utf8PathBuf {
        self.output_root
            .join("inputdata")
            .join(Self::archive_name(site, version))
    }

    pub fn metadata_dir(&self, site: &SiteId) -> Utf8PathBuf {
        self.output_root.join("site_metadata").join(site.as_str())
    }

    pub fn ensure_output_root(&self) -> Result<(), SitepackError> {
        fs::create_dir_all(self.output_root.as_std_path())
            .map_err(|err| SitepackError::Filesystem(err.to_string()))
    }

    /// Creates an isolated scratch directory inside the output root. It is
    /// removed when the returned handle drops unless `keep` is set.
    pub fn scratch(&self, site: &SiteId, keep: bool) -> Result<TempDir, SitepackError> {
        self.ensure_output_root()?;
        Builder::new()
            .prefix(&format!(".sitepack-{site}-"))
            .disable_cleanup(keep)
            .tempdir_in(self.output_root.as_std_path())
            .map_err(|err| SitepackError::Filesystem(err.to_string()))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SitepackError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file(source: &Path, dest: &Path) -> Result<(), SitepackError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        }
        fs::copy(source, dest).map_err(|err| {
            SitepackError::Filesystem(format!(
                "copy {} -> {}: {err}",
                source.display(),
                dest.display()
            ))
        })?;
        Ok(())
    }

    /// Replaces `dest` with the contents of `staged_dir` in one rename.
    pub fn publish_dir(staged_dir: &Path, dest: &Utf8Path) -> Result<(), SitepackError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        }
        atomic_rename_dir(staged_dir, dest.as_std_path())
            .map_err(|err| SitepackError::Filesystem(err.to_string()))
    }
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}
