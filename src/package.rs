//! All-or-nothing site package: a tar archive of the generated artifacts plus
//! a checksummed manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::domain::{Coordinate, DatasetCategory, OutputProfile, SiteId, StreamGroup, VersionTag};
use crate::error::SitepackError;
use crate::fs_util::{sha256_file, sha256_reader};
use crate::locator::{DatasetOrigin, ResolvedDataset};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Domain,
    Surface,
    Forcing,
    Ancillary,
    Parameter,
    Scrip,
    Mapping,
}

/// One file headed for the archive. `relative_path` is relative to the
/// archive's `inputdata/` root.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifact {
    pub kind: ArtifactKind,
    pub category: Option<DatasetCategory>,
    pub group: Option<StreamGroup>,
    pub relative_path: String,
    pub path: PathBuf,
    pub produced_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<DatasetCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<StreamGroup>,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub produced_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub category: DatasetCategory,
    pub source: String,
    pub downloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub site_id: SiteId,
    pub version: VersionTag,
    pub archive: String,
    pub coordinate: Coordinate,
    pub artifacts: Vec<ManifestEntry>,
    pub provenance: Vec<Provenance>,
    pub generated_at: String,
}

impl Manifest {
    pub fn file_name(site: &SiteId) -> String {
        format!("manifest_{site}.json")
    }

    pub fn entry(&self, kind: ArtifactKind) -> Option<&ManifestEntry> {
        self.artifacts.iter().find(|entry| entry.kind == kind)
    }
}

/// A finished archive waiting in a temporary file until publication.
pub struct StagedPackage {
    pub manifest: Manifest,
    destination: Utf8PathBuf,
    staged: NamedTempFile,
}

impl StagedPackage {
    pub fn destination(&self) -> &Utf8PathBuf {
        &self.destination
    }

    /// Moves the archive into place with a single rename.
    pub fn publish(self) -> Result<PathBuf, SitepackError> {
        let destination = self.destination.into_std_path_buf();
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        }
        self.staged
            .persist(&destination)
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        info!(archive = %destination.display(), "published site package");
        Ok(destination)
    }
}

pub struct PackageBuilder {
    site_id: SiteId,
    version: VersionTag,
    coordinate: Coordinate,
    profile: OutputProfile,
    artifacts: Vec<GeneratedArtifact>,
    provenance: Vec<Provenance>,
}

impl PackageBuilder {
    pub fn new(
        site_id: SiteId,
        version: VersionTag,
        coordinate: Coordinate,
        profile: OutputProfile,
    ) -> Self {
        Self {
            site_id,
            version,
            coordinate,
            profile,
            artifacts: Vec::new(),
            provenance: Vec::new(),
        }
    }

    pub fn add(&mut self, artifact: GeneratedArtifact) {
        self.artifacts.push(artifact);
    }

    pub fn record_sources(&mut self, datasets: &[ResolvedDataset]) {
        self.provenance.extend(datasets.iter().map(|dataset| Provenance {
            category: dataset.category,
            source: dataset.origin.describe().to_string(),
            downloaded: matches!(dataset.origin, DatasetOrigin::Downloaded { .. }),
        }));
        self.provenance.sort_by_key(|entry| entry.category);
    }

    /// Names every required artifact that has not been added.
    pub fn missing(&self) -> Vec<String> {
        let mut missing = Vec::new();
        let has_kind = |kind: ArtifactKind| self.artifacts.iter().any(|a| a.kind == kind);
        if !has_kind(ArtifactKind::Domain) {
            missing.push("domain".to_string());
        }
        if !has_kind(ArtifactKind::Surface) {
            missing.push("surface".to_string());
        }
        for group in StreamGroup::ALL {
            let present = self
                .artifacts
                .iter()
                .any(|a| a.kind == ArtifactKind::Forcing && a.group == Some(group));
            if !present {
                missing.push(format!("forcing {group}"));
            }
        }
        for category in self.profile.required_categories() {
            if !category.is_ancillary() {
                continue;
            }
            let present = self
                .artifacts
                .iter()
                .any(|a| a.kind == ArtifactKind::Ancillary && a.category == Some(*category));
            if !present {
                missing.push(category.to_string());
            }
        }
        missing
    }

    /// Checksums every artifact and writes the archive to a temporary file in
    /// `staging_dir`, which must share a filesystem with the output tree.
    /// Fails without side effects if a required artifact is missing.
    pub fn build(
        mut self,
        store: &Store,
        staging_dir: &Path,
        generated_at: DateTime<Utc>,
    ) -> Result<StagedPackage, SitepackError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(SitepackError::IncompletePackage { missing });
        }
        self.artifacts
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let mut seen = BTreeSet::new();
        for artifact in &self.artifacts {
            if !seen.insert(artifact.relative_path.as_str()) {
                return Err(SitepackError::Filesystem(format!(
                    "two artifacts map to {}",
                    artifact.relative_path
                )));
            }
        }

        let mut entries = Vec::with_capacity(self.artifacts.len());
        for artifact in &self.artifacts {
            let (sha256, bytes) = sha256_file(&artifact.path)?;
            entries.push(ManifestEntry {
                kind: artifact.kind,
                category: artifact.category,
                group: artifact.group,
                path: artifact.relative_path.clone(),
                sha256,
                bytes,
                produced_by: artifact.produced_by.clone(),
            });
        }

        let archive = Store::archive_name(&self.site_id, &self.version);
        let manifest = Manifest {
            site_id: self.site_id.clone(),
            version: self.version.clone(),
            archive: archive.clone(),
            coordinate: self.coordinate,
            artifacts: entries,
            provenance: self.provenance.clone(),
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;

        let destination = store.archive_path(&self.site_id, &self.version);
        let staged = tempfile::Builder::new()
            .prefix(".sitepack-archive")
            .tempfile_in(staging_dir)
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;

        let mtime = u64::try_from(generated_at.timestamp()).unwrap_or(0);
        let mut builder = tar::Builder::new(staged.as_file());
        for artifact in &self.artifacts {
            let file = File::open(&artifact.path)
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
            let size = file
                .metadata()
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?
                .len();
            let path = format!("inputdata/{}", artifact.relative_path);
            append_entry(&mut builder, &path, size, mtime, file)?;
        }
        let manifest_path = format!("inputdata/{}", Manifest::file_name(&self.site_id));
        append_entry(
            &mut builder,
            &manifest_path,
            manifest_bytes.len() as u64,
            mtime,
            manifest_bytes.as_slice(),
        )?;
        builder
            .finish()
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        drop(builder);

        info!(
            site = %self.site_id,
            artifacts = manifest.artifacts.len(),
            archive = %archive,
            "staged site package"
        );
        Ok(StagedPackage {
            manifest,
            destination,
            staged,
        })
    }
}

fn append_entry<W: std::io::Write, R: Read>(
    builder: &mut tar::Builder<W>,
    path: &str,
    size: u64,
    mtime: u64,
    data: R,
) -> Result<(), SitepackError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, path, data)
        .map_err(|err| SitepackError::Filesystem(format!("archive {path}: {err}")))
}

/// Reads the manifest back out of a published archive.
pub fn read_manifest(archive: &Path) -> Result<Manifest, SitepackError> {
    let file = File::open(archive)
        .map_err(|err| SitepackError::Filesystem(format!("open {}: {err}", archive.display())))?;
    let mut tar = tar::Archive::new(file);
    let entries = tar
        .entries()
        .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?
            .to_string_lossy()
            .to_string();
        let is_manifest = path
            .rsplit('/')
            .next()
            .map(|name| name.starts_with("manifest_") && name.ends_with(".json"))
            .unwrap_or(false);
        if is_manifest {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
            return serde_json::from_str(&content)
                .map_err(|err| SitepackError::InconsistentMetadata(format!("manifest: {err}")));
        }
    }
    Err(SitepackError::InconsistentMetadata(format!(
        "{} contains no manifest",
        archive.display()
    )))
}

/// Reads a published archive and checks every entry against its manifest:
/// each listed artifact must be present with the recorded size and digest,
/// and nothing unlisted may be packed beside them.
pub fn verify_archive(archive: &Path) -> Result<Manifest, SitepackError> {
    let manifest = read_manifest(archive)?;
    let manifest_path = format!("inputdata/{}", Manifest::file_name(&manifest.site_id));
    let file = File::open(archive)
        .map_err(|err| SitepackError::Filesystem(format!("open {}: {err}", archive.display())))?;
    let mut tar = tar::Archive::new(file);
    let entries = tar
        .entries()
        .map_err(|err| SitepackError::Filesystem(err.to_string()))?;

    let mut packed = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|err| SitepackError::Filesystem(err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| SitepackError::Filesystem(err.to_string()))?
            .to_string_lossy()
            .to_string();
        if path == manifest_path {
            continue;
        }
        let digest = sha256_reader(entry)
            .map_err(|err| SitepackError::Filesystem(format!("read {path}: {err}")))?;
        packed.insert(path, digest);
    }

    let inconsistent = |detail: String| {
        SitepackError::InconsistentMetadata(format!("{}: {detail}", archive.display()))
    };
    for artifact in &manifest.artifacts {
        let path = format!("inputdata/{}", artifact.path);
        let (sha256, bytes) = packed
            .remove(&path)
            .ok_or_else(|| inconsistent(format!("{path} listed in manifest but not packed")))?;
        if bytes != artifact.bytes {
            return Err(inconsistent(format!(
                "{path} is {bytes} bytes, manifest records {}",
                artifact.bytes
            )));
        }
        if sha256 != artifact.sha256 {
            return Err(inconsistent(format!("{path} checksum does not match manifest")));
        }
    }
    if let Some(extra) = packed.keys().next() {
        return Err(inconsistent(format!("{extra} is packed but not in the manifest")));
    }
    Ok(manifest)
}
