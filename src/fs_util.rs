use std::fs;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use crate::error::SitepackError;

/// Decompresses a gzip file next to its final location, then renames it in.
pub fn gunzip_file(gz_path: &Path, target: &Path) -> Result<(), SitepackError> {
    let file = fs::File::open(gz_path)
        .map_err(|err| SitepackError::Filesystem(format!("open gz {}: {err}", gz_path.display())))?;
    let parent = target
        .parent()
        .ok_or_else(|| SitepackError::Filesystem("invalid gunzip target".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| SitepackError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("sitepack-gunzip")
        .tempfile_in(parent)
        .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
    let mut decoder = GzDecoder::new(file);
    io::copy(&mut decoder, temp.as_file_mut()).map_err(|err| {
        SitepackError::Filesystem(format!("decompress {}: {err}", gz_path.display()))
    })?;
    temp.persist(target)
        .map_err(|err| SitepackError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Streams a file through SHA-256 and returns the lowercase hex digest and
/// the byte count.
pub fn sha256_file(path: &Path) -> Result<(String, u64), SitepackError> {
    let file = fs::File::open(path)
        .map_err(|err| SitepackError::Filesystem(format!("open {}: {err}", path.display())))?;
    sha256_reader(file)
        .map_err(|err| SitepackError::Filesystem(format!("read {}: {err}", path.display())))
}

pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

pub fn sha256_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
