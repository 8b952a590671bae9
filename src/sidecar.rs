//! Content-addressed store for extracted text.
//!
//! Each blob lives at `<dir>/<hh>/<hash>.txt.gz`, where `hh` is the first two
//! characters of the content hash. Writes go to a temporary file in the shard
//! directory and are renamed into place, so a reader sees either the whole
//! blob or nothing.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::identity;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    #[error("sidecar not found: {0}")]
    NotFound(String),

    #[error("sidecar I/O error for {hash}: {source}")]
    Io {
        hash: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SidecarStore {
    dir: PathBuf,
}

impl SidecarStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, hash: &str) -> Result<PathBuf, SidecarError> {
        if !identity::is_content_hash(hash) {
            return Err(SidecarError::InvalidHash(hash.to_string()));
        }
        Ok(self.dir.join(&hash[..2]).join(format!("{}.txt.gz", hash)))
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.path_for(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Write `text` for `hash`, replacing any existing blob.
    pub fn write(&self, hash: &str, text: &str) -> Result<PathBuf, SidecarError> {
        let target = self.path_for(hash)?;
        let io_err = |source| SidecarError::Io {
            hash: hash.to_string(),
            source,
        };

        let shard = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir.clone());
        std::fs::create_dir_all(&shard).map_err(io_err)?;

        let tmp = NamedTempFile::new_in(&shard).map_err(io_err)?;
        let mut encoder = GzEncoder::new(tmp, Compression::default());
        encoder.write_all(text.as_bytes()).map_err(io_err)?;
        let tmp = encoder.finish().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&target).map_err(|e| io_err(e.error))?;

        tracing::debug!(hash, path = %target.display(), bytes = text.len(), "sidecar written");
        Ok(target)
    }

    pub fn read(&self, hash: &str) -> Result<String, SidecarError> {
        let path = self.path_for(hash)?;
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SidecarError::NotFound(hash.to_string()))
            }
            Err(e) => {
                return Err(SidecarError::Io {
                    hash: hash.to_string(),
                    source: e,
                })
            }
        };

        let mut text = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut text)
            .map_err(|source| SidecarError::Io {
                hash: hash.to_string(),
                source,
            })?;
        Ok(text)
    }
}
