//! Destination for exported files.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to write outside the export root: {0}")]
    InvalidPath(String),
}

/// One emitted file: its contents and path relative to the export root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportItem {
    pub bytes: Bytes,
    pub path: String,
}

impl ExportItem {
    pub fn new(bytes: impl Into<Bytes>, path: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            path: path.into(),
        }
    }
}

/// Durable storage for exported files
#[async_trait]
pub trait Sink: Send + Sync {
    /// Write `bytes` at `path` relative to the sink root, creating parent
    /// directories as needed
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SinkError>;
}

/// Writes files under a local directory
#[derive(Debug, Clone)]
pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SinkError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|component| {
            !matches!(component, std::path::Component::Normal(_) | std::path::Component::CurDir)
        });
        if path.is_empty() || escapes {
            return Err(SinkError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Sink for LocalSink {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SinkError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&full_path, bytes)
            .await
            .map_err(|source| SinkError::Io {
                path: full_path.clone(),
                source,
            })?;
        trace!(path = %full_path.display(), size_bytes = bytes.len(), "Wrote file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path());

        sink.write("000000000001/data/camera1/000000000000.jpg", b"jpeg")
            .await
            .unwrap();

        let written = dir.path().join("000000000001/data/camera1/000000000000.jpg");
        assert_eq!(std::fs::read(written).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn test_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path());
        sink.write("classes.txt", b"car").await.unwrap();
        sink.write("classes.txt", b"bus").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("classes.txt")).unwrap(), b"bus");
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let sink = LocalSink::new(dir.path());
        assert!(matches!(
            sink.write("../outside.txt", b"x").await,
            Err(SinkError::InvalidPath(_))
        ));
        assert!(matches!(
            sink.write("/etc/passwd", b"x").await,
            Err(SinkError::InvalidPath(_))
        ));
    }
}
