//! Archive engine boundary
//!
//! The raw extraction routine is a collaborator: hosts plug in their real
//! engine. The default implementation handles single-entry gzip payloads,
//! which is enough for the test fixtures and small mods.

use std::io::Read;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{FileOperation, ModError, Result};

/// Extracts a downloaded archive into a destination directory
#[async_trait]
pub trait ArchiveEngine: Send + Sync {
    async fn extract(&self, archive_path: &Path, dest_dir: &Path) -> Result<()>;
}

/// Default engine for single-entry gzip payloads
///
/// The compressed payload is written into `dest_dir` under the archive's
/// file stem.
#[derive(Debug, Default)]
pub struct GzipArchiveEngine;

impl GzipArchiveEngine {
    pub fn new() -> Self {
        Self
    }

    fn output_name(archive_path: &Path) -> PathBuf {
        let stem = archive_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "payload".into());
        PathBuf::from(stem)
    }
}

#[async_trait]
impl ArchiveEngine for GzipArchiveEngine {
    async fn extract(&self, archive_path: &Path, dest_dir: &Path) -> Result<()> {
        let archive_path = archive_path.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();

        // Decompression is CPU/blocking work; keep it off the runtime.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&archive_path)
                .map_err(|e| ModError::io(&archive_path, FileOperation::Read, e))?;
            let mut decoder = GzDecoder::new(file);
            let mut payload = Vec::new();
            decoder.read_to_end(&mut payload).map_err(|e| ModError::Archive {
                path: archive_path.clone(),
                reason: format!("gzip decode failed: {e}"),
            })?;

            std::fs::create_dir_all(&dest_dir)
                .map_err(|e| ModError::io(&dest_dir, FileOperation::CreateDir, e))?;
            let out_path = dest_dir.join(Self::output_name(&archive_path));
            std::fs::write(&out_path, payload)
                .map_err(|e| ModError::io(&out_path, FileOperation::Write, e))?;
            debug!("extracted {} to {}", archive_path.display(), out_path.display());
            Ok(())
        })
        .await
        .map_err(|e| ModError::Archive {
            path: PathBuf::new(),
            reason: format!("extraction task failed: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn extracts_gzip_payload_into_dest_dir() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod-1.gz");
        std::fs::write(&archive, gzip_bytes(b"mod contents")).unwrap();

        let dest = dir.path().join("out");
        GzipArchiveEngine::new().extract(&archive, &dest).await.unwrap();

        let extracted = std::fs::read(dest.join("mod-1")).unwrap();
        assert_eq!(extracted, b"mod contents");
    }

    #[tokio::test]
    async fn garbage_archive_is_an_archive_error() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("broken.gz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();

        let result = GzipArchiveEngine::new()
            .extract(&archive, &dir.path().join("out"))
            .await;
        assert!(matches!(result, Err(ModError::Archive { .. })));
    }
}
