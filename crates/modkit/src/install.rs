//! Archive verification and atomic installation
//!
//! Extraction happens in a staging directory; the install is published with
//! a single rename so the host never observes a partially extracted mod.

use std::path::{Path, PathBuf};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::AsyncReadExt;
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::archive::ArchiveEngine;
use crate::error::{FileOperation, ModError, Result};

/// Compute the xxHash64 digest of a file, base64-encoded little-endian,
/// streaming so large archives never sit in memory
pub async fn file_digest(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ModError::io(path, FileOperation::Read, e))?;
    let mut hasher = Xxh64::new(0);
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| ModError::io(path, FileOperation::Read, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(BASE64.encode(hasher.digest().to_le_bytes()))
}

/// Verify a downloaded archive against its published digest
///
/// A mismatch is a [`ModError::CorruptArtifact`]; the caller discards the
/// artifact and lets a later reconciliation pass re-derive the download.
pub async fn verify_archive(path: &Path, expected_digest: Option<&str>) -> Result<()> {
    let Some(expected) = expected_digest else {
        debug!("no digest published for {}, skipping verification", path.display());
        return Ok(());
    };
    let actual = file_digest(path).await?;
    if actual != expected {
        return Err(ModError::CorruptArtifact {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    debug!("archive digest verified for {}", path.display());
    Ok(())
}

/// Extract an archive into staging and atomically publish it at
/// `install_dir/<mod_dir_name>`. Returns the published path.
///
/// An existing install at the destination (an update) is swapped out only
/// after the new extraction fully succeeded.
pub async fn stage_and_publish(
    engine: &dyn ArchiveEngine,
    archive_path: &Path,
    staging_dir: &Path,
    install_dir: &Path,
    mod_dir_name: &str,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| ModError::io(staging_dir, FileOperation::CreateDir, e))?;
    tokio::fs::create_dir_all(install_dir)
        .await
        .map_err(|e| ModError::io(install_dir, FileOperation::CreateDir, e))?;

    // The staging dir lives on the same volume as the install dir's parent
    // tree, so the final publish is a rename, not a copy.
    let staged = tempfile::tempdir_in(staging_dir)
        .map_err(|e| ModError::io(staging_dir, FileOperation::CreateDir, e))?;
    engine.extract(archive_path, staged.path()).await?;

    let final_path = install_dir.join(mod_dir_name);
    if final_path.exists() {
        tokio::fs::remove_dir_all(&final_path)
            .await
            .map_err(|e| ModError::io(&final_path, FileOperation::Delete, e))?;
    }

    // Atomic publish: either the whole extraction appears, or nothing.
    let staged_path = staged.keep();
    tokio::fs::rename(&staged_path, &final_path)
        .await
        .map_err(|e| ModError::io(&final_path, FileOperation::Rename, e))?;

    debug!(
        "published {} to {}",
        archive_path.display(),
        final_path.display()
    );
    Ok(final_path)
}

/// Delete a mod's on-disk footprint: extracted files, archive, partials
pub async fn delete_mod_files(
    archive_path: Option<&Path>,
    extracted_path: Option<&Path>,
) -> Result<()> {
    if let Some(extracted) = extracted_path {
        if extracted.exists() {
            tokio::fs::remove_dir_all(extracted)
                .await
                .map_err(|e| ModError::io(extracted, FileOperation::Delete, e))?;
        }
    }
    if let Some(archive) = archive_path {
        if archive.exists() {
            tokio::fs::remove_file(archive)
                .await
                .map_err(|e| ModError::io(archive, FileOperation::Delete, e))?;
        }
        let partial = archive.with_extension("part");
        if partial.exists() {
            tokio::fs::remove_file(&partial).await.ok();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::GzipArchiveEngine;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn digest_of(data: &[u8]) -> String {
        let hash = xxhash_rust::xxh64::xxh64(data, 0);
        BASE64.encode(hash.to_le_bytes())
    }

    #[tokio::test]
    async fn verification_accepts_matching_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mod.archive");
        tokio::fs::write(&path, b"archive data").await.unwrap();

        verify_archive(&path, Some(&digest_of(b"archive data")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verification_rejects_corrupt_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mod.archive");
        tokio::fs::write(&path, b"tampered data").await.unwrap();

        let result = verify_archive(&path, Some(&digest_of(b"archive data"))).await;
        assert!(matches!(result, Err(ModError::CorruptArtifact { .. })));
    }

    #[tokio::test]
    async fn publish_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod-1.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"extracted contents").unwrap();
        tokio::fs::write(&archive, encoder.finish().unwrap())
            .await
            .unwrap();

        let staging = dir.path().join("staging");
        let install = dir.path().join("mods");
        let published = stage_and_publish(
            &GzipArchiveEngine::new(),
            &archive,
            &staging,
            &install,
            "mod-1",
        )
        .await
        .unwrap();

        assert_eq!(published, install.join("mod-1"));
        assert_eq!(
            tokio::fs::read(published.join("mod-1")).await.unwrap(),
            b"extracted contents"
        );
        // Nothing half-extracted remains in staging.
        let mut leftovers = tokio::fs::read_dir(&staging).await.unwrap();
        assert!(leftovers.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_extraction_leaves_no_published_install() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("broken.gz");
        tokio::fs::write(&archive, b"not gzip at all").await.unwrap();

        let staging = dir.path().join("staging");
        let install = dir.path().join("mods");
        let result = stage_and_publish(
            &GzipArchiveEngine::new(),
            &archive,
            &staging,
            &install,
            "broken",
        )
        .await;

        assert!(result.is_err());
        assert!(!install.join("broken").exists());
    }

    #[tokio::test]
    async fn delete_removes_archive_partial_and_extraction() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mod.archive");
        let partial = dir.path().join("mod.part");
        let extracted = dir.path().join("mod");
        tokio::fs::write(&archive, b"a").await.unwrap();
        tokio::fs::write(&partial, b"p").await.unwrap();
        tokio::fs::create_dir_all(&extracted).await.unwrap();

        delete_mod_files(Some(&archive), Some(&extracted))
            .await
            .unwrap();
        assert!(!archive.exists());
        assert!(!partial.exists());
        assert!(!extracted.exists());
    }
}
