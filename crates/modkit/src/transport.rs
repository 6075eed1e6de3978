//! Transfer transport boundary with an HTTP implementation
//!
//! The byte-level protocol (chunking, retry policy) belongs to the
//! transport; the executor only sequences calls and interprets results.
//! Downloads stream to a `.part` artifact and publish by rename, resuming
//! from the partial offset via a Range request when permitted. Cancellation
//! is observed before each chunk is written, never mid-write.

use std::path::Path;
use std::sync::Arc;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::config::ModKitConfig;
use crate::error::{FileOperation, ModError, Result};

/// Progress callback: (bytes transferred so far, total if known)
pub type TransferCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Byte-transfer collaborator consumed by the job executor
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transfer `url` into `dest_path`, reporting progress and honoring
    /// cancellation at chunk boundaries. Returns the final byte count.
    async fn download(
        &self,
        url: &str,
        dest_path: &Path,
        progress: Option<TransferCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Upload one independently acknowledged chunk of a large artifact
    async fn upload_chunk(&self, url: &str, offset: u64, chunk: &[u8]) -> Result<()>;

    /// Whether a cancelled download leaves a resumable partial artifact
    fn supports_resume(&self) -> bool;
}

/// HTTP transport over reqwest with `.part` resume support
pub struct HttpTransport {
    client: Client,
    allow_resume: bool,
}

impl HttpTransport {
    pub fn new(config: &ModKitConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(ModError::from)?;
        Ok(Self {
            client,
            allow_resume: config.allow_resume,
        })
    }

    fn parse_url(url: &str) -> Result<url::Url> {
        let parsed = url::Url::parse(url).map_err(|e| ModError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ModError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        Ok(parsed)
    }

    async fn download_inner(
        &self,
        url: &str,
        dest_path: &Path,
        progress: Option<TransferCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        Self::parse_url(url)?;

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ModError::io(parent, FileOperation::CreateDir, e))?;
        }

        // Resume from an existing partial artifact when allowed.
        let temp_path = dest_path.with_extension("part");
        let start_byte = if self.allow_resume && temp_path.exists() {
            let size = fs::metadata(&temp_path)
                .await
                .map_err(|e| ModError::io(&temp_path, FileOperation::Metadata, e))?
                .len();
            debug!("found partial artifact, resuming from byte {}", size);
            size
        } else {
            0
        };

        let mut request = self.client.get(url);
        if start_byte > 0 {
            request = request.header("Range", format!("bytes={}-", start_byte));
        }
        let response = request.send().await?;
        let response = response.error_for_status()?;

        // A 200 to a Range request carries the full body; appending it to
        // the partial would corrupt the artifact. Restart from zero.
        let mut start_byte = start_byte;
        if start_byte > 0 && response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            debug!("server ignored Range request, restarting from byte 0");
            start_byte = 0;
        }

        let mut total_size = response.content_length();
        if let Some(size) = total_size {
            if start_byte > 0 {
                total_size = Some(start_byte + size);
            }
        }

        let mut file = if start_byte > 0 {
            fs::OpenOptions::new()
                .append(true)
                .open(&temp_path)
                .await
                .map_err(|e| ModError::io(&temp_path, FileOperation::Write, e))?
        } else {
            fs::File::create(&temp_path)
                .await
                .map_err(|e| ModError::io(&temp_path, FileOperation::Create, e))?
        };

        let mut stream = response.bytes_stream();
        let mut downloaded = start_byte;
        let mut last_report = std::time::Instant::now();

        while let Some(chunk_result) = stream.next().await {
            // Cancellation checkpoint: between chunks, never mid-write.
            if cancel.is_cancelled() {
                file.flush()
                    .await
                    .map_err(|e| ModError::io(&temp_path, FileOperation::Write, e))?;
                drop(file);
                if !self.allow_resume {
                    fs::remove_file(&temp_path).await.ok();
                }
                return Err(ModError::Cancelled {
                    reason: format!("download of '{url}' cancelled at byte {downloaded}"),
                });
            }

            let chunk = chunk_result?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ModError::io(&temp_path, FileOperation::Write, e))?;
            downloaded += chunk.len() as u64;

            // Throttle progress reports to roughly 100ms.
            if last_report.elapsed().as_millis() >= 100 {
                if let Some(ref callback) = progress {
                    callback(downloaded, total_size);
                }
                last_report = std::time::Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| ModError::io(&temp_path, FileOperation::Write, e))?;
        drop(file);

        fs::rename(&temp_path, dest_path)
            .await
            .map_err(|e| ModError::io(dest_path, FileOperation::Rename, e))?;

        if let Some(ref callback) = progress {
            callback(downloaded, total_size);
        }
        debug!("download completed: {} bytes", downloaded);
        Ok(downloaded)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download(
        &self,
        url: &str,
        dest_path: &Path,
        progress: Option<TransferCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.download_inner(url, dest_path, progress, cancel)
            .instrument(info_span!("http_download", url = %url))
            .await
    }

    async fn upload_chunk(&self, url: &str, offset: u64, chunk: &[u8]) -> Result<()> {
        Self::parse_url(url)?;
        let response = self
            .client
            .put(url)
            .header("Content-Range", format!("bytes {}-{}", offset, offset + chunk.len() as u64 - 1))
            .body(chunk.to_vec())
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }

    fn supports_resume(&self) -> bool {
        self.allow_resume
    }
}

/// Drive a chunked, per-chunk-acknowledged upload of a local artifact
///
/// Each chunk is independently acknowledged by the remote end; a failed
/// chunk surfaces to the caller, which may re-run the upload from scratch
/// or from the failing offset.
pub async fn upload_archive(
    transport: &dyn Transport,
    url: &str,
    archive_path: &Path,
    chunk_size: usize,
) -> Result<u64> {
    let mut file = fs::File::open(archive_path)
        .await
        .map_err(|e| ModError::io(archive_path, FileOperation::Read, e))?;

    // Stream one chunk at a time; the artifact may be far larger than memory.
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut offset = 0u64;
    loop {
        let mut filled = 0;
        while filled < buffer.len() {
            let read = file
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| ModError::io(archive_path, FileOperation::Read, e))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            break;
        }
        transport.upload_chunk(url, offset, &buffer[..filled]).await?;
        offset += filled as u64;
        if filled < buffer.len() {
            break;
        }
    }
    debug!("uploaded {} bytes in {} byte chunks", offset, chunk_size);
    Ok(offset)
}
