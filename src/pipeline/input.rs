//! Input handling: load a user-supplied path or URL, and sniff its format.
//!
//! The pipeline only ever sees bytes. Loading is for callers like the CLI;
//! sniffing runs inside the rasteriser so a mislabelled upload fails with
//! `UnsupportedFormat` before any backend touches it.

use crate::error::{InputError, ServiceError};
use image::ImageFormat;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes kept in `UnsupportedFormat` errors.
const MAGIC_LEN: usize = 8;

/// PDF readers accept a header anywhere in the first 1 KiB.
const PDF_HEADER_WINDOW: usize = 1024;

/// What a payload looks like from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    /// A single-page raster image.
    Image(ImageFormat),
}

/// Detect the document format from magic bytes.
pub fn sniff_format(bytes: &[u8]) -> Result<DocumentFormat, InputError> {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    if window.windows(5).any(|w| w == b"%PDF-") {
        return Ok(DocumentFormat::Pdf);
    }
    match image::guess_format(bytes) {
        Ok(
            f @ (ImageFormat::Png
            | ImageFormat::Jpeg
            | ImageFormat::Tiff
            | ImageFormat::Bmp
            | ImageFormat::Gif
            | ImageFormat::WebP),
        ) => Ok(DocumentFormat::Image(f)),
        _ => Err(InputError::UnsupportedFormat {
            magic: bytes[..bytes.len().min(MAGIC_LEN)].to_vec(),
        }),
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Read a local file or download a URL into memory.
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<Vec<u8>, ServiceError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(input).await
    }
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, ServiceError> {
    let path = PathBuf::from(path_str);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("Read {} bytes from {}", bytes.len(), path.display());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ServiceError::FileNotFound { path })
        }
        Err(source) => Err(ServiceError::ReadFailed { path, source }),
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, ServiceError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ServiceError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            ServiceError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ServiceError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(classify)?;

    if !response.status().is_success() {
        return Err(ServiceError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(classify)?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
