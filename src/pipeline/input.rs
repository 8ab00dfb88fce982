//! Input loading: read a local path or download an HTTP(S) URL into memory.
//!
//! The orchestrators work on bytes (the content hash is taken over them), so
//! unlike a path-based pipeline there is no temp file to keep alive. The
//! `%PDF` magic is checked here so callers get a meaningful error rather
//! than a pdfium failure deep inside rendering.

use crate::error::Ocr2MdError;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load the PDF named by `input` (path or URL).
pub async fn load_input(input: &str, timeout_secs: u64) -> Result<Vec<u8>, Ocr2MdError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Ocr2MdError::InvalidInput {
            input: input.to_string(),
        });
    }

    let bytes = if is_url(trimmed) {
        download_url(trimmed, timeout_secs).await?
    } else {
        read_local(Path::new(trimmed)).await?
    };
    check_magic(&bytes)?;
    Ok(bytes)
}

/// Reject anything that does not start with `%PDF`.
pub fn check_magic(bytes: &[u8]) -> Result<(), Ocr2MdError> {
    if bytes.starts_with(b"%PDF") {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    Err(Ocr2MdError::NotAPdf { magic })
}

async fn read_local(path: &Path) -> Result<Vec<u8>, Ocr2MdError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Ocr2MdError::FileNotFound {
            path: path.display().to_string(),
        }),
        Err(e) => Err(Ocr2MdError::Internal(format!(
            "Failed to read '{}': {e}",
            path.display()
        ))),
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, Ocr2MdError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Ocr2MdError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let map_send = |e: reqwest::Error| {
        if e.is_timeout() {
            Ocr2MdError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            Ocr2MdError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(map_send)?;
    if !response.status().is_success() {
        return Err(Ocr2MdError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(map_send)?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn magic_check() {
        assert!(check_magic(b"%PDF-1.7\n").is_ok());
        assert!(matches!(
            check_magic(b"PK\x03\x04rest"),
            Err(Ocr2MdError::NotAPdf { magic }) if &magic == b"PK\x03\x04"
        ));
        assert!(check_magic(b"%P").is_err());
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let err = load_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, Ocr2MdError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn local_file_loads_and_is_checked() {
        let mut pdf = tempfile::NamedTempFile::new().unwrap();
        pdf.write_all(b"%PDF-1.4 fake body").unwrap();
        let bytes = load_input(pdf.path().to_str().unwrap(), 5).await.unwrap();
        assert!(bytes.starts_with(b"%PDF"));

        let mut txt = tempfile::NamedTempFile::new().unwrap();
        txt.write_all(b"hello world").unwrap();
        let err = load_input(txt.path().to_str().unwrap(), 5).await.unwrap_err();
        assert!(matches!(err, Ocr2MdError::NotAPdf { .. }));
    }

    #[tokio::test]
    async fn blank_input_is_invalid() {
        assert!(matches!(
            load_input("  ", 5).await,
            Err(Ocr2MdError::InvalidInput { .. })
        ));
    }
}
