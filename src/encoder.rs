//! Turns user-supplied image files into base64 payloads for the model.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::models::UploadedImage;

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to read file: {0}")] Read(#[from] std::io::Error),
    #[error("malformed data URL: {0}")] Malformed(String),
}

/// A binary file handed over by the browser.
#[async_trait]
pub trait FileHandle: Send + Sync {
    fn file_name(&self) -> &str;
    /// Declared content type, if the client sent one.
    fn content_type(&self) -> Option<&str>;
    async fn read_all(&self) -> std::io::Result<Bytes>;
}

/// A file that already sits in memory, e.g. a multipart field.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    pub name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[async_trait]
impl FileHandle for MemoryFile {
    fn file_name(&self) -> &str { &self.name }

    fn content_type(&self) -> Option<&str> { self.content_type.as_deref() }

    async fn read_all(&self) -> std::io::Result<Bytes> { Ok(self.bytes.clone()) }
}

/// Splits `data:<mime>;base64,<payload>` into its mime type and payload.
pub fn split_data_url(url: &str) -> Result<(&str, &str), EncodeError> {
    let (header, payload) = url
        .split_once(',')
        .ok_or_else(|| EncodeError::Malformed("missing ',' separator".into()))?;
    let mime = header
        .strip_prefix("data:")
        .and_then(|h| h.strip_suffix(";base64"))
        .ok_or_else(|| EncodeError::Malformed(format!("unexpected header '{}'", header)))?;
    if payload.is_empty() {
        return Err(EncodeError::Malformed("empty payload".into()));
    }
    Ok((mime, payload))
}

fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn resolve_mime(declared: Option<&str>, bytes: &[u8]) -> String {
    match declared {
        Some(m) if !m.is_empty() && m != FALLBACK_MIME => m.to_string(),
        _ => image::guess_format(bytes)
            .map(|f| f.to_mime_type().to_string())
            .unwrap_or_else(|_| FALLBACK_MIME.to_string()),
    }
}

async fn read_and_encode(file: &dyn FileHandle) -> Result<(Bytes, String, String), EncodeError> {
    let bytes = file.read_all().await?;
    let mime = resolve_mime(file.content_type(), &bytes);
    let url = to_data_url(&mime, &bytes);
    let payload = split_data_url(&url)?.1.to_string();
    Ok((bytes, mime, payload))
}

/// Reads the whole file; `encoded_data` is the base64 payload without the data-URL header.
pub async fn encode_upload(file: &dyn FileHandle) -> Result<UploadedImage, EncodeError> {
    let (bytes, mime_type, encoded_data) = read_and_encode(file).await?;
    debug!("Encoded '{}' ({}, {} bytes)", file.file_name(), mime_type, bytes.len());
    Ok(UploadedImage {
        file_name: file.file_name().to_string(),
        mime_type,
        encoded_data,
        size_bytes: bytes.len(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) const PNG_HEADER: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    pub(crate) fn memory_file(name: &str, content_type: Option<&str>, bytes: &[u8]) -> MemoryFile {
        MemoryFile { name: name.into(), content_type: content_type.map(String::from), bytes: Bytes::copy_from_slice(bytes) }
    }

    pub(crate) struct BrokenFile;

    #[async_trait]
    impl FileHandle for BrokenFile {
        fn file_name(&self) -> &str { "broken.png" }
        fn content_type(&self) -> Option<&str> { Some("image/png") }
        async fn read_all(&self) -> std::io::Result<Bytes> {
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated"))
        }
    }

    #[tokio::test]
    async fn encode_strips_header_and_is_deterministic() {
        let file = memory_file("a.png", Some("image/png"), b"hello world");
        let first = encode_upload(&file).await.unwrap().encoded_data;
        let second = encode_upload(&file).await.unwrap().encoded_data;
        assert_eq!(first, "aGVsbG8gd29ybGQ=");
        assert_eq!(first, second);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
    }

    #[tokio::test]
    async fn empty_file_is_malformed() {
        let file = memory_file("empty.png", Some("image/png"), b"");
        assert!(matches!(encode_upload(&file).await, Err(EncodeError::Malformed(_))));
    }

    #[tokio::test]
    async fn read_failure_surfaces_as_read_error() {
        assert!(matches!(encode_upload(&BrokenFile).await, Err(EncodeError::Read(_))));
    }

    #[tokio::test]
    async fn missing_content_type_is_sniffed() {
        let mut bytes = PNG_HEADER.to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 13]);
        let upload = encode_upload(&memory_file("photo", None, &bytes)).await.unwrap();
        assert_eq!(upload.mime_type, "image/png");
        assert_eq!(upload.size_bytes, 12);

        let unknown = encode_upload(&memory_file("notes", Some(""), b"plain text")).await.unwrap();
        assert_eq!(unknown.mime_type, "application/octet-stream");
    }

    #[test]
    fn split_data_url_cases() {
        assert_eq!(split_data_url("data:image/jpeg;base64,/9j/4AAQ").unwrap(), ("image/jpeg", "/9j/4AAQ"));
        assert!(split_data_url("data:image/jpeg;base64").is_err());
        assert!(split_data_url("data:image/jpeg;base64,").is_err());
        assert!(split_data_url("image/jpeg,abc").is_err());
    }
}
