use base64::Engine;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("image is not valid base64: {0}")] Decode(#[from] base64::DecodeError),
}

/// Attachment name for a downloaded variation, e.g. `creatorpic-generated-1700000000000.jpg`.
pub fn file_name(at: DateTime<Utc>) -> String {
    format!("creatorpic-generated-{}.jpg", at.timestamp_millis())
}

pub fn decode_image(encoded: &str) -> Result<Vec<u8>, DownloadError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded.trim())?)
}
