use serde::{Serialize, Deserialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UploadedImage {
    pub file_name: String,
    pub mime_type: String,
    pub encoded_data: String, // base64, no data-URL header
    pub size_bytes: usize,
}

impl UploadedImage {
    pub fn as_image_data(&self) -> ImageData {
        ImageData { data: self.encoded_data.clone(), mime_type: self.mime_type.clone() }
    }
}

/// A single reference image as it is sent to the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImageData {
    pub data: String,
    pub mime_type: String,
}

/// One generate action. Shared read-only by every sub-request of the batch.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub reference_images: Vec<ImageData>,
    pub prompt: String,
    pub requested_count: usize,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct StateSnapshot {
    pub id: Uuid,
    pub uploaded_images: Vec<UploadedImage>,
    pub prompt: String,
    pub generated_images: Vec<String>,
    pub is_generating: bool,
    pub error_message: Option<String>,
    pub selected_preview: Option<String>,
    pub generation_count: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptRequest {
    pub prompt: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewRequest {
    pub index: usize,
}
