use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{info, error};
use uuid::Uuid;

use crate::encoder::{self, EncodeError, FileHandle};
use crate::models::{ImageData, StateSnapshot, UploadedImage};
use crate::orchestrator::{BatchOrchestrator, GenerationError};

pub const UPLOAD_FAILED_MESSAGE: &str = "Failed to read image file(s).";
pub const MISSING_INPUT_MESSAGE: &str = "Please upload at least one image and enter a prompt.";
pub const INTERRUPTED_MESSAGE: &str = "Error: Generation was interrupted before it finished.";

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("upload failed: {0}")] Upload(#[from] EncodeError),
    #[error("missing input: {0}")] MissingInput(&'static str),
    #[error("a generation is already in progress")] AlreadyGenerating,
    #[error(transparent)] Generation(#[from] GenerationError),
}

#[derive(Debug, Default, Clone)]
pub struct ApplicationState {
    pub uploaded_images: Vec<UploadedImage>,
    pub prompt: String,
    pub generated_images: Vec<String>,
    pub is_generating: bool,
    pub error_message: Option<String>,
    pub selected_preview: Option<String>,
}

/// One user's editing session. All state transitions go through here.
pub struct Studio {
    id: Uuid,
    state: RwLock<ApplicationState>,
    orchestrator: Arc<BatchOrchestrator>,
    generation_count: usize,
    last_active: Mutex<Instant>,
}

/// Resets `is_generating` if a batch future is dropped before it reports back.
struct GeneratingGuard<'a> {
    state: &'a RwLock<ApplicationState>,
    armed: bool,
}

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut s = self.state.write();
            s.is_generating = false;
            s.error_message = Some(INTERRUPTED_MESSAGE.to_string());
        }
    }
}

impl Studio {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, generation_count: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RwLock::new(ApplicationState::default()),
            orchestrator,
            generation_count: generation_count.max(1),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid { self.id }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }

    pub fn is_generating(&self) -> bool { self.state.read().is_generating }

    pub fn snapshot(&self) -> StateSnapshot {
        let s = self.state.read();
        StateSnapshot {
            id: self.id,
            uploaded_images: s.uploaded_images.clone(),
            prompt: s.prompt.clone(),
            generated_images: s.generated_images.clone(),
            is_generating: s.is_generating,
            error_message: s.error_message.clone(),
            selected_preview: s.selected_preview.clone(),
            generation_count: self.generation_count,
        }
    }

    /// Encodes every file concurrently. Any failure rejects the whole batch and
    /// leaves the existing uploads alone.
    pub async fn upload_images(&self, files: Vec<Box<dyn FileHandle>>) -> Result<usize, StudioError> {
        let handles: Vec<_> = files
            .into_iter()
            .map(|file| tokio::spawn(async move { encoder::encode_upload(file.as_ref()).await }))
            .collect();

        let mut encoded = Vec::with_capacity(handles.len());
        let mut failure = None;
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| EncodeError::Read(std::io::Error::other(e.to_string())))
                .and_then(|r| r);
            match result {
                Ok(image) => encoded.push(image),
                Err(e) if failure.is_none() => failure = Some(e),
                Err(_) => {}
            }
        }

        let mut s = self.state.write();
        if let Some(e) = failure {
            error!("❌ [{}] Failed to read image file(s): {}", self.id, e);
            s.error_message = Some(UPLOAD_FAILED_MESSAGE.to_string());
            return Err(StudioError::Upload(e));
        }

        let added = encoded.len();
        s.uploaded_images.extend(encoded);
        s.generated_images.clear();
        s.error_message = None;
        info!("📥 [{}] Uploaded {} image(s), {} total", self.id, added, s.uploaded_images.len());
        Ok(added)
    }

    pub fn clear_images(&self) {
        self.state.write().uploaded_images.clear();
    }

    pub fn set_prompt(&self, text: impl Into<String>) {
        self.state.write().prompt = text.into();
    }

    /// Runs one batch. The outcome is recorded in the state either way; the
    /// returned error mirrors `error_message`. A second call while a batch is
    /// in flight is refused with `AlreadyGenerating` and changes nothing.
    pub async fn generate(&self) -> Result<usize, StudioError> {
        let (images, prompt): (Vec<ImageData>, String) = {
            let mut s = self.state.write();
            if s.is_generating {
                return Err(StudioError::AlreadyGenerating);
            }
            if s.uploaded_images.is_empty() || s.prompt.is_empty() {
                s.error_message = Some(MISSING_INPUT_MESSAGE.to_string());
                return Err(StudioError::MissingInput(MISSING_INPUT_MESSAGE));
            }
            s.is_generating = true;
            s.error_message = None;
            s.generated_images.clear();
            (s.uploaded_images.iter().map(UploadedImage::as_image_data).collect(), s.prompt.clone())
        };

        let mut guard = GeneratingGuard { state: &self.state, armed: true };

        info!("🎯 [{}] Generating {} variations for prompt: {}", self.id, self.generation_count, prompt);
        let result = self.orchestrator.generate_edits(&images, &prompt, self.generation_count).await;

        guard.armed = false;
        let mut s = self.state.write();
        s.is_generating = false;
        match result {
            Ok(images) => {
                let count = images.len();
                s.generated_images = images;
                info!("✅ [{}] Generated {} images", self.id, count);
                Ok(count)
            }
            Err(e) => {
                error!("❌ [{}] Generation failed: {}", self.id, e);
                s.error_message = Some(format!("Error: {}", e));
                Err(e.into())
            }
        }
    }

    pub fn select_preview(&self, image: String) {
        self.state.write().selected_preview = Some(image);
    }

    pub fn close_preview(&self) {
        self.state.write().selected_preview = None;
    }
}
