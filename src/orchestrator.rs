//! Batch fan-out of edit requests against an [`ImageEditor`].
//!
//! Every sub-request carries the full set of reference images and the same
//! prompt. At most `max_concurrency` sub-requests are in flight; the rest wait
//! on a semaphore. Results come back indexed by submission order.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn, error};

use crate::config::API_KEY_VARS;
use crate::gemini::{preview, GeminiError, ImageEditor};
use crate::models::{GenerationRequest, ImageData};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")] Configuration(String),
    #[error("Failed to generate one or more images ({failed} of {requested} failed).")]
    Batch { failed: usize, requested: usize },
}

/// Outcome of a single sub-request.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Success(String),
    Failure(String),
}

impl EditOutcome {
    pub fn is_success(&self) -> bool { matches!(self, EditOutcome::Success(_)) }
}

#[derive(Debug, Clone)]
pub enum ApiKeySource {
    /// First non-empty variable wins; looked up on every batch.
    Env(Vec<String>),
    Static(String),
}

impl Default for ApiKeySource {
    fn default() -> Self {
        ApiKeySource::Env(API_KEY_VARS.iter().map(|v| v.to_string()).collect())
    }
}

impl ApiKeySource {
    pub fn resolve(&self) -> Result<String, GenerationError> {
        match self {
            ApiKeySource::Static(key) if !key.is_empty() => Ok(key.clone()),
            ApiKeySource::Static(_) => Err(GenerationError::Configuration("API key is empty.".into())),
            ApiKeySource::Env(names) => names
                .iter()
                .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
                .ok_or_else(|| GenerationError::Configuration(format!("{} environment variable not set.", names.join(" / ")))),
        }
    }
}

pub struct BatchOrchestrator {
    editor: Arc<dyn ImageEditor>,
    api_key: ApiKeySource,
    max_concurrency: usize,
    request_timeout: Option<Duration>,
}

impl BatchOrchestrator {
    pub fn new(editor: Arc<dyn ImageEditor>, api_key: ApiKeySource) -> Self {
        Self { editor, api_key, max_concurrency: crate::config::DEFAULT_MAX_CONCURRENCY, request_timeout: None }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// All-or-nothing: returns `count` images in submission order, or a
    /// `Batch` error if any sub-request failed.
    pub async fn generate_edits(&self, images: &[ImageData], prompt: &str, count: usize) -> Result<Vec<String>, GenerationError> {
        let outcomes = self.generate_edits_settled(images, prompt, count).await?;
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if failed > 0 {
            error!("❌ {} of {} generations failed, discarding the batch", failed, count);
            return Err(GenerationError::Batch { failed, requested: count });
        }
        Ok(outcomes
            .into_iter()
            .filter_map(|o| match o {
                EditOutcome::Success(image) => Some(image),
                EditOutcome::Failure(_) => None,
            })
            .collect())
    }

    /// Waits for every sub-request and reports each outcome at its submission index.
    pub async fn generate_edits_settled(&self, images: &[ImageData], prompt: &str, count: usize) -> Result<Vec<EditOutcome>, GenerationError> {
        let api_key: Arc<str> = self.api_key.resolve()?.into();
        let request = Arc::new(GenerationRequest {
            reference_images: images.to_vec(),
            prompt: prompt.to_string(),
            requested_count: count,
        });

        info!(
            "🚀 Generating {} edits from {} reference image(s), concurrency {}",
            request.requested_count, request.reference_images.len(), self.max_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let sem = Arc::clone(&semaphore);
            let editor = Arc::clone(&self.editor);
            let request = Arc::clone(&request);
            let api_key = Arc::clone(&api_key);
            let timeout = self.request_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| "semaphore closed".to_string())?;
                let call = editor.edit(&api_key, &request);
                let result: Result<String, GeminiError> = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => return Err(format!("timed out after {}s", limit.as_secs())),
                    },
                    None => call.await,
                };
                result.map_err(|e| e.to_string()).inspect(|image| {
                    info!("✅ Edit {} done: {}", i, preview(image));
                })
            }));
        }

        let mut outcomes = Vec::with_capacity(count);
        for (i, handle) in handles.into_iter().enumerate() {
            let outcome = match handle.await {
                Ok(Ok(image)) => EditOutcome::Success(image),
                Ok(Err(e)) => {
                    warn!("⚠️ Edit {} failed: {}", i, e);
                    EditOutcome::Failure(e)
                }
                Err(e) => {
                    warn!("⚠️ Edit {} task failed: {}", i, e);
                    EditOutcome::Failure(format!("task failed: {}", e))
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}
