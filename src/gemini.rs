use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, error, debug};

use crate::models::{GenerationRequest, ImageData};

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("HTTP error: {0}")] Http(String),
    #[error("API error: status={status} body={message}")] Api { status: u16, message: String },
    #[error("parse error: {0}")] Parse(String),
    #[error("no image data found in the Gemini API response")] NoImageInResponse,
}

/// Produces one edited image for a request. The orchestrator fans out over this.
#[async_trait]
pub trait ImageEditor: Send + Sync {
    async fn edit(&self, api_key: &str, request: &GenerationRequest) -> Result<String, GeminiError>;
}

/// Short form of a base64 payload for log lines.
pub fn preview(data: &str) -> String {
    match data.char_indices().nth(50) {
        Some((cut, _)) => format!("{}...[{} chars total]", &data[..cut], data.chars().count()),
        None => data.to_string(),
    }
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let serde_json::Value::String(s) = val {
                        if s.len() > 100 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=') {
                            *val = serde_json::Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn sniff_image_type(data: &str) -> &'static str {
    if data.starts_with("iVBORw0KGgo") {
        "PNG"
    } else if data.starts_with("/9j/") {
        "JPEG"
    } else if data.starts_with("UklGR") {
        "WEBP"
    } else {
        "Unknown"
    }
}

pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub fn build_edit_body(images: &[ImageData], prompt: &str) -> serde_json::Value {
        let mut parts: Vec<serde_json::Value> = images
            .iter()
            .map(|img| json!({"inlineData": {"data": img.data, "mimeType": img.mime_type}}))
            .collect();
        parts.push(json!({"text": prompt}));

        json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "responseModalities": ["IMAGE"]
            }
        })
    }

    async fn perform_api_call(&self, api_key: &str, request: &GenerationRequest) -> Result<String, GeminiError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        info!("🔗 Making request to: {}", url);

        let request_body = Self::build_edit_body(&request.reference_images, &request.prompt);
        if tracing::enabled!(tracing::Level::DEBUG) {
            let mut logged = request_body.clone();
            truncate_base64_in_json(&mut logged);
            debug!("📤 Request body: {}", serde_json::to_string_pretty(&logged).unwrap_or_default());
        }

        let response = self.client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GeminiError::Http(e.to_string()))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!("❌ API Error response: {}", error_body);
            return Err(GeminiError::Api { status: status.as_u16(), message: error_body });
        }

        let response_text = response.text().await
            .map_err(|e| GeminiError::Http(e.to_string()))?;

        let parsed: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| GeminiError::Parse(e.to_string()))?;

        match extract_first_image_b64(&parsed) {
            Some(image_data) => {
                info!("🖼️ Extracted {} image from API response: {}", sniff_image_type(&image_data), preview(&image_data));
                Ok(image_data)
            }
            None => {
                let mut logged = serde_json::from_str::<serde_json::Value>(&response_text).unwrap_or_default();
                truncate_base64_in_json(&mut logged);
                info!("⚠️ No image data found in API response: {}", logged);
                Err(GeminiError::NoImageInResponse)
            }
        }
    }
}

#[async_trait]
impl ImageEditor for GeminiClient {
    async fn edit(&self, api_key: &str, request: &GenerationRequest) -> Result<String, GeminiError> {
        self.perform_api_call(api_key, request).await
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate { #[serde(default)] content: Content }

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData
    },
    #[allow(dead_code)]
    Other(serde_json::Value)
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
}

/// Only the first candidate is consulted.
fn extract_first_image_b64(resp: &GeminiResponse) -> Option<String> {
    let candidate = resp.candidates.first()?;
    candidate.content.parts.iter().find_map(|p| match p {
        Part::Inline { inline_data } => {
            debug!("🎯 Found image data with mime type: {}", inline_data.mime_type);
            Some(inline_data.data.clone())
        }
        Part::Other(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use parking_lot::Mutex;

    fn parse(json: &str) -> GeminiResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn edit_body_lists_images_then_prompt() {
        let images = vec![
            ImageData { data: "AAA".into(), mime_type: "image/png".into() },
            ImageData { data: "BBB".into(), mime_type: "image/jpeg".into() },
        ];
        let body = GeminiClient::build_edit_body(&images, "make it sunny");
        assert_eq!(body, json!({
            "contents": [{ "parts": [
                {"inlineData": {"data": "AAA", "mimeType": "image/png"}},
                {"inlineData": {"data": "BBB", "mimeType": "image/jpeg"}},
                {"text": "make it sunny"}
            ]}],
            "generationConfig": { "responseModalities": ["IMAGE"] }
        }));
    }

    #[test]
    fn first_inline_part_of_first_candidate_wins() {
        let resp = parse(r#"{"candidates": [
            {"content": {"parts": [{"text": "here you go"}, {"inlineData": {"mimeType": "image/png", "data": "first"}}, {"inlineData": {"mimeType": "image/png", "data": "second"}}]}},
            {"content": {"parts": [{"inlineData": {"mimeType": "image/png", "data": "other"}}]}}
        ]}"#);
        assert_eq!(extract_first_image_b64(&resp).as_deref(), Some("first"));
    }

    #[test]
    fn later_candidates_are_ignored() {
        let resp = parse(r#"{"candidates": [
            {"content": {"parts": [{"text": "no image, sorry"}]}},
            {"content": {"parts": [{"inlineData": {"mimeType": "image/png", "data": "other"}}]}}
        ]}"#);
        assert_eq!(extract_first_image_b64(&resp), None);
    }

    #[test]
    fn empty_responses_have_no_image() {
        assert_eq!(extract_first_image_b64(&parse("{}")), None);
        assert_eq!(extract_first_image_b64(&parse(r#"{"candidates": [{"content": {"parts": []}}]}"#)), None);
        assert_eq!(extract_first_image_b64(&parse(r#"{"candidates": [{"finishReason": "IMAGE_SAFETY"}]}"#)), None);
    }

    #[test]
    fn preview_cuts_on_char_boundaries() {
        assert_eq!(preview("short"), "short");
        let ascii = "B".repeat(80);
        assert_eq!(preview(&ascii), format!("{}...[80 chars total]", "B".repeat(50)));

        // Byte 50 lands inside a multi-byte char.
        let odd = format!("{}é{}", "A".repeat(49), "Z".repeat(30));
        assert_eq!(preview(&odd), format!("{}é...[80 chars total]", "A".repeat(49)));
    }

    #[test]
    fn long_base64_is_truncated_for_logs() {
        let long = "A".repeat(200);
        let mut value = json!({"parts": [{"inlineData": {"data": long}}, {"text": "keep"}]});
        truncate_base64_in_json(&mut value);
        let data = value["parts"][0]["inlineData"]["data"].as_str().unwrap();
        assert!(data.ends_with("[truncated 150 chars]"));
        assert_eq!(value["parts"][1]["text"], "keep");
    }

    #[derive(Clone, Default)]
    struct Seen {
        key: Arc<Mutex<Option<String>>>,
        body: Arc<Mutex<Option<serde_json::Value>>>,
    }

    async fn fake_generate(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
        *seen.key.lock() = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()).map(String::from);
        *seen.body.lock() = Some(body);
        Json(json!({"candidates": [{"content": {"parts": [{"inlineData": {"mimeType": "image/jpeg", "data": "/9j/edited"}}]}}]}))
    }

    async fn spawn_fake_gemini(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{}/v1beta", addr)
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            reference_images: vec![ImageData { data: "AAA".into(), mime_type: "image/png".into() }],
            prompt: "vintage filter".into(),
            requested_count: 1,
        }
    }

    #[tokio::test]
    async fn client_posts_to_generate_content() {
        let seen = Seen::default();
        let router = Router::new()
            .route("/v1beta/models/:call", post(fake_generate))
            .with_state(seen.clone());
        let base = spawn_fake_gemini(router).await;

        let client = GeminiClient::new(base, "gemini-2.5-flash-image");
        let image = client.edit("secret", &request()).await.unwrap();

        assert_eq!(image, "/9j/edited");
        assert_eq!(seen.key.lock().as_deref(), Some("secret"));
        let body = seen.body.lock().clone().unwrap();
        assert_eq!(body["contents"][0]["parts"][1]["text"], "vintage filter");
    }

    #[tokio::test]
    async fn client_maps_error_status() {
        let router = Router::new().route(
            "/v1beta/models/:call",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = spawn_fake_gemini(router).await;

        let err = GeminiClient::new(base, "m").edit("k", &request()).await.unwrap_err();
        match err {
            GeminiError::Api { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_reports_missing_image() {
        let router = Router::new().route(
            "/v1beta/models/:call",
            post(|| async { Json(json!({"candidates": [{"content": {"parts": []}}]})) }),
        );
        let base = spawn_fake_gemini(router).await;

        let err = GeminiClient::new(base, "m").edit("k", &request()).await.unwrap_err();
        assert!(matches!(err, GeminiError::NoImageInResponse));
    }
}
