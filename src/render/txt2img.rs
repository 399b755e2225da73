//! Image backend for AUTOMATIC1111-compatible Stable Diffusion servers.
//!
//! Construction switches the server to the profile's checkpoint via
//! `/sdapi/v1/options`; each render posts to `/sdapi/v1/txt2img` and decodes
//! the first base64 image of the answer.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde_json::{json, Value};

use super::{ImageBackend, ImageBackendFactory, ImageRequest, RenderProfile};
use crate::error::Result;
use crate::PipelineError;

const BACKEND_NAME: &str = "txt2img";

/// Creates one [`Txt2ImgBackend`] per profile against a single server.
#[derive(Debug, Clone)]
pub struct Txt2ImgFactory {
    client: Client,
    base_url: String,
}

impl Txt2ImgFactory {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ImageBackendFactory for Txt2ImgFactory {
    async fn create(&self, profile: &RenderProfile) -> Result<Arc<dyn ImageBackend>> {
        let url = format!("{}/sdapi/v1/options", self.base_url);
        send(
            &self.client,
            &url,
            &json!({ "sd_model_checkpoint": profile.checkpoint }),
        )
        .await?;
        tracing::debug!(checkpoint = profile.checkpoint, "checkpoint selected");
        Ok(Arc::new(Txt2ImgBackend {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        }))
    }
}

/// Renders through `/sdapi/v1/txt2img`.
#[derive(Debug, Clone)]
pub struct Txt2ImgBackend {
    client: Client,
    base_url: String,
}

impl Txt2ImgBackend {
    fn build_body(request: &ImageRequest) -> Value {
        json!({
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt,
            "steps": request.steps,
            "cfg_scale": request.guidance,
            "tiling": request.tiling,
            "width": request.width,
            "height": request.height,
            "batch_size": 1,
        })
    }

    /// Decode the first image of a txt2img answer.
    fn first_image(body: &Value) -> Result<Vec<u8>> {
        let encoded = body
            .get("images")
            .and_then(|i| i.get(0))
            .and_then(|i| i.as_str())
            .ok_or_else(|| malformed("answer has no images", body))?;
        // some servers prefix a data URI
        let encoded = encoded
            .split_once("base64,")
            .map(|(_, data)| data)
            .unwrap_or(encoded);
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| malformed(&format!("invalid base64 image: {}", e), body))
    }
}

fn malformed(reason: &str, body: &Value) -> PipelineError {
    let mut raw = body.to_string();
    raw.truncate(512);
    PipelineError::MalformedResponse {
        stage: "render".into(),
        reason: reason.to_string(),
        raw,
    }
}

/// Post JSON and turn non-success statuses into `BackendUnavailable`.
async fn send(client: &Client, url: &str, body: &Value) -> Result<reqwest::Response> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| PipelineError::from_transport(BACKEND_NAME, e))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(PipelineError::BackendUnavailable {
            backend: BACKEND_NAME.to_string(),
            reason: format!("HTTP {} from {}: {}", status, url, text),
        });
    }
    Ok(resp)
}

#[async_trait]
impl ImageBackend for Txt2ImgBackend {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>> {
        let url = format!("{}/sdapi/v1/txt2img", self.base_url);
        let resp = send(&self.client, &url, &Self::build_body(request)).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::from_transport(BACKEND_NAME, e))?;
        Self::first_image(&body)
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}
