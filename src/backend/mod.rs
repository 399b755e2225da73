//! Text-generation backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over the language-model service. Every
//! stage of the book pipeline sends exactly one user-role prompt and reads
//! back one completion string, optionally streamed token by token.
//!
//! ```text
//! LlmCall ──► LlmRequest ──► Backend::complete() ──► LlmResponse
//!                                    │
//!                         ┌──────────┴──────────┐
//!                    OllamaBackend          MockBackend
//!                    /api/chat              scripted responses
//!                    NDJSON streaming
//! ```

pub mod mock;
pub mod ollama;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;

use crate::client::LlmConfig;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;

/// A normalized text-generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"llama3.1:8b"`).
    pub model: String,

    /// The single user-role prompt.
    pub prompt: String,

    /// Sampling configuration.
    pub config: LlmConfig,

    /// Whether to use the streaming endpoint.
    pub stream: bool,
}

/// A normalized text-generation response.
#[derive(Debug)]
pub struct LlmResponse {
    /// The full completion text (assembled from tokens when streaming).
    pub text: String,

    /// HTTP status code (for diagnostics/logging).
    pub status: u16,

    /// Provider-specific metadata (token counts, timing, model info).
    pub metadata: Option<serde_json::Value>,
}

/// Abstraction over text-generation providers.
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a non-streaming call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse>;

    /// Execute a streaming call.
    ///
    /// `on_token` is called for each token as it arrives. The final
    /// accumulated text is returned as an [`LlmResponse`].
    async fn complete_streaming(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}
