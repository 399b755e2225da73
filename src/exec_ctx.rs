//! Execution context shared by every text-generation call of a run.
//!
//! [`ExecCtx`] carries the HTTP client, backend, endpoint, sampling config,
//! streaming switch, cancellation handle, and optional event handler. It is
//! built once per process and passed explicitly to every stage.

use crate::backend::{Backend, OllamaBackend};
use crate::client::LlmConfig;
use crate::error::Result;
use crate::events::EventHandler;
use crate::PipelineError;
use reqwest::Client;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Shared execution context for text-generation calls.
///
/// # Example
///
/// ```
/// use storybook_pipeline::ExecCtx;
///
/// let ctx = ExecCtx::builder("http://localhost:11434")
///     .streaming(true)
///     .build()
///     .unwrap();
/// assert_eq!(ctx.base_url, "http://localhost:11434");
/// ```
pub struct ExecCtx {
    /// HTTP client (cheap to clone -- uses `Arc` internally).
    pub client: Client,
    /// Base URL for the text backend (e.g. `http://localhost:11434`).
    pub base_url: String,
    /// Text-generation backend. Default: [`OllamaBackend`].
    pub backend: Arc<dyn Backend>,
    /// Sampling configuration applied to every call.
    pub llm_config: LlmConfig,
    /// Whether calls use the streaming endpoint and emit token events.
    pub streaming: bool,
    /// Optional cancellation flag; calls check it before starting.
    pub cancellation: Option<Arc<AtomicBool>>,
    /// Optional event handler for streaming tokens and lifecycle events.
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl ExecCtx {
    /// Create a new builder.
    pub fn builder(base_url: impl Into<String>) -> ExecCtxBuilder {
        ExecCtxBuilder {
            client: None,
            base_url: base_url.into(),
            backend: None,
            llm_config: LlmConfig::default(),
            streaming: false,
            cancellation: None,
            event_handler: None,
            timeout: None,
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Return an error if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("llm_config", &self.llm_config)
            .field("streaming", &self.streaming)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Builder for [`ExecCtx`].
pub struct ExecCtxBuilder {
    client: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    llm_config: LlmConfig,
    streaming: bool,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    timeout: Option<Duration>,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a client with the configured timeout is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the text backend. Default: [`OllamaBackend`].
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the sampling configuration.
    pub fn llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    /// Enable or disable token streaming.
    pub fn streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    /// Set the cancellation flag.
    pub fn cancellation(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancellation = cancel;
        self
    }

    /// Set the event handler.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Set the request timeout. Default: 300 seconds.
    ///
    /// Ignored when a custom `Client` is provided via `.client()`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the execution context.
    pub fn build(self) -> Result<ExecCtx> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout.unwrap_or(Duration::from_secs(300)))
                .build()
                .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {}", e)))?,
        };
        Ok(ExecCtx {
            client,
            base_url: normalize_base_url(&self.base_url),
            backend: self.backend.unwrap_or_else(|| Arc::new(OllamaBackend)),
            llm_config: self.llm_config,
            streaming: self.streaming,
            cancellation: self.cancellation,
            event_handler: self.event_handler,
        })
    }
}

/// Strip known endpoint suffixes so the backend can append its own path.
/// e.g., "http://localhost:11434/api" -> "http://localhost:11434"
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in &["/api/chat", "/api/generate", "/api"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}
