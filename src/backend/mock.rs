//! Mock backend for testing without a live language model.
//!
//! [`MockBackend`] returns scripted responses in order and records every
//! prompt it receives, so tests can assert on what each pipeline step sent.
//!
//! # Example
//!
//! ```
//! use storybook_pipeline::backend::MockBackend;
//!
//! let mock = MockBackend::new(vec!["Die Waldfreunde".to_string()]);
//! assert!(mock.prompts().is_empty());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::{ErrorKind, Result};
use crate::PipelineError;

/// A test backend that returns canned responses in order.
///
/// Cycles back to the beginning when all responses have been consumed.
/// For streaming, emits the response split on whitespace boundaries.
#[derive(Debug)]
pub struct MockBackend {
    responses: Vec<String>,
    index: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    failures: HashMap<usize, ErrorKind>,
}

impl MockBackend {
    /// Create a mock backend with the given canned responses.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            index: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            failures: HashMap::new(),
        }
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Make the call with the given 0-based ordinal fail with `kind`
    /// (`BackendTimeout` or anything else, which maps to `BackendUnavailable`).
    ///
    /// A failing call does not consume a scripted response.
    pub fn failing_at(mut self, call: usize, kind: ErrorKind) -> Self {
        self.failures.insert(call, kind);
        self
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Number of calls received so far (including failed ones).
    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn next_response(&self, request: &LlmRequest) -> Result<String> {
        let call = {
            let mut prompts = self
                .prompts
                .lock()
                .map_err(|_| PipelineError::BackendUnavailable {
                    backend: "mock".into(),
                    reason: "prompt log poisoned".into(),
                })?;
            prompts.push(request.prompt.clone());
            prompts.len() - 1
        };

        if let Some(kind) = self.failures.get(&call) {
            return Err(match kind {
                ErrorKind::BackendTimeout => PipelineError::BackendTimeout {
                    backend: "mock".into(),
                },
                _ => PipelineError::BackendUnavailable {
                    backend: "mock".into(),
                    reason: format!("scripted failure at call {}", call),
                },
            });
        }

        if self.responses.is_empty() {
            return Ok(String::new());
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        Ok(self.responses[idx].clone())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let text = self.next_response(request)?;
        Ok(LlmResponse {
            text,
            status: 200,
            metadata: None,
        })
    }

    async fn complete_streaming(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<LlmResponse> {
        let text = self.next_response(request)?;
        for token in text.split_inclusive(' ') {
            on_token(token.to_string());
        }
        Ok(LlmResponse {
            text,
            status: 200,
            metadata: None,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmConfig;

    fn request(prompt: &str) -> LlmRequest {
        LlmRequest {
            model: "test".to_string(),
            prompt: prompt.to_string(),
            config: LlmConfig::default(),
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_mock_cycles_responses_and_records_prompts() {
        let mock = MockBackend::new(vec!["first".into(), "second".into()]);
        let client = Client::new();
        let r1 = mock.complete(&client, "http://unused", &request("a")).await.unwrap();
        let r2 = mock.complete(&client, "http://unused", &request("b")).await.unwrap();
        let r3 = mock.complete(&client, "http://unused", &request("c")).await.unwrap();
        assert_eq!(r1.text, "first");
        assert_eq!(r2.text, "second");
        assert_eq!(r3.text, "first");
        assert_eq!(mock.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mock_streaming_tokens_reassemble() {
        let mock = MockBackend::fixed("Es war einmal");
        let client = Client::new();
        let mut tokens = Vec::new();
        let resp = mock
            .complete_streaming(&client, "http://unused", &request("p"), &mut |t| tokens.push(t))
            .await
            .unwrap();
        assert_eq!(resp.text, "Es war einmal");
        assert_eq!(tokens.concat(), "Es war einmal");
        assert_eq!(tokens.len(), 3);
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let mock = MockBackend::new(vec!["ok".into()]).failing_at(1, ErrorKind::BackendTimeout);
        let client = Client::new();
        assert!(mock.complete(&client, "", &request("a")).await.is_ok());
        let err = mock.complete(&client, "", &request("b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendTimeout);
        let third = mock.complete(&client, "", &request("c")).await.unwrap();
        assert_eq!(third.text, "ok");
        assert_eq!(mock.calls(), 3);
    }
}
