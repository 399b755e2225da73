//! Backend for Ollama's native chat API.
//!
//! [`OllamaBackend`] sends every request to `/api/chat` with a single user
//! message. Streaming uses NDJSON with `{"message": {"content": "token"}}`
//! per line.

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::streaming::StreamingDecoder;
use crate::PipelineError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

const BACKEND_NAME: &str = "ollama";

/// Backend for Ollama's `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaBackend;

impl OllamaBackend {
    /// Build the Ollama `options` object from the LlmConfig.
    fn build_options(request: &LlmRequest) -> Value {
        let mut opts = json!({
            "temperature": request.config.temperature,
            "num_predict": request.config.max_tokens,
        });
        if let Some(ref custom) = request.config.options {
            if let (Some(base), Some(extra)) = (opts.as_object_mut(), custom.as_object()) {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        opts
    }

    /// Build the JSON body for `/api/chat`.
    fn build_chat_body(request: &LlmRequest, stream: bool) -> Value {
        json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "stream": stream,
            "options": Self::build_options(request),
        })
    }

    fn chat_url(base_url: &str) -> String {
        format!("{}/api/chat", base_url.trim_end_matches('/'))
    }

    /// Token text carried by one chat response line.
    fn content_of(json_val: &Value) -> Option<&str> {
        json_val
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
    }

    /// Extract metadata fields from an Ollama response.
    fn extract_metadata(json_resp: &Value) -> Option<Value> {
        let mut meta = serde_json::Map::new();
        for key in [
            "total_duration",
            "eval_count",
            "eval_duration",
            "prompt_eval_count",
            "model",
        ] {
            if let Some(v) = json_resp.get(key) {
                meta.insert(key.into(), v.clone());
            }
        }
        if meta.is_empty() {
            None
        } else {
            Some(Value::Object(meta))
        }
    }

    /// Send the request and turn non-success statuses into `BackendUnavailable`.
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
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let url = Self::chat_url(base_url);
        let body = Self::build_chat_body(request, false);
        let resp = Self::send(client, &url, &body).await?;
        let status = resp.status().as_u16();

        let json_resp: Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::from_transport(BACKEND_NAME, e))?;

        let text = Self::content_of(&json_resp).unwrap_or("").to_string();

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    async fn complete_streaming(
        &self,
        client: &Client,
        base_url: &str,
        request: &LlmRequest,
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<LlmResponse> {
        let url = Self::chat_url(base_url);
        let body = Self::build_chat_body(request, true);
        let resp = Self::send(client, &url, &body).await?;
        let status = resp.status().as_u16();

        let mut stream = resp.bytes_stream();
        let mut decoder = StreamingDecoder::new();
        let mut accumulated = String::new();
        let mut last_metadata = None;

        let mut handle = |json_val: Value, accumulated: &mut String| {
            if let Some(t) = Self::content_of(&json_val) {
                if !t.is_empty() {
                    accumulated.push_str(t);
                    on_token(t.to_string());
                }
            }
            if json_val.get("done").and_then(|v| v.as_bool()) == Some(true) {
                last_metadata = Self::extract_metadata(&json_val);
            }
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::from_transport(BACKEND_NAME, e))?;
            for json_val in decoder.decode(&chunk) {
                handle(json_val, &mut accumulated);
            }
        }

        // Flush remaining buffer
        if let Some(json_val) = decoder.flush() {
            handle(json_val, &mut accumulated);
        }

        Ok(LlmResponse {
            text: accumulated,
            status,
            metadata: last_metadata,
        })
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmConfig;

    fn test_request() -> LlmRequest {
        LlmRequest {
            model: "llama3.1:8b".into(),
            prompt: "Erzähl mir von Füchsen.".into(),
            config: LlmConfig::default(),
            stream: false,
        }
    }

    #[test]
    fn test_chat_body_single_user_message() {
        let body = OllamaBackend::build_chat_body(&test_request(), false);

        assert_eq!(body["model"], "llama3.1:8b");
        assert_eq!(body["stream"], false);
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Erzähl mir von Füchsen.");
        assert_eq!(body["options"]["temperature"], 0.7);
        assert_eq!(body["options"]["num_predict"], 2048);
    }

    #[test]
    fn test_custom_options_merged() {
        let mut request = test_request();
        request.config.options = Some(json!({"top_p": 0.9, "seed": 42}));

        let body = OllamaBackend::build_chat_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["top_p"], 0.9);
        assert_eq!(body["options"]["seed"], 42);
        assert_eq!(body["options"]["temperature"], 0.7);
    }

    #[test]
    fn test_chat_url_trailing_slash() {
        assert_eq!(
            OllamaBackend::chat_url("http://localhost:11434/"),
            "http://localhost:11434/api/chat"
        );
    }

    #[test]
    fn test_extract_metadata() {
        let resp = json!({"model": "phi4", "eval_count": 12, "message": {"content": "x"}});
        let meta = OllamaBackend::extract_metadata(&resp).expect("metadata");
        assert_eq!(meta["model"], "phi4");
        assert_eq!(meta["eval_count"], 12);
        assert!(OllamaBackend::extract_metadata(&json!({})).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let client = Client::new();
        let err = OllamaBackend
            .complete(&client, "http://127.0.0.1:1", &test_request())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
