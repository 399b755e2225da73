//! A single text-generation call: the execution unit every stage uses.
//!
//! [`LlmCall`] sends one rendered prompt to the context's backend, streams
//! tokens to the event handler when streaming is on, removes reasoning-trace
//! blocks from the answer, and rejects answers that are empty afterwards.

use crate::{
    backend::{LlmRequest, LlmResponse},
    error::Result,
    events::{emit, Event},
    exec_ctx::ExecCtx,
    parsing, PipelineError,
};

/// Output of one [`LlmCall`].
#[derive(Debug, Clone)]
pub struct LlmOutput {
    /// Completion with reasoning-trace blocks removed.
    pub text: String,
    /// Contents of the removed reasoning-trace blocks, if any.
    pub thinking: Option<String>,
    /// The completion exactly as the backend returned it.
    pub raw: String,
}

/// One prompt sent to one model under a stage name.
///
/// # Example
///
/// ```no_run
/// use storybook_pipeline::{ExecCtx, LlmCall};
///
/// # async fn run() -> storybook_pipeline::Result<()> {
/// let ctx = ExecCtx::builder("http://localhost:11434").build()?;
/// let output = LlmCall::new("title", "Erfinde einen Titel über Füchse.")
///     .with_model("llama3.1:8b")
///     .invoke(&ctx)
///     .await?;
/// println!("{}", output.text);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LlmCall {
    stage: String,
    prompt: String,
    model: String,
    page: Option<usize>,
}

impl LlmCall {
    /// Create a call for `stage` with an already rendered prompt.
    pub fn new(stage: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            prompt: prompt.into(),
            model: String::new(),
            page: None,
        }
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Tag the call with a 1-based page index for events and logs.
    pub fn for_page(mut self, page: usize) -> Self {
        self.page = Some(page);
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, ctx: &ExecCtx) -> LlmRequest {
        LlmRequest {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            config: ctx.llm_config.clone(),
            stream: ctx.streaming,
        }
    }

    async fn call_backend(&self, ctx: &ExecCtx, request: &LlmRequest) -> Result<LlmResponse> {
        if !request.stream {
            return ctx
                .backend
                .complete(&ctx.client, &ctx.base_url, request)
                .await;
        }

        let stage = self.stage.clone();
        let event_handler = ctx.event_handler.clone();
        let mut on_token = move |token: String| {
            emit(
                &event_handler,
                Event::Token {
                    stage: stage.clone(),
                    chunk: token,
                },
            );
        };

        ctx.backend
            .complete_streaming(&ctx.client, &ctx.base_url, request, &mut on_token)
            .await
    }

    /// Strip reasoning traces and reject answers with nothing left.
    fn build_output(&self, raw: String) -> Result<LlmOutput> {
        let (thinking, text) = parsing::strip_think_tags(&raw);
        if text.trim().is_empty() {
            return Err(PipelineError::MalformedResponse {
                stage: self.stage.clone(),
                reason: "empty response after removing reasoning traces".into(),
                raw,
            });
        }
        Ok(LlmOutput {
            text,
            thinking,
            raw,
        })
    }

    /// Execute the call.
    ///
    /// Transport failures are returned wrapped in
    /// [`PipelineError::StageFailed`] with their kind intact; nothing is
    /// retried here.
    pub async fn invoke(&self, ctx: &ExecCtx) -> Result<LlmOutput> {
        ctx.check_cancelled()?;

        emit(
            &ctx.event_handler,
            Event::StageStart {
                stage: self.stage.clone(),
                page: self.page,
            },
        );
        tracing::debug!(
            stage = %self.stage,
            page = ?self.page,
            model = %self.model,
            backend = ctx.backend.name(),
            prompt_chars = self.prompt.len(),
            "sending prompt"
        );

        let request = self.build_request(ctx);
        let result = match self.call_backend(ctx, &request).await {
            Ok(response) => self.build_output(response.text),
            Err(e) => Err(e.in_stage(&self.stage)),
        };

        emit(
            &ctx.event_handler,
            Event::StageEnd {
                stage: self.stage.clone(),
                ok: result.is_ok(),
            },
        );

        match &result {
            Ok(output) => tracing::debug!(
                stage = %self.stage,
                chars = output.text.len(),
                had_thinking = output.thinking.is_some(),
                "received completion"
            ),
            Err(e) => tracing::warn!(stage = %self.stage, error = %e, "call failed"),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::error::ErrorKind;
    use crate::events::EventLog;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn ctx_with(mock: Arc<MockBackend>, streaming: bool) -> (ExecCtx, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let ctx = ExecCtx::builder("http://unused")
            .backend(mock)
            .streaming(streaming)
            .event_handler(log.clone())
            .build()
            .unwrap();
        (ctx, log)
    }

    #[tokio::test]
    async fn test_invoke_strips_thinking() {
        let mock = Arc::new(MockBackend::fixed("<think>hmm</think>Die Waldfreunde"));
        let (ctx, _) = ctx_with(mock.clone(), false);
        let out = LlmCall::new("title", "Titel bitte")
            .with_model("m")
            .invoke(&ctx)
            .await
            .unwrap();
        assert_eq!(out.text, "Die Waldfreunde");
        assert_eq!(out.thinking.as_deref(), Some("hmm"));
        assert_eq!(out.raw, "<think>hmm</think>Die Waldfreunde");
        assert_eq!(mock.prompts(), vec!["Titel bitte"]);
    }

    #[tokio::test]
    async fn test_invoke_empty_after_strip_is_malformed() {
        let mock = Arc::new(MockBackend::fixed("<think>only reasoning</think>  \n"));
        let (ctx, _) = ctx_with(mock, false);
        let err = LlmCall::new("title", "p").invoke(&ctx).await.unwrap_err();
        match err {
            PipelineError::MalformedResponse { stage, raw, .. } => {
                assert_eq!(stage, "title");
                assert!(raw.contains("only reasoning"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_streaming_emits_tokens_and_lifecycle() {
        let mock = Arc::new(MockBackend::fixed("Es war einmal"));
        let (ctx, log) = ctx_with(mock, true);
        let out = LlmCall::new("page-text", "p")
            .for_page(2)
            .invoke(&ctx)
            .await
            .unwrap();
        assert_eq!(out.text, "Es war einmal");

        let events = log.events();
        assert!(matches!(
            events.first(),
            Some(Event::StageStart { stage, page: Some(2) }) if stage == "page-text"
        ));
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                Event::Token { chunk, .. } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "Es war einmal");
        assert!(matches!(events.last(), Some(Event::StageEnd { ok: true, .. })));
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_kind_and_stage() {
        let mock = Arc::new(MockBackend::fixed("x").failing_at(0, ErrorKind::BackendTimeout));
        let (ctx, log) = ctx_with(mock, false);
        let err = LlmCall::new("outline", "p").invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendTimeout);
        assert!(err.is_transient());
        assert!(err.to_string().contains("outline"));
        assert!(matches!(
            log.events().last(),
            Some(Event::StageEnd { ok: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let mock = Arc::new(MockBackend::fixed("x"));
        let ctx = ExecCtx::builder("http://unused")
            .backend(mock.clone())
            .cancellation(Some(Arc::new(AtomicBool::new(true))))
            .build()
            .unwrap();
        let err = LlmCall::new("title", "p").invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(mock.calls(), 0);
    }
}
