//! Topic suggestion stage.

use crate::{
    error::Result, exec_ctx::ExecCtx, llm_call::LlmCall, model::State, parsing, prompt,
    PipelineError,
};

const STAGE: &str = "topics";

/// Ask the text backend for three candidate themes.
///
/// Sends the fixed editorial prompt once and extracts the bracketed list from
/// the answer, tolerating commentary around it. Only `suggested_topics` is
/// written on the returned state.
pub async fn suggest_topics(ctx: &ExecCtx, mut state: State) -> Result<State> {
    let output = LlmCall::new(STAGE, prompt::render(prompt::TOPIC_PROMPT, &prompt::PromptVars::new()))
        .with_model(&state.model)
        .invoke(ctx)
        .await?;

    let topics =
        parsing::extract_bracket_list(&output.text).map_err(|e| PipelineError::MalformedResponse {
            stage: STAGE.to_string(),
            reason: e.to_string(),
            raw: output.raw.clone(),
        })?;

    if topics.len() != 3 {
        tracing::warn!(count = topics.len(), "expected three topic suggestions");
    }
    tracing::info!(topics = ?topics, "topics suggested");

    state.suggested_topics = Some(topics);
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn ctx(mock: Arc<MockBackend>) -> ExecCtx {
        ExecCtx::builder("http://unused").backend(mock).build().unwrap()
    }

    #[tokio::test]
    async fn test_topics_with_leading_commentary() {
        let mock = Arc::new(MockBackend::fixed(
            r#"Here are three ideas: ["Drachen", "Weltraum", "Tiere"]"#,
        ));
        let before = State::new("llama3.1:8b", "sdxl");
        let after = suggest_topics(&ctx(mock.clone()), before.clone()).await.unwrap();
        assert_eq!(
            after.suggested_topics,
            Some(vec!["Drachen".to_string(), "Weltraum".to_string(), "Tiere".to_string()])
        );
        assert_eq!(after.model, before.model);
        assert_eq!(after.image_model, before.image_model);
        assert!(after.selected_topic.is_none());
        assert!(after.storyline.is_none());
        assert_eq!(mock.calls(), 1);
        assert!(mock.prompts()[0].contains("Kinderbuchredakteur"));
    }

    #[tokio::test]
    async fn test_topics_after_think_block() {
        let mock = Arc::new(MockBackend::fixed(
            "<think>[\"nicht das\"]</think>\n[\"Piraten\", \"Ritter\", \"Feen\"]",
        ));
        let state = suggest_topics(&ctx(mock), State::new("qwen3:14b", "sdxl"))
            .await
            .unwrap();
        assert_eq!(state.suggested_topics.unwrap()[0], "Piraten");
    }

    #[tokio::test]
    async fn test_topics_without_list_is_malformed_with_raw() {
        let mock = Arc::new(MockBackend::fixed("Ich mag Drachen."));
        let err = suggest_topics(&ctx(mock), State::new("phi4", "sdxl"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
        assert!(err.to_string().contains("Ich mag Drachen."));
    }

    #[tokio::test]
    async fn test_topics_backend_down_propagates() {
        let mock = Arc::new(MockBackend::fixed("[]").failing_at(0, ErrorKind::BackendUnavailable));
        let err = suggest_topics(&ctx(mock), State::new("phi4", "sdxl"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }
}
