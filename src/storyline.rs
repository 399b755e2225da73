//! Storyline pipeline: title, outline, character roster, then seven pages.
//!
//! Every step is one text-generation call whose prompt embeds the finalized
//! output of earlier steps, so the steps run strictly in order:
//!
//! ```text
//! theme ─► title ─► outline ─► characters ─► page 1 text ─► page 1 illustration
//!                                                 │
//!                                                 ▼   (prior texts grow by one)
//!                                           page 2 text ─► page 2 illustration ─► ...
//! ```
//!
//! Nothing is written to the state until all seven pages exist, so a failure
//! part way leaves the caller's state exactly as it was.

use crate::{
    error::Result,
    events::{emit, Event},
    exec_ctx::ExecCtx,
    llm_call::{LlmCall, LlmOutput},
    model::{Page, State, Storyline, PAGE_COUNT},
    parsing::{self, ParseError},
    prompt, PipelineError,
};

fn malformed(stage: &str, reason: impl ToString, output: &LlmOutput) -> PipelineError {
    PipelineError::MalformedResponse {
        stage: stage.to_string(),
        reason: reason.to_string(),
        raw: output.raw.clone(),
    }
}

/// Generate the book title for `theme`, stripped of quotes and emphasis.
pub async fn generate_title(ctx: &ExecCtx, model: &str, theme: &str) -> Result<String> {
    let output = LlmCall::new("title", prompt::title_prompt(theme))
        .with_model(model)
        .invoke(ctx)
        .await?;
    let title = parsing::clean_title(&output.text);
    if title.is_empty() {
        return Err(malformed("title", ParseError::Empty, &output));
    }
    Ok(title)
}

/// Generate the outline. Returns the outline text as generated (trimmed)
/// together with its parsed beats.
pub async fn generate_outline(
    ctx: &ExecCtx,
    model: &str,
    theme: &str,
) -> Result<(String, Vec<String>)> {
    let output = LlmCall::new("outline", prompt::outline_prompt(theme))
        .with_model(model)
        .invoke(ctx)
        .await?;
    let beats = parsing::parse_outline(&output.text).map_err(|e| malformed("outline", e, &output))?;
    if beats.len() != PAGE_COUNT {
        tracing::warn!(
            beats = beats.len(),
            expected = PAGE_COUNT,
            "outline beat count differs from page count"
        );
    }
    Ok((output.text.trim().to_string(), beats))
}

/// Generate the recurring character roster, one description per line.
pub async fn generate_characters(ctx: &ExecCtx, model: &str, theme: &str) -> Result<Vec<String>> {
    let output = LlmCall::new("characters", prompt::character_prompt(theme))
        .with_model(model)
        .invoke(ctx)
        .await?;
    parsing::parse_character_roster(&output.text).map_err(|e| malformed("characters", e, &output))
}

/// Everything a page prompt may refer to.
#[derive(Debug, Clone, Copy)]
pub struct PageContext<'a> {
    pub model: &'a str,
    pub theme: &'a str,
    pub title: &'a str,
    pub outline: &'a str,
    pub characters: &'a [String],
}

/// Draft page `index` (1-based): text from the outline, then the
/// illustration description from the texts of all earlier pages.
pub async fn draft_page(
    ctx: &ExecCtx,
    page_ctx: PageContext<'_>,
    prior_texts: &[String],
    index: usize,
) -> Result<Page> {
    let text_output = LlmCall::new(
        "page-text",
        prompt::page_text_prompt(page_ctx.theme, page_ctx.title, page_ctx.outline, index),
    )
    .with_model(page_ctx.model)
    .for_page(index)
    .invoke(ctx)
    .await?;

    let text = parsing::clean_page_text(&text_output.text);
    if text.is_empty() {
        return Err(malformed(
            "page-text",
            format!("page {} is empty after cleanup", index),
            &text_output,
        ));
    }

    let description_output = LlmCall::new(
        "illustration",
        prompt::illustration_prompt(
            page_ctx.theme,
            page_ctx.title,
            prior_texts,
            index,
            &text,
            page_ctx.characters,
        ),
    )
    .with_model(page_ctx.model)
    .for_page(index)
    .invoke(ctx)
    .await?;

    Ok(Page::new(text, description_output.text.trim()))
}

/// Run the whole storyline pipeline for the state's chosen topic.
///
/// A state that already has a storyline is returned unchanged. Fails with
/// `NoTopic` when no non-blank topic is chosen. Backend failures propagate
/// without retry.
pub async fn generate_storyline(ctx: &ExecCtx, mut state: State) -> Result<State> {
    if state.storyline.is_some() {
        tracing::debug!("storyline already present, skipping generation");
        return Ok(state);
    }
    let theme = state.topic().ok_or(PipelineError::NoTopic)?.to_string();
    let model = state.model.clone();

    tracing::info!(theme = %theme, model = %model, "generating storyline");

    let title = generate_title(ctx, &model, &theme).await?;
    tracing::info!(title = %title, "title generated");

    let (outline, beats) = generate_outline(ctx, &model, &theme).await?;
    tracing::debug!(beats = beats.len(), "outline generated");

    let characters = generate_characters(ctx, &model, &theme).await?;
    tracing::debug!(characters = characters.len(), "character roster generated");

    let page_ctx = PageContext {
        model: &model,
        theme: &theme,
        title: &title,
        outline: &outline,
        characters: &characters,
    };

    let mut pages: Vec<Page> = Vec::with_capacity(PAGE_COUNT);
    let mut prior_texts: Vec<String> = Vec::with_capacity(PAGE_COUNT);
    for index in 1..=PAGE_COUNT {
        let page = draft_page(ctx, page_ctx, &prior_texts, index).await?;
        tracing::info!(page = index, "page drafted");
        emit(&ctx.event_handler, Event::PageDrafted { page: index });
        prior_texts.push(page.text.clone());
        pages.push(page);
    }

    state.storyline = Some(Storyline {
        title,
        title_image_filepath: None,
        pages,
        outline,
        characters,
    });
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::error::ErrorKind;
    use crate::events::EventLog;
    use std::sync::Arc;

    const OUTLINE: &str = "Hier ist die Gliederung:\n1. Fini trifft Hops.\n2. Ein Sturm zieht auf.\n3. Sie suchen Schutz.\n4. Sie finden eine Höhle.\n5. Ein Ast blockiert den Weg.\n6. Gemeinsam schaffen sie es.\n7. Sie bleiben Freunde.";

    /// Title, outline, roster, then text and illustration for each page.
    fn scripted(title: &str, outline: &str) -> Vec<String> {
        let mut responses = vec![
            title.to_string(),
            outline.to_string(),
            "- Fini, ein roter Fuchs\n- Hops, ein grauer Hase".to_string(),
        ];
        for i in 1..=PAGE_COUNT {
            responses.push(format!("Seitentext-{i} mit Wald."));
            responses.push(format!("  scene-{i}, warm colors  \n"));
        }
        responses
    }

    fn state_with_topic() -> State {
        let mut state = State::new("llama3.1:8b", "sdxl");
        state.selected_topic = Some("Freundschaft im Wald".into());
        state
    }

    fn ctx(mock: Arc<MockBackend>) -> ExecCtx {
        ExecCtx::builder("http://unused").backend(mock).build().unwrap()
    }

    /// Index of the illustration call for 1-based page `i` in the call log.
    fn illustration_call(i: usize) -> usize {
        3 + 2 * (i - 1) + 1
    }

    #[tokio::test]
    async fn test_full_storyline_shape_and_title_cleanup() {
        let mock = Arc::new(MockBackend::new(scripted("**Die Waldfreunde**\n", OUTLINE)));
        let state = generate_storyline(&ctx(mock.clone()), state_with_topic())
            .await
            .unwrap();
        let storyline = state.storyline.unwrap();

        assert_eq!(storyline.title, "Die Waldfreunde");
        assert_eq!(storyline.pages.len(), PAGE_COUNT);
        assert_eq!(storyline.pages[0].text, "Seitentext-1 mit Wald.");
        assert_eq!(storyline.pages[6].image_description, "scene-7, warm colors");
        assert!(storyline.pages.iter().all(|p| p.image_filepath.is_none()));
        assert!(storyline.title_image_filepath.is_none());
        assert_eq!(storyline.characters.len(), 2);
        assert!(storyline.outline.starts_with("Hier ist die Gliederung:"));
        assert_eq!(mock.calls(), 3 + 2 * PAGE_COUNT);
    }

    #[tokio::test]
    async fn test_prompts_follow_dependency_order() {
        let mock = Arc::new(MockBackend::new(scripted("Die Waldfreunde", OUTLINE)));
        generate_storyline(&ctx(mock.clone()), state_with_topic())
            .await
            .unwrap();
        let prompts = mock.prompts();

        assert!(prompts[0].contains("\"Freundschaft im Wald\""));
        assert!(prompts[0].contains("Titel"));
        assert!(prompts[1].contains("Gliederung"));
        assert!(prompts[2].contains("recurring characters"));
        for i in 1..=PAGE_COUNT {
            let text_prompt = &prompts[illustration_call(i) - 1];
            assert!(text_prompt.contains("Die Waldfreunde"));
            assert!(text_prompt.contains("6. Gemeinsam schaffen sie es."));
            assert!(text_prompt.contains(&format!("Seite {i},")));
        }
    }

    #[tokio::test]
    async fn test_illustration_prompts_carry_only_prior_texts() {
        let mock = Arc::new(MockBackend::new(scripted("Die Waldfreunde", OUTLINE)));
        generate_storyline(&ctx(mock.clone()), state_with_topic())
            .await
            .unwrap();
        let prompts = mock.prompts();

        for i in 1..=PAGE_COUNT {
            let prompt = &prompts[illustration_call(i)];
            assert!(prompt.starts_with(
                "The main characters in this book are:\n- Fini, ein roter Fuchs\n- Hops, ein grauer Hase\n\n"
            ));
            for j in 1..i {
                assert!(
                    prompt.contains(&format!("{j}. Seitentext-{j} mit Wald.")),
                    "page {i} prompt misses page {j}"
                );
            }
            assert!(prompt.contains(&format!("The text on the page is: Seitentext-{i} mit Wald.")));
            for j in (i + 1)..=PAGE_COUNT {
                assert!(
                    !prompt.contains(&format!("Seitentext-{j}")),
                    "page {i} prompt leaks page {j}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_page_text_cleanup_applied() {
        let mut responses = scripted("T", OUTLINE);
        responses[3] =
            "Es war einmal ein Fuchs.\n**Seite 3**\nDiese Seite hilft Kindern beim Verständnis.".into();
        let mock = Arc::new(MockBackend::new(responses));
        let state = generate_storyline(&ctx(mock.clone()), state_with_topic())
            .await
            .unwrap();
        assert_eq!(state.storyline.unwrap().pages[0].text, "Es war einmal ein Fuchs.");
        assert!(mock.prompts()[illustration_call(2)].contains("1. Es war einmal ein Fuchs.\n"));
    }

    #[tokio::test]
    async fn test_short_outline_still_yields_seven_pages() {
        let mock = Arc::new(MockBackend::new(scripted("T", "1. Anfang\n2. Ende")));
        let state = generate_storyline(&ctx(mock), state_with_topic())
            .await
            .unwrap();
        assert_eq!(state.storyline.unwrap().pages.len(), PAGE_COUNT);
    }

    #[tokio::test]
    async fn test_unnumbered_outline_is_malformed() {
        let mock = Arc::new(MockBackend::new(scripted("T", "Eine schöne Geschichte.")));
        let err = generate_storyline(&ctx(mock.clone()), state_with_topic())
            .await
            .unwrap_err();
        match err {
            PipelineError::MalformedResponse { stage, raw, .. } => {
                assert_eq!(stage, "outline");
                assert_eq!(raw, "Eine schöne Geschichte.");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_mid_loop_failure_stops_pipeline() {
        // call 8 is page 3's text
        let mock = Arc::new(
            MockBackend::new(scripted("T", OUTLINE)).failing_at(7, ErrorKind::BackendTimeout),
        );
        let log = Arc::new(EventLog::new());
        let ctx = ExecCtx::builder("http://unused")
            .backend(mock.clone())
            .event_handler(log.clone())
            .build()
            .unwrap();
        let err = generate_storyline(&ctx, state_with_topic()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendTimeout);
        assert!(err.to_string().contains("page-text"));
        assert_eq!(mock.calls(), 8);

        let drafted: Vec<usize> = log
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::PageDrafted { page } => Some(page),
                _ => None,
            })
            .collect();
        assert_eq!(drafted, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_requires_topic() {
        let mock = Arc::new(MockBackend::fixed("x"));
        let mut state = State::new("phi4", "sdxl");
        let err = generate_storyline(&ctx(mock.clone()), state.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoTopic);

        state.selected_topic = Some("  ".into());
        let err = generate_storyline(&ctx(mock.clone()), state).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoTopic);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_storyline_is_not_regenerated() {
        let first = Arc::new(MockBackend::new(scripted("Erster Titel", OUTLINE)));
        let state = generate_storyline(&ctx(first), state_with_topic())
            .await
            .unwrap();

        let second = Arc::new(MockBackend::new(scripted("Zweiter Titel", OUTLINE)));
        let again = generate_storyline(&ctx(second.clone()), state.clone())
            .await
            .unwrap();
        assert_eq!(again, state);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_page_emptied_by_cleanup_is_malformed() {
        let mut responses = scripted("T", OUTLINE);
        responses[3] = "**Seite 1**\nDiese Seite soll Spaß machen.".into();
        let mock = Arc::new(MockBackend::new(responses));
        let err = generate_storyline(&ctx(mock), state_with_topic())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }
}
