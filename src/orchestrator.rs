//! Run state machine.
//!
//! ```text
//! ModelChosen ──choose_topic──► TopicChosen ──confirm_storyline──► StorylineConfirmed
//!                                                                       │  ▲
//!                                                         confirm_images│  │regenerate_page / regenerate_cover
//!                                                                       ▼  │
//!                                       DocumentReady ◄──assemble── ImagesComplete
//! ```
//!
//! Every operation loads the run, works on a copy of its [`State`], and only
//! saves once the step succeeded; a failed stage leaves the last saved state
//! as the resumption point. Images are saved one by one, so an interrupted
//! render resumes at the first page without an image.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::document::{self, LayoutOptions};
use crate::error::Result;
use crate::events::{emit, Event};
use crate::exec_ctx::ExecCtx;
use crate::model::{State, PAGE_COUNT};
use crate::render::{self, ImageBackendFactory, Renderer};
use crate::store::{check_run_id, FsRunStore, RunLayout, RunStore};
use crate::{prompt, storyline, topics, PipelineError};

/// The user-confirmed steps of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStep {
    ModelChosen,
    TopicChosen,
    StorylineConfirmed,
    ImagesComplete,
    DocumentReady,
}

impl RunStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStep::ModelChosen => "model_chosen",
            RunStep::TopicChosen => "topic_chosen",
            RunStep::StorylineConfirmed => "storyline_confirmed",
            RunStep::ImagesComplete => "images_complete",
            RunStep::DocumentReady => "document_ready",
        }
    }
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session progress persisted next to the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub step: RunStep,
    pub topics_generated: bool,
    pub storyline_generated: bool,
    /// 0-based index of the next page to render.
    pub render_cursor: usize,
}

impl RunProgress {
    fn new() -> Self {
        Self {
            step: RunStep::ModelChosen,
            topics_generated: false,
            storyline_generated: false,
            render_cursor: 0,
        }
    }

    /// Best reconstruction from the state alone, for runs whose progress
    /// record is missing. An unconfirmed storyline is indistinguishable from
    /// a confirmed one without images, so the earlier step is assumed.
    pub fn derive(state: &State) -> Self {
        let mut progress = Self::new();
        progress.topics_generated = state.suggested_topics.is_some();
        if state.topic().is_some() {
            progress.step = RunStep::TopicChosen;
        }
        if let Some(storyline) = &state.storyline {
            progress.storyline_generated = true;
            let any_image = storyline.title_image_filepath.is_some()
                || storyline.pages.iter().any(|p| p.image_filepath.is_some());
            if storyline.all_images_present() {
                progress.step = RunStep::ImagesComplete;
                progress.render_cursor = storyline.pages.len();
            } else if any_image {
                progress.step = RunStep::StorylineConfirmed;
                progress.render_cursor = storyline.pending_pages().first().copied().unwrap_or(0);
            }
        }
        progress
    }
}

/// What one render step produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget {
    Cover,
    /// 0-based page index.
    Page(usize),
}

/// Summary of a run for display.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub run_id: String,
    pub step: RunStep,
    pub render_cursor: usize,
    pub title: Option<String>,
    pub topic: Option<String>,
    pub cover_pending: bool,
    /// 0-based indices of pages without an image.
    pub pending_pages: Vec<usize>,
}

/// Drives runs through their steps and persists every transition.
pub struct Orchestrator {
    ctx: ExecCtx,
    store: Arc<dyn RunStore>,
    layout: RunLayout,
    renderer: Renderer,
    document_options: LayoutOptions,
    document_name: String,
}

impl Orchestrator {
    pub fn new(ctx: ExecCtx, store: Arc<dyn RunStore>, layout: RunLayout, renderer: Renderer) -> Self {
        Self {
            ctx,
            store,
            layout,
            renderer,
            document_options: LayoutOptions::default(),
            document_name: "kinderbuch.pdf".to_string(),
        }
    }

    /// Wire an orchestrator with file-backed runs under `config.runs_dir`.
    pub fn from_config(config: &Config, ctx: ExecCtx, images: Arc<dyn ImageBackendFactory>) -> Self {
        let store = FsRunStore::new(&config.runs_dir);
        let layout = store.layout().clone();
        let renderer = Renderer::new(images).with_size(config.image.width, config.image.height);
        Self::new(ctx, Arc::new(store), layout, renderer).with_document(
            LayoutOptions::from(&config.document),
            config.document.file_name.clone(),
        )
    }

    pub fn with_document(mut self, options: LayoutOptions, file_name: impl Into<String>) -> Self {
        self.document_options = options;
        self.document_name = file_name.into();
        self
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    async fn load(&self, run_id: &str) -> Result<(State, RunProgress)> {
        check_run_id(run_id)?;
        let state = self.store.load(run_id).await?;
        let mut progress = match self.store.load_progress(run_id).await? {
            Some(progress) => progress,
            None => {
                let derived = RunProgress::derive(&state);
                tracing::warn!(run_id, step = %derived.step, "progress record missing, derived from state");
                derived
            }
        };
        // state is written before progress; a lost progress write after
        // choose_topic must not reopen the topic
        if progress.step == RunStep::ModelChosen && state.topic().is_some() {
            progress.step = RunStep::TopicChosen;
        }
        Ok((state, progress))
    }

    async fn save(&self, run_id: &str, state: &State, progress: &RunProgress) -> Result<()> {
        self.store.save(run_id, state).await?;
        self.store.save_progress(run_id, progress).await?;
        tracing::debug!(run_id, step = %progress.step, cursor = progress.render_cursor, store = self.store.name(), "run saved");
        Ok(())
    }

    fn require(progress: &RunProgress, allowed: &[RunStep], action: &str) -> Result<()> {
        if allowed.contains(&progress.step) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                from: progress.step.to_string(),
                action: action.to_string(),
            })
        }
    }

    /// Start a run with the given text model and rendering profile.
    /// Returns the new run identifier.
    pub async fn create_run(&self, model: &str, image_model: &str) -> Result<String> {
        let model = model.trim();
        if model.is_empty() {
            return Err(PipelineError::InvalidConfig("text model must not be empty".into()));
        }
        let profile = render::profile(image_model)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let state = State::new(model, profile.key);
        self.save(&run_id, &state, &RunProgress::new()).await?;
        tracing::info!(run_id = %run_id, model, profile = profile.key, "run created");
        Ok(run_id)
    }

    /// Suggest three themes. Suggestions are generated once per run; later
    /// calls return the stored ones.
    pub async fn suggest_topics(&self, run_id: &str) -> Result<Vec<String>> {
        let (state, mut progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::ModelChosen], "suggest topics")?;
        if let Some(existing) = &state.suggested_topics {
            return Ok(existing.clone());
        }
        let state = topics::suggest_topics(&self.ctx, state).await?;
        progress.topics_generated = true;
        self.save(run_id, &state, &progress).await?;
        Ok(state.suggested_topics.unwrap_or_default())
    }

    /// Pick the theme. Any non-blank text is accepted, suggested or not.
    pub async fn choose_topic(&self, run_id: &str, topic: &str) -> Result<State> {
        let (mut state, mut progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::ModelChosen], "choose a topic")?;
        if state.selected_topic.is_some() {
            return Err(PipelineError::InvalidTransition {
                from: progress.step.to_string(),
                action: "change the chosen topic".into(),
            });
        }
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(PipelineError::NoTopic);
        }
        state.selected_topic = Some(topic.to_string());
        progress.step = RunStep::TopicChosen;
        self.save(run_id, &state, &progress).await?;
        tracing::info!(run_id, topic, "topic chosen");
        Ok(state)
    }

    pub async fn generate_storyline(&self, run_id: &str) -> Result<State> {
        let (state, mut progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::TopicChosen], "generate the storyline")?;
        let state = storyline::generate_storyline(&self.ctx, state).await?;
        progress.storyline_generated = true;
        self.save(run_id, &state, &progress).await?;
        Ok(state)
    }

    pub async fn edit_title(&self, run_id: &str, title: &str) -> Result<State> {
        let (mut state, progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::TopicChosen], "edit the title")?;
        let storyline = state.storyline.as_mut().ok_or(PipelineError::NoStoryline)?;
        storyline.title = title.trim().to_string();
        self.save(run_id, &state, &progress).await?;
        Ok(state)
    }

    /// Replace the text and/or illustration description of the 0-based page
    /// `index`.
    pub async fn edit_page(
        &self,
        run_id: &str,
        index: usize,
        text: Option<&str>,
        image_description: Option<&str>,
    ) -> Result<State> {
        let (mut state, progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::TopicChosen], "edit a page")?;
        let storyline = state.storyline.as_mut().ok_or(PipelineError::NoStoryline)?;
        let page = storyline
            .pages
            .get_mut(index)
            .ok_or(PipelineError::PageOutOfRange { index })?;
        if let Some(text) = text {
            page.text = text.trim().to_string();
        }
        if let Some(description) = image_description {
            page.image_description = description.trim().to_string();
        }
        self.save(run_id, &state, &progress).await?;
        Ok(state)
    }

    pub async fn confirm_storyline(&self, run_id: &str) -> Result<State> {
        let (state, mut progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::TopicChosen], "confirm the storyline")?;
        let storyline = state.storyline.as_ref().ok_or(PipelineError::NoStoryline)?;
        if storyline.pages.len() != PAGE_COUNT {
            return Err(PipelineError::InvalidTransition {
                from: progress.step.to_string(),
                action: format!("confirm a storyline with {} pages", storyline.pages.len()),
            });
        }
        progress.step = RunStep::StorylineConfirmed;
        progress.render_cursor = 0;
        self.save(run_id, &state, &progress).await?;
        tracing::info!(run_id, "storyline confirmed");
        Ok(state)
    }

    async fn render_target(&self, run_id: &str, state: &mut State, target: RenderTarget) -> Result<PathBuf> {
        let profile = state.image_model.clone();
        let storyline = state.storyline.as_mut().ok_or(PipelineError::NoStoryline)?;
        let (description, path, page) = match target {
            RenderTarget::Cover => (
                prompt::cover_prompt(&storyline.title),
                self.layout.title_image(run_id),
                None,
            ),
            RenderTarget::Page(index) => {
                let page = storyline
                    .pages
                    .get(index)
                    .ok_or(PipelineError::PageOutOfRange { index })?;
                (page.image_description.clone(), self.layout.page_image(run_id, index), Some(index))
            }
        };

        self.ctx.check_cancelled()?;
        self.renderer.render(&description, &profile, &path).await?;

        let stored = path.to_string_lossy().to_string();
        match target {
            RenderTarget::Cover => storyline.title_image_filepath = Some(stored.clone()),
            RenderTarget::Page(index) => {
                if let Some(page) = storyline.pages.get_mut(index) {
                    page.image_filepath = Some(stored.clone());
                }
            }
        }
        emit(
            &self.ctx.event_handler,
            Event::ImageRendered {
                page: page.map(|i| i + 1),
                path: stored,
            },
        );
        Ok(path)
    }

    /// Render the next missing image: the cover first, then pages from the
    /// render cursor on. Returns `None` when nothing is left to render.
    pub async fn render_next(&self, run_id: &str) -> Result<Option<RenderTarget>> {
        let (mut state, mut progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::StorylineConfirmed], "render images")?;
        let storyline = state.storyline.as_ref().ok_or(PipelineError::NoStoryline)?;

        let target = if storyline.title_image_filepath.is_none() {
            RenderTarget::Cover
        } else {
            let mut cursor = progress.render_cursor;
            while cursor < storyline.pages.len() && storyline.pages[cursor].image_filepath.is_some() {
                cursor += 1;
            }
            progress.render_cursor = cursor;
            if cursor >= storyline.pages.len() {
                self.store.save_progress(run_id, &progress).await?;
                return Ok(None);
            }
            RenderTarget::Page(cursor)
        };

        self.render_target(run_id, &mut state, target).await?;
        if let RenderTarget::Page(index) = target {
            progress.render_cursor = index + 1;
        }
        self.save(run_id, &state, &progress).await?;
        Ok(Some(target))
    }

    /// Render until every image is present. Returns what was rendered.
    pub async fn render_all(&self, run_id: &str) -> Result<Vec<RenderTarget>> {
        let mut rendered = Vec::new();
        while let Some(target) = self.render_next(run_id).await? {
            rendered.push(target);
        }
        tracing::info!(run_id, images = rendered.len(), "rendering finished");
        Ok(rendered)
    }

    /// Throw away the image of the 0-based page `index` and render it again.
    ///
    /// Only that page's image path changes; texts, descriptions and every
    /// other image are kept. The reset is saved before rendering, so a failed
    /// render leaves the page pending with the cursor on it.
    pub async fn regenerate_page(&self, run_id: &str, index: usize) -> Result<State> {
        let (mut state, mut progress) = self.load(run_id).await?;
        Self::require(
            &progress,
            &[RunStep::StorylineConfirmed, RunStep::ImagesComplete, RunStep::DocumentReady],
            "regenerate a page",
        )?;
        let storyline = state.storyline.as_mut().ok_or(PipelineError::NoStoryline)?;
        let page = storyline
            .pages
            .get_mut(index)
            .ok_or(PipelineError::PageOutOfRange { index })?;
        if let Some(old) = page.image_filepath.take() {
            remove_image(Path::new(&old)).await?;
        }
        progress.step = RunStep::StorylineConfirmed;
        progress.render_cursor = progress.render_cursor.min(index);
        self.save(run_id, &state, &progress).await?;
        tracing::info!(run_id, page = index + 1, "page image reset");

        self.render_target(run_id, &mut state, RenderTarget::Page(index)).await?;
        if progress.render_cursor == index {
            progress.render_cursor = index + 1;
        }
        self.save(run_id, &state, &progress).await?;
        Ok(state)
    }

    /// Throw away the cover image and render it again.
    pub async fn regenerate_cover(&self, run_id: &str) -> Result<State> {
        let (mut state, mut progress) = self.load(run_id).await?;
        Self::require(
            &progress,
            &[RunStep::StorylineConfirmed, RunStep::ImagesComplete, RunStep::DocumentReady],
            "regenerate the cover",
        )?;
        let storyline = state.storyline.as_mut().ok_or(PipelineError::NoStoryline)?;
        if let Some(old) = storyline.title_image_filepath.take() {
            remove_image(Path::new(&old)).await?;
        }
        progress.step = RunStep::StorylineConfirmed;
        self.save(run_id, &state, &progress).await?;

        self.render_target(run_id, &mut state, RenderTarget::Cover).await?;
        self.save(run_id, &state, &progress).await?;
        Ok(state)
    }

    pub async fn confirm_images(&self, run_id: &str) -> Result<State> {
        let (state, mut progress) = self.load(run_id).await?;
        Self::require(&progress, &[RunStep::StorylineConfirmed], "confirm images")?;
        let storyline = state.storyline.as_ref().ok_or(PipelineError::NoStoryline)?;
        if !storyline.all_images_present() {
            let pending = storyline.pending_pages().len()
                + usize::from(storyline.title_image_filepath.is_none());
            return Err(PipelineError::InvalidTransition {
                from: progress.step.to_string(),
                action: format!("confirm images with {} still pending", pending),
            });
        }
        progress.step = RunStep::ImagesComplete;
        self.save(run_id, &state, &progress).await?;
        tracing::info!(run_id, "images confirmed");
        Ok(state)
    }

    /// Write the book document. Returns its path.
    pub async fn assemble(&self, run_id: &str) -> Result<PathBuf> {
        let (state, mut progress) = self.load(run_id).await?;
        Self::require(
            &progress,
            &[RunStep::ImagesComplete, RunStep::DocumentReady],
            "assemble the document",
        )?;
        let output = self.layout.document(run_id, &self.document_name);
        let path = document::assemble(&state, &output, &self.document_options).await?;
        progress.step = RunStep::DocumentReady;
        self.save(run_id, &state, &progress).await?;
        emit(
            &self.ctx.event_handler,
            Event::DocumentWritten {
                path: path.to_string_lossy().to_string(),
            },
        );
        Ok(path)
    }

    pub async fn state(&self, run_id: &str) -> Result<State> {
        self.store.load(run_id).await
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatus> {
        let (state, progress) = self.load(run_id).await?;
        let (title, cover_pending, pending_pages) = match &state.storyline {
            Some(s) => (
                Some(s.title.clone()),
                s.title_image_filepath.is_none(),
                s.pending_pages(),
            ),
            None => (None, true, Vec::new()),
        };
        Ok(RunStatus {
            run_id: run_id.to_string(),
            step: progress.step,
            render_cursor: progress.render_cursor,
            title,
            topic: state.topic().map(str::to_string),
            cover_pending,
            pending_pages,
        })
    }
}

async fn remove_image(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
