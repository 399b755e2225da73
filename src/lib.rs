//! # Storybook Pipeline
//!
//! Turns a theme into an illustrated children's book with a local language
//! model and a local diffusion server.
//!
//! ```text
//! topics ──► storyline ──► images ──► document
//!   │          │  title, 7-beat outline, character roster,
//!   │          │  then text + illustration description per page
//!   ▼          ▼
//! RunStore (state.json + progress.json per run, resumable at every step)
//! ```
//!
//! ## Core Concepts
//!
//! - **[`ExecCtx`]**: shared execution context (HTTP client, text backend,
//!   sampling options, cancellation, optional event handler).
//! - **[`LlmCall`]**: one text-generation call with think-tag stripping.
//! - **[`storyline::generate_storyline`]**: the strictly sequential core
//!   pipeline; every page prompt sees the finished output of the steps before.
//! - **[`Renderer`]**: illustration rendering with one cached backend per
//!   profile.
//! - **[`Orchestrator`]**: the run state machine that persists every step.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use storybook_pipeline::render::MockImageFactory;
//! use storybook_pipeline::{config::Config, ExecCtx, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> storybook_pipeline::Result<()> {
//!     let config = Config::default();
//!     let ctx = ExecCtx::builder(&config.text.base_url).build()?;
//!     let orchestrator = Orchestrator::from_config(&config, ctx, Arc::new(MockImageFactory::new()));
//!
//!     let run_id = orchestrator.create_run("llama3.1:8b", "sdxl").await?;
//!     orchestrator.suggest_topics(&run_id).await?;
//!     orchestrator.choose_topic(&run_id, "Freundschaft im Wald").await?;
//!     orchestrator.generate_storyline(&run_id).await?;
//!     orchestrator.confirm_storyline(&run_id).await?;
//!     orchestrator.render_all(&run_id).await?;
//!     orchestrator.confirm_images(&run_id).await?;
//!     let pdf = orchestrator.assemble(&run_id).await?;
//!     println!("{}", pdf.display());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod llm_call;
pub mod model;
pub mod orchestrator;
pub mod parsing;
pub mod prompt;
pub mod render;
pub mod store;
pub mod storyline;
pub mod streaming;
pub mod topics;

pub use backend::{Backend, MockBackend, OllamaBackend};
pub use client::LlmConfig;
pub use config::Config;
pub use error::{ErrorKind, PipelineError, Result};
pub use events::{Event, EventHandler, EventLog, FnEventHandler};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use llm_call::{LlmCall, LlmOutput};
pub use model::{Page, State, Storyline, PAGE_COUNT};
pub use orchestrator::{Orchestrator, RenderTarget, RunProgress, RunStatus, RunStep};
pub use render::{ImageBackend, ImageBackendFactory, RenderProfile, Renderer};
pub use store::{FsRunStore, MemoryRunStore, RunLayout, RunStore};
pub use streaming::StreamingDecoder;
