//! Event system for stage lifecycle and token streaming.
//!
//! Stages emit events when they start, stream tokens, finish, and when
//! durable artifacts (pages, images, the document) come into existence.
//! Handlers are purely observational: the pipeline's control flow never
//! depends on whether one is installed.

use std::sync::Arc;

/// Events emitted while a run is being processed.
#[derive(Debug, Clone)]
pub enum Event {
    /// A text-generation call has started.
    StageStart {
        /// Stage name (e.g. `"title"`, `"page-text"`).
        stage: String,
        /// 1-based page index for per-page stages.
        page: Option<usize>,
    },
    /// A token was received during streaming.
    Token {
        /// Stage producing this token.
        stage: String,
        /// The token text.
        chunk: String,
    },
    /// A text-generation call has finished.
    StageEnd {
        /// Stage name.
        stage: String,
        /// Whether the call succeeded.
        ok: bool,
    },
    /// A page's text and illustration description are final.
    PageDrafted {
        /// 1-based page index.
        page: usize,
    },
    /// An image was written to disk. `page` is `None` for the cover.
    ImageRendered {
        page: Option<usize>,
        path: String,
    },
    /// The book document was written.
    DocumentWritten { path: String },
}

/// Handler for pipeline events.
///
/// # Example
///
/// ```
/// use storybook_pipeline::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::Token { chunk, .. } => print!("{}", chunk),
///             Event::StageStart { stage, .. } => println!("[start] {}", stage),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when the pipeline emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// ```
/// use storybook_pipeline::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::Token { chunk, .. } = event {
///         eprint!("{}", chunk);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

/// Collects every event; handy for tests and for replaying progress.
#[derive(Default)]
pub struct EventLog {
    events: std::sync::Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventHandler for EventLog {
    fn on_event(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
