//! Run state persistence.
//!
//! A [`RunStore`] keeps one [`State`] per run identifier with full-object
//! replace semantics, plus the small session progress record the
//! orchestrator needs to resume. [`RunLayout`] names the files a run owns:
//!
//! ```text
//! <runs_dir>/<run_id>/
//!     state.json      full State, rewritten on every save
//!     progress.json   RunProgress (current step, render cursor)
//!     title.png       cover image
//!     page_00.png     page images, zero-padded 0-based index
//!     ...
//!     kinderbuch.pdf  assembled book
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::model::State;
use crate::orchestrator::RunProgress;
use crate::PipelineError;

const STATE_FILE: &str = "state.json";
const PROGRESS_FILE: &str = "progress.json";

/// File locations of every artifact a run owns.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn state_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    pub fn progress_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(PROGRESS_FILE)
    }

    pub fn title_image(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("title.png")
    }

    /// Image path for the 0-based page `index`.
    pub fn page_image(&self, run_id: &str, index: usize) -> PathBuf {
        self.run_dir(run_id).join(format!("page_{:02}.png", index))
    }

    pub fn document(&self, run_id: &str, file_name: &str) -> PathBuf {
        self.run_dir(run_id).join(file_name)
    }
}

/// Fails with `NotFound` unless `run_id` is a single plain path component
/// (ASCII letters, digits, `-` and `_`), so it can never address anything
/// outside its run directory.
pub fn check_run_id(run_id: &str) -> Result<()> {
    let plain = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        Ok(())
    } else {
        Err(PipelineError::NotFound {
            run_id: run_id.to_string(),
        })
    }
}

/// Persistence for run state and session progress.
///
/// Saves replace the whole record and are atomic: a concurrent or later
/// `load` sees either the previous or the new record, never a mix.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run_id: &str, state: &State) -> Result<()>;

    /// Fails with `NotFound` when nothing was saved for `run_id`, and with
    /// `Corrupt` when the record cannot be parsed into a [`State`].
    async fn load(&self, run_id: &str) -> Result<State>;

    async fn save_progress(&self, run_id: &str, progress: &RunProgress) -> Result<()>;

    /// `Ok(None)` when the run has no progress record yet.
    async fn load_progress(&self, run_id: &str) -> Result<Option<RunProgress>>;

    fn name(&self) -> &'static str;
}

/// Stores each run as JSON files in its own directory.
#[derive(Debug, Clone)]
pub struct FsRunStore {
    layout: RunLayout,
}

impl FsRunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: RunLayout::new(runs_dir),
        }
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(value)?;
        write_atomic(path, &json).await
    }

    async fn read_json<T: DeserializeOwned>(&self, run_id: &str, path: &Path) -> Result<Option<T>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PipelineError::Corrupt {
                run_id: run_id.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })
    }
}

/// Write `bytes` to a temporary sibling of `path` and rename it into place.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn save(&self, run_id: &str, state: &State) -> Result<()> {
        check_run_id(run_id)?;
        let path = self.layout.state_file(run_id);
        self.write_json(&path, state).await?;
        tracing::debug!(run_id, path = %path.display(), "state saved");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<State> {
        check_run_id(run_id)?;
        let path = self.layout.state_file(run_id);
        self.read_json(run_id, &path)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn save_progress(&self, run_id: &str, progress: &RunProgress) -> Result<()> {
        check_run_id(run_id)?;
        let path = self.layout.progress_file(run_id);
        self.write_json(&path, progress).await
    }

    async fn load_progress(&self, run_id: &str) -> Result<Option<RunProgress>> {
        check_run_id(run_id)?;
        let path = self.layout.progress_file(run_id);
        self.read_json(run_id, &path).await
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}

/// Keeps runs in memory. Records are stored serialized so load/save behave
/// like the file store (deep copies, same round-trip).
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    states: Mutex<HashMap<String, String>>,
    progress: Mutex<HashMap<String, RunProgress>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the raw record of a run (for exercising `Corrupt`).
    pub fn put_raw(&self, run_id: &str, raw: impl Into<String>) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(run_id.to_string(), raw.into());
        }
    }
}

fn poisoned(run_id: &str) -> PipelineError {
    PipelineError::Corrupt {
        run_id: run_id.to_string(),
        reason: "store lock poisoned".into(),
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run_id: &str, state: &State) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.states
            .lock()
            .map_err(|_| poisoned(run_id))?
            .insert(run_id.to_string(), json);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<State> {
        let raw = self
            .states
            .lock()
            .map_err(|_| poisoned(run_id))?
            .get(run_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound {
                run_id: run_id.to_string(),
            })?;
        serde_json::from_str(&raw).map_err(|e| PipelineError::Corrupt {
            run_id: run_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn save_progress(&self, run_id: &str, progress: &RunProgress) -> Result<()> {
        self.progress
            .lock()
            .map_err(|_| poisoned(run_id))?
            .insert(run_id.to_string(), progress.clone());
        Ok(())
    }

    async fn load_progress(&self, run_id: &str) -> Result<Option<RunProgress>> {
        Ok(self
            .progress
            .lock()
            .map_err(|_| poisoned(run_id))?
            .get(run_id)
            .cloned())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{Page, Storyline, PAGE_COUNT};
    use crate::orchestrator::RunStep;

    fn sample_state() -> State {
        let mut state = State::new("llama3.1:8b", "sdxl");
        state.suggested_topics = Some(vec!["Drachen".into(), "Weltraum".into(), "Tiere".into()]);
        state.selected_topic = Some("Freundschaft im Wald".into());
        let mut pages: Vec<Page> = (1..=PAGE_COUNT)
            .map(|i| Page::new(format!("Seite {i}: Füße & \"Zitate\""), format!("scene {i}")))
            .collect();
        pages[0].image_filepath = Some("runs/r/page_00.png".into());
        state.storyline = Some(Storyline {
            title: "Die Waldfreunde".into(),
            title_image_filepath: Some("runs/r/title.png".into()),
            pages,
            outline: "1. a\n2. b".into(),
            characters: vec!["- Fini".into()],
        });
        state
    }

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new("runs");
        assert_eq!(layout.page_image("abc", 3), PathBuf::from("runs/abc/page_03.png"));
        assert_eq!(layout.title_image("abc"), PathBuf::from("runs/abc/title.png"));
        assert_eq!(
            layout.document("abc", "kinderbuch.pdf"),
            PathBuf::from("runs/abc/kinderbuch.pdf")
        );
    }

    #[tokio::test]
    async fn test_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let state = sample_state();
        store.save("r1", &state).await.unwrap();
        assert_eq!(store.load("r1").await.unwrap(), state);

        let minimal = State::new("phi4", "sd35");
        store.save("r1", &minimal).await.unwrap();
        assert_eq!(store.load("r1").await.unwrap(), minimal);
        assert!(!dir.path().join("r1").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_fs_rejects_ids_outside_runs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let store = FsRunStore::new(&runs);

        for id in ["../escape", "..", "a/b", "a\\b", "", "/etc"] {
            let err = store.save(id, &sample_state()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound, "{id:?}");
            let err = store.load(id).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound, "{id:?}");
        }
        assert!(!dir.path().join("escape").exists());
        assert!(!runs.exists());

        check_run_id("6f1c2a4e-9b1d-4c3e-8f00-123456789abc").unwrap();
        check_run_id("run_01").unwrap();
    }

    #[tokio::test]
    async fn test_fs_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let err = store.load("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fs_corrupt_on_missing_required_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        let run_dir = dir.path().join("bad");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("state.json"), r#"{"model": "phi4"}"#).unwrap();
        let err = store.load("bad").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        std::fs::write(run_dir.join("state.json"), "{not json").unwrap();
        assert_eq!(store.load("bad").await.unwrap_err().kind(), ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn test_fs_progress_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path());
        assert!(store.load_progress("r").await.unwrap().is_none());
        let progress = RunProgress {
            step: RunStep::StorylineConfirmed,
            topics_generated: true,
            storyline_generated: true,
            render_cursor: 3,
        };
        store.save_progress("r", &progress).await.unwrap();
        assert_eq!(store.load_progress("r").await.unwrap(), Some(progress));
    }

    #[tokio::test]
    async fn test_memory_round_trip_and_errors() {
        let store = MemoryRunStore::new();
        assert_eq!(store.load("x").await.unwrap_err().kind(), ErrorKind::NotFound);
        let state = sample_state();
        store.save("x", &state).await.unwrap();
        assert_eq!(store.load("x").await.unwrap(), state);
        store.put_raw("x", "[]");
        assert_eq!(store.load("x").await.unwrap_err().kind(), ErrorKind::Corrupt);
    }
}
