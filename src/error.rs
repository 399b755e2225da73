use thiserror::Error;

/// Errors produced by the book pipeline and its stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The text or image backend could not be reached or answered with a
    /// non-success status.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The backend did not answer within the configured timeout.
    #[error("backend '{backend}' timed out")]
    BackendTimeout { backend: String },

    /// The backend answered, but the output does not have the expected shape.
    ///
    /// `raw` carries the unprocessed backend output so the user can see what
    /// the model actually said before retrying the step.
    #[error("malformed response in stage '{stage}': {reason}\n--- raw output ---\n{raw}")]
    MalformedResponse {
        stage: String,
        reason: String,
        raw: String,
    },

    /// No persisted state exists for the run.
    #[error("run '{run_id}' not found")]
    NotFound { run_id: String },

    /// The persisted state exists but cannot be parsed into a valid `State`.
    #[error("run '{run_id}' has corrupt state: {reason}")]
    Corrupt { run_id: String, reason: String },

    /// An operation that needs a storyline was called before one exists.
    #[error("no storyline available in state")]
    NoStoryline,

    /// Storyline generation was requested without a chosen topic.
    #[error("no topic selected")]
    NoTopic,

    /// The requested rendering profile is not known.
    #[error("unknown image profile '{profile}' (known: {known})")]
    UnknownProfile { profile: String, known: String },

    /// The run is not in a step that allows the requested action.
    #[error("cannot {action} while run is in step '{from}'")]
    InvalidTransition { from: String, action: String },

    /// A page index outside the storyline was addressed.
    #[error("page index {index} out of range")]
    PageOutOfRange { index: usize },

    /// A stage failed; the inner error keeps its kind.
    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// The run was cancelled via the cancellation flag.
    #[error("pipeline was cancelled")]
    Cancelled,

    /// Invalid configuration detected at load time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem failure outside the state store's own classification.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Flat view of [`PipelineError`] for matching on the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BackendUnavailable,
    BackendTimeout,
    MalformedResponse,
    NotFound,
    Corrupt,
    NoStoryline,
    NoTopic,
    UnknownProfile,
    InvalidTransition,
    PageOutOfRange,
    Cancelled,
    InvalidConfig,
    Io,
    Json,
}

impl PipelineError {
    /// The taxonomy kind of this error. `StageFailed` reports its inner kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            PipelineError::BackendTimeout { .. } => ErrorKind::BackendTimeout,
            PipelineError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::Corrupt { .. } => ErrorKind::Corrupt,
            PipelineError::NoStoryline => ErrorKind::NoStoryline,
            PipelineError::NoTopic => ErrorKind::NoTopic,
            PipelineError::UnknownProfile { .. } => ErrorKind::UnknownProfile,
            PipelineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            PipelineError::PageOutOfRange { .. } => ErrorKind::PageOutOfRange,
            PipelineError::StageFailed { source, .. } => source.kind(),
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Json(_) => ErrorKind::Json,
        }
    }

    /// Whether re-invoking the same stage may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendUnavailable | ErrorKind::BackendTimeout
        )
    }

    /// Attach a stage name. Errors that already carry one are left alone.
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            e @ PipelineError::StageFailed { .. } | e @ PipelineError::MalformedResponse { .. } => e,
            other => PipelineError::StageFailed {
                stage: stage.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Classify a transport error from `reqwest`.
    pub fn from_transport(backend: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::BackendTimeout {
                backend: backend.to_string(),
            }
        } else {
            PipelineError::BackendUnavailable {
                backend: backend.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failed_keeps_inner_kind() {
        let err = PipelineError::BackendTimeout {
            backend: "ollama".into(),
        }
        .in_stage("title");
        assert_eq!(err.kind(), ErrorKind::BackendTimeout);
        assert!(err.is_transient());
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_in_stage_does_not_double_wrap() {
        let err = PipelineError::NoTopic.in_stage("storyline").in_stage("outer");
        match err {
            PipelineError::StageFailed { stage, .. } => assert_eq!(stage, "storyline"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_response_includes_raw_output() {
        let err = PipelineError::MalformedResponse {
            stage: "topics".into(),
            reason: "no list".into(),
            raw: "I like dragons".into(),
        };
        assert!(err.to_string().contains("I like dragons"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_precondition_errors_are_not_transient() {
        assert!(!PipelineError::NoStoryline.is_transient());
        let err = PipelineError::UnknownProfile {
            profile: "dalle".into(),
            known: "sdxl, sd35".into(),
        };
        assert_eq!(err.kind(), ErrorKind::UnknownProfile);
        assert!(!err.is_transient());
    }
}
