//! Error types for the trickle render pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type RenderResult<T> = Result<T, RenderError>;

/// Errors that fail a lifecycle stage.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("malformed tag: {0}")]
    MalformedTag(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("stylesheet error: {0}")]
    Stylesheet(String),

    #[error("page data error: {0}")]
    Data(String),

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<RenderError>,
    },
}

impl RenderError {
    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            RenderError::Stage { .. } => self,
            other => RenderError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

/// Failure of a single render unit. Never fatal to the response.
#[derive(Debug, Clone, Error)]
pub enum UnitError {
    #[error("render failed: {0}")]
    Failed(String),

    #[error("render task panicked: {0}")]
    Panicked(String),
}

/// Failure of a background data fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("fetch {key} failed: {reason}")]
    Failed { key: String, reason: String },

    #[error("fetch {0} was dropped before resolving")]
    Dropped(String),
}
