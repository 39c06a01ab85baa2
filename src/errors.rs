//! Typed error hierarchy for the Blueprint pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `ChatError`: streaming chat client failures
//! - `PublishError`: issue tracker API failures
//! - `PipelineError`: state machine and stage execution failures

use thiserror::Error;

use crate::models::Stage;

/// Errors from the streaming chat client.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Chat API key is missing")]
    MissingCredential,

    #[error("Chat API returned status {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("Chat request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Errors from the issue tracker client and publisher setup.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Tracker configuration missing: {0}")]
    MissingConfig(&'static str),

    #[error("Tracker API returned status {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("Tracker request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Errors from the pipeline state machine and stage execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage {stage} is missing upstream output: {field}")]
    UpstreamMissing { stage: Stage, field: &'static str },

    #[error("Task breakdown is not a valid issue list: {0}")]
    InvalidTaskList(String),

    #[error("Pipeline is not paused for input")]
    NotPaused,

    #[error("Pipeline is paused at {expected}, got input for {got}")]
    StageMismatch { expected: Stage, got: Stage },

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
