//! Error handling.

use serde::{Deserialize, Serialize};
use std::error::Error;
use strum_macros::Display;
use thiserror::Error;
use tracing::{event, Level};

/// Batch reduction error type
///
/// This type encapsulates the various errors that may occur while building the tree, resolving
/// options and executing reductions. Each variant belongs to one [ErrorKind], which decides how
/// the scheduler records it.
#[derive(Debug, Error)]
pub enum ReductionError {
    /// A processing, pre-processing or post-processing algorithm failed
    #[error("algorithm {algorithm} failed: {message}")]
    AlgorithmExecution { algorithm: String, message: String },

    /// Error joining a background task
    #[error("background execution failed")]
    BackgroundTask(#[from] tokio::task::JoinError),

    /// Structural edit attempted while a reduction is running
    #[error("cannot modify the tree while a reduction is running")]
    Busy,

    /// Attempt to access a slice, row or group that does not exist
    #[error("index {index} is out of range (count is {count})")]
    InvalidIndex { index: usize, count: usize },

    /// Error reading a file
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error (de)serialising a document
    #[error("invalid document")]
    Json(#[from] serde_json::Error),

    /// Time slicing used before the plan was resolved against a run
    #[error("time slicing has not been resolved against a run")]
    NotResolved,

    /// A dispatch was attempted while the execution slot was occupied
    #[error("the execution slot is already in use")]
    SlotBusy,

    /// An output that was expected in the workspace store has gone
    #[error("workspace {name} has been removed from the store")]
    StoreConsistency { name: String },

    /// Any other failure
    #[error("unexpected error: {0}")]
    Unknown(String),

    /// Invalid user input (single error)
    #[error("{0}")]
    Validation(String),

    /// Error validating settings (multiple errors)
    #[error("settings are not valid")]
    SettingsValidation(#[from] validator::ValidationErrors),

    /// A workspace required as input is not in the store
    #[error("workspace {name} not found")]
    WorkspaceNotFound { name: String },
}

/// Error taxonomy used when recording errors against tree nodes.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad user input, reported before anything is dispatched
    Validation,
    /// Failure of an algorithm, recorded on the node being processed
    AlgorithmExecution,
    /// An expected output vanished from the store
    StoreConsistency,
    /// Anything else
    Unknown,
}

impl ReductionError {
    /// Shorthand for an [ReductionError::Validation] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for an [ReductionError::AlgorithmExecution] error.
    pub fn algorithm(algorithm: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AlgorithmExecution {
            algorithm: algorithm.into(),
            message: message.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Validation
            ReductionError::InvalidIndex { index: _, count: _ }
            | ReductionError::Io { path: _, source: _ }
            | ReductionError::Json(_)
            | ReductionError::NotResolved
            | ReductionError::SettingsValidation(_)
            | ReductionError::Validation(_) => ErrorKind::Validation,

            // Algorithm execution
            ReductionError::AlgorithmExecution {
                algorithm: _,
                message: _,
            }
            | ReductionError::WorkspaceNotFound { name: _ } => ErrorKind::AlgorithmExecution,

            // Store consistency
            ReductionError::StoreConsistency { name: _ } => ErrorKind::StoreConsistency,

            // Unknown
            ReductionError::BackgroundTask(_)
            | ReductionError::Busy
            | ReductionError::SlotBusy
            | ReductionError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Returns the message to record against a tree node.
    ///
    /// Unknown errors are logged with their full cause chain and recorded with a generic message,
    /// everything else is recorded with its report.
    pub fn node_message(&self) -> String {
        match self.kind() {
            ErrorKind::Unknown => {
                event!(Level::ERROR, "{}", self.to_string());
                let mut current = self.source();
                while let Some(source) = current {
                    event!(Level::ERROR, "Caused by: {}", source.to_string());
                    current = source.source();
                }
                "Unexpected error during reduction (see log for details)".to_string()
            }
            _ => ErrorReport::new(self).to_string(),
        }
    }
}

/// An error message together with the messages of its causes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Main error message
    pub message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Vec<String>>,
}

impl ErrorReport {
    /// Return a new ErrorReport
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    pub fn new<E>(error: &E) -> Self
    where
        E: std::error::Error,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorReport { message, caused_by }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(caused_by) = &self.caused_by {
            for cause in caused_by {
                write!(f, ": {}", cause)?;
            }
        }
        Ok(())
    }
}
