use std::time::Duration;

use thiserror::Error;

use crate::pipeline::types::{Output, PortId};

/// Capture pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported configuration on {port}: {reason}")]
    Configuration { port: PortId, reason: String },

    #[error("cannot {operation} while pipeline is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("hardware call failed: {0}")]
    Hardware(String),

    #[error("{output} capture timed out after {}ms", bound.as_millis())]
    CaptureTimeout { output: Output, bound: Duration },

    #[error("{output} sink failed: {source}")]
    Sink {
        output: Output,
        #[source]
        source: std::io::Error,
    },

    #[error("settings error: {0}")]
    Settings(String),

    #[error("thumbnail save failed: {0}")]
    Thumbnail(String),
}

impl PipelineError {
    pub fn configuration(port: PortId, reason: impl Into<String>) -> Self {
        Self::Configuration {
            port,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Which output timed out, if this is a capture timeout.
    pub fn timed_out_output(&self) -> Option<Output> {
        match self {
            Self::CaptureTimeout { output, .. } => Some(*output),
            _ => None,
        }
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
