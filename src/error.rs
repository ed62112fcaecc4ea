//! Error types for the odometry pipeline.

use std::{collections::TryReserveError, path::PathBuf};

use thiserror::Error;

/// Rejected configuration. Always fatal at [`crate::Pipeline::new`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error(
        "real-time mode needs num_cores >= num_keyframes, got {num_cores} cores for {num_keyframes} keyframes"
    )]
    RealtimeOversubscribed {
        num_keyframes: usize,
        num_cores: usize,
    },

    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl ConfigError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Failure while processing one frame. The pipeline state is not advanced.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("out of memory while buffering {requested} points")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: TryReserveError,
    },
}
