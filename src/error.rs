use std::path::PathBuf;

use thiserror::Error;

/// Why a single fetch attempt produced no response body.
///
/// These never escape a worker: the dispatcher turns them into an
/// [`Outcome`](crate::dispatcher::Outcome).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Startup and persistence failures that stop the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read input {path:?}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("input {0:?} has no jobs")]
    EmptyInput(PathBuf),
    #[error("output {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("checkpoint {path:?}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
