// src/error.rs
//
// Error taxonomy for the non-RT control boundary.
//
// The RT thread never raises: hot-path functions return small Copy status
// enums (see `rt_queue::CommandOutcome`, `prefetch::FetchOutcome`) instead of
// `Result<_, EngineError>`, since building an error value must not allocate.
// `EngineError` is for control-thread callers: command submission, engine
// construction, and prefetch file I/O reported back from the worker thread.

use thiserror::Error;

use crate::doc::DocId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown object: {0}")]
    UnknownObject(DocId),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(&'static str),

    #[error("operation must be retried: {0}")]
    CallAgainLater(&'static str),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer overflow: {0}")]
    BufferOverflow(&'static str),
}

pub type EngineResult<T> = Result<T, EngineError>;
