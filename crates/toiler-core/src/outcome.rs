use thiserror::Error;

/// The single value a claim is resolved with.
///
/// Every claim yielded by `Driver::select` is terminated by exactly one
/// outcome; the driver commits the matching storage mutation atomically
/// with the claim release.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Work succeeded: delete the job.
    Ack,
    /// Return the job to the queue after `delay` seconds, retry counter +1.
    Retry { delay: f64 },
    /// Terminal failure: dead-letter the job with the error recorded.
    Dead { error: String },
}

/// What a work callback may raise.
///
/// A timeout is not raised by the callback; the worker enforces it from
/// the outside and resolves per the driver's timeout policy.
#[derive(Error, Debug)]
pub enum WorkError {
    #[error("retry after {delay} seconds")]
    Retry { delay: f64 },

    #[error("{0}")]
    Failed(String),
}

impl WorkError {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        WorkError::Failed(error.to_string())
    }
}
