use thiserror::Error;
use toiler_core::CoreError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    /// A claim-protocol violation: resolve without a claim, a second
    /// resolve, or a resolution for a message that is not in flight.
    #[error("claim state error: {0}")]
    Claim(String),

    #[error("failed to lock {0}")]
    Lock(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
