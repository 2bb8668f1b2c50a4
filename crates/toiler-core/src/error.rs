use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("contents exceed maximum size of {max} bytes (got {actual})")]
    ContentsTooLarge { max: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, CoreError>;
