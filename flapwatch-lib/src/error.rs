use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("maximum number of user-defined prefixes reached ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("import limit of {limit} paths exceeded")]
    ImportLimitExceeded { limit: usize },

    #[error("path change queue closed")]
    PathChangesClosed,
}
