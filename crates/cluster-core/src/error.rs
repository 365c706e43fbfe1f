#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("ownership conflict: record belongs to a different daemon")]
    OwnershipConflict,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
