use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("registry error: {0}")]
    Registry(#[from] anyhow::Error),

    #[error("invalid priority table: {0}")]
    InvalidTable(String),

    #[error("failed to read priority table: {0}")]
    Io(#[from] std::io::Error),
}
