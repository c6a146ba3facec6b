use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("intent model error: {0}")]
    Model(String),

    #[error("intent model returned unusable output: {0:?}")]
    InvalidOutput(String),

    #[error("intent model timed out after {0} ms")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
