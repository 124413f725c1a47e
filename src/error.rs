use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or unusable credentials/endpoints. Fatal for the operation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failures, non-2xx answers and rejections from a collaborator.
    #[error("{0}")]
    Remote(String),

    /// Rejected before any network call.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn remote(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Remote(format!("{context}: {err}"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
