/// Shared error type used across all faceplate crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unauthorized")]
    Unauthorized,

    /// Client-side request error; the message is returned verbatim to the
    /// caller as the external body.
    #[error("{0}")]
    BadRequest(String),

    #[error("unknown API method")]
    NotFound,

    /// Failed to retrieve a frame from a camera screenshot endpoint.
    #[error("upstream fetch: {0}")]
    UpstreamFetch(String),

    /// Remote model server failure (network, non-OK status, malformed output).
    #[error("inference: {0}")]
    Inference(String),

    #[error("persistence: {0}")]
    Persistence(String),

    /// Outbound callback POST failure; never fatal for the pipeline.
    #[error("callback: {0}")]
    Callback(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    /// Wrap a database-layer error; fp-domain does not depend on the SQL
    /// crate, so the conversion happens at the call site.
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Error::Persistence(err.to_string())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
