use thiserror::Error;

/// Errors from the remote photo search service.
///
/// None of these are retried; the sync engine logs them and carries on with
/// whatever it already has.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Network error requesting {url}: {source}")]
    Network {
        url: String,
        source: reqwest::Error,
    },

    #[error("HTTP error {status} requesting {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Malformed search response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The service answered with `stat: "fail"`.
    #[error("Photo search failed: {message} (code: {code})")]
    Api { code: i64, message: String },

    #[error("Invalid photo reference {0}")]
    InvalidReference(String),
}
