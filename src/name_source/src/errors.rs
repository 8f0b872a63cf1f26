use thiserror::Error;

/// Why a name lookup failed, as seen by the caller's retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The source does not know this product. Retrying will not help.
    #[error("product not found: {0}")]
    NotFound(String),

    /// Timeouts, connection resets, rate limiting, upstream 5xx.
    #[error("transient source failure: {0}")]
    Transient(String),

    /// Authentication, authorization or request-shape failures.
    #[error("fatal source failure: {0}")]
    Fatal(String),
}

impl FetchError {
    /// `true` when a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Short machine-readable label, used as the `error_type` of persisted failures.
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::NotFound(_) => "not_found",
            FetchError::Transient(_) => "transient",
            FetchError::Fatal(_) => "fatal",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return crate::http::classify_status(status, &e.to_string());
        }
        if e.is_timeout() || e.is_connect() || e.is_request() {
            FetchError::Transient(e.to_string())
        } else if e.is_decode() || e.is_builder() {
            FetchError::Fatal(e.to_string())
        } else {
            FetchError::Transient(e.to_string())
        }
    }
}

/// Errors raised while constructing a name source.
#[derive(Debug, Error)]
pub enum SourceInitError {
    /// The API token variable is not set.
    #[error(transparent)]
    Env(#[from] shared_utils::env::EnvError),

    /// The configured base URL does not parse or cannot carry path segments.
    #[error("invalid base url {0:?}")]
    BaseUrl(String),

    /// The token contains bytes that are not valid in an HTTP header.
    #[error("invalid header value")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    /// The HTTP client could not be built (TLS backend, proxy config).
    #[error("failed to build HTTP client")]
    Client(#[from] reqwest::Error),
}
