use thiserror::Error;

/// Enumeration of failures while delivering one webhook request.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("error parsing webhook url")]
    ParseUrlError(url::ParseError),
    #[error("webhook request timed out: {0}")]
    Timeout(reqwest::Error),
    #[error("webhook request failed: {0}")]
    Request(reqwest::Error),
    #[error("webhook endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

impl DeliveryError {
    /// Whether a later attempt could still succeed. Timeouts and unparseable
    /// urls are terminal, connect errors and non-2xx responses are not.
    pub fn retryable(&self) -> bool {
        matches!(self, DeliveryError::Request(_) | DeliveryError::Status(_))
    }
}
