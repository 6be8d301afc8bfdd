pub mod client;
pub mod method;
pub mod policy;
pub mod request;
pub mod response;

use thiserror::Error;

/// Failure while resolving or executing one collection request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Request failed: {0}")]
    Send(String),
    #[error("Failed to read response: {0}")]
    Read(String),
    #[error("Exceeded maxRedirects ({max}). Probably stuck in a redirect loop {url}")]
    TooManyRedirects { max: u32, url: String },
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Request cancelled")]
    Cancelled,
}

impl RequestError {
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return RequestError::Timeout(err.to_string());
        }
        if err.is_connect() {
            return RequestError::Connect(err.to_string());
        }
        if err.is_builder() {
            return RequestError::Client(err.to_string());
        }
        RequestError::Send(err.to_string())
    }
}
