//! Error types shared by the HTTP adapters

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Longest response body kept in an error message.
const MAX_BODY_CHARS: usize = 500;

/// Errors from talking to Conbench or GitHub
#[derive(Error, Debug)]
pub enum ClientError {
    /// Server answered with a non-success status
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    /// Request never produced a response
    #[error("request to {url} failed: {message}")]
    Transport {
        url: String,
        message: String,
        /// Connection refused, reset or timed out
        retryable: bool,
    },

    /// Response body did not match the expected shape
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ClientError {
    /// HTTP status, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the request failed before reaching the server in a way worth retrying.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, ClientError::Transport { retryable: true, .. })
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport {
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            retryable: err.is_connect() || err.is_timeout(),
            message: err.to_string(),
        }
    }
}

/// Turn a response into `T`, or a `Status` error carrying a truncated body.
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let url = response.url().to_string();
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode {
        url,
        message: e.to_string(),
    })
}

/// Pass successful responses through; drain the rest into a `Status` error.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        url,
        status: status.as_u16(),
        body: body.chars().take(MAX_BODY_CHARS).collect(),
    })
}
