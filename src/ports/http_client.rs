use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
///
/// The variants double as the forwarder's retry classification: only dial
/// failures are retried, and only dial timeouts count against the address.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The backend refused or reset the connection attempt
    #[error("Connection error: {0}")]
    Connect(String),

    /// The connection attempt did not complete in time
    #[error("Connection timed out: {0}")]
    ConnectTimeout(String),

    /// The outbound request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Failure after the connection was established (malformed response, reset mid-body)
    #[error("Transport error: {0}")]
    Transport(String),
}

impl HttpClientError {
    /// Network dial failure; eligible for retry.
    pub fn is_dial_error(&self) -> bool {
        matches!(
            self,
            HttpClientError::Connect(_) | HttpClientError::ConnectTimeout(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpClientError::ConnectTimeout(_))
    }
}

/// Request extension carrying the connect timeout of one forwarding round.
///
/// Clients honour it in place of their configured dial timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DialTimeout(pub Duration);

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server
    ///
    /// # Arguments
    /// * `req` - The fully rewritten request (absolute URI, Host already set)
    ///
    /// # Returns
    /// The backend's response, whatever its status, or a transport error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
