//! Structured failures of the dispatch core.
//!
//! Every failure path in the core produces a [`GatewayError`] carrying an explicit
//! [`ErrorKind`] and status code. The HTTP response is derived exactly once, at the
//! handler boundary, via [`GatewayError::into_response`].
use std::fmt;

use axum::{body::Body as AxumBody, http::header::CONTENT_TYPE};
use http::{Response, StatusCode};
use thiserror::Error;

use crate::ports::{address_resolver::ResolverError, result_store::StoreError};

/// Non-standard status for requests abandoned by the client.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Backend not found, not ready, or the orchestration collaborator failed
    Resolution,
    /// Non-retriable transport failure
    Network,
    /// Result store failure other than "not found"
    Store,
    ClientClosed,
    DeadlineExceeded,
    /// Retry budget spent without reaching a backend
    Exhausted,
    /// No completion callback arrived within the wait window
    RendezvousTimeout,
    BadRequest,
}

impl ErrorKind {
    fn generic_message(self) -> &'static str {
        match self {
            ErrorKind::Resolution => "error getting function address",
            ErrorKind::Network => "error sending request to function",
            ErrorKind::Store => "error reading function result",
            ErrorKind::ClientClosed => "client closes the connection",
            ErrorKind::DeadlineExceeded => "function timed out",
            ErrorKind::Exhausted => "no available address for function",
            ErrorKind::RendezvousTimeout => "timed out waiting for function result",
            ErrorKind::BadRequest => "bad request",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::Network => "network",
            ErrorKind::Store => "store",
            ErrorKind::ClientClosed => "client_closed",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::RendezvousTimeout => "rendezvous_timeout",
            ErrorKind::BadRequest => "bad_request",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind} error ({status}): {message}")]
pub struct GatewayError {
    kind: ErrorKind,
    status: StatusCode,
    message: String,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    fn new(kind: ErrorKind, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    /// Collaborator failures keep their status; anything unusable becomes 500.
    pub fn resolution(status: Option<StatusCode>, message: impl Into<String>) -> Self {
        let status = status
            .filter(|s| s.is_client_error() || s.is_server_error())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(ErrorKind::Resolution, status, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, StatusCode::BAD_GATEWAY, message)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Store, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn client_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientClosed, client_closed_status(), message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::DeadlineExceeded,
            StatusCode::GATEWAY_TIMEOUT,
            message,
        )
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Exhausted,
            StatusCode::SERVICE_UNAVAILABLE,
            message,
        )
    }

    pub fn rendezvous_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RendezvousTimeout, StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, StatusCode::BAD_REQUEST, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Renders the error for the end user. Detail is only exposed in debug mode;
    /// it is always logged.
    pub fn into_response(self, debug: bool) -> Response<AxumBody> {
        if self.status.is_server_error() {
            tracing::error!(kind = %self.kind, status = %self.status, error = %self.message, "request failed");
        } else {
            tracing::warn!(kind = %self.kind, status = %self.status, error = %self.message, "request failed");
        }

        let body = if debug {
            self.message
        } else {
            self.kind.generic_message().to_string()
        };

        Response::builder()
            .status(self.status)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(AxumBody::from(body))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(AxumBody::empty());
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}

impl From<ResolverError> for GatewayError {
    fn from(err: ResolverError) -> Self {
        GatewayError::resolution(err.status, err.message)
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::store(err.to_string())
    }
}

pub fn client_closed_status() -> StatusCode {
    StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn body_text(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn statuses_follow_kind() {
        assert_eq!(GatewayError::network("x").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::deadline_exceeded("x").status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(GatewayError::client_closed("x").status().as_u16(), 499);
        assert_eq!(
            GatewayError::rendezvous_timeout("x").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::exhausted("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn resolution_keeps_collaborator_status() {
        let err = GatewayError::resolution(Some(StatusCode::TOO_MANY_REQUESTS), "busy");
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let err = GatewayError::resolution(None, "boom");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = GatewayError::resolution(Some(StatusCode::OK), "odd");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn debug_mode_exposes_detail() {
        let err = GatewayError::store("connection reset by redis");
        assert_eq!(
            body_text(err.clone().into_response(true)).await,
            "connection reset by redis"
        );
        assert_eq!(
            body_text(err.into_response(false)).await,
            "error reading function result"
        );
    }
}
