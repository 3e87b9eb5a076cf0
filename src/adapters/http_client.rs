use std::{error::Error as StdError, io, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Version, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use scc::hash_map::Entry;

use crate::{
    config::models::RoundTripConfig,
    ports::http_client::{DialTimeout, HttpClient, HttpClientError, HttpClientResult},
};

/// HTTP/1.1 client adapter for in-cluster function backends.
///
/// Responsibilities:
/// * Applies the dial timeout and keep-alive settings of the round-trip config
/// * Honours a per-request [`DialTimeout`], keeping one pooled client per deadline
/// * Classifies failures into dial / dial-timeout / other for the retry loop
/// * Converts between Hyper body and Axum body types
///
/// No retries happen here; the forwarder owns the retry policy.
pub struct HttpClientAdapter {
    config: RoundTripConfig,
    client: Client<HttpConnector, AxumBody>,
    /// Clients for dial deadlines other than the configured one
    by_dial_timeout: scc::HashMap<Duration, Client<HttpConnector, AxumBody>>,
}

impl HttpClientAdapter {
    pub fn new(config: &RoundTripConfig) -> Self {
        let client = build_client(config, config.timeout);
        tracing::info!(
            dial_timeout = ?config.timeout,
            keep_alive = !config.disable_keep_alive,
            "Created backend HTTP client"
        );
        Self {
            config: config.clone(),
            client,
            by_dial_timeout: scc::HashMap::new(),
        }
    }

    async fn client_for(&self, dial_timeout: Option<DialTimeout>) -> Client<HttpConnector, AxumBody> {
        let Some(DialTimeout(timeout)) = dial_timeout.filter(|d| d.0 != self.config.timeout) else {
            return self.client.clone();
        };
        match self.by_dial_timeout.entry_async(timeout).await {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                tracing::debug!(dial_timeout = ?timeout, "Created backend HTTP client for dial deadline");
                let client = build_client(&self.config, timeout);
                vacant.insert_entry(client.clone());
                client
            }
        }
    }

    /// Number of distinct dial deadlines served so far, the configured one included.
    pub fn dial_deadlines(&self) -> usize {
        self.by_dial_timeout.len() + 1
    }

    /// Connection-stage failures are retriable; a timeout anywhere in the
    /// source chain marks a dial timeout.
    fn classify(err: hyper_util::client::legacy::Error) -> HttpClientError {
        let message = match err.source() {
            Some(source) => format!("{err}: {source}"),
            None => err.to_string(),
        };
        if !err.is_connect() {
            return HttpClientError::Transport(message);
        }
        if chain_has_timeout(&err) {
            HttpClientError::ConnectTimeout(message)
        } else {
            HttpClientError::Connect(message)
        }
    }
}

fn build_client(config: &RoundTripConfig, dial_timeout: Duration) -> Client<HttpConnector, AxumBody> {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(dial_timeout));
    connector.set_nodelay(true);

    let mut builder = Client::builder(TokioExecutor::new());
    if config.disable_keep_alive {
        connector.set_keepalive(None);
        builder.pool_max_idle_per_host(0);
    } else {
        connector.set_keepalive(Some(config.keep_alive));
        builder.pool_idle_timeout(config.keep_alive);
    }
    builder.build::<_, AxumBody>(connector)
}

fn chain_has_timeout(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        current = e.source();
    }
    false
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new(&RoundTripConfig::default())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let client = self.client_for(parts.extensions.get::<DialTimeout>().copied()).await;
        tracing::debug!(method = %parts.method, uri = %parts.uri, "Sending request to backend");

        match client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed by the downstream server.
                parts.headers.remove(header::TRANSFER_ENCODING);
                tracing::debug!(status = %parts.status, "Backend responded");
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(err) => {
                let classified = Self::classify(err);
                tracing::debug!(error = %classified, "Backend request failed");
                Err(classified)
            }
        }
    }
}
