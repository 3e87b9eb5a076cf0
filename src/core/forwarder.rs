//! Retrying reverse-proxy transport.
//!
//! [`RetryingForwarder::forward`] rewrites an inbound request for the resolved
//! backend and sends it, retrying dial failures with exponential backoff. Only
//! transport errors are retried; any HTTP response, whatever its status, is
//! returned as-is.
use std::{
    net::{IpAddr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, Request, Response, Version,
    header::{CONTENT_LENGTH, FORWARDED, HOST, TRANSFER_ENCODING},
    request::Parts,
};
use tracing::{Instrument, debug, warn};

use crate::{
    config::models::AgentConfig,
    core::{
        address::ServiceAddress,
        address_cache::{Resolution, ServiceAddressCache},
        error::{GatewayError, GatewayResult},
        function::FunctionSpec,
    },
    metrics,
    ports::{
        address_resolver::AddressResolver,
        http_client::{DialTimeout, HttpClient},
    },
    tracing_setup::create_forward_span,
};

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Retry and transport tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderSettings {
    pub initial_backoff: Duration,
    pub backoff_exponent: u32,
    /// Forwarding rounds per request; also bounds readiness waits
    pub max_retries: u32,
    /// Consecutive dial timeouts before a cached address is dropped
    pub svc_address_max_retries: u32,
    /// Per-attempt ceiling for functions without their own timeout
    pub function_timeout: Duration,
    /// Lifetime bound of background tap/untap notifications
    pub notify_timeout: Duration,
    pub max_body_bytes: usize,
}

impl From<&AgentConfig> for ForwarderSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            initial_backoff: config.round_trip.timeout,
            backoff_exponent: config.round_trip.timeout_exponent,
            max_retries: config.round_trip.max_retries,
            svc_address_max_retries: config.round_trip.svc_address_max_retries,
            function_timeout: config.round_trip.function_timeout,
            notify_timeout: config.address_cache.untap_timeout,
            max_body_bytes: config.invocation.max_body_bytes,
        }
    }
}

/// How the trigger that matched the request maps paths onto the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteBinding {
    pub prefix: Option<String>,
    pub keep_prefix: bool,
}

impl RouteBinding {
    pub fn prefix(prefix: impl Into<String>, keep_prefix: bool) -> Self {
        Self {
            prefix: Some(prefix.into()),
            keep_prefix,
        }
    }

    /// Path forwarded to the backend. The trigger prefix (or, without one, the
    /// function's internal URL) is trimmed; unmatched paths become `/`.
    pub fn rewrite_path(&self, path: &str, function_url: &str) -> String {
        let prefix = self.prefix.as_deref().filter(|p| !p.is_empty());
        let rewritten = match prefix {
            Some(_) if self.keep_prefix => path,
            Some(prefix) => path.strip_prefix(prefix).unwrap_or(path),
            None => match path.strip_prefix(function_url) {
                Some(rest) => rest,
                None => return "/".to_string(),
            },
        };

        if rewritten.starts_with('/') {
            rewritten.to_string()
        } else {
            format!("/{rewritten}")
        }
    }
}

/// Per-request retry bookkeeping.
#[derive(Debug)]
struct RetryState {
    backoff: Duration,
    attempts: u32,
    readiness_waits: u32,
    same_address_failures: u32,
    address: Option<ServiceAddress>,
    from_cache: bool,
}

impl RetryState {
    fn new(initial_backoff: Duration) -> Self {
        Self {
            backoff: initial_backoff,
            attempts: 0,
            readiness_waits: 0,
            same_address_failures: 0,
            address: None,
            from_cache: false,
        }
    }

    fn adopt(&mut self, address: ServiceAddress, from_cache: bool) {
        self.address = Some(address);
        self.from_cache = from_cache;
        self.same_address_failures = 0;
    }

    fn drop_address(&mut self) {
        self.address = None;
        self.same_address_failures = 0;
    }
}

/// Untaps leased addresses once the request is done with them, even if the
/// request future is dropped halfway.
struct UntapOnDrop {
    resolver: Arc<dyn AddressResolver>,
    function: FunctionSpec,
    addresses: Vec<ServiceAddress>,
    timeout: Duration,
}

impl Drop for UntapOnDrop {
    fn drop(&mut self) {
        if self.addresses.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(function = %self.function.identity, "runtime gone, skipping untap");
            return;
        };
        for address in self.addresses.drain(..) {
            let resolver = Arc::clone(&self.resolver);
            let function = self.function.clone();
            let timeout = self.timeout;
            handle.spawn(async move {
                match tokio::time::timeout(timeout, resolver.untap(&function, &address)).await {
                    Ok(Ok(())) => debug!(function = %function.identity, %address, "untapped service"),
                    Ok(Err(err)) => {
                        warn!(function = %function.identity, %address, error = %err, "error untapping service")
                    }
                    Err(_) => {
                        warn!(function = %function.identity, %address, "untap timed out")
                    }
                }
            });
        }
    }
}

pub struct RetryingForwarder {
    client: Arc<dyn HttpClient>,
    addresses: Arc<ServiceAddressCache>,
    settings: ForwarderSettings,
}

impl RetryingForwarder {
    pub fn new(
        client: Arc<dyn HttpClient>,
        addresses: Arc<ServiceAddressCache>,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            client,
            addresses,
            settings,
        }
    }

    pub fn settings(&self) -> &ForwarderSettings {
        &self.settings
    }

    /// Sends `request` to the backend of `function`.
    ///
    /// `initial` is a resolution the caller already performed; without one the
    /// forwarder resolves on the first round.
    pub async fn forward(
        &self,
        request: Request<AxumBody>,
        binding: &RouteBinding,
        function: &FunctionSpec,
        initial: Option<Resolution>,
    ) -> GatewayResult<Response<AxumBody>> {
        let (mut parts, body) = request.into_parts();
        add_forwarded_host_header(&mut parts.headers);
        let body = axum::body::to_bytes(body, self.settings.max_body_bytes)
            .await
            .map_err(|e| GatewayError::bad_request(format!("error reading request body: {e}")))?;

        let path = binding.rewrite_path(parts.uri.path(), &function.identity.default_url());
        let attempt_timeout = function.timeout.unwrap_or(self.settings.function_timeout);
        let function_name = function.identity.to_string();

        let mut pending = initial;
        let mut state = RetryState::new(self.settings.initial_backoff);
        let mut untaps = UntapOnDrop {
            resolver: Arc::clone(self.addresses.resolver()),
            function: function.clone(),
            addresses: Vec::new(),
            timeout: self.settings.notify_timeout,
        };

        loop {
            if state.address.is_none() {
                let resolution = match pending.take() {
                    Some(resolution) => resolution,
                    None => self.addresses.resolve(function).await?,
                };

                let Some(address) = resolution.address else {
                    state.readiness_waits += 1;
                    if state.readiness_waits > self.settings.max_retries {
                        return Err(GatewayError::exhausted(format!(
                            "backend for {function_name} not ready after {} waits",
                            state.readiness_waits - 1
                        )));
                    }
                    debug!(function = %function_name, backoff = ?state.backoff, "backend not ready, waiting");
                    metrics::increment_forward_retry("not_ready");
                    self.backoff(&mut state).await;
                    continue;
                };

                if !resolution.from_cache && function.strategy.taps_on_resolve() {
                    self.spawn_tap(function, &address);
                }
                if function.strategy.untaps_after_use() {
                    untaps.addresses.push(address.clone());
                }
                state.adopt(address, resolution.from_cache);
            }

            let Some(address) = state.address.clone() else {
                continue;
            };
            state.attempts += 1;

            let mut outbound = build_outbound(&parts, &body, &address, &path)?;
            // The dial deadline grows with the backoff, round by round.
            outbound.extensions_mut().insert(DialTimeout(state.backoff));
            let span = create_forward_span(&function_name, &address.to_string(), state.attempts);
            let outcome = tokio::time::timeout(attempt_timeout, self.client.send_request(outbound))
                .instrument(span)
                .await;

            let err = match outcome {
                Ok(Ok(response)) => return Ok(response),
                Err(_) => {
                    return Err(GatewayError::deadline_exceeded(format!(
                        "{function_name} did not respond within {attempt_timeout:?}"
                    )));
                }
                Ok(Err(err)) if !err.is_dial_error() => {
                    return Err(GatewayError::network(format!(
                        "error sending request to {address} for {function_name}: {err}"
                    )));
                }
                Ok(Err(err)) => err,
            };

            warn!(
                function = %function_name,
                %address,
                attempt = state.attempts,
                error = %err,
                "dial to function backend failed"
            );
            if state.attempts >= self.settings.max_retries {
                return Err(GatewayError::exhausted(format!(
                    "unable to reach {function_name} after {} attempts: {err}",
                    state.attempts
                )));
            }

            if err.is_timeout() {
                state.same_address_failures += 1;
                if state.same_address_failures >= self.settings.svc_address_max_retries {
                    if state.from_cache {
                        self.addresses.invalidate(&function.identity).await;
                    }
                    state.drop_address();
                }
            }

            metrics::increment_forward_retry(if err.is_timeout() { "dial_timeout" } else { "dial" });
            self.backoff(&mut state).await;
        }
    }

    async fn backoff(&self, state: &mut RetryState) {
        tokio::time::sleep(state.backoff).await;
        state.backoff = state.backoff.saturating_mul(self.settings.backoff_exponent);
    }

    fn spawn_tap(&self, function: &FunctionSpec, address: &ServiceAddress) {
        let resolver = Arc::clone(self.addresses.resolver());
        let function = function.clone();
        let address = address.clone();
        let timeout = self.settings.notify_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, resolver.tap(&function, &address)).await {
                Ok(Ok(())) => debug!(function = %function.identity, %address, "tapped service"),
                Ok(Err(err)) => {
                    warn!(function = %function.identity, %address, error = %err, "error tapping service")
                }
                Err(_) => warn!(function = %function.identity, %address, "tap timed out"),
            }
        });
    }
}

fn build_outbound(
    parts: &Parts,
    body: &Bytes,
    address: &ServiceAddress,
    path: &str,
) -> GatewayResult<Request<AxumBody>> {
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let uri = address
        .uri_for(&path_and_query)
        .map_err(|e| GatewayError::bad_request(e.to_string()))?;

    let mut headers = parts.headers.clone();
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    let host = HeaderValue::from_str(address.authority())
        .map_err(|e| GatewayError::bad_request(format!("invalid backend host: {e}")))?;
    headers.insert(HOST, host);

    let mut request = Request::new(AxumBody::from(body.clone()));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Records the client-facing host unless an upstream proxy already did.
pub fn add_forwarded_host_header(headers: &mut HeaderMap) {
    let already_set = |name| {
        headers
            .get(name)
            .is_some_and(|value: &HeaderValue| !value.is_empty())
    };
    if already_set(FORWARDED.as_str()) || already_set(X_FORWARDED_HOST) {
        return;
    }

    let Some(host) = headers.get(HOST).and_then(|h| h.to_str().ok()).map(str::to_owned) else {
        return;
    };

    let forwarded = if is_ipv6_host(&host) {
        format!("host=\"{host}\";")
    } else {
        format!("host={host};")
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(FORWARDED, value);
    }
    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
}

fn is_ipv6_host(host: &str) -> bool {
    let hostname = match host.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None if host.parse::<Ipv6Addr>().is_ok() => host,
        None => host.rsplit_once(':').map_or(host, |(name, _)| name),
    };
    matches!(hostname.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
}
