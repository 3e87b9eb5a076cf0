//! Per-trigger request orchestration.
//!
//! Every inbound request walks the same states: result lookup, address resolution,
//! then a branch on the function's [`InvocationMode`]. Exactly one metric event is
//! emitted per request, including requests abandoned by the client.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{body::Body as AxumBody, extract::ConnectInfo};
use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
    header::CONTENT_TYPE,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::{
    config::models::AgentConfig,
    core::{
        address_cache::{Resolution, ServiceAddressCache},
        canary::WeightedVariants,
        error::{GatewayError, GatewayResult, client_closed_status},
        forwarder::{ForwarderSettings, RetryingForwarder, RouteBinding},
        function::{FunctionSpec, InvocationMode},
        rendezvous::{CORRELATION_HEADER, Delivery, RendezvousRegistry},
    },
    ports::{
        address_resolver::AddressResolver,
        function_metrics::{FunctionCall, FunctionMetrics},
        http_client::HttpClient,
        result_store::{ResultStore, StoreError},
    },
    tracing_setup::create_invocation_span,
};

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationSettings {
    /// Ceiling for a synchronous request waiting on its completion callback
    pub sync_wait: Duration,
    pub max_body_bytes: usize,
    pub debug: bool,
}

impl From<&AgentConfig> for InvocationSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            sync_wait: config.invocation.sync_wait,
            max_body_bytes: config.invocation.max_body_bytes,
            debug: config.debug,
        }
    }
}

/// Collaborators shared by every handler of a route table.
pub struct InvocationContext {
    pub addresses: Arc<ServiceAddressCache>,
    pub forwarder: Arc<RetryingForwarder>,
    pub results: Arc<dyn ResultStore>,
    pub rendezvous: RendezvousRegistry,
    pub metrics: Arc<dyn FunctionMetrics>,
    pub settings: InvocationSettings,
}

impl InvocationContext {
    /// Wires the address cache and forwarder from `config` around the given ports.
    pub fn new(
        config: &AgentConfig,
        resolver: Arc<dyn AddressResolver>,
        client: Arc<dyn HttpClient>,
        results: Arc<dyn ResultStore>,
        metrics: Arc<dyn FunctionMetrics>,
    ) -> Self {
        let addresses = Arc::new(ServiceAddressCache::new(
            resolver,
            config.address_cache.ttl,
            config.address_cache.update_timeout,
        ));
        let forwarder = Arc::new(RetryingForwarder::new(
            client,
            Arc::clone(&addresses),
            ForwarderSettings::from(config),
        ));
        Self {
            addresses,
            forwarder,
            results,
            rendezvous: RendezvousRegistry::with_correlation_ttl(config.invocation.correlation_ttl),
            metrics,
            settings: InvocationSettings::from(config),
        }
    }

    /// Periodically purges expired address cache entries and unclaimed
    /// correlation ids until `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let addresses = ctx.addresses.purge_expired().await;
                        let correlations = ctx.rendezvous.purge_expired().await;
                        if addresses + correlations > 0 {
                            debug!(addresses, correlations, "purged expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

/// The function(s) a handler dispatches to.
#[derive(Debug, Clone)]
pub enum FunctionTarget {
    Single(Arc<FunctionSpec>),
    /// Canary split; `functions[i]` is the variant at index `i`
    Weighted {
        variants: WeightedVariants,
        functions: Vec<Arc<FunctionSpec>>,
    },
}

impl FunctionTarget {
    fn pick(&self) -> Arc<FunctionSpec> {
        match self {
            FunctionTarget::Single(function) => Arc::clone(function),
            FunctionTarget::Weighted {
                variants,
                functions,
            } => Arc::clone(&functions[variants.pick_index()]),
        }
    }

    /// Function a completion callback belongs to. An echoed correlation id is
    /// claimed either way; weighted targets cannot be attributed without one.
    async fn for_callback(
        &self,
        correlation_id: Option<Uuid>,
        rendezvous: &RendezvousRegistry,
    ) -> Option<Arc<FunctionSpec>> {
        let issued_to = match correlation_id {
            Some(id) => rendezvous.claim(id).await,
            None => None,
        };
        match self {
            FunctionTarget::Single(function) => Some(Arc::clone(function)),
            FunctionTarget::Weighted { functions, .. } => {
                let uid = issued_to?;
                functions.iter().find(|f| f.uid() == uid).cloned()
            }
        }
    }
}

/// Emits the invocation metric when dropped. A request dropped before a status
/// was recorded counts as closed by the client.
struct CallRecorder {
    sink: Arc<dyn FunctionMetrics>,
    call: Option<FunctionCall>,
    started: std::time::Instant,
}

impl CallRecorder {
    fn start(sink: Arc<dyn FunctionMetrics>, function: &FunctionSpec, path: &str, method: Method) -> Self {
        Self {
            sink,
            call: Some(FunctionCall {
                function: function.identity.clone(),
                path: path.to_string(),
                method,
                status: client_closed_status(),
                duration: Duration::ZERO,
            }),
            started: std::time::Instant::now(),
        }
    }

    fn finish(mut self, status: StatusCode) {
        if let Some(call) = self.call.as_mut() {
            call.status = status;
        }
    }
}

impl Drop for CallRecorder {
    fn drop(&mut self) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        call.duration = self.started.elapsed();
        let sink = Arc::clone(&self.sink);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { sink.record_call(&call) });
            }
            Err(_) => sink.record_call(&call),
        }
    }
}

/// Handler bound to one trigger (or one function's internal URL).
pub struct InvocationHandler {
    ctx: Arc<InvocationContext>,
    target: FunctionTarget,
    binding: RouteBinding,
    /// Metric label: trigger prefix, relative URL or internal function URL
    route_path: String,
}

impl InvocationHandler {
    pub fn new(
        ctx: Arc<InvocationContext>,
        target: FunctionTarget,
        binding: RouteBinding,
        route_path: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            target,
            binding,
            route_path: route_path.into(),
        }
    }

    pub fn route_path(&self) -> &str {
        &self.route_path
    }

    /// Serves one invocation. Never fails: every error becomes a response.
    pub async fn handle(&self, request: Request<AxumBody>) -> Response<AxumBody> {
        let function = self.target.pick();
        let span = create_invocation_span(
            &function.identity.to_string(),
            request.method().as_str(),
            request.uri().path(),
        );
        let recorder = CallRecorder::start(
            Arc::clone(&self.ctx.metrics),
            &function,
            &self.route_path,
            request.method().clone(),
        );

        let response = match self.invoke(&function, request).instrument(span.clone()).await {
            Ok(response) => response,
            Err(err) => span.in_scope(|| err.into_response(self.ctx.settings.debug)),
        };

        span.record("http.status_code", response.status().as_u16());
        recorder.finish(response.status());
        response
    }

    async fn invoke(
        &self,
        function: &Arc<FunctionSpec>,
        request: Request<AxumBody>,
    ) -> GatewayResult<Response<AxumBody>> {
        match self.ctx.results.get(function.uid()).await {
            Ok(payload) => {
                debug!(function = %function.identity, "serving stored result");
                return Ok(result_response(payload, None));
            }
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let resolution = self.ctx.addresses.resolve(function).await?;

        match function.strategy.invocation_mode() {
            InvocationMode::Proxy => {
                self.ctx
                    .forwarder
                    .forward(request, &self.binding, function, Some(resolution))
                    .await
            }
            InvocationMode::Synchronous => self.invoke_sync(function, request, resolution).await,
            InvocationMode::Asynchronous => Ok(self.invoke_async(function, request, resolution).await),
        }
    }

    async fn invoke_sync(
        &self,
        function: &Arc<FunctionSpec>,
        request: Request<AxumBody>,
        resolution: Resolution,
    ) -> GatewayResult<Response<AxumBody>> {
        let mut slot = self.ctx.rendezvous.register(function.uid());
        let correlation_id = slot.correlation_id();
        self.ctx.rendezvous.remember(correlation_id, function.uid()).await;

        let kickoff = self
            .ctx
            .forwarder
            .forward(
                with_correlation(request, correlation_id),
                &self.binding,
                function,
                Some(resolution),
            )
            .await?;
        if !kickoff.status().is_success() {
            warn!(function = %function.identity, status = %kickoff.status(), "backend rejected invocation");
            return Ok(kickoff);
        }

        let wait = self.ctx.settings.sync_wait;
        match tokio::time::timeout(wait, slot.wait()).await {
            Ok(Some(payload)) => Ok(result_response(payload, Some(correlation_id))),
            Ok(None) | Err(_) => Err(GatewayError::rendezvous_timeout(format!(
                "no result from {} within {wait:?}",
                function.identity
            ))),
        }
    }

    async fn invoke_async(
        &self,
        function: &Arc<FunctionSpec>,
        request: Request<AxumBody>,
        resolution: Resolution,
    ) -> Response<AxumBody> {
        let correlation_id = Uuid::new_v4();
        self.ctx.rendezvous.remember(correlation_id, function.uid()).await;
        let request = with_correlation(request, correlation_id);
        let ctx = Arc::clone(&self.ctx);
        let binding = self.binding.clone();
        let background = Arc::clone(function);

        tokio::spawn(
            async move {
                match ctx
                    .forwarder
                    .forward(request, &binding, &background, Some(resolution))
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        debug!(function = %background.identity, "asynchronous invocation accepted by backend");
                    }
                    Ok(response) => {
                        warn!(function = %background.identity, status = %response.status(), "backend rejected asynchronous invocation")
                    }
                    Err(err) => {
                        warn!(function = %background.identity, error = %err, "asynchronous invocation failed")
                    }
                }
            }
            .in_current_span(),
        );

        let body = serde_json::json!({
            "status": "accepted",
            "function": function.identity.name,
            "namespace": function.identity.namespace,
            "correlation_id": correlation_id,
        });
        Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_TYPE, "application/json")
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .body(AxumBody::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(AxumBody::empty()))
    }

    /// Completion callback posted by the backend once a function finished.
    pub async fn function_output(&self, request: Request<AxumBody>) -> Response<AxumBody> {
        let debug = self.ctx.settings.debug;
        match self.store_output(request).await {
            Ok(()) => Response::new(AxumBody::empty()),
            Err(err) => err.into_response(debug),
        }
    }

    async fn store_output(&self, request: Request<AxumBody>) -> GatewayResult<()> {
        let (parts, body) = request.into_parts();
        let correlation_id = correlation_from(&parts.headers)?;
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let payload = axum::body::to_bytes(body, self.ctx.settings.max_body_bytes)
            .await
            .map_err(|e| GatewayError::bad_request(format!("error reading request body: {e}")))?;

        let function = self
            .target
            .for_callback(correlation_id, &self.ctx.rendezvous)
            .await
            .ok_or_else(|| {
                GatewayError::bad_request(format!(
                    "cannot tell which function of '{}' produced this result; send {CORRELATION_HEADER}",
                    self.route_path
                ))
            })?;

        self.ctx
            .results
            .set(function.uid(), payload.clone(), None)
            .await
            .map_err(|e| {
                GatewayError::store(format!(
                    "error persisting result of {}: {e}",
                    function.identity
                ))
            })?;
        info!(function = %function.identity, bytes = payload.len(), "stored function result");
        if let Some(peer) = peer {
            self.record_pod(&function, peer).await;
        }

        if function.strategy.invocation_mode() == InvocationMode::Synchronous {
            if self.ctx.rendezvous.publish(function.uid(), correlation_id, payload) == Delivery::NoListener {
                warn!(function = %function.identity, "no request waiting for function result");
            }
        }
        Ok(())
    }

    /// Remembers the pod that reported a job result so later runs of the same
    /// function go straight to it. The pod serves on the service's port.
    async fn record_pod(&self, function: &FunctionSpec, peer: SocketAddr) {
        if !function.strategy.routes_to_pod() {
            return;
        }
        let Some(service) = self.ctx.addresses.cached_address(&function.identity).await else {
            return;
        };
        match service.on_host(peer.ip()) {
            Ok(pod) => {
                debug!(function = %function.identity, %pod, "recorded pod address");
                self.ctx.addresses.assign_pod(function.uid(), pod).await;
            }
            Err(err) => warn!(function = %function.identity, error = %err, "unusable pod address"),
        }
    }
}

fn with_correlation(mut request: Request<AxumBody>, correlation_id: Uuid) -> Request<AxumBody> {
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        request.headers_mut().insert(CORRELATION_HEADER, value);
    }
    request
}

fn correlation_from(headers: &HeaderMap) -> GatewayResult<Option<Uuid>> {
    let Some(value) = headers.get(CORRELATION_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .map(Some)
        .ok_or_else(|| GatewayError::bad_request(format!("malformed {CORRELATION_HEADER} header")))
}

fn result_response(payload: Bytes, correlation_id: Option<Uuid>) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(payload));
    if let Some(value) = correlation_id.and_then(|id| HeaderValue::from_str(&id.to_string()).ok()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
