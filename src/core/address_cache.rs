//! Service address cache with single-flight resolution.
//!
//! Addresses handed out by the orchestration collaborator are cached per
//! [`FunctionIdentity`] for a fixed TTL and evicted lazily on lookup (plus a periodic
//! reaper). Concurrent misses for the same identity share one in-flight resolution:
//! the first caller (the leader) drives the collaborator call and fills the cache,
//! every other caller awaits the same shared future.
//!
//! A second map keeps the pod address a function uid last reported its result
//! from. Functions whose strategy routes to pods are sent there directly while
//! the entry is live, bypassing the service address.
use std::{sync::Arc, time::Duration};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use scc::hash_map::Entry;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    core::{
        address::ServiceAddress,
        error::GatewayError,
        function::{FunctionIdentity, FunctionSpec},
        ttl_map::TtlMap,
    },
    metrics,
    ports::address_resolver::{AddressResolver, ResolverError},
};

#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error("resolving {function} timed out after {timeout:?}")]
    Timeout { function: String, timeout: Duration },
}

impl From<ResolveError> for GatewayError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Resolver(e) => e.into(),
            timeout @ ResolveError::Timeout { .. } => {
                GatewayError::resolution(None, timeout.to_string())
            }
        }
    }
}

/// Outcome of [`ServiceAddressCache::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when the backend is not ready yet
    pub address: Option<ServiceAddress>,
    /// False only for the caller that performed a fresh collaborator call
    pub from_cache: bool,
}

impl Resolution {
    pub fn fresh(address: Option<ServiceAddress>) -> Self {
        Self {
            address,
            from_cache: false,
        }
    }
}

type SharedResolution = Shared<BoxFuture<'static, Result<Option<ServiceAddress>, ResolveError>>>;

/// TTL cache of backend addresses fronting the orchestration collaborator.
pub struct ServiceAddressCache {
    resolver: Arc<dyn AddressResolver>,
    services: Arc<TtlMap<FunctionIdentity, ServiceAddress>>,
    pods: TtlMap<String, ServiceAddress>,
    inflight: Arc<scc::HashMap<FunctionIdentity, SharedResolution>>,
    update_timeout: Duration,
}

impl ServiceAddressCache {
    pub fn new(resolver: Arc<dyn AddressResolver>, ttl: Duration, update_timeout: Duration) -> Self {
        Self {
            resolver,
            services: Arc::new(TtlMap::new(ttl)),
            pods: TtlMap::new(ttl),
            inflight: Arc::new(scc::HashMap::new()),
            update_timeout,
        }
    }

    pub fn resolver(&self) -> &Arc<dyn AddressResolver> {
        &self.resolver
    }

    /// Returns a live address for `function`.
    ///
    /// Pool-managed functions always go to the collaborator. Everything else is
    /// served from the cache, or from a single shared resolution per identity.
    pub async fn resolve(&self, function: &FunctionSpec) -> Result<Resolution, ResolveError> {
        if function.strategy.always_resolve() {
            let address = self.resolver.get_address_for_function(function).await?;
            return Ok(Resolution::fresh(address));
        }

        if function.strategy.routes_to_pod() {
            if let Some(pod) = self.pods.get(&function.identity.uid).await {
                metrics::record_address_cache_event("pod_hit");
                return Ok(Resolution {
                    address: Some(pod),
                    from_cache: true,
                });
            }
        }

        let identity = &function.identity;
        if let Some(address) = self.services.get(identity).await {
            metrics::record_address_cache_event("hit");
            return Ok(Resolution {
                address: Some(address),
                from_cache: true,
            });
        }
        metrics::record_address_cache_event("miss");

        let (resolution, leader) = match self.inflight.entry_async(identity.clone()).await {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let resolution = self.start_resolution(function.clone());
                vacant.insert_entry(resolution.clone());
                (resolution, true)
            }
        };

        let address = resolution.await?;
        Ok(Resolution {
            address,
            from_cache: !leader,
        })
    }

    fn start_resolution(&self, function: FunctionSpec) -> SharedResolution {
        let resolver = Arc::clone(&self.resolver);
        let services = Arc::clone(&self.services);
        let inflight = Arc::clone(&self.inflight);
        let timeout = self.update_timeout;

        async move {
            let identity = function.identity.clone();
            debug!(function = %identity, "resolving service address");
            metrics::record_address_cache_event("resolution");

            let outcome = match tokio::time::timeout(
                timeout,
                resolver.get_address_for_function(&function),
            )
            .await
            {
                Ok(Ok(Some(address))) => {
                    services.insert(identity.clone(), address.clone()).await;
                    Ok(Some(address))
                }
                Ok(Ok(None)) => Ok(None),
                Ok(Err(err)) => Err(ResolveError::Resolver(err)),
                Err(_) => Err(ResolveError::Timeout {
                    function: identity.to_string(),
                    timeout,
                }),
            };

            if let Err(err) = &outcome {
                warn!(function = %identity, error = %err, "service address resolution failed");
            }
            inflight.remove_async(&identity).await;
            outcome
        }
        .boxed()
        .shared()
    }

    /// Drops the cached service and pod addresses so the next resolution goes
    /// to the collaborator.
    pub async fn invalidate(&self, identity: &FunctionIdentity) -> bool {
        let pod_removed = self.pods.remove(&identity.uid).await;
        let removed = self.services.remove(identity).await || pod_removed;
        if removed {
            metrics::record_address_cache_event("invalidation");
            info!(function = %identity, "evicted cached service address");
        }
        removed
    }

    pub async fn cached_address(&self, identity: &FunctionIdentity) -> Option<ServiceAddress> {
        self.services.get(identity).await
    }

    pub async fn pod_address(&self, uid: &str) -> Option<ServiceAddress> {
        self.pods.get(&uid.to_string()).await
    }

    pub async fn assign_pod(&self, uid: &str, address: ServiceAddress) {
        self.pods.insert(uid.to_string(), address).await;
    }

    /// Removes expired entries from both maps, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        self.services.purge_expired().await + self.pods.purge_expired().await
    }

    pub fn service_entries(&self) -> usize {
        self.services.len()
    }

    pub fn pod_entries(&self) -> usize {
        self.pods.len()
    }
}
