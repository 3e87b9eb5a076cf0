use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;

use crate::core::{address::ServiceAddress, function::FunctionSpec};

/// Failure reported by the orchestration collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ResolverError {
    /// HTTP-style status, when the collaborator supplied one
    pub status: Option<StatusCode>,
    pub message: String,
}

impl ResolverError {
    pub fn new(status: Option<StatusCode>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

pub type ResolverResult<T> = Result<T, ResolverError>;

/// Port to the collaborator that provisions backends and hands out their addresses.
#[async_trait]
pub trait AddressResolver: Send + Sync + 'static {
    /// Returns the live address of the function's backend. `Ok(None)` means the
    /// backend exists but is not ready to accept traffic yet.
    async fn get_address_for_function(
        &self,
        function: &FunctionSpec,
    ) -> ResolverResult<Option<ServiceAddress>>;

    /// Marks the address as in use so it is not reclaimed.
    async fn tap(&self, function: &FunctionSpec, address: &ServiceAddress) -> ResolverResult<()>;

    /// Releases an address leased for a single request.
    async fn untap(&self, function: &FunctionSpec, address: &ServiceAddress)
    -> ResolverResult<()>;
}
