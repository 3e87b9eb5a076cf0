//! Function identity and the closed set of execution strategies.
use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::config::models::DEFAULT_NAMESPACE;

/// Identifies one deployment of a function. A redeploy bumps
/// `resource_version`, which makes it a distinct cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionIdentity {
    pub name: String,
    pub namespace: String,
    pub resource_version: String,
    pub uid: String,
}

impl FunctionIdentity {
    pub fn new(name: &str, namespace: &str, resource_version: &str, uid: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource_version: resource_version.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Internal URL every function is reachable on, independent of triggers.
    pub fn default_url(&self) -> String {
        if self.namespace == DEFAULT_NAMESPACE {
            format!("/fn/{}", self.name)
        } else {
            format!("/fn/{}/{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.resource_version)
    }
}

/// How the orchestration collaborator runs a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Generic warm pool; addresses are leased per request
    #[default]
    PoolManager,
    /// Dedicated deployment per function
    NewDeploy,
    /// Short-lived wasm job whose result is awaited by the caller
    WasmShort,
    /// Long-running wasm job; the caller only gets an acknowledgement
    WasmLong,
}

/// How the handler answers the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Mirror the backend response
    Proxy,
    /// Block until the completion callback delivers the result
    Synchronous,
    /// Acknowledge immediately and let the callback persist the result
    Asynchronous,
}

impl ExecutionStrategy {
    /// Leased addresses are never cached; every request resolves again.
    pub fn always_resolve(self) -> bool {
        matches!(self, ExecutionStrategy::PoolManager)
    }

    pub fn taps_on_resolve(self) -> bool {
        !self.always_resolve()
    }

    /// Job-style functions are sent to the pod that last reported a result.
    pub fn routes_to_pod(self) -> bool {
        matches!(self, ExecutionStrategy::WasmShort | ExecutionStrategy::WasmLong)
    }

    pub fn untaps_after_use(self) -> bool {
        matches!(self, ExecutionStrategy::PoolManager)
    }

    pub fn invocation_mode(self) -> InvocationMode {
        match self {
            ExecutionStrategy::WasmShort => InvocationMode::Synchronous,
            ExecutionStrategy::WasmLong => InvocationMode::Asynchronous,
            ExecutionStrategy::PoolManager | ExecutionStrategy::NewDeploy => InvocationMode::Proxy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStrategy::PoolManager => "poolmgr",
            ExecutionStrategy::NewDeploy => "newdeploy",
            ExecutionStrategy::WasmShort => "wasm_short",
            ExecutionStrategy::WasmLong => "wasm_long",
        }
    }
}

/// Everything the dispatch core needs to know about a function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub identity: FunctionIdentity,
    pub strategy: ExecutionStrategy,
    /// Per-attempt forwarding ceiling
    pub timeout: Option<Duration>,
}

impl FunctionSpec {
    pub fn new(identity: FunctionIdentity, strategy: ExecutionStrategy) -> Self {
        Self {
            identity,
            strategy,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn uid(&self) -> &str {
        &self.identity.uid
    }
}
