//! Configuration data structures for fnagent.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to
//! `FNAGENT_*` environment variables. Every section carries defaults so a minimal
//! config only needs the functions and triggers it serves.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::function::{ExecutionStrategy, FunctionIdentity, FunctionSpec};

/// Namespace assumed when a function or trigger does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Serde helpers for durations written as humantime strings ("50ms", "1h")
/// or as a bare number of seconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Text(String),
        Seconds(u64),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|e| D::Error::custom(format!("invalid duration '{text}': {e}"))),
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(deserialize_with = "super::deserialize")] Duration);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(d)| d))
        }
    }
}

/// Retry and transport tunables for the forwarder.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RoundTripConfig {
    /// Initial backoff window; also used as the dial timeout
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Factor applied to the backoff after every failed round
    pub timeout_exponent: u32,
    /// TCP keep-alive and idle pool lifetime
    #[serde(with = "duration_str")]
    pub keep_alive: Duration,
    pub disable_keep_alive: bool,
    /// Maximum forwarding rounds per request
    pub max_retries: u32,
    /// Consecutive timeouts against one address before it is evicted
    pub svc_address_max_retries: u32,
    /// Per-attempt ceiling when a function does not set its own timeout
    #[serde(with = "duration_str")]
    pub function_timeout: Duration,
}

impl Default for RoundTripConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(50),
            timeout_exponent: 2,
            keep_alive: Duration::from_secs(30),
            disable_keep_alive: false,
            max_retries: 10,
            svc_address_max_retries: 5,
            function_timeout: Duration::from_secs(60),
        }
    }
}

/// Service address cache settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AddressCacheConfig {
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    /// Ceiling for one single-flight resolution
    #[serde(with = "duration_str")]
    pub update_timeout: Duration,
    /// Ceiling for a background untap notification
    #[serde(with = "duration_str")]
    pub untap_timeout: Duration,
    #[serde(with = "duration_str")]
    pub reap_interval: Duration,
}

impl Default for AddressCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            update_timeout: Duration::from_secs(30),
            untap_timeout: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Invocation handler settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct InvocationConfig {
    /// How long a synchronous request waits for its completion callback
    #[serde(with = "duration_str")]
    pub sync_wait: Duration,
    /// Upper bound for buffered request and callback bodies
    pub max_body_bytes: usize,
    /// How long an issued correlation id can still attribute a callback
    #[serde(with = "duration_str")]
    pub correlation_ttl: Duration,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            sync_wait: Duration::from_secs(10),
            max_body_bytes: 10 * 1024 * 1024,
            correlation_ttl: Duration::from_secs(3600),
        }
    }
}

/// Where completed function results are persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultStoreConfig {
    /// Process-local store; results do not survive a restart
    #[default]
    Memory,
    /// Remote key/value service speaking GET/PUT on `<url>/<key>`
    Http {
        url: String,
        #[serde(with = "duration_str", default = "default_store_timeout")]
        timeout: Duration,
    },
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_resource_version() -> String {
    "1".to_string()
}

/// A deployable function.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_resource_version")]
    pub resource_version: String,
    pub uid: String,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default, with = "duration_str::option")]
    pub timeout: Option<Duration>,
}

impl FunctionConfig {
    pub fn to_spec(&self) -> FunctionSpec {
        FunctionSpec {
            identity: FunctionIdentity::new(
                &self.name,
                &self.namespace,
                &self.resource_version,
                &self.uid,
            ),
            strategy: self.strategy,
            timeout: self.timeout,
        }
    }
}

/// One member of a weighted (canary) function reference.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WeightedFunction {
    pub name: String,
    pub weight: u32,
}

/// The function(s) a trigger dispatches to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FunctionReference {
    Name { name: String },
    Weights { functions: Vec<WeightedFunction> },
}

impl FunctionReference {
    /// Names of every function this reference can dispatch to.
    pub fn function_names(&self) -> Vec<&str> {
        match self {
            FunctionReference::Name { name } => vec![name.as_str()],
            FunctionReference::Weights { functions } => {
                functions.iter().map(|f| f.name.as_str()).collect()
            }
        }
    }
}

/// An HTTP trigger binding a URL (exact) or a prefix to a function reference.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub relative_url: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Forward the prefix to the backend instead of trimming it
    #[serde(default)]
    pub keep_prefix: bool,
    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    pub function: FunctionReference,
}

impl TriggerConfig {
    /// The path the trigger is mounted on, without a trailing slash.
    pub fn base_path(&self) -> Option<String> {
        self.prefix
            .as_deref()
            .or(self.relative_url.as_deref())
            .map(|path| path.trim_end_matches('/').to_string())
    }
}

/// Top-level agent configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub listen_addr: String,
    /// Base URL of the orchestration collaborator
    pub executor_url: String,
    /// Reflect internal error detail in response bodies
    pub debug: bool,
    pub display_access_log: bool,
    pub round_trip: RoundTripConfig,
    pub address_cache: AddressCacheConfig,
    pub invocation: InvocationConfig,
    pub result_store: ResultStoreConfig,
    pub functions: Vec<FunctionConfig>,
    pub triggers: Vec<TriggerConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8888".to_string(),
            executor_url: "http://executor.fission".to_string(),
            debug: false,
            display_access_log: false,
            round_trip: RoundTripConfig::default(),
            address_cache: AddressCacheConfig::default(),
            invocation: InvocationConfig::default(),
            result_store: ResultStoreConfig::default(),
            functions: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// True when the two configs differ in anything other than the trigger set.
    pub fn tunables_differ(&self, other: &AgentConfig) -> bool {
        self.listen_addr != other.listen_addr
            || self.executor_url != other.executor_url
            || self.debug != other.debug
            || self.display_access_log != other.display_access_log
            || self.round_trip != other.round_trip
            || self.address_cache != other.address_cache
            || self.invocation != other.invocation
            || self.result_store != other.result_store
    }
}

/// Builder for [`AgentConfig`], mostly useful in tests and embedders.
#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn executor_url(mut self, url: impl Into<String>) -> Self {
        self.config.executor_url = url.into();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn round_trip(mut self, round_trip: RoundTripConfig) -> Self {
        self.config.round_trip = round_trip;
        self
    }

    pub fn invocation(mut self, invocation: InvocationConfig) -> Self {
        self.config.invocation = invocation;
        self
    }

    pub fn function(mut self, function: FunctionConfig) -> Self {
        self.config.functions.push(function);
        self
    }

    pub fn trigger(mut self, trigger: TriggerConfig) -> Self {
        self.config.triggers.push(trigger);
        self
    }

    pub fn build(self) -> AgentConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            executor_url = "http://127.0.0.1:9000"

            [round_trip]
            timeout = "100ms"
            max_retries = 3

            [[functions]]
            name = "hello"
            uid = "uid-hello"
            strategy = "wasm_short"
            timeout = 5

            [[triggers]]
            name = "hello-trigger"
            prefix = "/hello/"

            [triggers.function]
            type = "name"
            name = "hello"
        "#;

        let config: AgentConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap();

        assert_eq!(config.round_trip.timeout, Duration::from_millis(100));
        assert_eq!(config.round_trip.max_retries, 3);
        assert_eq!(config.round_trip.timeout_exponent, 2);
        assert_eq!(config.functions[0].namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.functions[0].strategy, ExecutionStrategy::WasmShort);
        assert_eq!(config.functions[0].timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.triggers[0].base_path().as_deref(), Some("/hello"));
        assert_eq!(config.result_store, ResultStoreConfig::Memory);
    }

    #[test]
    fn weighted_reference_lists_every_variant() {
        let reference = FunctionReference::Weights {
            functions: vec![
                WeightedFunction {
                    name: "v1".into(),
                    weight: 90,
                },
                WeightedFunction {
                    name: "v2".into(),
                    weight: 10,
                },
            ],
        };
        assert_eq!(reference.function_names(), vec!["v1", "v2"]);
    }

    #[test]
    fn tunables_ignore_trigger_changes() {
        let base = AgentConfig::default();
        let mut changed = base.clone();
        changed.functions.push(FunctionConfig {
            name: "f".into(),
            namespace: DEFAULT_NAMESPACE.into(),
            resource_version: "1".into(),
            uid: "u".into(),
            strategy: ExecutionStrategy::PoolManager,
            timeout: None,
        });
        assert!(!base.tunables_differ(&changed));

        changed.round_trip.max_retries = 1;
        assert!(base.tunables_differ(&changed));
    }
}
