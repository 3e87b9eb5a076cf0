pub mod address_resolver;
pub mod config_provider;
pub mod function_metrics;
pub mod http_client;
pub mod result_store;

pub use address_resolver::{AddressResolver, ResolverError, ResolverResult};
pub use config_provider::ConfigProvider;
pub use function_metrics::{FunctionCall, FunctionMetrics};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use result_store::{ResultStore, StoreError, StoreResult};
