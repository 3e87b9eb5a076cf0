pub mod config_providers;
pub mod executor_client;
pub mod http_client;
pub mod middleware;
pub mod result_store;

pub use config_providers::FileConfigProvider;
pub use executor_client::ExecutorClient;
pub use http_client::HttpClientAdapter;
pub use middleware::*;
pub use result_store::{HttpResultStore, InMemoryResultStore};
