//! fnagent - the request-dispatch core of a function-invocation gateway.
//!
//! The agent sits in front of function backends managed by an executor. For
//! every inbound request it:
//! - picks the function bound to the matching trigger, drawing a variant for
//!   weighted (canary) triggers
//! - serves a stored result when the function already produced one
//! - resolves a live backend address through a TTL cache with single-flight
//!   resolution
//! - forwards the request with bounded retries and exponential backoff, or, for
//!   job-style functions, kicks the job off and waits for its completion
//!   callback (synchronous) or acknowledges immediately (asynchronous)
//!
//! # Architecture
//! Collaborators are reached through the traits in [`ports`]; [`adapters`] holds
//! their HTTP and in-memory implementations and `core` the dispatch logic. The
//! live routing table is an atomically swappable router
//! ([`core::MutableRouteTable`]) rebuilt by [`core::TriggerSet`] whenever the
//! configured triggers change.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use fnagent::{
//!     adapters::{ExecutorClient, HttpClientAdapter, InMemoryResultStore},
//!     config::load_config,
//!     core::{InvocationContext, MutableRouteTable, TriggerSet},
//!     metrics::RecorderFunctionMetrics,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config(Some(std::path::Path::new("fnagent.toml"))).await?;
//! let ctx = Arc::new(InvocationContext::new(
//!     &config,
//!     Arc::new(ExecutorClient::new(&config.executor_url, config.address_cache.update_timeout)?),
//!     Arc::new(HttpClientAdapter::new(&config.round_trip)),
//!     Arc::new(InMemoryResultStore::new()),
//!     Arc::new(RecorderFunctionMetrics),
//! ));
//! let table = Arc::new(MutableRouteTable::empty());
//! TriggerSet::new(ctx, table.clone()).apply(&config.functions, &config.triggers)?;
//! let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//! axum::serve(listener, table.service()).await?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request-path failures are [`core::GatewayError`] values carrying their HTTP
//! status; ports use their own `thiserror` enums and setup code returns
//! `eyre::Result<T>`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{ExecutorClient, HttpClientAdapter},
    core::{InvocationContext, MutableRouteTable, TriggerSet},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
