pub mod address;
pub mod address_cache;
pub mod canary;
pub mod error;
pub mod forwarder;
pub mod function;
pub mod invocation;
pub mod rendezvous;
pub mod route_table;
pub mod trigger_set;
mod ttl_map;

pub use address::ServiceAddress;
pub use address_cache::ServiceAddressCache;
pub use canary::WeightedVariants;
pub use error::{GatewayError, GatewayResult};
pub use forwarder::{RetryingForwarder, RouteBinding};
pub use function::{ExecutionStrategy, FunctionIdentity, FunctionSpec};
pub use invocation::{InvocationContext, InvocationHandler};
pub use rendezvous::RendezvousRegistry;
pub use route_table::MutableRouteTable;
pub use trigger_set::TriggerSet;
