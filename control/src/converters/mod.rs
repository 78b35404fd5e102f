//! Change model, dependency tracking and object conversion

pub mod annotations;
pub mod changes;
pub mod endpoints;
pub mod gateway;
pub mod ingress;
pub mod memory;
pub mod model;
pub mod tcp;
pub mod tracker;
pub mod types;

pub use changes::{ChangeKind, ChangedObjects, Changes, TrackedResource};
pub use endpoints::{create_endpoints, create_svc_endpoint, find_service_port, ResolvedEndpoints};
pub use memory::MemoryCache;
pub use model::{BackendRef, Contribution, PathRoute, TcpService, DEFAULT_HOST};
pub use tracker::Tracker;
pub use types::{split_name, Cache};
