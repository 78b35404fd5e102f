//! Kubernetes API integrations
//!
//! The watcher-fed cluster cache and the controller metrics.

pub mod cache;
pub mod metrics;

pub use cache::KubeCache;
