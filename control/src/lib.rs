//! Gatehouse Control Plane Library
//!
//! Change tracking, endpoint resolution, certificate automation and the
//! reconciliation loop tying them together.

pub mod acme;
pub mod apis;
pub mod config;
pub mod converters;
pub mod error;
pub mod reconcile;
pub mod server;

pub use reconcile::{CycleReport, Model, Reconciler};
