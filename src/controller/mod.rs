//! # Controller
//!
//! The generic reconciliation engine and the plumbing around it.
//!
//! - `backoff`: Fibonacci backoff for hard reconciliation errors
//! - `client`: typed access to an object store
//! - `conditions`: condition sets and the Ready aggregation
//! - `events`: Kubernetes event recording
//! - `ownership`: controller owner references
//! - `reconciler`: parent, sub and child reconcilers
//! - `server`: HTTP server for metrics and health checks
//! - `stash`: per-reconciliation scratch space
//! - `store`: Kubernetes and in-memory object stores
//! - `tracker`: dependency tracking with leases
//! - `wait`: wait for a resource to become Ready

pub mod backoff;
pub mod client;
pub mod conditions;
pub mod events;
pub mod ownership;
pub mod reconciler;
pub mod server;
pub mod stash;
pub mod store;
pub mod tracker;
pub mod wait;
