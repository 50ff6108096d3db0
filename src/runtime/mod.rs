//! # Runtime
//!
//! Process wiring around the reconcilers.
//!
//! - `initialization`: rustls, tracing, metrics, HTTP server, Kubernetes client
//! - `watch_loop`: one supervised kube-runtime controller per resource kind
//! - `error_policy`: reconciliation backoff and watch error classification

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;

use crate::controller::reconciler::{Context, Reconciler};

/// Per-controller state handed to kube-runtime as the controller context
#[derive(Debug)]
pub struct ReconcileData<R: Reconciler> {
    pub reconciler: R,
    pub ctx: Context,
}

impl<R: Reconciler> ReconcileData<R> {
    pub fn new(reconciler: R, ctx: Context) -> Self {
        Self { reconciler, ctx }
    }
}
