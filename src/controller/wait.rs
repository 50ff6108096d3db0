//! # Wait
//!
//! Wait for a resource to report Ready while a companion task (typically a
//! log stream) runs alongside. Whichever finishes first wins and the other
//! is dropped; a deadline bounds both.

use crate::controller::client::Client;
use crate::controller::store::StoreError;
use crate::crd::{Reconcilable, ResourceStatus, CONDITION_READY};
use kube::Resource;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    /// Ready became False
    Failed { reason: String, message: String },
    /// The resource was deleted, or replaced by one with another uid
    Deleted,
    /// The companion task completed first
    CompanionFinished,
    TimedOut,
}

/// Poll `resource` every `poll` until its Ready condition settles
///
/// Ready=False counts as settled only once the controller has observed the
/// current generation, so a stale failure from an earlier spec is ignored.
pub async fn wait_until_ready<T, F>(
    client: &Client,
    resource: &T,
    poll: Duration,
    deadline: Duration,
    companion: F,
) -> Result<WaitOutcome, StoreError>
where
    T: Reconcilable,
    F: Future<Output = ()> + Send,
{
    let race = async {
        tokio::select! {
            outcome = poll_ready(client, resource, poll) => outcome,
            () = companion => Ok(WaitOutcome::CompanionFinished),
        }
    };
    match tokio::time::timeout(deadline, race).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => Ok(WaitOutcome::TimedOut),
    }
}

async fn poll_ready<T: Reconcilable>(
    client: &Client,
    resource: &T,
    poll: Duration,
) -> Result<WaitOutcome, StoreError> {
    let namespace = resource.meta().namespace.clone().unwrap_or_default();
    let name = resource.meta().name.clone().unwrap_or_default();
    let uid = resource.meta().uid.clone();
    loop {
        let Some(current) = client.get_opt::<T>(&namespace, &name).await? else {
            return Ok(WaitOutcome::Deleted);
        };
        if uid.is_some() && current.meta().uid != uid {
            return Ok(WaitOutcome::Deleted);
        }
        if let Some(outcome) = settled(&current) {
            return Ok(outcome);
        }
        debug!(resource.name = %name, "Waiting for resource to become ready");
        tokio::time::sleep(poll).await;
    }
}

fn settled<T: Reconcilable>(resource: &T) -> Option<WaitOutcome> {
    let status = resource.status()?;
    let ready = status.get_condition(CONDITION_READY)?;
    if ready.is_true() {
        return Some(WaitOutcome::Ready);
    }
    let observed = status.observed_generation();
    if ready.is_false() && (observed.is_none() || observed == resource.meta().generation) {
        return Some(WaitOutcome::Failed {
            reason: ready.reason.clone().unwrap_or_default(),
            message: ready.message.clone().unwrap_or_default(),
        });
    }
    None
}
