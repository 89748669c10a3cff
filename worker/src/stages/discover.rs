//! Discover stage: resolve a dist string and submit what needs rebuilding.
//!
//! A package is skipped when its stored record is reproducible or
//! unreproducible, when it failed for good (unless forced), when a retry is
//! already scheduled, or when an identical task payload is already pending in
//! the Rebuild queue. The queue check is advisory: concurrent passes may race
//! and submit the same task twice.

use super::{PipelineContext, StageResult};
use crate::error::PipelineError;
use crate::message::{Stage, StageMessage};
use crate::queue::PendingState;
use crate::resolver;
use log::{debug, info};
use rebuilder_common::dist::DistributionSpec;
use rebuilder_common::identity::PackageIdentity;
use rebuilder_common::record::BuildRecord;
use rebuilder_common::task::{BuildStatus, BuildTask};

/// Resolves `dist` and enqueues a Rebuild for every package that needs one.
///
/// Returns the identities submitted by this pass.
///
/// # Errors
///
/// Fails with a non-retryable `DistributionParse` cause when `dist` is
/// malformed, and with a `Store` or `Queue` cause when the record store or
/// the queues cannot be used. Listing failures are not errors; they yield no
/// candidates.
pub fn discover(
    context: &PipelineContext<'_>,
    dist: &str,
    force_retry: bool,
) -> StageResult<Vec<PackageIdentity>> {
    let fail = |cause| PipelineError::new(Stage::Discover, cause);
    let spec = DistributionSpec::parse(dist).map_err(|err| fail(err.into()))?;

    if duplicate_discover_pending(context, dist).map_err(fail)? {
        debug!("{spec}: another discovery is already queued");
        return Ok(Vec::new());
    }

    let project = context.config.project(spec.project());
    let repository = resolver::for_spec(&spec, &project, context.fetcher, context.executor);
    let latest = repository.resolve(&spec);

    let mut pending = pending_rebuilds(context).map_err(fail)?;
    let mut submitted = Vec::new();
    for task in latest {
        let record = context.store.get(&task.identity).map_err(fail)?;
        if let Some(reason) = skip_reason(record.as_ref(), force_retry) {
            debug!("{}: {reason}", task.canonical());
            continue;
        }
        if pending.iter().any(|queued| queued.same_payload(&task)) {
            debug!("{}: already submitted", task.canonical());
            continue;
        }
        context
            .queue
            .enqueue(StageMessage::Rebuild { task: task.clone() })
            .map_err(fail)?;
        submitted.push(task.identity.clone());
        pending.push(task);
    }

    info!("{spec}: {} package(s) submitted for rebuild", submitted.len());
    Ok(submitted)
}

/// Why a stored record keeps a package out of this pass.
fn skip_reason(record: Option<&BuildRecord>, force_retry: bool) -> Option<&'static str> {
    match record?.status {
        BuildStatus::Reproducible | BuildStatus::Unreproducible => Some("already rebuilt"),
        BuildStatus::Failure if !force_retry => Some("failed, not forcing a retry"),
        BuildStatus::Retry => Some("retry already scheduled"),
        BuildStatus::Failure | BuildStatus::Pending | BuildStatus::Running => None,
    }
}

fn duplicate_discover_pending(
    context: &PipelineContext<'_>,
    dist: &str,
) -> crate::error::Result<bool> {
    let pending = context.queue.pending(Stage::Discover)?;
    Ok(pending.iter().any(|entry| {
        entry.state != PendingState::Inflight
            && matches!(&entry.message, StageMessage::Discover { dist: queued, .. } if queued == dist)
    }))
}

/// Task payloads queued, scheduled or reserved in the Rebuild stage.
fn pending_rebuilds(context: &PipelineContext<'_>) -> crate::error::Result<Vec<BuildTask>> {
    Ok(context
        .queue
        .pending(Stage::Rebuild)?
        .into_iter()
        .filter_map(|entry| match entry.message {
            StageMessage::Rebuild { task } => Some(task),
            _ => None,
        })
        .collect())
}
