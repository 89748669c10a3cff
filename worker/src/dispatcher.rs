//! Stage dispatcher: delivers queued messages to their stage and applies
//! the retry policy to failures.
//!
//! Retry policy is data attached to each stage ([`StagePolicy`]). Rebuild
//! failures are special: the retry counter lives on the task, each failed
//! attempt is reported with status `retry`, and a fresh Rebuild is scheduled
//! after the project's retry delay until `max_retries` is reached.

use crate::error::{PipelineError, Result};
use crate::message::{Stage, StageMessage};
use crate::queue::Envelope;
use crate::stages::{self, PipelineContext, PublishRequest};
use log::{debug, error, warn};
use rebuilder_common::task::{BuildStatus, BuildTask};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Redelivery policy of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    /// Deliveries of one message before it is abandoned.
    pub max_attempts: u32,
    /// Delay before a failed message is delivered again.
    pub retry_delay: Duration,
}

impl StagePolicy {
    /// Default policy of `stage`: Attest and Report are redelivered up to
    /// three times, other stages once.
    #[must_use]
    pub const fn for_stage(stage: Stage, retry_delay: Duration) -> Self {
        let max_attempts = match stage {
            Stage::Attest | Stage::Report => 3,
            Stage::Discover | Stage::Rebuild | Stage::Publish => 1,
        };
        Self {
            max_attempts,
            retry_delay,
        }
    }
}

/// Delivers messages of one or more stages to the stage functions.
pub struct Dispatcher<'a> {
    context: PipelineContext<'a>,
    policies: BTreeMap<Stage, StagePolicy>,
}

impl<'a> Dispatcher<'a> {
    /// Creates a dispatcher with the default policies, using
    /// `common.retry_delay_seconds` as redelivery delay.
    #[must_use]
    pub fn new(context: PipelineContext<'a>) -> Self {
        let delay = Duration::from_secs(context.config.common.retry_delay_seconds);
        let policies = Stage::ALL
            .into_iter()
            .map(|stage| (stage, StagePolicy::for_stage(stage, delay)))
            .collect();
        Self { context, policies }
    }

    /// Replaces the policy of `stage`.
    #[must_use]
    pub fn with_policy(mut self, stage: Stage, policy: StagePolicy) -> Self {
        self.policies.insert(stage, policy);
        self
    }

    /// Policy applied to `stage`.
    #[must_use]
    pub fn policy(&self, stage: Stage) -> StagePolicy {
        self.policies.get(&stage).copied().unwrap_or(StagePolicy {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        })
    }

    /// Runs the stage of `envelope` and routes a failure.
    ///
    /// # Errors
    ///
    /// Returns `Queue` errors raised while routing a failure; stage
    /// failures themselves are handled here.
    pub fn process(&self, envelope: &Envelope) -> Result<()> {
        let context = &self.context;
        let outcome = match &envelope.message {
            StageMessage::Discover { dist, force_retry } => {
                stages::discover(context, dist, *force_retry).map(drop)
            }
            StageMessage::Rebuild { task } => stages::rebuild(context, task.clone()).map(drop),
            StageMessage::Attest { task } => stages::attest(context, task.clone()).map(drop),
            StageMessage::Report { task } => stages::report(context, task.clone()).map(drop),
            StageMessage::Publish {
                task,
                project,
                upload_results,
            } => stages::publish(
                context,
                &PublishRequest {
                    task: task.as_ref(),
                    project: project.as_deref(),
                    upload_results: *upload_results,
                },
            )
            .map(drop),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => self.route_failure(envelope, err),
        }
    }

    /// Reserves, processes and acknowledges one message of `stage`.
    ///
    /// Returns `false` when nothing was deliverable. A message whose failure
    /// could not be routed stays reserved and is restored by the next
    /// queue recovery.
    ///
    /// # Errors
    ///
    /// Returns `Queue` errors from the queue or from failure routing.
    pub fn run_once(&self, stage: Stage) -> Result<bool> {
        let queue = self.context.queue;
        let Some(envelope) = queue.reserve(stage)? else {
            return Ok(false);
        };
        self.process(&envelope)?;
        queue.ack(stage, envelope.id)?;
        Ok(true)
    }

    /// Processes deliverable messages of `stages`, in order, until none is
    /// left. Returns the number of messages processed.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::run_once`].
    pub fn drain(&self, stages: &[Stage]) -> Result<usize> {
        let mut processed = 0;
        loop {
            let mut progressed = false;
            for &stage in stages {
                while self.run_once(stage)? {
                    processed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(processed);
            }
        }
    }

    /// Runs `jobs` workers per stage until `stop` is set. Idle workers sleep
    /// for `poll` between reservations.
    pub fn run_workers(&self, stages: &[Stage], jobs: usize, poll: Duration, stop: &AtomicBool) {
        thread::scope(|scope| {
            for &stage in stages {
                for worker in 0..jobs.max(1) {
                    scope.spawn(move || self.worker_loop(stage, worker, poll, stop));
                }
            }
        });
    }

    fn worker_loop(&self, stage: Stage, worker: usize, poll: Duration, stop: &AtomicBool) {
        debug!("{stage} worker {worker} started");
        while !stop.load(Ordering::Relaxed) {
            match self.run_once(stage) {
                Ok(true) => {}
                Ok(false) => thread::sleep(poll),
                Err(err) => {
                    error!("{stage} worker {worker}: {err}");
                    thread::sleep(poll);
                }
            }
        }
        debug!("{stage} worker {worker} stopped");
    }

    fn route_failure(&self, envelope: &Envelope, err: PipelineError) -> Result<()> {
        let PipelineError { stage, task, cause } = err;
        if stage == Stage::Rebuild {
            if let Some(task) = task {
                return self.route_failed_rebuild(*task, &cause);
            }
        }

        let policy = self.policy(stage);
        let attempt = envelope.attempts + 1;
        if cause.is_retryable() && attempt < policy.max_attempts {
            warn!(
                "{stage}: {cause}; delivery {attempt}/{} failed, retrying in {}s",
                policy.max_attempts,
                policy.retry_delay.as_secs()
            );
            self.context
                .queue
                .push(envelope.message.clone(), policy.retry_delay, attempt)?;
            return Ok(());
        }

        match task {
            Some(task) if stage == Stage::Attest => {
                let mut task = *task;
                error!(
                    "CRITICAL: {}: attestation abandoned after {attempt} deliveries: {cause}",
                    task.canonical()
                );
                task.status = BuildStatus::Failure;
                self.context
                    .queue
                    .enqueue(StageMessage::Report { task })?;
            }
            _ if cause.is_retryable() => {
                error!("CRITICAL: {stage}: giving up after {attempt} deliveries: {cause}");
            }
            _ => error!("{stage}: {cause}"),
        }
        Ok(())
    }

    fn route_failed_rebuild(
        &self,
        mut task: BuildTask,
        cause: &crate::error::StageError,
    ) -> Result<()> {
        let queue = self.context.queue;
        let (max_retries, retry_delay) = match self.context.project_of(&task) {
            Ok((_, project)) => (project.max_retries, project.retry_delay),
            Err(err) => {
                error!("{}: {err}", task.canonical());
                return Ok(());
            }
        };

        if cause.is_retryable() && task.retries < max_retries {
            task.retries += 1;
            task.status = BuildStatus::Retry;
            warn!(
                "{}: {cause}; retry {}/{max_retries} in {}s",
                task.canonical(),
                task.retries,
                retry_delay.as_secs()
            );
            queue.enqueue(StageMessage::Report { task: task.clone() })?;

            let mut next = task;
            next.status = BuildStatus::Pending;
            next.log = None;
            next.diffoscope = None;
            next.artifacts = None;
            next.descriptors.new = None;
            queue.enqueue_after(StageMessage::Rebuild { task: next }, retry_delay)?;
        } else {
            task.status = BuildStatus::Failure;
            error!(
                "CRITICAL: {}: rebuild failed after {} retries: {cause}",
                task.canonical(),
                task.retries
            );
            queue.enqueue(StageMessage::Report { task })?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
