//! Report stage: relocate durable files and persist the build record.
//!
//! The attempt log moves to `{rebuild_dir}/{project}/logs/`, the diff report
//! (unreproducible rebuilds only) moves next to it, and the new build
//! descriptor moves to `{rebuild_dir}/{project}/buildinfos/`. The artifacts
//! directory is then removed and the record upserted. Terminal records
//! trigger a publication of their project.

use super::{PipelineContext, StageResult, failed};
use crate::error::{Result, StageError};
use crate::layout::{buildinfos_dir, diffoscope_path, logs_dir};
use crate::message::{Stage, StageMessage};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info};
use rebuilder_common::task::{BuildStatus, BuildTask};
use std::fs;
use std::io::ErrorKind;

/// Diff report written by the rebuild engine into the artifacts directory.
pub const DIFFOSCOPE_FILE: &str = "diffoscope.log";

/// Persists `task` and, when its status is terminal, enqueues a publication.
///
/// # Errors
///
/// Returns a `Report` cause when the log or the new build descriptor of an
/// attestable rebuild is missing, and `Io`, `Store` or `Queue` causes when
/// files, the record store or the queues cannot be used.
pub fn report(context: &PipelineContext<'_>, mut task: BuildTask) -> StageResult<BuildTask> {
    relocate(context, &mut task).map_err(|cause| failed(Stage::Report, &task, cause))?;
    context
        .store
        .upsert(&task)
        .map_err(|cause| failed(Stage::Report, &task, cause))?;
    info!("{}: reported as {}", task.canonical(), task.status);

    if task.status.is_terminal() {
        context
            .queue
            .enqueue(StageMessage::Publish {
                task: Some(task.clone()),
                project: None,
                upload_results: false,
            })
            .map_err(|cause| failed(Stage::Report, &task, cause))?;
    }
    Ok(task)
}

fn relocate(context: &PipelineContext<'_>, task: &mut BuildTask) -> Result<()> {
    let (ecosystem, _) = context.project_of(task)?;
    let rebuild_dir = &context.config.common.rebuild_dir;
    let required = task.status.is_attestable();

    let logs = logs_dir(rebuild_dir, ecosystem.project());
    if let Some(log) = task.log.clone() {
        match move_into(&log, &logs)? {
            Some(durable) => task.log = Some(durable),
            None if required => return Err(missing(task, log)),
            None => task.log = None,
        }
    } else if required {
        return Err(missing(task, logs));
    }

    if task.status == BuildStatus::Unreproducible {
        let diff = task
            .artifacts
            .as_deref()
            .map(|dir| dir.join(DIFFOSCOPE_FILE));
        if let (Some(diff), Some(log)) = (diff, task.log.as_deref()) {
            let destination = diffoscope_path(log);
            if move_file(&diff, &destination)? {
                task.diffoscope = Some(destination);
            }
        }
    }

    let buildinfos = buildinfos_dir(rebuild_dir, ecosystem.project());
    if let Some(descriptor) = task.descriptors.new.clone() {
        match move_into(&descriptor, &buildinfos)? {
            Some(durable) => task.descriptors.new = Some(durable),
            None if required => return Err(missing(task, descriptor)),
            None => task.descriptors.new = None,
        }
    } else if required {
        return Err(missing(task, buildinfos));
    }

    if let Some(artifacts) = task.artifacts.take() {
        match fs::remove_dir_all(&artifacts) {
            Ok(()) => debug!("{}: removed {artifacts}", task.canonical()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn missing(task: &BuildTask, path: Utf8PathBuf) -> StageError {
    StageError::Report {
        package: task.canonical(),
        path,
    }
}

/// Moves `file` into `dir`, keeping its name. A file already in `dir` stays
/// put. Returns `None` when `file` does not exist.
fn move_into(file: &Utf8Path, dir: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let Some(name) = file.file_name() else {
        return Ok(None);
    };
    let destination = dir.join(name);
    if file == destination {
        return Ok(destination.is_file().then_some(destination));
    }
    fs::create_dir_all(dir)?;
    Ok(move_file(file, &destination)?.then_some(destination))
}

/// Renames `from` to `to`, copying across filesystems. Returns `false` when
/// `from` does not exist.
fn move_file(from: &Utf8Path, to: &Utf8Path) -> Result<bool> {
    if !from.is_file() {
        return Ok(false);
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStore;
    use crate::test_utils::PipelineHarness;
    use rebuilder_common::identity::PackageIdentity;
    use rstest::{fixture, rstest};

    #[fixture]
    fn harness() -> PipelineHarness {
        PipelineHarness::new("[project.debian]\n")
    }

    fn attempted(harness: &PipelineHarness, status: BuildStatus) -> BuildTask {
        let base = harness.root.join("artifacts/debian");
        let artifacts = base.join("bash-5.1-2+b3xyz");
        fs::create_dir_all(&artifacts).expect("artifacts");
        let log = base.join("bash-5.1-2+b3.amd64-1650000000.log");
        fs::write(&log, "build log").expect("log");
        let descriptor = artifacts.join("bash_5.1-2+b3_amd64.buildinfo");
        fs::write(&descriptor, "Source: bash\n").expect("descriptor");
        fs::write(artifacts.join(DIFFOSCOPE_FILE), "diff").expect("diffoscope");

        let identity = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye");
        let mut task = BuildTask::new(identity, "bash_5.1-2+b3_amd64.buildinfo");
        task.status = status;
        task.log = Some(log);
        task.artifacts = Some(artifacts);
        task.descriptors.new = Some(descriptor);
        task
    }

    #[rstest]
    fn unreproducible_rebuild_keeps_log_diff_and_descriptor(harness: PipelineHarness) {
        let task = attempted(&harness, BuildStatus::Unreproducible);
        let artifacts = task.artifacts.clone().expect("artifacts");
        let task = report(&harness.context(), task).expect("reported");

        let logs = harness.root.join("rebuild/debian/logs");
        assert_eq!(task.log, Some(logs.join("bash-5.1-2+b3.amd64-1650000000.log")));
        assert_eq!(
            task.diffoscope,
            Some(logs.join("bash-5.1-2+b3.amd64-1650000000.diffoscope.log"))
        );
        assert_eq!(
            task.descriptors.new,
            Some(harness.root.join("rebuild/debian/buildinfos/bash_5.1-2+b3_amd64.buildinfo"))
        );
        assert!(task.log.as_ref().is_some_and(|log| log.is_file()));
        assert!(task.artifacts.is_none());
        assert!(!artifacts.exists());

        let stored = harness.store.get(&task.identity).expect("get").expect("record");
        assert_eq!(stored.status, BuildStatus::Unreproducible);
        assert_eq!(harness.queue.len(Stage::Publish), 1);
    }

    #[rstest]
    fn reproducible_rebuild_drops_the_diff_report(harness: PipelineHarness) {
        let task = attempted(&harness, BuildStatus::Reproducible);
        let task = report(&harness.context(), task).expect("reported");
        assert!(task.diffoscope.is_none());
    }

    #[rstest]
    fn failure_without_files_is_still_recorded(harness: PipelineHarness) {
        let identity = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye");
        let mut task = BuildTask::new(identity, "old");
        task.status = BuildStatus::Failure;
        task.log = Some(harness.root.join("artifacts/debian/never-written.log"));

        let task = report(&harness.context(), task).expect("reported");
        assert!(task.log.is_none());
        assert_eq!(harness.store.upsert_count(&task.identity), 1);
        assert_eq!(harness.queue.len(Stage::Publish), 1);
    }

    #[rstest]
    fn retry_is_recorded_without_publishing(harness: PipelineHarness) {
        let mut task = attempted(&harness, BuildStatus::Retry);
        task.retries = 1;
        let task = report(&harness.context(), task).expect("reported");
        assert_eq!(task.retries, 1);
        assert!(harness.queue.is_empty());
        assert_eq!(harness.store.upsert_count(&task.identity), 1);
    }

    #[rstest]
    fn attestable_rebuild_without_log_is_a_report_error(harness: PipelineHarness) {
        let mut task = attempted(&harness, BuildStatus::Reproducible);
        if let Some(log) = task.log.as_ref() {
            fs::remove_file(log).expect("remove log");
        }
        let err = report(&harness.context(), task).expect_err("missing log");
        assert!(matches!(err.cause, StageError::Report { .. }));
        assert!(err.is_retryable());
        assert_eq!(harness.store.upsert_count(&err.task.expect("task").identity), 0);
    }

    #[rstest]
    fn second_report_leaves_durable_files_in_place(harness: PipelineHarness) {
        let task = attempted(&harness, BuildStatus::Reproducible);
        let first = report(&harness.context(), task).expect("first");
        let second = report(&harness.context(), first.clone()).expect("second");
        assert_eq!(first.log, second.log);
        assert_eq!(first.descriptors.new, second.descriptors.new);
    }
}
