//! Rebuild stage: run the rebuild engine for one package.
//!
//! The engine writes into a fresh scratch directory; its regular files are
//! copied into `{artifacts}/{distdir}/{scratch name}` and the scratch
//! directory is removed. The combined output stream goes to
//! `{artifacts}/{distdir}/{canonical}-{timestamp}.log`.

use super::{PipelineContext, StageResult, failed, unix_seconds};
use crate::engine::{EXIT_REPRODUCIBLE, EXIT_UNREPRODUCIBLE, EngineRequest};
use crate::error::{Result, StageError};
use crate::layout::{artifacts_base, log_file_name};
use crate::message::{Stage, StageMessage};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info};
use rebuilder_common::config::ResolvedProject;
use rebuilder_common::dist::Ecosystem;
use rebuilder_common::task::{BuildStatus, BuildTask};
use std::fs;

/// Rebuilds `task` and enqueues its attestation.
///
/// # Errors
///
/// Returns a `BuildFailure` carrying the partial task when the engine exits
/// with any code other than `0` or `2`, cannot be started, or leaves no new
/// build descriptor behind.
pub fn rebuild(context: &PipelineContext<'_>, mut task: BuildTask) -> StageResult<BuildTask> {
    let (ecosystem, project) = context
        .project_of(&task)
        .map_err(|cause| failed(Stage::Rebuild, &task, cause))?;

    task.status = BuildStatus::Running;
    task.descriptors.new = None;
    task.artifacts = None;
    execute(context, &mut task, &ecosystem, &project)
        .map_err(|cause| failed(Stage::Rebuild, &task, cause))?;

    info!("{}: rebuilt, {}", task.canonical(), task.status);
    context
        .queue
        .enqueue(StageMessage::Attest { task: task.clone() })
        .map_err(|cause| failed(Stage::Rebuild, &task, cause))?;
    Ok(task)
}

fn execute(
    context: &PipelineContext<'_>,
    task: &mut BuildTask,
    ecosystem: &Ecosystem,
    project: &ResolvedProject,
) -> Result<()> {
    let base = artifacts_base(&context.config.common.artifacts_dir, ecosystem);
    fs::create_dir_all(&base)?;
    let log = base.join(log_file_name(&task.identity, unix_seconds()));
    task.log = Some(log.clone());

    let scratch = tempfile::Builder::new()
        .prefix(&format!("{}-{}", task.identity.name(), task.identity.version()))
        .tempdir()?;
    let scratch_dir = Utf8Path::from_path(scratch.path())
        .ok_or_else(|| StageError::build(task, "scratch directory is not UTF-8"))?
        .to_owned();
    let scratch_name = scratch_dir
        .file_name()
        .ok_or_else(|| StageError::build(task, "scratch directory has no name"))?
        .to_owned();

    let request = EngineRequest {
        project: ecosystem.project(),
        descriptor: task.descriptors.old.clone(),
        output_dir: scratch_dir.clone(),
        snapshot_query_url: project.snapshot.clone(),
        snapshot_mirror_url: project.snapshot.clone(),
        signing_key: project.sign_key.clone(),
        extra_args: project.rebuild_extra_args.clone(),
        log_file: log,
    };
    debug!("{}: running rebuild engine", task.canonical());
    let code = context.engine.rebuild(&request)?;

    let artifacts = base.join(scratch_name);
    collect_outputs(&scratch_dir, &artifacts)?;
    scratch.close()?;
    task.artifacts = Some(artifacts.clone());

    let status = match code {
        Some(EXIT_REPRODUCIBLE) => BuildStatus::Reproducible,
        Some(EXIT_UNREPRODUCIBLE) => BuildStatus::Unreproducible,
        other => {
            task.status = BuildStatus::Failure;
            let reason = other.map_or_else(
                || "engine was terminated by a signal".to_owned(),
                |code| format!("engine exited with code {code}"),
            );
            return Err(StageError::build(task, reason));
        }
    };
    task.status = status;

    let descriptor = new_descriptor(&artifacts, task.identity.name())
        .ok_or_else(|| StageError::build(task, "cannot find the new build descriptor"))?;
    task.descriptors.new = Some(descriptor);
    Ok(())
}

/// Copies the regular files of `scratch` into `artifacts`.
fn collect_outputs(scratch: &Utf8Path, artifacts: &Utf8Path) -> Result<()> {
    fs::create_dir_all(artifacts)?;
    for entry in scratch.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), artifacts.join(entry.file_name()))?;
        }
    }
    Ok(())
}

/// First `{name}*.buildinfo` in `artifacts`, in name order.
fn new_descriptor(artifacts: &Utf8Path, name: &str) -> Option<Utf8PathBuf> {
    let pattern = format!(
        "{}/{}*.buildinfo",
        glob::Pattern::escape(artifacts.as_str()),
        glob::Pattern::escape(name)
    );
    let mut found: Vec<Utf8PathBuf> = glob::glob(&pattern)
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect();
    found.sort();
    found.into_iter().next()
}
