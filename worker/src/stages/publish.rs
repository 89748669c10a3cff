//! Publish stage: mirror a project's durable tree to the remote host.
//!
//! Everything durable lives below `{rebuild_dir}/{project}/`: logs, build
//! descriptors and the attestation trees. The directory is copied with
//! `rsync` over `ssh` to `{host}:{basedir}/{project}`. Rendered results in
//! `results/` are only uploaded on request.

use super::{PipelineContext, StageResult};
use crate::error::{PipelineError, Result, StageError};
use crate::executor::{CommandOptions, failure_reason};
use crate::layout::project_root;
use crate::message::Stage;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, error, info};
use rebuilder_common::config::TransferConfig;
use rebuilder_common::dist::{Ecosystem, Project};
use rebuilder_common::task::BuildTask;
use std::path::Path;

/// Directory of rendered results, excluded unless requested.
pub const RESULTS_DIR: &str = "results";

/// What to publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishRequest<'a> {
    /// Task whose project is published, when triggered by Report.
    pub task: Option<&'a BuildTask>,
    /// Project name; takes precedence over the task's project.
    pub project: Option<&'a str>,
    /// Whether `results/` is uploaded too.
    pub upload_results: bool,
}

/// Result of a publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The tree was mirrored.
    Published {
        /// Published project.
        project: Project,
        /// `host:dir` destination.
        remote: String,
    },
    /// Nothing was sent: transfer settings are incomplete or the project
    /// has no durable tree yet.
    Skipped,
}

/// Mirrors the durable tree of the requested project.
///
/// Missing transfer settings are logged as critical and reported as
/// [`PublishOutcome::Skipped`], not as an error.
///
/// # Errors
///
/// Returns a non-retryable `Publish` cause when no project can be
/// determined, or when `ssh` or `rsync` fails.
pub fn publish(
    context: &PipelineContext<'_>,
    request: &PublishRequest<'_>,
) -> StageResult<PublishOutcome> {
    let fail = |cause: StageError| {
        error!("CRITICAL: {cause}");
        let err = PipelineError::new(Stage::Publish, cause);
        match request.task {
            Some(task) => err.with_task(task.clone()),
            None => err,
        }
    };

    let project = target_project(request).map_err(fail)?;
    let settings = context.config.project(project);
    let Some(transfer) = settings.transfer.as_ref() else {
        error!("CRITICAL: {project}: missing SSH key or SSH remote destination, not publishing");
        return Ok(PublishOutcome::Skipped);
    };

    let local = project_root(&context.config.common.rebuild_dir, project);
    if !local.is_dir() {
        info!("{project}: nothing to publish yet");
        return Ok(PublishOutcome::Skipped);
    }
    let remote = transfer_tree(context, transfer, project, &local, request.upload_results)
        .map_err(fail)?;
    info!("{project}: published to {remote}");
    Ok(PublishOutcome::Published { project, remote })
}

fn target_project(request: &PublishRequest<'_>) -> Result<Project> {
    if let Some(name) = request.project {
        return name.parse().map_err(|err| StageError::Publish {
            reason: format!("{err}"),
        });
    }
    let task = request.task.ok_or_else(|| StageError::Publish {
        reason: "neither a project nor a task to publish".to_owned(),
    })?;
    let ecosystem = Ecosystem::from_distribution(task.identity.distribution()).map_err(|err| {
        StageError::Publish {
            reason: format!("{}: {err}", task.canonical()),
        }
    })?;
    Ok(ecosystem.project())
}

fn transfer_tree(
    context: &PipelineContext<'_>,
    transfer: &TransferConfig,
    project: Project,
    local: &Utf8Path,
    upload_results: bool,
) -> Result<String> {
    let home = directories_next::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
    let key = ssh_key_path(&transfer.ssh_key, home.as_deref()).ok_or_else(|| {
        StageError::Publish {
            reason: format!("cannot locate SSH key {}", transfer.ssh_key),
        }
    })?;
    let remote_dir = format!("{}/{}", transfer.basedir.trim_end_matches('/'), project.as_str());
    let remote = format!("{}:{remote_dir}", transfer.host);

    let mkdir = [
        "-i",
        key.as_str(),
        "-o",
        "StrictHostKeyChecking=no",
        transfer.host.as_str(),
        "mkdir",
        "-p",
        remote_dir.as_str(),
    ];
    run_checked(context, "ssh", &mkdir)?;

    let shell = format!("ssh -i {key} -o StrictHostKeyChecking=no");
    let source = format!("{local}/");
    let exclude = format!("--exclude={RESULTS_DIR}");
    let mut rsync = vec!["-av", "--progress"];
    if !upload_results {
        rsync.push(exclude.as_str());
    }
    rsync.extend(["-e", shell.as_str(), source.as_str(), remote.as_str()]);
    run_checked(context, "rsync", &rsync)?;
    Ok(remote)
}

fn run_checked(context: &PipelineContext<'_>, cmd: &str, args: &[&str]) -> Result<()> {
    debug!("running {cmd} {}", args.join(" "));
    let output = context
        .executor
        .run(cmd, args, &CommandOptions::default())
        .map_err(|err| StageError::Publish {
            reason: format!("{cmd}: {err}"),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(StageError::Publish {
            reason: format!("{cmd}: {}", failure_reason(&output)),
        })
    }
}

/// Path of the transfer key: absolute keys are used as is, bare names are
/// looked up in `{home}/.ssh`.
///
/// # Examples
///
/// ```
/// use rebuilder_worker::stages::publish::ssh_key_path;
/// use std::path::Path;
///
/// let home = Path::new("/home/rebuilder");
/// assert_eq!(
///     ssh_key_path("id_rebuilder", Some(home)).as_deref(),
///     Some(camino::Utf8Path::new("/home/rebuilder/.ssh/id_rebuilder"))
/// );
/// assert_eq!(
///     ssh_key_path("/etc/keys/id", None).as_deref(),
///     Some(camino::Utf8Path::new("/etc/keys/id"))
/// );
/// ```
#[must_use]
pub fn ssh_key_path(key: &str, home: Option<&Path>) -> Option<Utf8PathBuf> {
    let key = Utf8Path::new(key);
    if key.is_absolute() {
        return Some(key.to_owned());
    }
    let home = Utf8Path::from_path(home?)?;
    Some(home.join(".ssh").join(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, PipelineHarness, StubExecutor, failure_output, success_output};
    use rebuilder_common::identity::PackageIdentity;
    use rstest::rstest;
    use std::fs;

    fn configured(root_key: &str) -> String {
        format!(
            "[project.debian]\n\
             repo_ssh_key = \"{root_key}\"\n\
             repo_remote_ssh_host = \"rebuilder@mirror.example\"\n\
             repo_remote_ssh_basedir = \"/srv/rebuilder/\"\n"
        )
    }

    fn with_tree(mut harness: PipelineHarness, expected: Vec<ExpectedCall>) -> PipelineHarness {
        fs::create_dir_all(harness.root.join("rebuild/debian/logs")).expect("tree");
        harness.executor = StubExecutor::new(expected);
        harness
    }

    fn bash() -> BuildTask {
        let identity = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye");
        BuildTask::new(identity, "old")
    }

    #[rstest]
    fn task_publication_mirrors_the_project_tree_without_results() {
        let harness = PipelineHarness::new(&configured("/keys/id_rebuilder"));
        let local = format!("{}/rebuild/debian/", harness.root);
        let harness = with_tree(
            harness,
            vec![
                ExpectedCall::new(
                    "ssh",
                    &[
                        "-i",
                        "/keys/id_rebuilder",
                        "-o",
                        "StrictHostKeyChecking=no",
                        "rebuilder@mirror.example",
                        "mkdir",
                        "-p",
                        "/srv/rebuilder/debian",
                    ],
                    Ok(success_output()),
                ),
                ExpectedCall::new(
                    "rsync",
                    &[
                        "-av",
                        "--progress",
                        "--exclude=results",
                        "-e",
                        "ssh -i /keys/id_rebuilder -o StrictHostKeyChecking=no",
                        local.as_str(),
                        "rebuilder@mirror.example:/srv/rebuilder/debian",
                    ],
                    Ok(success_output()),
                ),
            ],
        );
        let task = bash();
        let outcome = publish(
            &harness.context(),
            &PublishRequest {
                task: Some(&task),
                ..PublishRequest::default()
            },
        )
        .expect("published");

        assert_eq!(
            outcome,
            PublishOutcome::Published {
                project: Project::Debian,
                remote: "rebuilder@mirror.example:/srv/rebuilder/debian".to_owned(),
            }
        );
        harness.executor.assert_finished();
    }

    #[rstest]
    fn scheduled_publication_uploads_results() {
        let harness = with_tree(
            PipelineHarness::new(&configured("/keys/id_rebuilder")),
            vec![
                ExpectedCall::any("ssh", Ok(success_output())),
                ExpectedCall::any("rsync", Ok(success_output())),
            ],
        );
        publish(
            &harness.context(),
            &PublishRequest {
                project: Some("debian"),
                upload_results: true,
                ..PublishRequest::default()
            },
        )
        .expect("published");

        let calls = harness.executor.calls();
        let (_, rsync_args, _) = calls.last().expect("rsync call");
        assert!(!rsync_args.iter().any(|arg| arg.starts_with("--exclude")));
    }

    #[rstest]
    fn missing_transfer_settings_skip_without_commands() {
        let harness = with_tree(PipelineHarness::new("[project.debian]\n"), Vec::new());
        let outcome = publish(
            &harness.context(),
            &PublishRequest {
                project: Some("debian"),
                ..PublishRequest::default()
            },
        )
        .expect("skipped");
        assert_eq!(outcome, PublishOutcome::Skipped);
        assert!(harness.executor.calls().is_empty());
    }

    #[rstest]
    fn transfer_failure_is_not_retryable() {
        let harness = with_tree(
            PipelineHarness::new(&configured("/keys/id_rebuilder")),
            vec![ExpectedCall::any("ssh", Ok(failure_output("Permission denied")))],
        );
        let task = bash();
        let err = publish(
            &harness.context(),
            &PublishRequest {
                task: Some(&task),
                ..PublishRequest::default()
            },
        )
        .expect_err("ssh failed");
        assert!(matches!(err.cause, StageError::Publish { ref reason } if reason.contains("Permission denied")));
        assert!(!err.is_retryable());
    }

    #[rstest]
    #[case::nothing(None)]
    #[case::unknown_project(Some("gentoo"))]
    fn unresolvable_target_is_a_publish_error(#[case] project: Option<&str>) {
        let harness = PipelineHarness::new(&configured("/keys/id_rebuilder"));
        let err = publish(
            &harness.context(),
            &PublishRequest {
                project,
                ..PublishRequest::default()
            },
        )
        .expect_err("no target");
        assert!(matches!(err.cause, StageError::Publish { .. }));
    }

    #[rstest]
    fn bare_key_names_resolve_below_home() {
        let home = tempfile::TempDir::new().expect("home");
        let expected = home.path().join(".ssh").join("id_rebuilder");
        temp_env::with_var("HOME", Some(home.path()), || {
            let home = directories_next::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
            let key = ssh_key_path("id_rebuilder", home.as_deref()).expect("key path");
            assert_eq!(key.as_std_path(), expected);
        });
    }
}
