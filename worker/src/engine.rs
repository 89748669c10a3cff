//! Rebuild Engine seam.
//!
//! The engine takes the distributed build descriptor, rebuilds the package
//! into an output directory and reports the outcome solely through its exit
//! code: `0` reproducible, `2` unreproducible, anything else a failure. On
//! success it leaves a new build descriptor and a `summary.out` product
//! summary in the output directory.

use crate::error::{Result, StageError};
use camino::Utf8PathBuf;
use rebuilder_common::config::Config;
use rebuilder_common::dist::Project;
use std::collections::BTreeMap;
use std::fs::File;
use std::process::{Command, Stdio};

/// Exit code of a reproducible rebuild.
pub const EXIT_REPRODUCIBLE: i32 = 0;
/// Exit code of an unreproducible rebuild.
pub const EXIT_UNREPRODUCIBLE: i32 = 2;

/// One engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    /// Project whose engine command is used.
    pub project: Project,
    /// Locator of the distributed build descriptor.
    pub descriptor: String,
    /// Scratch directory receiving the products.
    pub output_dir: Utf8PathBuf,
    /// Snapshot service queried for build dependencies.
    pub snapshot_query_url: String,
    /// Snapshot mirror serving build dependencies.
    pub snapshot_mirror_url: String,
    /// Key signing the new build descriptor, if any.
    pub signing_key: Option<String>,
    /// Ecosystem-specific arguments, opaque to the pipeline.
    pub extra_args: Vec<String>,
    /// File receiving the combined output stream.
    pub log_file: Utf8PathBuf,
}

impl EngineRequest {
    /// Per-request arguments appended to the engine command.
    ///
    /// # Examples
    ///
    /// ```
    /// use rebuilder_common::dist::Project;
    /// use rebuilder_worker::engine::EngineRequest;
    ///
    /// let request = EngineRequest {
    ///     project: Project::Debian,
    ///     descriptor: "https://example.test/bash_5.1-2+b3_amd64.buildinfo".to_owned(),
    ///     output_dir: "/tmp/bash-5.1-2+b3xyz".into(),
    ///     snapshot_query_url: "http://snapshot.notset.fr".to_owned(),
    ///     snapshot_mirror_url: "http://snapshot.notset.fr".to_owned(),
    ///     signing_key: None,
    ///     extra_args: vec!["--gpg-verify".to_owned()],
    ///     log_file: "/tmp/bash.log".into(),
    /// };
    /// let args = request.arguments();
    /// assert_eq!(args.first().map(String::as_str), Some("--output=/tmp/bash-5.1-2+b3xyz"));
    /// assert_eq!(args.last().map(String::as_str), Some(request.descriptor.as_str()));
    /// ```
    #[must_use]
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            format!("--output={}", self.output_dir),
            format!("--query-url={}", self.snapshot_query_url),
            format!("--snapshot-mirror={}", self.snapshot_mirror_url),
        ];
        if let Some(key) = &self.signing_key {
            args.push("--gpg-sign-keyid".to_owned());
            args.push(key.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.descriptor.clone());
        args
    }
}

/// External rebuild toolchain.
#[cfg_attr(test, mockall::automock)]
pub trait RebuildEngine: Send + Sync {
    /// Runs one rebuild and returns its exit code, `None` when the engine
    /// was killed by a signal.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot be started.
    fn rebuild(&self, request: &EngineRequest) -> Result<Option<i32>>;
}

/// Engine running the configured per-project command line.
#[derive(Debug, Clone, Default)]
pub struct SystemRebuildEngine {
    commands: BTreeMap<Project, Vec<String>>,
}

impl SystemRebuildEngine {
    /// Collects the engine command of every project.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let commands = Project::ALL
            .into_iter()
            .map(|project| (project, config.project(project).rebuild_command))
            .filter(|(_, command)| !command.is_empty())
            .collect();
        Self { commands }
    }
}

impl RebuildEngine for SystemRebuildEngine {
    fn rebuild(&self, request: &EngineRequest) -> Result<Option<i32>> {
        let Some((program, base_args)) = self
            .commands
            .get(&request.project)
            .and_then(|command| command.split_first())
        else {
            return Err(StageError::BuildFailure {
                package: request.descriptor.clone(),
                reason: format!("no rebuild engine configured for {}", request.project),
            });
        };

        let log = File::create(&request.log_file)?;
        let status = Command::new(program)
            .args(base_args)
            .args(request.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .status()?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use rstest::rstest;

    fn request(project: Project, log_file: Utf8PathBuf) -> EngineRequest {
        EngineRequest {
            project,
            descriptor: "bash_5.1-2+b3_amd64.buildinfo".to_owned(),
            output_dir: Utf8PathBuf::from("/tmp/out"),
            snapshot_query_url: "http://snapshot.example".to_owned(),
            snapshot_mirror_url: "http://snapshot.example".to_owned(),
            signing_key: Some("632F8C69E01B25C9E0C3ADF2F360C0D259FB650C".to_owned()),
            extra_args: vec!["--gpg-verify".to_owned()],
            log_file,
        }
    }

    #[rstest]
    fn arguments_place_key_and_extras_before_descriptor() {
        let args = request(Project::Debian, Utf8PathBuf::from("/tmp/log")).arguments();
        assert_eq!(
            args,
            [
                "--output=/tmp/out",
                "--query-url=http://snapshot.example",
                "--snapshot-mirror=http://snapshot.example",
                "--gpg-sign-keyid",
                "632F8C69E01B25C9E0C3ADF2F360C0D259FB650C",
                "--gpg-verify",
                "bash_5.1-2+b3_amd64.buildinfo",
            ]
        );
    }

    #[rstest]
    fn missing_command_is_a_build_failure() {
        let config = Config::from_toml_str(Utf8Path::new("t.toml"), "").expect("config");
        let engine = SystemRebuildEngine::from_config(&config);
        let result = engine.rebuild(&request(Project::Fedora, Utf8PathBuf::from("/tmp/log")));
        assert!(matches!(result, Err(StageError::BuildFailure { .. })));
    }

    #[cfg(unix)]
    #[rstest]
    fn exit_code_and_output_are_captured() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf-8 path");
        let config = Config::from_toml_str(
            Utf8Path::new("t.toml"),
            "[project.debian]\nrebuild_command = [\"sh\", \"-c\", \"echo rebuilt; exit 2\", \"engine\"]\n",
        )
        .expect("config");
        let engine = SystemRebuildEngine::from_config(&config);
        let log = root.join("bash.log");

        let code = engine
            .rebuild(&request(Project::Debian, log.clone()))
            .expect("engine runs");
        assert_eq!(code, Some(EXIT_UNREPRODUCIBLE));
        let captured = std::fs::read_to_string(&log).expect("log written");
        assert_eq!(captured.trim(), "rebuilt");
    }
}
