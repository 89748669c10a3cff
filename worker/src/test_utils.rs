//! Shared test utilities for the worker crate.
//!
//! Available to unit tests and, through the `test-support` feature, to the
//! behaviour tests: command stubs, an in-memory fetcher, a scripted rebuild
//! engine and a signing tool that writes realistic link documents without
//! GnuPG.

use crate::engine::{EngineRequest, RebuildEngine};
use crate::error::{Result, StageError};
use crate::executor::{CommandExecutor, CommandOptions};
use crate::fetch::{FetchError, Fetcher};
use crate::queue::MemoryQueue;
use crate::signer::{SigningTool, signed_link_name};
use crate::stages::PipelineContext;
use crate::store::MemoryStore;
use camino::{Utf8Path, Utf8PathBuf};
use rebuilder_common::config::Config;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::process::{ExitStatus, Output};
use std::sync::Mutex;

/// Creates an `ExitStatus` from an exit code (Unix implementation).
#[cfg(unix)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    ExitStatus::from_raw(code << 8)
}

/// Creates an `ExitStatus` from an exit code (Windows implementation).
#[cfg(windows)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;

    ExitStatus::from_raw(code.unsigned_abs())
}

/// Creates a successful command `Output` with empty stdout and stderr.
#[must_use]
pub fn success_output() -> Output {
    stdout_output("")
}

/// Creates a successful command `Output` with the given stdout.
#[must_use]
pub fn stdout_output(stdout: &str) -> Output {
    Output {
        status: exit_status(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Creates a failed command `Output` with the given stderr message.
#[must_use]
pub fn failure_output(stderr: &str) -> Output {
    Output {
        status: exit_status(1),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Represents an expected command invocation for testing.
#[derive(Debug)]
pub struct ExpectedCall {
    /// The command to execute (e.g., "rsync").
    pub cmd: String,
    /// The arguments to pass to the command; `None` accepts any.
    pub args: Option<Vec<String>>,
    /// The result to return when this command is invoked.
    pub result: Result<Output>,
}

impl ExpectedCall {
    /// Expects `cmd` with exactly `args`.
    #[must_use]
    pub fn new(cmd: &str, args: &[&str], result: Result<Output>) -> Self {
        Self {
            cmd: cmd.to_owned(),
            args: Some(args.iter().map(|arg| (*arg).to_owned()).collect()),
            result,
        }
    }

    /// Expects `cmd` with any arguments.
    #[must_use]
    pub fn any(cmd: &str, result: Result<Output>) -> Self {
        Self {
            cmd: cmd.to_owned(),
            args: None,
            result,
        }
    }
}

/// A stub implementation of `CommandExecutor` for testing.
///
/// Records expected command invocations and returns predefined results,
/// allowing tests to verify command execution without side effects.
#[derive(Debug, Default)]
pub struct StubExecutor {
    expected: Mutex<VecDeque<ExpectedCall>>,
    calls: Mutex<Vec<(String, Vec<String>, Option<Utf8PathBuf>)>>,
}

impl StubExecutor {
    /// Creates a new `StubExecutor` with the given expected calls.
    #[must_use]
    pub fn new(expected: Vec<ExpectedCall>) -> Self {
        Self {
            expected: Mutex::new(expected.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Commands received so far, with their working directories.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Vec<String>, Option<Utf8PathBuf>)> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Asserts that all expected command invocations have been consumed.
    ///
    /// # Panics
    ///
    /// Panics if there are remaining expected calls that were not invoked.
    pub fn assert_finished(&self) {
        let remaining = self.expected.lock().map_or(0, |expected| expected.len());
        assert_eq!(remaining, 0, "expected no further command invocations");
    }
}

impl CommandExecutor for StubExecutor {
    fn run(&self, cmd: &str, args: &[&str], options: &CommandOptions) -> Result<Output> {
        let args: Vec<String> = args.iter().map(|arg| (*arg).to_owned()).collect();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((cmd.to_owned(), args.clone(), options.cwd.clone()));
        }

        let call = self
            .expected
            .lock()
            .ok()
            .and_then(|mut expected| expected.pop_front())
            .ok_or_else(|| StageError::StubMismatch {
                message: format!("unexpected command invocation: {cmd} {}", args.join(" ")),
            })?;

        if call.cmd != cmd {
            return Err(StageError::StubMismatch {
                message: format!("expected command {}, got {cmd}", call.cmd),
            });
        }
        if let Some(expected_args) = &call.args {
            if *expected_args != args {
                return Err(StageError::StubMismatch {
                    message: format!("expected args {expected_args:?}, got {args:?}"),
                });
            }
        }
        call.result
    }
}

/// In-memory document server.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    documents: BTreeMap<String, String>,
    failing: Vec<String>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    /// Creates a fetcher serving nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` at `url`.
    #[must_use]
    pub fn with_document(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.documents.insert(url.into(), body.into());
        self
    }

    /// Fails every request to `url` with an HTTP error.
    #[must_use]
    pub fn with_failure(mut self, url: impl Into<String>) -> Self {
        self.failing.push(url.into());
        self
    }

    /// URLs requested so far.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_owned());
        }
        if self.failing.iter().any(|failing| failing == url) {
            return Err(FetchError::Http {
                url: url.to_owned(),
                reason: "connection reset by peer".to_owned(),
            });
        }
        self.documents
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: url.to_owned(),
            })
    }
}

/// One scripted engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineRun {
    /// Exit code to report.
    pub exit_code: Option<i32>,
    /// Files written into the output directory.
    pub files: Vec<(String, String)>,
    /// Text written to the log file.
    pub log: String,
}

impl EngineRun {
    /// A run exiting with `code` and producing no files.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            files: Vec::new(),
            log: format!("engine exited with {code}\n"),
        }
    }

    /// Adds an output file.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push((name.into(), contents.into()));
        self
    }
}

/// Rebuild engine replaying scripted runs in order.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    runs: Mutex<VecDeque<EngineRun>>,
    requests: Mutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    /// Creates an engine replaying `runs`.
    #[must_use]
    pub fn new(runs: Vec<EngineRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Appends a run to the script.
    pub fn push(&self, run: EngineRun) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push_back(run);
        }
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl RebuildEngine for ScriptedEngine {
    fn rebuild(&self, request: &EngineRequest) -> Result<Option<i32>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let run = self
            .runs
            .lock()
            .ok()
            .and_then(|mut runs| runs.pop_front())
            .ok_or_else(|| StageError::StubMismatch {
                message: format!("unexpected rebuild of {}", request.descriptor),
            })?;

        std::fs::write(&request.log_file, &run.log)?;
        std::fs::create_dir_all(&request.output_dir)?;
        for (name, contents) in &run.files {
            std::fs::write(request.output_dir.join(name), contents)?;
        }
        Ok(run.exit_code)
    }
}

/// Signing tool writing unsigned-but-well-formed in-toto link documents.
///
/// Product digests are the SHA-256 of the product files, so merged links
/// can be compared byte for byte.
#[derive(Debug, Default)]
pub struct FakeSigner {
    signed: Mutex<Vec<Utf8PathBuf>>,
}

impl FakeSigner {
    /// Creates a signer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signed links written so far.
    #[must_use]
    pub fn signed(&self) -> Vec<Utf8PathBuf> {
        self.signed
            .lock()
            .map(|signed| signed.clone())
            .unwrap_or_default()
    }
}

impl SigningTool for FakeSigner {
    fn run(
        &self,
        step: &str,
        products: &[String],
        key: &str,
        metadata_dir: &Utf8Path,
        cwd: &Utf8Path,
    ) -> Result<Utf8PathBuf> {
        let mut digests = Map::new();
        for product in products {
            let bytes = std::fs::read(cwd.join(product))?;
            let digest = format!("{:x}", Sha256::digest(&bytes));
            digests.insert(product.clone(), json!({ "sha256": digest }));
        }
        let link = json!({
            "signatures": [{ "keyid": key, "sig": "run" }],
            "signed": {
                "_type": "link",
                "name": step,
                "materials": {},
                "products": Value::Object(digests),
                "byproducts": {},
                "command": [],
                "environment": {},
            },
        });
        let path = metadata_dir.join(signed_link_name(step, key));
        std::fs::write(&path, serde_json::to_vec(&link).map_err(std::io::Error::other)?)?;
        Ok(path)
    }

    fn sign(&self, link: &Utf8Path, key: &str) -> Result<Utf8PathBuf> {
        let (Some(dir), Some(step)) = (link.parent(), link.file_stem()) else {
            return Err(StageError::StubMismatch {
                message: format!("not a link file: {link}"),
            });
        };
        let text = std::fs::read_to_string(link)?;
        let mut document: Value = serde_json::from_str(&text).map_err(std::io::Error::other)?;
        if let Some(object) = document.as_object_mut() {
            object.insert(
                "signatures".to_owned(),
                json!([{ "keyid": key, "sig": "merged" }]),
            );
        }
        let signed = dir.join(signed_link_name(step, key));
        std::fs::write(
            &signed,
            serde_json::to_vec(&document).map_err(std::io::Error::other)?,
        )?;
        if let Ok(mut written) = self.signed.lock() {
            written.push(signed.clone());
        }
        Ok(signed)
    }
}

/// Temporary state tree, configuration and in-memory collaborators for
/// driving the stages without external tools.
pub struct PipelineHarness {
    _root: tempfile::TempDir,
    /// Root of the temporary tree.
    pub root: Utf8PathBuf,
    /// Configuration pointing every directory into `root`.
    pub config: Config,
    /// Record store.
    pub store: MemoryStore,
    /// Task queue.
    pub queue: MemoryQueue,
    /// Listing and catalog server.
    pub fetcher: FakeFetcher,
    /// Command stub; expects no command unless replaced.
    pub executor: StubExecutor,
    /// Rebuild engine replaying pushed runs.
    pub engine: ScriptedEngine,
    /// Signing tool.
    pub signer: FakeSigner,
}

impl PipelineHarness {
    /// Creates a harness whose configuration is `[common]` (directories in
    /// a fresh temporary tree, no retry delay) followed by `projects`.
    ///
    /// # Panics
    ///
    /// Panics when the temporary tree cannot be created or `projects` is
    /// not valid configuration.
    #[must_use]
    pub fn new(projects: &str) -> Self {
        let dir = tempfile::TempDir::new().expect("temporary tree");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("UTF-8 temporary tree");
        let toml = format!(
            "[common]\nretry_delay_seconds = 0\nartifacts_dir = '{root}/artifacts'\n\
             rebuild_dir = '{root}/rebuild'\nstate_dir = '{root}/state'\n\n{projects}"
        );
        let config =
            Config::from_toml_str(Utf8Path::new("harness.toml"), &toml).expect("harness config");
        Self {
            _root: dir,
            root,
            config,
            store: MemoryStore::new(),
            queue: MemoryQueue::new(),
            fetcher: FakeFetcher::new(),
            executor: StubExecutor::new(Vec::new()),
            engine: ScriptedEngine::new(Vec::new()),
            signer: FakeSigner::new(),
        }
    }

    /// Stage context borrowing the harness collaborators.
    #[must_use]
    pub fn context(&self) -> PipelineContext<'_> {
        PipelineContext {
            config: &self.config,
            store: &self.store,
            queue: &self.queue,
            fetcher: &self.fetcher,
            executor: &self.executor,
            engine: &self.engine,
            signer: &self.signer,
        }
    }
}
