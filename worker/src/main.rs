//! `rebuilder` CLI entrypoint.
//!
//! Runs the pipeline workers, queues one-off discoveries and publications,
//! and reports on the record store.

use clap::Parser;
use log::info;
use rebuilder_common::config::{Config, config_path};
use rebuilder_common::dist::DistributionSpec;
use rebuilder_worker::cli::{Cli, Command, DumpArgs, StatusArgs, WorkerArgs};
use rebuilder_worker::dispatcher::Dispatcher;
use rebuilder_worker::engine::SystemRebuildEngine;
use rebuilder_worker::error::CommandError;
use rebuilder_worker::executor::SystemCommandExecutor;
use rebuilder_worker::fetch::HttpFetcher;
use rebuilder_worker::logging;
use rebuilder_worker::message::StageMessage;
use rebuilder_worker::queue::SpoolQueue;
use rebuilder_worker::scheduler::{Scheduler, submit_once};
use rebuilder_worker::signer::InTotoSigner;
use rebuilder_worker::stages::PipelineContext;
use rebuilder_worker::status::{StatusReport, format_human, format_json};
use rebuilder_worker::store::{JsonFileStore, RecordStore};
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

type Result<T, E = CommandError> = std::result::Result<T, E>;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbosity);
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let run_result = run(&cli, &mut stdout, &mut stderr);
    let exit_code = exit_code_for_run_result(run_result, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run(cli: &Cli, stdout: &mut dyn Write, stderr: &mut dyn Write) -> Result<()> {
    let path = config_path(cli.config.as_deref());
    let config = Config::load(&path)?;
    let state_dir = &config.common.state_dir;

    match &cli.command {
        Command::Worker(args) => run_worker(&config, args),
        Command::Discover(args) => {
            DistributionSpec::parse(&args.dist)?;
            let queue = SpoolQueue::open(state_dir)?;
            let message = StageMessage::Discover {
                dist: args.dist.clone(),
                force_retry: args.force_retry,
            };
            report_submission(submit_once(&queue, message)?, &args.dist, stderr);
            Ok(())
        }
        Command::Publish(args) => {
            let queue = SpoolQueue::open(state_dir)?;
            let message = StageMessage::Publish {
                task: None,
                project: Some(args.project.as_str().to_owned()),
                upload_results: args.upload_results,
            };
            report_submission(submit_once(&queue, message)?, args.project.as_str(), stderr);
            Ok(())
        }
        Command::Status(StatusArgs { json }) => {
            let store = JsonFileStore::open(state_dir)?;
            let report = StatusReport::collect(&store)?;
            let rendered = if *json {
                format_json(&report)
            } else {
                format_human(&report)
            };
            write!(stdout, "{}", rendered.trim_end())?;
            writeln!(stdout)?;
            Ok(())
        }
        Command::Dump(DumpArgs { limit }) => {
            let store = JsonFileStore::open(state_dir)?;
            let records = store.dump_all(*limit)?;
            writeln!(stdout, "{}", serde_json::to_string_pretty(&records)?)?;
            Ok(())
        }
    }
}

/// Serves the requested stages until the process is killed; the stop flag
/// is never raised, so there is no graceful shutdown. A message reserved at
/// that moment stays in the spool's `inflight/` directory and is restored by
/// the `recover` call at the next start.
fn run_worker(config: &Config, args: &WorkerArgs) -> Result<()> {
    let state_dir = &config.common.state_dir;
    let store = JsonFileStore::open(state_dir)?;
    let queue = SpoolQueue::open(state_dir)?;
    let restored = queue.recover()?;
    if restored > 0 {
        info!("restored {restored} reserved message(s)");
    }

    let fetcher = HttpFetcher;
    let executor = SystemCommandExecutor;
    let engine = SystemRebuildEngine::from_config(config);
    let signer = InTotoSigner::new(SystemCommandExecutor);
    let context = PipelineContext {
        config,
        store: &store,
        queue: &queue,
        fetcher: &fetcher,
        executor: &executor,
        engine: &engine,
        signer: &signer,
    };

    let dispatcher = Dispatcher::new(context);
    let stages = args.selected_stages();
    let poll = Duration::from_millis(args.poll_ms);
    let stop = AtomicBool::new(false);
    let mut scheduler = if args.no_schedule {
        Scheduler::default()
    } else {
        Scheduler::from_config(config, Instant::now())
    };

    thread::scope(|scope| {
        if !scheduler.is_empty() {
            scope.spawn(|| scheduler.run(&queue, poll, &stop));
        }
        dispatcher.run_workers(&stages, args.jobs, poll, &stop);
    });
    Ok(())
}

fn report_submission(queued: bool, subject: &str, stderr: &mut dyn Write) {
    if queued {
        write_stderr_line(stderr, format!("{subject}: queued"));
    } else {
        write_stderr_line(stderr, format!("{subject}: already queued"));
    }
}

fn exit_code_for_run_result(result: Result<()>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            write_stderr_line(stderr, err);
            1
        }
    }
}

fn write_stderr_line(stderr: &mut dyn Write, message: impl std::fmt::Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort logging; ignore write failures.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuilder_worker::error::StageError;
    use rstest::rstest;
    use tempfile::TempDir;

    #[test]
    fn exit_code_for_run_result_returns_zero_on_success() {
        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Ok(()), &mut stderr);
        assert_eq!(exit_code, 0);
        assert!(stderr.is_empty());
    }

    #[test]
    fn exit_code_for_run_result_prints_error_and_returns_one() {
        let err = CommandError::Stage(StageError::Queue {
            reason: "spool is read-only".to_owned(),
        });
        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Err(err), &mut stderr);
        assert_eq!(exit_code, 1);

        let stderr_text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(stderr_text.contains("spool is read-only"));
    }

    fn config_in(dir: &TempDir) -> String {
        let root = dir.path().display();
        let path = dir.path().join("rebuilder.toml");
        std::fs::write(
            &path,
            format!("[common]\nstate_dir = '{root}/state'\n\n[project.debian]\n"),
        )
        .expect("config");
        path.display().to_string()
    }

    fn run_args(args: &[&str]) -> (Result<()>, String, String) {
        let cli = Cli::parse_from(args);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = run(&cli, &mut stdout, &mut stderr);
        (
            result,
            String::from_utf8(stdout).expect("stdout was not UTF-8"),
            String::from_utf8(stderr).expect("stderr was not UTF-8"),
        )
    }

    #[rstest]
    fn discover_queues_once() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir);
        let args = ["rebuilder", "--config", &config, "discover", "bullseye.amd64"];

        let (first, _, stderr) = run_args(&args);
        assert!(first.is_ok());
        assert!(stderr.contains("bullseye.amd64: queued"));

        let (second, _, stderr) = run_args(&args);
        assert!(second.is_ok());
        assert!(stderr.contains("already queued"));
    }

    #[rstest]
    fn malformed_dist_is_rejected_before_queueing() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir);
        let (result, _, _) = run_args(&["rebuilder", "--config", &config, "discover", "bullseye"]);
        assert!(matches!(result, Err(CommandError::Distribution(_))));
    }

    #[rstest]
    fn status_of_an_empty_store() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir);
        let (result, stdout, _) = run_args(&["rebuilder", "--config", &config, "status"]);
        assert!(result.is_ok());
        assert_eq!(stdout, "No build records.\n");
    }

    #[rstest]
    fn dump_of_an_empty_store_is_an_empty_array() {
        let dir = TempDir::new().expect("tempdir");
        let config = config_in(&dir);
        let (result, stdout, _) = run_args(&["rebuilder", "--config", &config, "dump"]);
        assert!(result.is_ok());
        assert_eq!(stdout.trim(), "[]");
    }

    #[rstest]
    fn missing_configuration_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("absent.toml").display().to_string();
        let (result, _, _) = run_args(&["rebuilder", "--config", &missing, "status"]);
        assert!(matches!(result, Err(CommandError::Config(_))));
    }
}
