//! Tests for CLI parsing and defaults.

use super::*;
use rstest::rstest;

#[test]
fn worker_defaults_to_every_stage() {
    let cli = Cli::parse_from(["rebuilder", "worker"]);
    let Command::Worker(args) = cli.command else {
        panic!("expected Worker command");
    };
    assert_eq!(args.jobs, 1);
    assert_eq!(args.poll_ms, 1000);
    assert!(!args.no_schedule);
    assert_eq!(args.selected_stages(), Stage::ALL);
}

#[test]
fn worker_stages_are_ordered_and_deduplicated() {
    let cli = Cli::parse_from([
        "rebuilder", "worker", "--stage", "report", "--stage", "rebuild", "--stage", "report",
        "-j", "4",
    ]);
    let Command::Worker(args) = cli.command else {
        panic!("expected Worker command");
    };
    assert_eq!(args.jobs, 4);
    assert_eq!(args.selected_stages(), [Stage::Rebuild, Stage::Report]);
}

#[test]
fn global_options_follow_the_subcommand() {
    let cli = Cli::parse_from(["rebuilder", "status", "--json", "-vv", "--config", "/etc/r.toml"]);
    assert_eq!(cli.verbosity, 2);
    assert_eq!(cli.config, Some(Utf8PathBuf::from("/etc/r.toml")));
    assert!(matches!(cli.command, Command::Status(StatusArgs { json: true })));
}

#[test]
fn discover_takes_a_dist_string() {
    let cli = Cli::parse_from(["rebuilder", "discover", "bullseye+essential.amd64", "--force-retry"]);
    let Command::Discover(args) = cli.command else {
        panic!("expected Discover command");
    };
    assert_eq!(args.dist, "bullseye+essential.amd64");
    assert!(args.force_retry);
}

#[rstest]
#[case::debian("debian", Project::Debian)]
#[case::qubes("qubesos", Project::QubesOs)]
#[case::fedora("fedora", Project::Fedora)]
fn publish_parses_projects(#[case] name: &str, #[case] expected: Project) {
    let cli = Cli::parse_from(["rebuilder", "publish", "--project", name]);
    let Command::Publish(args) = cli.command else {
        panic!("expected Publish command");
    };
    assert_eq!(args.project, expected);
    assert!(!args.upload_results);
}

#[rstest]
#[case::unknown_project(&["rebuilder", "publish", "--project", "gentoo"])]
#[case::missing_project(&["rebuilder", "publish"])]
#[case::unknown_stage(&["rebuilder", "worker", "--stage", "render"])]
#[case::missing_command(&["rebuilder"])]
fn invalid_invocations_are_rejected(#[case] args: &[&str]) {
    assert!(Cli::try_parse_from(args).is_err());
}

#[test]
fn dump_limit_is_optional() {
    let cli = Cli::parse_from(["rebuilder", "dump", "--limit", "10"]);
    assert!(matches!(cli.command, Command::Dump(DumpArgs { limit: Some(10) })));
}
