use super::*;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chainer_core::status::{E_FAIL, E_INSTALLUSEREXIT, S_OK};
use chainer_core::{ActionState, BundleAction};
use chainer_engine::{ApplyResult, Engine, NullObserver, RestartState};
use chainer_resume::ProcessPrivilege;
use clap::error::ErrorKind;
use clap::CommandFactory;

use crate::completion::write_completions_script;
use crate::dispatch::{
    bundle_action, exit_code_for, EXIT_FAILED, EXIT_RESTART_INITIATED, EXIT_RESTART_REQUIRED,
    EXIT_USER_CANCELLED,
};
use crate::logging::resolve_log_filter;
use crate::plan_view::PlanView;
use crate::render::{format_apply_summary, format_plan_lines, render_status_line};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

struct TempRoot(PathBuf);

impl TempRoot {
    fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let counter = TEST_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "chainer-cli-tests-{}-{}-{}",
            std::process::id(),
            nanos,
            counter
        ));
        fs::create_dir_all(&path).expect("must create temp root");
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

const MIXED_BUNDLE: &str = r#"
[registration]
id = "tools-bundle"
per_machine = true
executable_name = "tools-setup.exe"

[registration.arp]
display_name = "Tools"
display_version = "2.1.0"

[[packages]]
id = "runtime"
kind = "exe"
per_machine = true
install_arguments = "/quiet"
uninstall_arguments = "/uninstall /quiet"

[[packages.payloads]]
id = "runtime.exe"
file_name = "runtime.exe"
size = 2048
source_path = "runtime.exe"
"#;

fn write_manifest(root: &Path, contents: &str) -> PathBuf {
    let path = root.join("bundle").join("bundle.toml");
    fs::create_dir_all(path.parent().expect("manifest has parent")).expect("must create bundle dir");
    fs::write(&path, contents).expect("must write manifest");
    path
}

fn test_config(root: &Path, manifest: &Path) -> EngineConfig {
    EngineConfig::resolve(manifest, None, Some(&root.join("cache")), None, None)
        .expect("config must resolve")
}

fn planned_engine(config: &EngineConfig, action: BundleAction) -> Engine {
    let manifest = config.load_manifest().expect("manifest must load");
    let resume = config
        .resume_registry(manifest.registration.clone(), ProcessPrivilege::User)
        .expect("resume registry");
    let installer = config.installer_context(&manifest.registration);
    let mut engine = Engine::new(manifest, resume, installer).expect("engine must build");
    engine.detect(&mut NullObserver).expect("detect must succeed");
    engine
        .plan(action, &mut NullObserver)
        .expect("plan must succeed");
    engine
}

#[test]
fn cli_parses_bundle_action_commands() {
    let cases = [
        ("install", "Install"),
        ("modify", "Modify"),
        ("repair", "Repair"),
        ("uninstall", "Uninstall"),
    ];
    for (arg, expected) in cases {
        let cli = Cli::try_parse_from(["chainer", arg]).expect("command must parse");
        assert_eq!(format!("{:?}", cli.command), expected);
        assert_eq!(cli.manifest, PathBuf::from("bundle.toml"));
    }
}

#[test]
fn cli_parses_plan_action_and_json_flag() {
    let cli = Cli::try_parse_from(["chainer", "plan", "uninstall", "--json"])
        .expect("command must parse");
    match cli.command {
        Commands::Plan { action, json } => {
            assert_eq!(action, CliAction::Uninstall);
            assert!(json);
            assert_eq!(bundle_action(action), BundleAction::Uninstall);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = Cli::try_parse_from(["chainer", "plan"]).expect("command must parse");
    match cli.command {
        Commands::Plan { action, json } => {
            assert_eq!(action, CliAction::Install);
            assert!(!json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_accepts_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "chainer",
        "install",
        "--manifest",
        "/bundles/suite.toml",
        "--source-dir",
        "/media/suite",
        "--cache-root",
        "/tmp/chainer-cache",
        "--registry-root",
        "/tmp/chainer-registry",
        "--log-level",
        "debug",
    ])
    .expect("command must parse");

    assert_eq!(cli.manifest, PathBuf::from("/bundles/suite.toml"));
    assert_eq!(cli.source_dir, Some(PathBuf::from("/media/suite")));
    assert_eq!(cli.cache_root, Some(PathBuf::from("/tmp/chainer-cache")));
    assert_eq!(cli.registry_root, Some(PathBuf::from("/tmp/chainer-registry")));
    assert_eq!(cli.log_level.as_deref(), Some("debug"));
}

#[test]
fn cli_parses_hidden_elevated_worker_command() {
    let cli = Cli::try_parse_from([
        "chainer",
        "elevated",
        "--pipe",
        "chainer-elevated.1234",
        "--token",
        "0f1e2d3c",
    ])
    .expect("command must parse");
    match cli.command {
        Commands::Elevated { pipe, token } => {
            assert_eq!(pipe, "chainer-elevated.1234");
            assert_eq!(token, "0f1e2d3c");
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let err = Cli::try_parse_from(["chainer", "elevated", "--pipe", "p"])
        .expect_err("missing token must fail");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

    let help = Cli::command().render_help().to_string();
    assert!(!help.contains("elevated"));
}

#[test]
fn cli_parses_every_completion_shell() {
    let cases = [
        ("bash", CliCompletionShell::Bash),
        ("zsh", CliCompletionShell::Zsh),
        ("fish", CliCompletionShell::Fish),
        ("powershell", CliCompletionShell::Powershell),
    ];

    for (shell, expected) in cases {
        let cli = Cli::try_parse_from(["chainer", "completions", shell]).expect("command parses");
        match cli.command {
            Commands::Completions { shell } => assert_eq!(shell, expected),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

#[test]
fn cli_rejects_unsupported_completion_shell() {
    let err = Cli::try_parse_from(["chainer", "completions", "elvish"])
        .expect_err("unsupported shell must fail");
    let rendered = err.to_string();
    assert!(rendered.contains("elvish"));
    assert!(rendered.contains("possible values"));
}

#[test]
fn completions_script_names_the_binary() {
    let mut out = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut out).expect("must generate");
    let script = String::from_utf8(out).expect("script is utf-8");
    assert!(script.contains("chainer"));
    assert!(script.contains("uninstall"));
}

#[test]
fn log_filter_prefers_flag_then_environment() {
    assert_eq!(resolve_log_filter(Some("debug"), Some("warn")), "debug");
    assert_eq!(resolve_log_filter(None, Some("warn")), "warn");
    assert_eq!(resolve_log_filter(Some("  "), Some("trace")), "trace");
    assert_eq!(resolve_log_filter(None, None), "info");
}

#[test]
fn config_defaults_source_dir_and_registry_root() {
    let root = TempRoot::new();
    let manifest = write_manifest(root.path(), MIXED_BUNDLE);
    let config = test_config(root.path(), &manifest);

    assert_eq!(config.source_dir, root.path().join("bundle"));
    assert_eq!(
        config.registry_root,
        root.path().join("cache").join("user").join("registry")
    );
    assert_eq!(config.cache_root, Some(root.path().join("cache")));
    let registration = config.load_manifest().expect("manifest must load").registration;
    assert_eq!(
        config.bundle_image(&registration),
        root.path().join("bundle").join("tools-setup.exe")
    );

    let bare = EngineConfig::resolve(
        Path::new("bundle.toml"),
        None,
        Some(root.path()),
        Some(Path::new("/srv/registry")),
        None,
    )
    .expect("config must resolve");
    assert_eq!(bare.source_dir, PathBuf::from("."));
    assert_eq!(bare.registry_root, PathBuf::from("/srv/registry"));
}

#[cfg(target_os = "linux")]
#[test]
fn registry_volatile_keys_are_scoped_to_the_running_boot() {
    let root = TempRoot::new();
    let manifest = write_manifest(root.path(), MIXED_BUNDLE);
    let config = test_config(root.path(), &manifest);
    let stale = config.registry_root.join("volatile").join("earlier-boot");
    fs::create_dir_all(&stale).expect("must create stale boot dir");

    let store = config.registry_store().expect("registry store");
    let boot_id = fs::read_to_string("/proc/sys/kernel/random/boot_id").expect("boot id");
    assert_eq!(
        store.volatile_root(),
        config.registry_root.join("volatile").join(boot_id.trim())
    );
    assert_eq!(store.root(), config.registry_root.join("persistent"));
    assert!(!stale.exists());
}

#[test]
fn worker_arguments_reproduce_locations_before_elevated_command() {
    let root = TempRoot::new();
    let manifest = write_manifest(root.path(), MIXED_BUNDLE);
    let mut config = test_config(root.path(), &manifest);
    config.log_level = Some("debug".to_string());

    let args = config.worker_arguments("chainer-elevated.42", "cafe");
    let elevated = args
        .iter()
        .position(|arg| arg == "elevated")
        .expect("worker command present");
    assert_eq!(
        &args[elevated..],
        ["elevated", "--pipe", "chainer-elevated.42", "--token", "cafe"]
    );
    let flags = &args[..elevated];
    for flag in ["--manifest", "--source-dir", "--registry-root", "--cache-root", "--log-level"] {
        assert!(flags.iter().any(|arg| arg == flag), "missing {flag}");
    }

    let reparsed = Cli::try_parse_from(std::iter::once("chainer".to_string()).chain(args))
        .expect("worker arguments must parse");
    assert_eq!(reparsed.manifest, manifest);
    assert_eq!(reparsed.cache_root, Some(root.path().join("cache")));
}

#[test]
fn plan_view_serializes_actions_and_elevation() {
    let root = TempRoot::new();
    let manifest = write_manifest(root.path(), MIXED_BUNDLE);
    let config = test_config(root.path(), &manifest);
    let engine = planned_engine(&config, BundleAction::Install);

    let view = PlanView::build(engine.current_plan(), engine.packages()).expect("view builds");
    assert_eq!(view.action, BundleAction::Install);
    assert_eq!(view.execute.len(), 1);
    assert_eq!(view.execute[0].action, ActionState::Install);
    assert!(view.execute[0].elevated);
    assert_eq!(view.cache.len(), 1);
    assert_eq!(view.cache[0].size, 2048);

    let json: serde_json::Value =
        serde_json::from_str(&view.to_json().expect("json")).expect("valid json");
    assert_eq!(json["action"], "install");
    assert_eq!(json["packages"][0]["id"], "runtime");
    assert_eq!(json["packages"][0]["current_state"], "absent");
    assert_eq!(json["packages"][0]["execute_action"], "install");
    assert_eq!(json["execute"][0]["rollback_action"], "uninstall");
    assert!(json["packages"][0].get("installed_version").is_none());
}

#[test]
fn plan_lines_mark_elevated_entries() {
    let root = TempRoot::new();
    let manifest = write_manifest(root.path(), MIXED_BUNDLE);
    let config = test_config(root.path(), &manifest);
    let engine = planned_engine(&config, BundleAction::Install);

    let lines = format_plan_lines(engine.current_plan(), engine.packages());
    assert!(lines[0].starts_with("plan: install (1 to cache, 1 to execute"));
    assert_eq!(lines[1], "  runtime: install, rollback uninstall [elevated]");
}

#[test]
fn plan_lines_report_nothing_to_do_for_absent_uninstall() {
    let root = TempRoot::new();
    let manifest = write_manifest(root.path(), MIXED_BUNDLE);
    let config = test_config(root.path(), &manifest);
    let engine = planned_engine(&config, BundleAction::Uninstall);

    let lines = format_plan_lines(engine.current_plan(), engine.packages());
    assert_eq!(lines.last().map(String::as_str), Some("  nothing to do"));
}

#[test]
fn exit_codes_distinguish_failure_cancel_and_restarts() {
    let result = |status, restart| ApplyResult {
        status,
        restart,
        rolled_back: false,
    };
    assert_eq!(exit_code_for(&result(S_OK, RestartState::None)), 0);
    assert_eq!(
        exit_code_for(&result(S_OK, RestartState::Required)),
        EXIT_RESTART_REQUIRED
    );
    assert_eq!(
        exit_code_for(&result(S_OK, RestartState::Initiated)),
        EXIT_RESTART_INITIATED
    );
    assert_eq!(exit_code_for(&result(E_FAIL, RestartState::None)), EXIT_FAILED);
    assert_eq!(
        exit_code_for(&result(E_INSTALLUSEREXIT, RestartState::Required)),
        EXIT_USER_CANCELLED
    );
}

#[test]
fn status_lines_are_plain_or_badged() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "apply complete"),
        "apply complete"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "a restart is required to finish"),
        "[WARN] a restart is required to finish"
    );
}

#[test]
fn apply_summary_reports_rollback_and_restart() {
    let lines = format_apply_summary(
        OutputStyle::Rich,
        &ApplyResult {
            status: E_FAIL,
            restart: RestartState::None,
            rolled_back: true,
        },
    );
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("[ERROR] apply failed with "));
    assert!(lines[0].ends_with("changes were rolled back"));

    let lines = format_apply_summary(
        OutputStyle::Plain,
        &ApplyResult {
            status: S_OK,
            restart: RestartState::Required,
            rolled_back: false,
        },
    );
    assert_eq!(
        lines,
        vec![
            "apply complete".to_string(),
            "a restart is required to finish".to_string()
        ]
    );
}
