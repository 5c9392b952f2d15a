use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bundlekit_core::{AppMetadata, BundleRef, BundleScope, Progress};
use bundlekit_installer::{CompletedOperation, OpKind, TransactionReport, TransactionWarning};
use bundlekit_registry::{EngineConfig, Remote, RemoteRef, Scope, ScopeDecl, ScopeStore};
use clap::error::ErrorKind;
use clap::Parser;

use super::*;
use crate::commands::{format_report_lines, format_search_results, format_status_lines, StatusEntry};
use crate::render::{render_progress_line, render_status_line, resolve_output_style, OutputStyle};

const ARCH: &str = "x86_64";

#[test]
fn render_status_line_plain_is_message_only() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "installed editor"),
        "installed editor"
    );
}

#[test]
fn render_status_line_rich_uses_ascii_badges() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "installed editor"),
        "[OK] installed editor"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "low space"),
        "[WARN] low space"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "failed"),
        "[ERR] failed"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "step", "nothing to do"),
        "[..] nothing to do"
    );
}

#[test]
fn resolve_output_style_follows_stdout_tty() {
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
    assert_eq!(resolve_output_style(true, true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, false), OutputStyle::Plain);
}

#[test]
fn render_progress_line_is_suppressed_in_plain_mode() {
    assert_eq!(
        render_progress_line(OutputStyle::Plain, "install", 40, None),
        None
    );
    let line = render_progress_line(OutputStyle::Rich, "install", 250, None)
        .expect("rich mode must render a line");
    assert!(line.contains("100%"));
}

#[test]
fn cli_parses_global_background_flag_after_subcommand() {
    let cli = Cli::try_parse_from(["bundlekit", "update", "org.example.Editor", "--background"])
        .expect("update must parse");
    assert!(cli.background);
    match cli.command {
        Commands::Update { ids } => assert_eq!(ids, vec!["org.example.Editor".to_string()]),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_parses_remote_add_with_defaults() {
    let cli = Cli::try_parse_from([
        "bundlekit",
        "remote",
        "add",
        "main",
        "https://main.example.test/repo",
    ])
    .expect("remote add must parse");
    match cli.command {
        Commands::Remote { command } => assert_eq!(
            command,
            RemoteCommands::Add {
                name: "main".to_string(),
                url: "https://main.example.test/repo".to_string(),
                scope: "user".to_string(),
                priority: 10,
            }
        ),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_parses_status_json_without_ids() {
    let cli = Cli::try_parse_from(["bundlekit", "status", "--json"]).expect("status must parse");
    match cli.command {
        Commands::Status { ids, json } => {
            assert!(ids.is_empty());
            assert!(json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_rejects_install_without_id() {
    let err = Cli::try_parse_from(["bundlekit", "install"]).expect_err("install needs an id");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn format_report_lines_lists_completed_then_warnings() {
    let report = TransactionReport {
        completed: vec![CompletedOperation {
            scope: "user".to_string(),
            kind: OpKind::Install,
            target: editor_ref(),
        }],
        warnings: vec![TransactionWarning::Skipped {
            subject: "org.example.Maps".to_string(),
            reason: "remote 'gone' in scope 'user' not found".to_string(),
        }],
        skipped_scopes: vec!["system".to_string()],
    };

    let lines = format_report_lines(&report, OutputStyle::Rich);
    assert_eq!(
        lines,
        vec![
            format!("[OK] install {} (user)", editor_ref()),
            "[WARN] warning: skipped org.example.Maps: remote 'gone' in scope 'user' not found"
                .to_string(),
            "[WARN] skipped scope system: not enough free space".to_string(),
        ]
    );
}

#[test]
fn format_search_results_reports_empty_match() {
    assert_eq!(
        format_search_results(&[], "edit"),
        vec!["No applications found matching 'edit'. Try a broader keyword.".to_string()]
    );
}

#[test]
fn format_status_lines_flags_missing_runtime() {
    let entry = StatusEntry {
        id: "org.example.Editor".to_string(),
        kind: "application".to_string(),
        state: "updatable-live".to_string(),
        installation: Some("user".to_string()),
        origin: Some("main".to_string()),
        commit: Some("c1".to_string()),
        update_commit: None,
        missing_runtime: true,
        end_of_life: None,
        diagnostic: None,
    };

    let lines = format_status_lines(&[entry]);
    assert_eq!(lines[0], "id\tstate\tscope\torigin");
    assert_eq!(
        lines[1],
        "org.example.Editor\tupdatable-live\tuser\tmain\t(runtime missing)"
    );
}

#[test]
fn with_progress_in_plain_mode_passes_result_through() {
    let metadata = editor_metadata();
    let mut cache = bundlekit_core::AppCache::new();
    let app = cache.insert_metadata(&metadata).expect("record must be created");
    app.set_progress(Progress::Percent(30));

    let renderer = render::TerminalRenderer::from_style(OutputStyle::Plain);
    let result: Result<u32, String> = renderer.with_progress("install", &app, || Ok(7));
    assert_eq!(result, Ok(7));
    let failed: Result<u32, String> =
        renderer.with_progress("install", &app, || Err("boom".to_string()));
    assert_eq!(failed, Err("boom".to_string()));
}

#[test]
fn install_command_persists_app_and_runtime_to_user_scope() {
    let root = test_root();
    seed_state_root(&root);

    let mut workspace = Workspace::open(Some(root.clone())).expect("workspace must open");
    commands::run_install_command(&mut workspace, "org.example.Editor", false)
        .expect("install must succeed");

    let store = ScopeStore::new(&root);
    let scope = store.load_scope(&user_decl()).expect("user scope must load");
    let installed = scope
        .installed_ref(&editor_ref())
        .expect("editor must be installed");
    assert_eq!(installed.origin, "main");
    assert_eq!(installed.commit, "e1");
    assert!(scope.is_installed(&platform_ref()));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn remote_remove_refuses_while_installed_refs_use_it() {
    let root = test_root();
    seed_state_root(&root);

    let mut workspace = Workspace::open(Some(root.clone())).expect("workspace must open");
    commands::run_install_command(&mut workspace, "org.example.Editor", false)
        .expect("install must succeed");

    let mut workspace = Workspace::open(Some(root.clone())).expect("workspace must reopen");
    let err = commands::run_remote_command(
        &mut workspace,
        RemoteCommands::Remove {
            name: "main".to_string(),
            scope: "user".to_string(),
        },
    )
    .expect_err("remote in use must not be removed");
    assert!(err.to_string().contains("still the origin"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn remote_disable_persists_to_remotes_file() {
    let root = test_root();
    seed_state_root(&root);

    let mut workspace = Workspace::open(Some(root.clone())).expect("workspace must open");
    commands::run_remote_command(
        &mut workspace,
        RemoteCommands::Disable {
            name: "main".to_string(),
            scope: "user".to_string(),
        },
    )
    .expect("disable must succeed");

    let scope = ScopeStore::new(&root)
        .load_scope(&user_decl())
        .expect("user scope must load");
    assert!(!scope.remote("main").expect("remote must remain").enabled);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_of_unknown_id_fails_with_lookup_error() {
    let root = test_root();
    seed_state_root(&root);

    let mut workspace = Workspace::open(Some(root.clone())).expect("workspace must open");
    let err = commands::run_install_command(&mut workspace, "org.example.Missing", false)
        .expect_err("unknown id must fail");
    assert!(err.to_string().contains("no application found"));

    let _ = fs::remove_dir_all(&root);
}

fn seed_state_root(root: &std::path::Path) {
    let store = ScopeStore::new(root);
    let config = EngineConfig {
        min_free_headroom_bytes: 0,
        ..EngineConfig::default()
    };
    store.save_config(&config).expect("config must save");

    let mut scope = Scope::new("user", true, store.scope_dir(&user_decl()));
    let mut editor = remote_ref(&editor_ref(), "e1");
    editor.runtime = Some(format!("org.example.Platform/{ARCH}/stable"));
    scope.remotes.push(Remote {
        name: "main".to_string(),
        url: "https://main.example.test/repo".to_string(),
        enabled: true,
        priority: 10,
        refs: vec![editor, remote_ref(&platform_ref(), "p1")],
    });
    store.save_remotes(&scope).expect("remotes must save");

    let catalog = store.catalog_dir();
    fs::create_dir_all(&catalog).expect("catalog dir must be created");
    fs::write(
        catalog.join("org.example.Editor.toml"),
        format!(
            "id = \"org.example.Editor\"\n\
             kind = \"application\"\n\
             arch = \"{ARCH}\"\n\
             branch = \"stable\"\n\
             runtime = \"org.example.Platform/{ARCH}/stable\"\n\
             summary = \"Text editor\"\n\
             bundle_scope = \"user\"\n"
        ),
    )
    .expect("catalog entry must be written");
}

fn editor_metadata() -> AppMetadata {
    AppMetadata::from_toml_str(&format!(
        "id = \"org.example.Editor\"\n\
         kind = \"application\"\n\
         arch = \"{ARCH}\"\n\
         branch = \"stable\"\n\
         bundle_scope = \"{}\"\n",
        BundleScope::User.as_str()
    ))
    .expect("metadata must parse")
}

fn user_decl() -> ScopeDecl {
    ScopeDecl {
        name: "user".to_string(),
        is_user: true,
        path: PathBuf::from("scopes/user"),
    }
}

fn editor_ref() -> BundleRef {
    BundleRef::app("org.example.Editor", ARCH, "stable")
}

fn platform_ref() -> BundleRef {
    BundleRef::runtime("org.example.Platform", ARCH, "stable")
}

fn remote_ref(bundle_ref: &BundleRef, commit: &str) -> RemoteRef {
    RemoteRef {
        bundle_ref: bundle_ref.clone(),
        commit: commit.to_string(),
        download_size: 1_024,
        installed_size: 4_096,
        runtime: None,
        related: Vec::new(),
        runtime_repo: None,
        eol: None,
        eol_rebase: None,
    }
}

fn test_root() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "bundlekit-cli-test-{}-{nanos}",
        std::process::id()
    ))
}
