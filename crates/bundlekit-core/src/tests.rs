use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::*;

#[test]
fn bundle_ref_parses_and_formats() {
    let parsed: BundleRef = "app/org.example.Maps/x86_64/stable"
        .parse()
        .expect("ref must parse");
    assert_eq!(parsed.kind, RefKind::App);
    assert_eq!(parsed.name, "org.example.Maps");
    assert_eq!(parsed.to_string(), "app/org.example.Maps/x86_64/stable");
}

#[test]
fn bundle_ref_rejects_unknown_kind_and_short_forms() {
    let err = "bundle/org.example.Maps/x86_64/stable"
        .parse::<BundleRef>()
        .expect_err("unknown kind must fail");
    assert!(err.to_string().contains("unknown kind"));

    let err = "app/org.example.Maps/x86_64"
        .parse::<BundleRef>()
        .expect_err("three parts must fail");
    assert!(err.to_string().contains("expected kind/name/arch/branch"));
}

#[test]
fn runtime_declaration_is_always_runtime_kind() {
    let runtime = BundleRef::parse_runtime_decl("org.example.Platform/x86_64/46")
        .expect("declaration must parse");
    assert!(runtime.is_runtime_class());
    assert_eq!(runtime.to_string(), "runtime/org.example.Platform/x86_64/46");
}

#[test]
fn app_kind_rejects_unrecognized_tags() {
    assert_eq!("desktop".parse::<AppKind>(), Ok(AppKind::Application));
    assert_eq!("Runtime".parse::<AppKind>(), Ok(AppKind::Runtime));
    assert_eq!(
        "repository-source".parse::<AppKind>(),
        Ok(AppKind::Repository)
    );
    assert_eq!(
        "font".parse::<AppKind>(),
        Err(KindError::Unrecognized("font".to_string()))
    );
}

#[test]
fn metadata_with_unknown_kind_fails_to_parse() {
    let err = AppMetadata::from_toml_str(
        r#"
id = "org.example.Font"
kind = "font"
"#,
    )
    .expect_err("unknown kind must be rejected");
    assert!(format!("{err:#}").contains("unrecognized application kind"));
}

#[test]
fn metadata_without_arch_has_no_ref() {
    let metadata = AppMetadata::from_toml_str(
        r#"
id = "org.example.Maps"
kind = "application"
"#,
    )
    .expect("metadata must parse");
    assert_eq!(metadata.bundle_ref().expect("kind is valid"), None);
}

#[test]
fn state_table_rejects_skipping_install() {
    assert!(AppState::Available.allows_transition(AppState::Installing));
    assert!(!AppState::Available.allows_transition(AppState::Removing));
    assert!(!AppState::Installed.allows_transition(AppState::Installing));
    assert!(AppState::UpdatableLive.allows_transition(AppState::Installing));
    assert!(AppState::Removing.allows_transition(AppState::Unknown));
}

#[test]
fn handle_refuses_invalid_transition_and_keeps_state() {
    let handle = AppHandle::new(AppRecord::new(app_key("org.example.Maps")));
    assert!(handle.set_state(AppState::Installed));
    assert!(!handle.set_state(AppState::Installing));
    assert_eq!(handle.state(), AppState::Installed);

    handle.restore_state(AppState::Available);
    assert_eq!(handle.state(), AppState::Available);
}

#[test]
fn cache_returns_same_record_for_same_identity() {
    let mut cache = AppCache::new();
    let first = cache.get_or_create(app_key("org.example.Maps"));
    let second = cache.get_or_create(app_key("org.example.Maps"));

    first.set_state(AppState::Available);
    assert_eq!(second.state(), AppState::Available);
    assert_eq!(first, second);
    assert_eq!(cache.len(), 1);

    let other_scope = cache.get_or_create(AppKey::new(
        BundleScope::User,
        AppKind::Application,
        "org.example.Maps",
        "x86_64",
        "stable",
    ));
    assert_ne!(first, other_scope);
    assert_eq!(cache.len(), 2);
}

#[test]
fn cache_links_declared_runtime() {
    let mut cache = AppCache::new();
    let metadata = AppMetadata::from_toml_str(
        r#"
id = "org.example.Maps"
kind = "application"
arch = "x86_64"
branch = "stable"
runtime = "org.example.Platform/x86_64/46"
"#,
    )
    .expect("metadata must parse");

    let app = cache.insert_metadata(&metadata).expect("record must be created");
    let runtime = app.runtime().expect("runtime must be linked");
    assert_eq!(runtime.kind(), AppKind::Runtime);
    assert_eq!(
        runtime.bundle_ref().map(|r| r.to_string()).as_deref(),
        Some("runtime/org.example.Platform/x86_64/46")
    );
    assert_eq!(
        cache
            .find_by_ref(&BundleRef::runtime("org.example.Platform", "x86_64", "46"))
            .as_ref(),
        Some(&runtime)
    );
}

#[test]
fn metadata_catalog_reads_and_searches_directory() {
    let root = test_root();
    fs::create_dir_all(&root).expect("must create catalog root");
    fs::write(
        root.join("org.example.Maps.toml"),
        "id = \"org.example.Maps\"\nkind = \"application\"\nsummary = \"Find places\"\n",
    )
    .expect("must write metadata");
    fs::write(
        root.join("org.example.Notes.toml"),
        "id = \"org.example.Notes\"\nkind = \"application\"\n",
    )
    .expect("must write metadata");

    let catalog = MetadataCatalog::open(&root);
    let found = catalog
        .metadata("org.example.Maps")
        .expect("lookup must succeed")
        .expect("entry must exist");
    assert_eq!(found.summary.as_deref(), Some("Find places"));
    assert!(catalog
        .metadata("org.example.Missing")
        .expect("lookup must succeed")
        .is_none());

    let results = catalog.search("places").expect("search must succeed");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "org.example.Maps");

    let _ = fs::remove_dir_all(&root);
}

fn app_key(name: &str) -> AppKey {
    AppKey::new(
        BundleScope::System,
        AppKind::Application,
        name,
        "x86_64",
        "stable",
    )
}

fn test_root() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "bundlekit-core-test-{}-{nanos}",
        std::process::id()
    ))
}
