use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use bundlekit_core::{AppCache, AppHandle, AppKey, AppMetadata, Catalog, MetadataCatalog};
use bundlekit_installer::{
    CommandHelper, Installer, Interaction, SimulatedBackend, TransactionReport,
};
use bundlekit_registry::{
    default_state_root, EngineConfig, Remote, Scope, ScopeSet, ScopeStore, StatvfsProbe,
};
use bundlekit_resolver::{Resolution, StateResolver};
use serde::Serialize;
use tracing::debug;

use crate::render::{render_status_line, OutputStyle, TerminalRenderer};
use crate::RemoteCommands;

/// Everything a command needs from the state root.
pub(crate) struct Workspace {
    store: ScopeStore,
    config: EngineConfig,
    scopes: ScopeSet,
    catalog: MetadataCatalog,
    cache: AppCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct StatusEntry {
    pub(crate) id: String,
    pub(crate) kind: String,
    pub(crate) state: String,
    pub(crate) installation: Option<String>,
    pub(crate) origin: Option<String>,
    pub(crate) commit: Option<String>,
    pub(crate) update_commit: Option<String>,
    pub(crate) missing_runtime: bool,
    pub(crate) end_of_life: Option<String>,
    pub(crate) diagnostic: Option<String>,
}

impl Workspace {
    pub(crate) fn open(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => default_state_root()?,
        };
        let store = ScopeStore::new(root);
        let config = store.load_config()?;
        let scopes = store.load_scopes(&config)?;
        let catalog = MetadataCatalog::open(store.catalog_dir());
        debug!(
            "opened state root {} with {} scopes",
            store.state_root().display(),
            scopes.scopes().len()
        );

        Ok(Self {
            store,
            config,
            scopes,
            catalog,
            cache: AppCache::new(),
        })
    }

    fn app(&mut self, id: &str) -> Result<AppHandle> {
        let metadata = self
            .catalog
            .metadata(id)?
            .ok_or_else(|| anyhow!("no application found: {id}"))?;
        self.cache.insert_metadata(&metadata)
    }

    /// Records for every installed ref in every scope, catalog-backed where
    /// the catalog knows the ref.
    fn installed_apps(&mut self) -> Result<Vec<AppHandle>> {
        let mut apps = Vec::new();
        for scope in self.scopes.scopes() {
            for bundle_ref in scope.installed.keys() {
                let metadata = self.catalog.metadata(&bundle_ref.name)?;
                let app = match metadata {
                    Some(metadata) if metadata.bundle_ref()?.as_ref() == Some(bundle_ref) => {
                        self.cache.insert_metadata(&metadata)?
                    }
                    _ => {
                        let key = AppKey::for_ref(scope.bundle_scope(), bundle_ref);
                        self.cache.get_or_create_for_ref(key, bundle_ref)
                    }
                };
                if !apps.contains(&app) {
                    apps.push(app);
                }
            }
        }
        Ok(apps)
    }

    fn with_installer<R>(&self, f: impl FnOnce(&mut Installer<'_>) -> R) -> R {
        let backend = SimulatedBackend::with_store(self.store.clone());
        let probe = StatvfsProbe;
        let helper = self
            .config
            .privileged_helper
            .clone()
            .map(CommandHelper::new);

        let mut installer = Installer::new(self.scopes.clone(), &backend, &probe)
            .with_min_free_headroom(self.config.min_free_headroom_bytes)
            .with_catalog(&self.catalog)
            .with_lookup(&self.cache);
        if let Some(helper) = &helper {
            installer = installer.with_helper(helper);
        }
        f(&mut installer)
    }

    fn scope_mut(&mut self, name: &str) -> Result<&mut Scope> {
        self.scopes
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown scope: '{name}'"))
    }
}

pub(crate) fn run_status_command(
    workspace: &mut Workspace,
    ids: &[String],
    json: bool,
) -> Result<()> {
    let apps = if ids.is_empty() {
        let listed = workspace.catalog.search("")?;
        listed
            .iter()
            .map(|metadata| workspace.cache.insert_metadata(metadata))
            .collect::<Result<Vec<_>>>()?
    } else {
        ids.iter()
            .map(|id| workspace.app(id))
            .collect::<Result<Vec<_>>>()?
    };

    let resolver = StateResolver::new(&workspace.scopes).with_catalog(&workspace.catalog);
    let entries = apps
        .iter()
        .map(|app| status_entry(app, &resolver.refine(app)))
        .collect::<Vec<_>>();

    if json {
        let rendered =
            serde_json::to_string_pretty(&entries).context("failed to serialize status output")?;
        println!("{rendered}");
        return Ok(());
    }

    let renderer = TerminalRenderer::current();
    renderer.print_section("Status");
    renderer.print_lines(&format_status_lines(&entries));
    Ok(())
}

pub(crate) fn run_search_command(workspace: &Workspace, query: &str) -> Result<()> {
    let results = workspace.catalog.search(query)?;
    for line in format_search_results(&results, query) {
        println!("{line}");
    }
    Ok(())
}

pub(crate) fn run_install_command(
    workspace: &mut Workspace,
    id: &str,
    background: bool,
) -> Result<()> {
    let app = workspace.app(id)?;
    let renderer = TerminalRenderer::current();
    let report = workspace
        .with_installer(|installer| {
            renderer.with_progress("install", &app, || {
                installer.install(&app, interaction(background))
            })
        })
        .with_context(|| format!("failed to install {id}"))?;

    print_outcome(renderer, &format!("installed {id}"), &report);
    Ok(())
}

pub(crate) fn run_update_command(
    workspace: &mut Workspace,
    ids: &[String],
    background: bool,
) -> Result<()> {
    let apps = if ids.is_empty() {
        workspace.installed_apps()?
    } else {
        ids.iter()
            .map(|id| workspace.app(id))
            .collect::<Result<Vec<_>>>()?
    };
    if apps.is_empty() {
        println!("No installed applications to update");
        return Ok(());
    }

    let renderer = TerminalRenderer::current();
    let report = workspace
        .with_installer(|installer| installer.update(&apps, interaction(background)))
        .context("update failed")?;

    print_outcome(renderer, "update finished", &report);
    Ok(())
}

pub(crate) fn run_remove_command(workspace: &mut Workspace, id: &str) -> Result<()> {
    let app = workspace.app(id)?;
    let renderer = TerminalRenderer::current();
    let report = workspace
        .with_installer(|installer| {
            renderer.with_progress("remove", &app, || installer.remove(&app))
        })
        .with_context(|| format!("failed to remove {id}"))?;

    print_outcome(renderer, &format!("removed {id}"), &report);
    Ok(())
}

pub(crate) fn run_refresh_command(workspace: &Workspace, scope: &str, remote: &str) -> Result<()> {
    workspace
        .with_installer(|installer| installer.refresh_metadata(scope, remote))
        .with_context(|| format!("failed to refresh remote '{remote}' in scope '{scope}'"))?;
    let style = TerminalRenderer::current().style();
    println!(
        "{}",
        render_status_line(style, "ok", &format!("refreshed {remote} ({scope})"))
    );
    Ok(())
}

pub(crate) fn run_remote_command(workspace: &mut Workspace, command: RemoteCommands) -> Result<()> {
    let store = workspace.store.clone();
    let message = match command {
        RemoteCommands::Add {
            name,
            url,
            scope,
            priority,
        } => {
            let target = workspace.scope_mut(&scope)?;
            store.add_remote(
                target,
                Remote {
                    name: name.clone(),
                    url,
                    enabled: true,
                    priority,
                    refs: Vec::new(),
                },
            )?;
            format!("added remote {name} ({scope})")
        }
        RemoteCommands::Remove { name, scope } => {
            store.remove_remote(workspace.scope_mut(&scope)?, &name)?;
            format!("removed remote {name} ({scope})")
        }
        RemoteCommands::Enable { name, scope } => {
            store.set_remote_enabled(workspace.scope_mut(&scope)?, &name, true)?;
            format!("enabled remote {name} ({scope})")
        }
        RemoteCommands::Disable { name, scope } => {
            store.set_remote_enabled(workspace.scope_mut(&scope)?, &name, false)?;
            format!("disabled remote {name} ({scope})")
        }
    };

    let style = TerminalRenderer::current().style();
    println!("{}", render_status_line(style, "ok", &message));
    Ok(())
}

fn interaction(background: bool) -> Interaction {
    if background {
        Interaction::Background
    } else {
        Interaction::Interactive
    }
}

fn status_entry(app: &AppHandle, resolution: &Resolution) -> StatusEntry {
    app.read(|record| StatusEntry {
        id: record.key.name.clone(),
        kind: record.key.kind.as_str().to_string(),
        state: resolution.state.as_str().to_string(),
        installation: record.installation.clone(),
        origin: record.origin.clone(),
        commit: record.commit.clone(),
        update_commit: record.update_commit.clone(),
        missing_runtime: record.missing_runtime,
        end_of_life: record.end_of_life.clone(),
        diagnostic: resolution
            .diagnostic
            .as_ref()
            .map(|diagnostic| diagnostic.to_string()),
    })
}

pub(crate) fn format_status_lines(entries: &[StatusEntry]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["No applications in the catalog".to_string()];
    }

    let mut lines = Vec::with_capacity(entries.len() + 1);
    lines.push("id\tstate\tscope\torigin".to_string());
    for entry in entries {
        let mut line = format!(
            "{}\t{}\t{}\t{}",
            entry.id,
            entry.state,
            entry.installation.as_deref().unwrap_or("-"),
            entry.origin.as_deref().unwrap_or("-")
        );
        if entry.missing_runtime {
            line.push_str("\t(runtime missing)");
        }
        if let Some(diagnostic) = &entry.diagnostic {
            line.push_str(&format!("\t({diagnostic})"));
        }
        lines.push(line);
    }
    lines
}

pub(crate) fn format_search_results(results: &[AppMetadata], query: &str) -> Vec<String> {
    if results.is_empty() {
        return vec![format!("No applications found matching '{query}'. Try a broader keyword.")];
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    lines.push("id\tkind\tsummary".to_string());
    for result in results {
        lines.push(format!(
            "{}\t{}\t{}",
            result.id,
            result.kind,
            result.summary.as_deref().unwrap_or("-")
        ));
    }
    lines
}

/// One line per completed operation, then warnings and skipped scopes.
pub(crate) fn format_report_lines(report: &TransactionReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for completed in &report.completed {
        lines.push(render_status_line(
            style,
            "ok",
            &format!(
                "{} {} ({})",
                completed.kind.as_str(),
                completed.target,
                completed.scope
            ),
        ));
    }
    for warning in &report.warnings {
        lines.push(render_status_line(style, "warn", &format!("warning: {warning}")));
    }
    for scope in &report.skipped_scopes {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("skipped scope {scope}: not enough free space"),
        ));
    }
    lines
}

fn print_outcome(renderer: TerminalRenderer, summary: &str, report: &TransactionReport) {
    renderer.print_lines(&format_report_lines(report, renderer.style()));
    if report.completed.is_empty() && report.skipped_scopes.is_empty() {
        println!("{}", render_status_line(renderer.style(), "step", "nothing to do"));
        return;
    }
    println!("{}", render_status_line(renderer.style(), "ok", summary));
}
