use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{config_file_version, EngineConfig, ScopeDecl};
use crate::resolver::ScopeError;
use crate::scope::{sort_remotes, InstalledRef, Remote, Scope, ScopeSet};

const CONFIG_FILE: &str = "bundlekit.toml";
const INSTALLED_FILE: &str = "installed.toml";
const REMOTES_FILE: &str = "remotes.toml";

/// On-disk state: engine config plus one directory per scope.
#[derive(Debug, Clone)]
pub struct ScopeStore {
    state_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstalledStateFile {
    #[serde(default = "config_file_version")]
    version: u32,
    #[serde(default)]
    installed: Vec<InstalledRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemotesStateFile {
    #[serde(default = "config_file_version")]
    version: u32,
    #[serde(default)]
    remotes: Vec<Remote>,
}

impl ScopeStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.state_root.join("catalog")
    }

    pub fn load_config(&self) -> Result<EngineConfig> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(EngineConfig::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed reading engine config: {}", path.display()))?;
        let mut config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("failed parsing engine config: {}", path.display()))?;
        config.version = config_file_version();
        validate_scope_decls(&config.scopes)
            .with_context(|| format!("invalid engine config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save_config(&self, config: &EngineConfig) -> Result<()> {
        validate_scope_decls(&config.scopes)?;
        let path = self.config_path();
        let content = toml::to_string(config)
            .with_context(|| format!("failed serializing engine config: {}", path.display()))?;
        write_state_file(&path, &content)
    }

    /// Loads every declared scope, keeping declaration order.
    pub fn load_scopes(&self, config: &EngineConfig) -> Result<ScopeSet> {
        let mut scopes = Vec::with_capacity(config.scopes.len());
        for decl in &config.scopes {
            scopes.push(self.load_scope(decl)?);
        }
        Ok(ScopeSet::new(scopes))
    }

    pub fn load_scope(&self, decl: &ScopeDecl) -> Result<Scope> {
        let mut scope = Scope::new(&decl.name, decl.is_user, self.scope_dir(decl));

        let installed_path = scope.path.join(INSTALLED_FILE);
        if installed_path.exists() {
            let content = fs::read_to_string(&installed_path).with_context(|| {
                format!("failed reading installed state: {}", installed_path.display())
            })?;
            let state: InstalledStateFile = toml::from_str(&content).with_context(|| {
                format!("failed parsing installed state: {}", installed_path.display())
            })?;
            scope.installed = state
                .installed
                .into_iter()
                .map(|installed| (installed.bundle_ref.clone(), installed))
                .collect::<BTreeMap<_, _>>();
        }

        let remotes_path = scope.path.join(REMOTES_FILE);
        if remotes_path.exists() {
            let content = fs::read_to_string(&remotes_path).with_context(|| {
                format!("failed reading remote state: {}", remotes_path.display())
            })?;
            let state: RemotesStateFile = toml::from_str(&content).with_context(|| {
                format!("failed parsing remote state: {}", remotes_path.display())
            })?;
            scope.remotes = state.remotes;
            scope.sort_remotes();
        }

        debug!(
            "loaded scope '{}': {} installed, {} remotes",
            scope.name,
            scope.installed.len(),
            scope.remotes.len()
        );
        Ok(scope)
    }

    pub fn save_installed(&self, scope: &Scope) -> Result<()> {
        let state = InstalledStateFile {
            version: config_file_version(),
            installed: scope.installed.values().cloned().collect(),
        };
        let path = scope.path.join(INSTALLED_FILE);
        let content = toml::to_string(&state)
            .with_context(|| format!("failed serializing installed state: {}", path.display()))?;
        write_state_file(&path, &content)
    }

    pub fn save_remotes(&self, scope: &Scope) -> Result<()> {
        let mut remotes = scope.remotes.clone();
        sort_remotes(&mut remotes);
        let state = RemotesStateFile {
            version: config_file_version(),
            remotes,
        };
        let path = scope.path.join(REMOTES_FILE);
        let content = toml::to_string(&state)
            .with_context(|| format!("failed serializing remote state: {}", path.display()))?;
        write_state_file(&path, &content)
    }

    pub fn add_remote(&self, scope: &mut Scope, remote: Remote) -> Result<()> {
        validate_name("remote", &remote.name)?;
        if scope.remote(&remote.name).is_some() {
            anyhow::bail!(
                "remote '{}' already exists in scope '{}'",
                remote.name,
                scope.name
            );
        }

        scope.remotes.push(remote);
        scope.sort_remotes();
        self.save_remotes(scope)
    }

    /// Refuses while any installed ref still names the remote as origin.
    pub fn remove_remote(&self, scope: &mut Scope, name: &str) -> Result<()> {
        let removed = scope.remove_remote(name)?;
        debug!("removed remote '{}' from scope '{}'", removed.name, scope.name);
        self.save_remotes(scope)
    }

    pub fn set_remote_enabled(&self, scope: &mut Scope, name: &str, enabled: bool) -> Result<()> {
        let scope_name = scope.name.clone();
        let remote = scope
            .remote_mut(name)
            .ok_or_else(|| ScopeError::RemoteNotFound {
                scope: scope_name,
                remote: name.to_string(),
            })?;
        remote.enabled = enabled;
        self.save_remotes(scope)
    }

    pub fn scope_dir(&self, decl: &ScopeDecl) -> PathBuf {
        if decl.path.is_absolute() {
            decl.path.clone()
        } else {
            self.state_root.join(&decl.path)
        }
    }

    fn config_path(&self) -> PathBuf {
        self.state_root.join(CONFIG_FILE)
    }
}

fn write_state_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed writing {}", path.display()))
}

fn validate_scope_decls(decls: &[ScopeDecl]) -> Result<()> {
    let mut seen = HashSet::new();
    for decl in decls {
        validate_name("scope", &decl.name)?;
        if !seen.insert(decl.name.as_str()) {
            anyhow::bail!("scope '{}' is declared more than once", decl.name);
        }
    }
    Ok(())
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        anyhow::bail!("invalid {what} name: must be 1-64 characters");
    }

    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        anyhow::bail!("invalid {what} name: '{name}'");
    };

    let first_is_valid = first.is_ascii_lowercase() || first.is_ascii_digit();
    let rest_is_valid =
        chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_');
    if !first_is_valid || !rest_is_valid {
        anyhow::bail!("invalid {what} name: '{name}'");
    }

    Ok(())
}
