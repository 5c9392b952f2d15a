use std::collections::BTreeMap;
use std::path::PathBuf;

use bundlekit_core::{BundleRef, BundleScope};
use serde::{Deserialize, Serialize};

use crate::resolver::ScopeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRef {
    #[serde(rename = "ref")]
    pub bundle_ref: BundleRef,
    pub origin: String,
    pub commit: String,
    #[serde(default)]
    pub installed_size: u64,
    #[serde(default)]
    pub installed_at_unix: u64,
}

/// One ref a remote offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    #[serde(rename = "ref")]
    pub bundle_ref: BundleRef,
    pub commit: String,
    #[serde(default)]
    pub download_size: u64,
    #[serde(default)]
    pub installed_size: u64,
    /// Runtime the ref needs, as `name/arch/branch`.
    pub runtime: Option<String>,
    /// Extensions (locales and the like) pulled in alongside the ref.
    #[serde(default)]
    pub related: Vec<BundleRef>,
    /// Remote that provides the runtime, when it is not this one.
    pub runtime_repo: Option<String>,
    pub eol: Option<String>,
    pub eol_rebase: Option<BundleRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub url: String,
    #[serde(default = "remote_enabled_default")]
    pub enabled: bool,
    pub priority: u32,
    #[serde(default)]
    pub refs: Vec<RemoteRef>,
}

impl Remote {
    pub fn find(&self, bundle_ref: &BundleRef) -> Option<&RemoteRef> {
        self.refs.iter().find(|entry| &entry.bundle_ref == bundle_ref)
    }
}

fn remote_enabled_default() -> bool {
    true
}

/// An independent installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub is_user: bool,
    pub path: PathBuf,
    pub installed: BTreeMap<BundleRef, InstalledRef>,
    /// Sorted by priority, then name.
    pub remotes: Vec<Remote>,
}

impl Scope {
    pub fn new(name: impl Into<String>, is_user: bool, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            is_user,
            path: path.into(),
            installed: BTreeMap::new(),
            remotes: Vec::new(),
        }
    }

    pub fn bundle_scope(&self) -> BundleScope {
        BundleScope::from_is_user(self.is_user)
    }

    pub fn installed_ref(&self, bundle_ref: &BundleRef) -> Option<&InstalledRef> {
        self.installed.get(bundle_ref)
    }

    pub fn is_installed(&self, bundle_ref: &BundleRef) -> bool {
        self.installed.contains_key(bundle_ref)
    }

    pub fn remote(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|remote| remote.name == name)
    }

    pub fn remote_mut(&mut self, name: &str) -> Option<&mut Remote> {
        self.remotes.iter_mut().find(|remote| remote.name == name)
    }

    /// Remotes offering `bundle_ref`, enabled or not, in priority order.
    pub fn remotes_offering<'a>(
        &'a self,
        bundle_ref: &'a BundleRef,
    ) -> impl Iterator<Item = (&'a Remote, &'a RemoteRef)> + 'a {
        self.remotes
            .iter()
            .filter_map(move |remote| remote.find(bundle_ref).map(|entry| (remote, entry)))
    }

    /// Installed refs whose origin is `remote`.
    pub fn refs_from_remote<'a>(
        &'a self,
        remote: &'a str,
    ) -> impl Iterator<Item = &'a BundleRef> + 'a {
        self.installed
            .values()
            .filter(move |installed| installed.origin == remote)
            .map(|installed| &installed.bundle_ref)
    }

    /// Drops a remote, refusing while any installed ref still names it as
    /// origin.
    pub fn remove_remote(&mut self, name: &str) -> Result<Remote, ScopeError> {
        let Some(index) = self.remotes.iter().position(|remote| remote.name == name) else {
            return Err(ScopeError::RemoteNotFound {
                scope: self.name.clone(),
                remote: name.to_string(),
            });
        };

        let in_use = self
            .refs_from_remote(name)
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !in_use.is_empty() {
            return Err(ScopeError::RemoteInUse {
                remote: name.to_string(),
                refs: in_use.join(", "),
            });
        }

        Ok(self.remotes.remove(index))
    }

    pub(crate) fn sort_remotes(&mut self) {
        sort_remotes(&mut self.remotes);
    }
}

pub(crate) fn sort_remotes(remotes: &mut [Remote]) {
    remotes.sort_by(|left, right| {
        left.priority
            .cmp(&right.priority)
            .then_with(|| left.name.cmp(&right.name))
    });
}

/// Configured scopes in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
}

impl ScopeSet {
    pub fn new(scopes: Vec<Scope>) -> Self {
        Self { scopes }
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn get(&self, name: &str) -> Option<&Scope> {
        self.scopes.iter().find(|scope| scope.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Scope> {
        self.scopes.iter_mut().find(|scope| scope.name == name)
    }

    pub fn replace(&mut self, scope: Scope) {
        match self.get_mut(&scope.name) {
            Some(existing) => *existing = scope,
            None => self.scopes.push(scope),
        }
    }
}
