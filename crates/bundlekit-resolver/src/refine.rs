use bundlekit_core::{AppHandle, AppKind, AppState, BundleRef, Catalog};
use bundlekit_registry::{InstalledRef, Scope, ScopeError, ScopeResolver, ScopeSet};
use tracing::{debug, warn};

/// Why a record was left unresolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("{0}: no metadata to derive a ref from")]
    NoMetadata(String),
    #[error("{app}: invalid metadata: {reason}")]
    InvalidMetadata { app: String, reason: String },
    #[error("{0}: no remote in any scope offers it")]
    NoOrigin(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: AppState,
    pub diagnostic: Option<Diagnostic>,
}

impl Resolution {
    fn resolved(state: AppState) -> Self {
        Self {
            state,
            diagnostic: None,
        }
    }

    fn unresolved(diagnostic: Diagnostic) -> Self {
        Self {
            state: AppState::Unknown,
            diagnostic: Some(diagnostic),
        }
    }
}

/// Works out install/availability state of application records from the
/// installed sets and remote lists of every scope.
pub struct StateResolver<'a> {
    scopes: &'a ScopeSet,
    catalog: Option<&'a dyn Catalog>,
}

impl<'a> StateResolver<'a> {
    pub fn new(scopes: &'a ScopeSet) -> Self {
        Self {
            scopes,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: &'a dyn Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn scopes(&self) -> &'a ScopeSet {
        self.scopes
    }

    /// Resolves `app` once. Records that already have a state are left alone.
    pub fn refine(&self, app: &AppHandle) -> Resolution {
        let state = app.state();
        if state != AppState::Unknown {
            return Resolution::resolved(state);
        }

        if app.kind() == AppKind::Repository {
            return self.refine_repository(app);
        }

        let bundle_ref = match self.derive_ref(app) {
            Ok(bundle_ref) => bundle_ref,
            Err(diagnostic) => {
                warn!("{diagnostic}");
                return Resolution::unresolved(diagnostic);
            }
        };

        if self.mark_installed(app, &bundle_ref) {
            self.refine_installed(app, &bundle_ref);
            return Resolution::resolved(app.state());
        }

        let home = ScopeResolver::new(self.scopes).scope_for(app);
        let origin_enabled = self.resolve_origin(app, &bundle_ref);

        if bundle_ref.is_runtime_class()
            && self.mark_installed_in_counterpart(app, home, &bundle_ref)
        {
            return Resolution::resolved(app.state());
        }

        match origin_enabled {
            Some(true) => {
                app.set_state(AppState::Available);
                Resolution::resolved(app.state())
            }
            Some(false) => {
                app.set_state(AppState::Unavailable);
                Resolution::resolved(app.state())
            }
            None => {
                let diagnostic = Diagnostic::NoOrigin(app.key().to_string());
                debug!("{diagnostic}");
                Resolution::unresolved(diagnostic)
            }
        }
    }

    fn derive_ref(&self, app: &AppHandle) -> Result<BundleRef, Diagnostic> {
        if let Some(bundle_ref) = app.bundle_ref() {
            return Ok(bundle_ref);
        }

        let no_metadata = || Diagnostic::NoMetadata(app.key().to_string());
        let catalog = self.catalog.ok_or_else(no_metadata)?;
        let metadata = catalog
            .metadata(&app.key().name)
            .map_err(|err| Diagnostic::InvalidMetadata {
                app: app.key().to_string(),
                reason: format!("{err:#}"),
            })?
            .ok_or_else(no_metadata)?;

        app.update(|record| record.apply_metadata(&metadata));
        app.bundle_ref().ok_or_else(no_metadata)
    }

    /// Scopes the record may live in, in declaration order.
    fn candidate_scopes(&self, app: &AppHandle) -> Vec<&'a Scope> {
        let installation = app.installation();
        let declared = app.key().scope;
        self.scopes
            .scopes()
            .iter()
            .filter(|scope| match &installation {
                Some(name) => &scope.name == name,
                None => declared.is_compatible(scope.bundle_scope()),
            })
            .collect()
    }

    fn mark_installed(&self, app: &AppHandle, bundle_ref: &BundleRef) -> bool {
        for scope in self.candidate_scopes(app) {
            if let Some(installed) = scope.installed_ref(bundle_ref) {
                copy_installed(app, scope, installed);
                return app.set_state(AppState::Installed);
            }
        }
        false
    }

    fn mark_installed_in_counterpart(
        &self,
        app: &AppHandle,
        home: Result<&'a Scope, ScopeError>,
        bundle_ref: &BundleRef,
    ) -> bool {
        let resolver = ScopeResolver::new(self.scopes);
        let scope = match home {
            Ok(scope) => scope,
            Err(err) => {
                debug!("no scope for {app}: {err}");
                return false;
            }
        };
        let counterpart = match resolver.counterpart_of(scope) {
            Ok(counterpart) => counterpart,
            Err(ScopeError::NoCounterpart(_)) => return false,
            Err(err) => {
                debug!("counterpart lookup for {app} failed: {err}");
                return false;
            }
        };

        let Some(installed) = counterpart.installed_ref(bundle_ref) else {
            return false;
        };
        debug!(
            "{app} is installed in counterpart scope '{}'",
            counterpart.name
        );
        copy_installed(app, counterpart, installed);
        app.set_state(AppState::Installed)
    }

    /// Finds the owning remote. Returns whether it is enabled, or `None` when
    /// no scope offers the ref.
    fn resolve_origin(&self, app: &AppHandle, bundle_ref: &BundleRef) -> Option<bool> {
        let resolver = ScopeResolver::new(self.scopes);
        let origin = app.origin();

        for scope in self.candidate_scopes(app) {
            if let Some(enabled) = probe_remotes(app, scope, bundle_ref, origin.as_deref()) {
                return Some(enabled);
            }

            if bundle_ref.is_runtime_class() && scope.is_user {
                match resolver.counterpart_of(scope) {
                    Ok(counterpart) => {
                        if let Some(enabled) =
                            probe_remotes(app, counterpart, bundle_ref, origin.as_deref())
                        {
                            return Some(enabled);
                        }
                    }
                    Err(ScopeError::NoCounterpart(_)) => {}
                    Err(err) => debug!("counterpart lookup for {app} failed: {err}"),
                }
            }
        }

        None
    }

    /// Update and missing-runtime detection for an installed record.
    fn refine_installed(&self, app: &AppHandle, bundle_ref: &BundleRef) {
        let installed = app.read(|record| (record.installation.clone(), record.origin.clone()));
        if let (Some(installation), Some(origin)) = installed {
            let remote_commit = self
                .scopes
                .get(&installation)
                .and_then(|scope| scope.remote(&origin))
                .and_then(|remote| remote.find(bundle_ref))
                .map(|entry| (entry.commit.clone(), entry.download_size));
            let has_update = app.update(|record| match &remote_commit {
                Some((commit, download_size)) if record.commit.as_ref() != Some(commit) => {
                    record.update_commit = Some(commit.clone());
                    record.download_size = Some(*download_size);
                    true
                }
                _ => false,
            });
            if has_update {
                app.set_state(AppState::UpdatableLive);
            }
        }

        if app.kind() != AppKind::Application {
            return;
        }
        let Some(runtime) = app.runtime() else {
            return;
        };
        match self.refine(&runtime).state {
            AppState::Available => {
                debug!("{app} is installed but its runtime {runtime} is missing");
                app.update(|record| record.missing_runtime = true);
                app.set_state(AppState::UpdatableLive);
            }
            AppState::Unknown | AppState::Unavailable => {
                warn!("{app} is installed but its runtime {runtime} cannot be found");
            }
            _ => {}
        }
    }

    /// Repository records are installed when a scope has the remote enabled.
    fn refine_repository(&self, app: &AppHandle) -> Resolution {
        for scope in self.candidate_scopes(app) {
            if let Some(remote) = scope.remote(&app.key().name) {
                app.update(|record| {
                    record.installation = Some(scope.name.clone());
                    record.origin = Some(remote.name.clone());
                });
                let state = if remote.enabled {
                    AppState::Installed
                } else {
                    AppState::Available
                };
                app.set_state(state);
                return Resolution::resolved(state);
            }
        }
        Resolution::unresolved(Diagnostic::NoOrigin(app.key().to_string()))
    }
}

fn copy_installed(app: &AppHandle, scope: &Scope, installed: &InstalledRef) {
    app.update(|record| {
        record.installation = Some(scope.name.clone());
        record.origin = Some(installed.origin.clone());
        record.installed_size = Some(installed.installed_size);
        record.install_date = Some(installed.installed_at_unix);
        record.commit = Some(installed.commit.clone());
    });
}

fn probe_remotes(
    app: &AppHandle,
    scope: &Scope,
    bundle_ref: &BundleRef,
    origin: Option<&str>,
) -> Option<bool> {
    let (remote, entry) = scope
        .remotes_offering(bundle_ref)
        .find(|(remote, _)| origin.map(|name| remote.name == name).unwrap_or(true))?;

    app.update(|record| {
        record.origin = Some(remote.name.clone());
        record.installation = Some(scope.name.clone());
        record.download_size = Some(entry.download_size);
        record.installed_size = Some(entry.installed_size);
        record.update_commit = Some(entry.commit.clone());
        if entry.eol.is_some() {
            record.end_of_life = entry.eol.clone();
            record.end_of_life_rebase = entry.eol_rebase.clone();
        }
    });
    Some(remote.enabled)
}
