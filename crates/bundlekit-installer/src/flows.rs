use anyhow::Result;
use bundlekit_core::{AppHandle, Catalog, PendingAction};
use bundlekit_registry::{
    check_free_space, RemoteRef, Scope, ScopeError, ScopeResolver, ScopeSet, SpaceCheck,
    StorageProbe, DEFAULT_MIN_FREE_HEADROOM_BYTES,
};
use bundlekit_resolver::{
    plan_install, plan_update, InstallPlan, PlanError, PlanStep, PlanStepKind, StateResolver,
};
use tracing::{debug, info, warn};

use crate::collaborators::{DownloadPermit, DownloadScheduler, PrivilegedHelper};
use crate::engine::{TransactionEngine, TransactionReport, TransactionWarning};
use crate::error::OperationError;
use crate::operation::{CancelToken, TransactionPrimitive};
use crate::ref_registry::RefLookup;

/// Source of transaction primitives, one per scope and run.
pub trait TransactionBackend {
    fn begin(&self, scope: &Scope) -> Box<dyn TransactionPrimitive>;

    /// Scope state as it stands after a transaction.
    fn reload_scope(&self, scope: &Scope) -> Result<Scope>;

    /// Refreshes remote metadata in-process. Only called for user scopes.
    fn refresh_metadata(&self, scope: &Scope, remote: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    /// The user asked for this and sees the outcome.
    Interactive,
    /// Unattended; work that cannot proceed is passed over quietly.
    Background,
}

/// Install, update and remove flows over a set of scopes.
pub struct Installer<'a> {
    scopes: ScopeSet,
    backend: &'a dyn TransactionBackend,
    storage: &'a dyn StorageProbe,
    min_free_headroom: u64,
    catalog: Option<&'a dyn Catalog>,
    lookup: Option<&'a dyn RefLookup>,
    scheduler: Option<&'a dyn DownloadScheduler>,
    helper: Option<&'a dyn PrivilegedHelper>,
    cancel: CancelToken,
}

impl<'a> Installer<'a> {
    pub fn new(
        scopes: ScopeSet,
        backend: &'a dyn TransactionBackend,
        storage: &'a dyn StorageProbe,
    ) -> Self {
        Self {
            scopes,
            backend,
            storage,
            min_free_headroom: DEFAULT_MIN_FREE_HEADROOM_BYTES,
            catalog: None,
            lookup: None,
            scheduler: None,
            helper: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_min_free_headroom(mut self, bytes: u64) -> Self {
        self.min_free_headroom = bytes;
        self
    }

    pub fn with_catalog(mut self, catalog: &'a dyn Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_lookup(mut self, lookup: &'a dyn RefLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_scheduler(mut self, scheduler: &'a dyn DownloadScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_helper(mut self, helper: &'a dyn PrivilegedHelper) -> Self {
        self.helper = Some(helper);
        self
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    /// Cancelling the token stops the running transaction before its next
    /// operation or chunk. A cancellation is consumed by the run it stops;
    /// later runs get a fresh token, so fetch it again before each flow.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn resolver(&self) -> StateResolver<'_> {
        let resolver = StateResolver::new(&self.scopes);
        match self.catalog {
            Some(catalog) => resolver.with_catalog(catalog),
            None => resolver,
        }
    }

    /// Installs `app`, its runtime first when that is missing. An app that
    /// is already installed is a success with an empty report.
    pub fn install(
        &mut self,
        app: &AppHandle,
        interaction: Interaction,
    ) -> Result<TransactionReport, OperationError> {
        with_pending(std::slice::from_ref(app), PendingAction::Install, || {
            self.install_app(app, interaction)
        })
    }

    /// Installs `app` from a local bundle described by `bundle`.
    pub fn install_bundle(
        &mut self,
        app: &AppHandle,
        origin: &str,
        bundle: &RemoteRef,
        interaction: Interaction,
    ) -> Result<TransactionReport, OperationError> {
        with_pending(std::slice::from_ref(app), PendingAction::Install, || {
            self.install_local(app, origin, bundle, interaction)
        })
    }

    /// Updates `apps`, one transaction per scope in declaration order. Apps
    /// that cannot be updated are reported as warnings rather than failing
    /// the batch. A fatal error in one scope aborts the batch: scopes that
    /// already finished keep their changes, later scopes are not run, and
    /// only the error is returned.
    pub fn update(
        &mut self,
        apps: &[AppHandle],
        interaction: Interaction,
    ) -> Result<TransactionReport, OperationError> {
        with_pending(apps, PendingAction::Update, || {
            self.update_apps(apps, interaction)
        })
    }

    pub fn remove(&mut self, app: &AppHandle) -> Result<TransactionReport, OperationError> {
        with_pending(std::slice::from_ref(app), PendingAction::Remove, || {
            self.remove_app(app)
        })
    }

    /// System scopes go through the privileged helper; user scopes are
    /// refreshed in-process.
    pub fn refresh_metadata(&self, scope_name: &str, remote: &str) -> Result<(), OperationError> {
        let scope = self
            .scopes
            .get(scope_name)
            .ok_or_else(|| ScopeError::UnknownScope(scope_name.to_string()))?;
        if scope.remote(remote).is_none() {
            return Err(ScopeError::RemoteNotFound {
                scope: scope.name.clone(),
                remote: remote.to_string(),
            }
            .into());
        }

        if scope.is_user {
            return self
                .backend
                .refresh_metadata(scope, remote)
                .map_err(|err| OperationError::Failed(format!("{err:#}")));
        }

        let helper = self.helper.ok_or_else(|| {
            OperationError::Failed(format!(
                "refreshing scope '{}' needs a privileged helper",
                scope.name
            ))
        })?;
        helper
            .refresh_metadata(&scope.name, remote)
            .map_err(|err| OperationError::Failed(format!("{err:#}")))
    }

    fn install_app(
        &mut self,
        app: &AppHandle,
        interaction: Interaction,
    ) -> Result<TransactionReport, OperationError> {
        let plan = match plan_install(&self.resolver(), app) {
            Ok(plan) => plan,
            Err(PlanError::AlreadyInstalled(name)) => {
                debug!("{name} is already installed");
                return Ok(TransactionReport::default());
            }
            Err(err) => return Err(err.into()),
        };
        let scope = ScopeResolver::new(&self.scopes).scope_for(app)?.clone();
        if !self.admit(&scope, plan.download_size(), interaction)? {
            return Ok(skipped_scope_report(&scope));
        }

        let mut transaction = self.backend.begin(&scope);
        let mut engine = self.engine(&scope);
        for step in &plan.steps {
            engine.registry_mut().add(step.bundle_ref.clone(), &step.app);
            tolerate_already_installed(add_step(transaction.as_mut(), step), step)?;
        }
        self.execute(&scope, transaction, engine)
    }

    fn install_local(
        &mut self,
        app: &AppHandle,
        origin: &str,
        bundle: &RemoteRef,
        interaction: Interaction,
    ) -> Result<TransactionReport, OperationError> {
        let scope = ScopeResolver::new(&self.scopes).scope_for(app)?.clone();
        if scope.is_installed(&bundle.bundle_ref) {
            debug!("{} is already installed", bundle.bundle_ref);
            return Ok(TransactionReport::default());
        }
        if !self.admit(&scope, bundle.installed_size, interaction)? {
            return Ok(skipped_scope_report(&scope));
        }

        app.update(|record| {
            if record.bundle_ref.is_none() {
                record.bundle_ref = Some(bundle.bundle_ref.clone());
            }
        });
        let mut transaction = self.backend.begin(&scope);
        let mut engine = self.engine(&scope);
        engine.registry_mut().add(bundle.bundle_ref.clone(), app);
        match transaction.add_install_bundle(origin, bundle) {
            Err(err) if err.is_already_installed() => {
                return Ok(TransactionReport::default());
            }
            added => added?,
        }
        self.execute(&scope, transaction, engine)
    }

    fn update_apps(
        &mut self,
        apps: &[AppHandle],
        interaction: Interaction,
    ) -> Result<TransactionReport, OperationError> {
        let mut report = TransactionReport::default();
        let mut batches: Vec<(String, Vec<AppHandle>, Vec<PlanStep>)> = Vec::new();
        {
            let resolver = self.resolver();
            let scopes = ScopeResolver::new(&self.scopes);
            for app in apps {
                let plan = match plan_update(&resolver, app) {
                    Ok(plan) => plan,
                    Err(
                        err @ (PlanError::NotInstalled(_)
                        | PlanError::Busy(_)
                        | PlanError::Unresolved(_)),
                    ) => {
                        warn!("not updating {app}: {err}");
                        report.warnings.push(TransactionWarning::Skipped {
                            subject: app.to_string(),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                if plan.steps.is_empty() {
                    debug!("{app} is up to date");
                    continue;
                }

                let scope = match scopes.scope_for(app) {
                    Ok(scope) => scope,
                    Err(err) => {
                        warn!("not updating {app}: {err}");
                        report.warnings.push(TransactionWarning::Skipped {
                            subject: app.to_string(),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                };
                match batches.iter_mut().find(|(name, _, _)| *name == scope.name) {
                    Some((_, batch_apps, steps)) => {
                        batch_apps.push(app.clone());
                        steps.extend(plan.steps);
                    }
                    None => batches.push((scope.name.clone(), vec![app.clone()], plan.steps)),
                }
            }
        }
        batches.sort_by_key(|(name, _, _)| {
            self.scopes
                .scopes()
                .iter()
                .position(|scope| scope.name == *name)
        });

        for (scope_name, batch_apps, steps) in batches {
            let Some(scope) = self.scopes.get(&scope_name).cloned() else {
                continue;
            };
            let steps = InstallPlan { steps };
            if !self.admit(&scope, steps.download_size(), interaction)? {
                report.skipped_scopes.push(scope.name.clone());
                continue;
            }

            let mut transaction = self.backend.begin(&scope);
            let mut engine = self.engine(&scope);
            for app in &batch_apps {
                engine.registry_mut().add_app(app);
            }
            for step in &steps.steps {
                engine.registry_mut().add(step.bundle_ref.clone(), &step.app);
                match add_step(transaction.as_mut(), step) {
                    Ok(()) => {}
                    Err(err) if err.is_already_installed() => {
                        debug!("{} is already installed", step.bundle_ref);
                    }
                    Err(err) if err.is_remote_not_found() => {
                        warn!("not updating {}: {err}", step.bundle_ref);
                        report.warnings.push(TransactionWarning::Skipped {
                            subject: step.bundle_ref.to_string(),
                            reason: err.to_string(),
                        });
                    }
                    Err(err) => return Err(err),
                }
            }
            report.merge(self.execute(&scope, transaction, engine)?);
        }
        Ok(report)
    }

    fn remove_app(&mut self, app: &AppHandle) -> Result<TransactionReport, OperationError> {
        let resolution = self.resolver().refine(app);
        if let Some(diagnostic) = resolution.diagnostic {
            return Err(PlanError::from(diagnostic).into());
        }
        let state = app.state();
        if state.is_transient() {
            return Err(PlanError::Busy(app.to_string()).into());
        }
        if !state.is_installed() {
            return Err(OperationError::NotInstalled(app.to_string()));
        }
        let bundle_ref = app
            .bundle_ref()
            .ok_or_else(|| OperationError::Failed(format!("{app} has no ref")))?;

        let scope = ScopeResolver::new(&self.scopes).scope_for(app)?.clone();
        let mut transaction = self.backend.begin(&scope);
        let mut engine = self.engine(&scope);
        engine.registry_mut().add(bundle_ref.clone(), app);
        transaction.add_uninstall(&bundle_ref)?;
        self.execute(&scope, transaction, engine)
    }

    fn engine(&self, scope: &Scope) -> TransactionEngine<'a> {
        let engine = TransactionEngine::new(scope.name.clone());
        match self.lookup {
            Some(lookup) => engine.with_lookup(lookup),
            None => engine,
        }
    }

    fn execute(
        &mut self,
        scope: &Scope,
        mut transaction: Box<dyn TransactionPrimitive>,
        engine: TransactionEngine<'a>,
    ) -> Result<TransactionReport, OperationError> {
        if transaction.is_empty() {
            debug!("nothing to do in scope '{}'", scope.name);
            return Ok(TransactionReport::default());
        }

        let _permit = self.request_permit(&scope.name);
        let result = engine.run(transaction.as_mut(), &self.cancel);
        if self.cancel.is_cancelled() {
            debug!("cancellation consumed by transaction on scope '{}'", scope.name);
            self.cancel = CancelToken::new();
        }
        match self.backend.reload_scope(scope) {
            Ok(reloaded) => self.scopes.replace(reloaded),
            Err(err) => warn!("failed to reload scope '{}': {err:#}", scope.name),
        }
        result
    }

    /// Whether a transaction pulling `download_size` bytes may start.
    fn admit(
        &self,
        scope: &Scope,
        download_size: u64,
        interaction: Interaction,
    ) -> Result<bool, OperationError> {
        if download_size == 0 {
            return Ok(true);
        }
        match check_free_space(self.storage, scope, download_size, self.min_free_headroom) {
            SpaceCheck::Sufficient | SpaceCheck::Unknown => Ok(true),
            SpaceCheck::Insufficient {
                required,
                available,
            } => match interaction {
                Interaction::Interactive => Err(OperationError::NoFreeSpace {
                    scope: scope.name.clone(),
                    required,
                    available,
                }),
                Interaction::Background => {
                    info!(
                        "skipping scope '{}': {required} bytes required, {available} available",
                        scope.name
                    );
                    Ok(false)
                }
            },
        }
    }

    fn request_permit(&self, scope: &str) -> Option<DownloadPermit> {
        let scheduler = self.scheduler?;
        let permit = scheduler.request_permit(scope);
        if permit.is_none() {
            debug!("no download permit for scope '{scope}', proceeding");
        }
        permit
    }
}

fn with_pending<R>(apps: &[AppHandle], action: PendingAction, run: impl FnOnce() -> R) -> R {
    for app in apps {
        app.set_pending_action(Some(action));
    }
    let result = run();
    for app in apps {
        app.set_pending_action(None);
    }
    result
}

fn add_step(
    transaction: &mut dyn TransactionPrimitive,
    step: &PlanStep,
) -> Result<(), OperationError> {
    match step.kind {
        PlanStepKind::Install => transaction.add_install(&step.remote, &step.bundle_ref),
        PlanStepKind::Update => transaction.add_update(&step.bundle_ref),
    }
}

fn tolerate_already_installed(
    added: Result<(), OperationError>,
    step: &PlanStep,
) -> Result<(), OperationError> {
    match added {
        Err(err) if err.is_already_installed() => {
            debug!("{} is already installed", step.bundle_ref);
            Ok(())
        }
        other => other,
    }
}

fn skipped_scope_report(scope: &Scope) -> TransactionReport {
    TransactionReport {
        skipped_scopes: vec![scope.name.clone()],
        ..TransactionReport::default()
    }
}
