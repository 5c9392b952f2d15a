use std::collections::{BTreeSet, HashMap};
use std::fmt;

use bundlekit_core::{AppHandle, AppState, BundleRef, Progress};
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, OperationError};
use crate::operation::{
    CancelToken, NewRemote, NewRemoteReason, OpId, OpKind, Operation, OperationProgress,
    TransactionEvents, TransactionPrimitive,
};
use crate::progress::{aggregate_progress, ancestors, apply_progress, ESTIMATING_THRESHOLD};
use crate::ref_registry::{RefAppRegistry, RefLookup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOperation {
    pub scope: String,
    pub kind: OpKind,
    pub target: BundleRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionWarning {
    NonFatal {
        target: BundleRef,
        message: String,
    },
    EndOfLife {
        target: BundleRef,
        reason: String,
        rebase: Option<BundleRef>,
    },
    Skipped {
        subject: String,
        reason: String,
    },
}

impl fmt::Display for TransactionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFatal { target, message } => write!(f, "{target}: {message}"),
            Self::EndOfLife {
                target,
                reason,
                rebase: Some(rebase),
            } => write!(f, "{target} is end-of-life ({reason}); replaced by {rebase}"),
            Self::EndOfLife { target, reason, .. } => {
                write!(f, "{target} is end-of-life ({reason})")
            }
            Self::Skipped { subject, reason } => write!(f, "skipped {subject}: {reason}"),
        }
    }
}

/// What a successful transaction (or batch of them) did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionReport {
    pub completed: Vec<CompletedOperation>,
    pub warnings: Vec<TransactionWarning>,
    /// Scopes a background update passed over for lack of space.
    pub skipped_scopes: Vec<String>,
}

impl TransactionReport {
    pub fn merge(&mut self, other: TransactionReport) {
        self.completed.extend(other.completed);
        self.warnings.extend(other.warnings);
        self.skipped_scopes.extend(other.skipped_scopes);
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.warnings.is_empty() && self.skipped_scopes.is_empty()
    }
}

/// Keeps application records in step with a running primitive.
pub struct TransactionEngine<'a> {
    scope: String,
    registry: RefAppRegistry,
    lookup: Option<&'a dyn RefLookup>,
    op_apps: HashMap<OpId, AppHandle>,
    unresolved: BTreeSet<OpId>,
    saved_states: Vec<(AppHandle, AppState)>,
    first_error: Option<OperationError>,
    report: TransactionReport,
}

impl<'a> TransactionEngine<'a> {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            registry: RefAppRegistry::new(),
            lookup: None,
            op_apps: HashMap::new(),
            unresolved: BTreeSet::new(),
            saved_states: Vec::new(),
            first_error: None,
            report: TransactionReport::default(),
        }
    }

    /// Consulted for operation refs nobody registered up front, such as
    /// dependencies the primitive pulled in itself.
    pub fn with_lookup(mut self, lookup: &'a dyn RefLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn registry_mut(&mut self) -> &mut RefAppRegistry {
        &mut self.registry
    }

    pub fn first_error(&self) -> Option<&OperationError> {
        self.first_error.as_ref()
    }

    /// Runs `primitive` to completion. On failure every record the
    /// transaction touched gets its pre-transaction state back, and the
    /// first recorded error wins over whatever the primitive returned.
    pub fn run(
        mut self,
        primitive: &mut dyn TransactionPrimitive,
        cancel: &CancelToken,
    ) -> Result<TransactionReport, OperationError> {
        debug!("running transaction on scope '{}'", self.scope);
        let outcome = primitive.run(&mut self, cancel);
        let error = match (outcome, self.first_error.take()) {
            (Ok(()), None) => return Ok(self.report),
            (_, Some(recorded)) => recorded,
            (Err(err), None) => err,
        };

        warn!("transaction on scope '{}' failed: {error}", self.scope);
        self.rollback();
        Err(error)
    }

    fn rollback(&mut self) {
        for (app, state) in self.saved_states.drain(..) {
            app.restore_state(state);
            app.set_progress(Progress::Unknown);
        }
    }

    fn remember(&mut self, app: &AppHandle) {
        if self.saved_states.iter().any(|(saved, _)| saved == app) {
            return;
        }
        self.saved_states.push((app.clone(), app.state()));
    }

    fn saved_state(&self, app: &AppHandle) -> Option<AppState> {
        self.saved_states
            .iter()
            .find(|(saved, _)| saved == app)
            .map(|(_, state)| *state)
    }

    /// The record operation `id` acts on, associating it on first use.
    fn app_for_op(&mut self, ops: &[Operation], id: OpId) -> Option<AppHandle> {
        if let Some(app) = self.op_apps.get(&id) {
            return Some(app.clone());
        }
        if self.unresolved.contains(&id) {
            return None;
        }

        let op = ops.get(id.0)?;
        match self.registry.resolve_or_ask(&op.target, self.lookup) {
            Some(app) => {
                self.remember(&app);
                app.set_progress(Progress::Unknown);
                self.op_apps.insert(id, app.clone());
                Some(app)
            }
            None => {
                self.unresolved.insert(id);
                None
            }
        }
    }

    /// Apps waiting on `runtime` are no longer missing it.
    fn settle_dependents(&mut self, runtime: &BundleRef) {
        let dependents = self
            .registry
            .apps()
            .filter(|app| {
                app.runtime()
                    .and_then(|dependency| dependency.bundle_ref())
                    .as_ref()
                    == Some(runtime)
            })
            .cloned()
            .collect::<Vec<_>>();

        for app in dependents {
            let was_missing = app.read(|record| record.missing_runtime);
            if !was_missing || !app.state().is_updatable() {
                continue;
            }
            self.remember(&app);
            app.update(|record| record.missing_runtime = false);
            app.set_state(AppState::Installed);
        }
    }
}

impl TransactionEvents for TransactionEngine<'_> {
    fn on_new_operation(&mut self, ops: &[Operation], id: OpId) {
        let Some(op) = ops.get(id.0) else {
            return;
        };
        let Some(app) = self.app_for_op(ops, id) else {
            warn!("operation {id} ({} {}) has no application record", op.kind.as_str(), op.target);
            return;
        };

        let state = app.state();
        let next = match op.kind {
            OpKind::Install => {
                if matches!(state, AppState::Unknown | AppState::Unavailable) {
                    app.set_state(AppState::Available);
                }
                AppState::Installing
            }
            OpKind::InstallBundle => {
                if state == AppState::Unknown {
                    app.set_state(AppState::AvailableLocal);
                }
                AppState::Installing
            }
            OpKind::Update => {
                if !state.is_updatable() {
                    app.set_state(AppState::UpdatableLive);
                }
                AppState::Installing
            }
            OpKind::Uninstall => {
                if !state.is_installed() {
                    app.set_state(AppState::Installed);
                }
                AppState::Removing
            }
        };
        app.set_state(next);
    }

    fn on_progress(&mut self, ops: &[Operation], id: OpId, progress: &OperationProgress) {
        if progress.estimating {
            if progress.percent <= ESTIMATING_THRESHOLD {
                if let Some(app) = self.app_for_op(ops, id) {
                    apply_progress(&app, progress.percent);
                }
            }
            return;
        }

        for root in ancestors(ops, id) {
            if let Some(app) = self.app_for_op(ops, root) {
                let percent = aggregate_progress(ops, root, id, progress.bytes_transferred);
                apply_progress(&app, percent);
            }
        }
    }

    fn on_done(&mut self, ops: &[Operation], id: OpId) {
        let Some(op) = ops.get(id.0) else {
            return;
        };
        self.report.completed.push(CompletedOperation {
            scope: self.scope.clone(),
            kind: op.kind,
            target: op.target.clone(),
        });

        let Some(app) = self.app_for_op(ops, id) else {
            return;
        };
        match op.kind {
            OpKind::Install | OpKind::InstallBundle | OpKind::Update => {
                let scope = self.scope.clone();
                app.update(|record| {
                    if op.commit.is_some() {
                        record.commit = op.commit.clone();
                    }
                    record.update_commit = None;
                    record.missing_runtime = false;
                    record.installation = Some(scope);
                    record.origin = Some(op.remote.clone());
                    record.installed_size = Some(op.installed_size);
                });
                app.set_state(AppState::Installed);
                if op.kind != OpKind::Update && op.target.is_runtime_class() {
                    self.settle_dependents(&op.target);
                }
            }
            OpKind::Uninstall => {
                app.update(|record| {
                    record.commit = None;
                    record.update_commit = None;
                    record.installation = None;
                    record.install_date = None;
                });
                app.set_state(AppState::Unknown);
            }
        }
        app.set_progress(Progress::Percent(100));
    }

    fn on_error(
        &mut self,
        ops: &[Operation],
        id: OpId,
        error: &OperationError,
        non_fatal: bool,
    ) -> bool {
        let target = ops.get(id.0).map(|op| op.target.clone());
        let class = error.class(non_fatal);
        if class == ErrorClass::Fatal {
            warn!("operation {id} failed: {error}");
            if self.first_error.is_none() {
                self.first_error = Some(error.clone());
            }
            return false;
        }

        // The operation will not finish; its record must not stay transient.
        if let Some(app) = self.op_apps.get(&id).cloned() {
            if let Some(state) = self.saved_state(&app) {
                app.restore_state(state);
            }
        }

        match (class, target) {
            (ErrorClass::NonFatal, Some(target)) => {
                warn!("operation {id} on {target} failed, continuing: {error}");
                self.report.warnings.push(TransactionWarning::NonFatal {
                    target,
                    message: error.to_string(),
                });
            }
            _ => debug!("operation {id} skipped: {error}"),
        }
        true
    }

    fn on_choose_remote(&mut self, bundle_ref: &BundleRef, remotes: &[String]) -> Option<usize> {
        let first = remotes.first()?;
        debug!("pulling {bundle_ref} from '{first}'");
        Some(0)
    }

    fn on_new_remote(&mut self, remote: &NewRemote) -> bool {
        match &remote.reason {
            NewRemoteReason::GenericRepo | NewRemoteReason::RuntimeDeps => {
                info!(
                    "adding remote '{}' ({}) needed by {}",
                    remote.suggested_name, remote.url, remote.from_id
                );
                true
            }
            NewRemoteReason::Other(reason) => {
                info!(
                    "declining remote '{}' proposed by {}: {reason}",
                    remote.suggested_name, remote.from_id
                );
                false
            }
        }
    }

    fn on_end_of_life(&mut self, bundle_ref: &BundleRef, reason: &str, rebase: Option<&BundleRef>) {
        info!("{bundle_ref} is end-of-life: {reason}");
        if let Some(app) = self.registry.lookup(bundle_ref) {
            app.update(|record| {
                record.end_of_life = Some(reason.to_string());
                record.end_of_life_rebase = rebase.cloned();
            });
        }
        self.report.warnings.push(TransactionWarning::EndOfLife {
            target: bundle_ref.clone(),
            reason: reason.to_string(),
            rebase: rebase.cloned(),
        });
    }
}
