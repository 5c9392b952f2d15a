use bundlekit_core::{AppHandle, AppKind, AppState, BundleRef};
use tracing::{debug, warn};

use crate::refine::{Diagnostic, StateResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStepKind {
    Install,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub kind: PlanStepKind,
    pub app: AppHandle,
    pub bundle_ref: BundleRef,
    pub remote: String,
}

/// Operations to add to a transaction, dependencies first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub steps: Vec<PlanStep>,
}

impl InstallPlan {
    pub fn download_size(&self) -> u64 {
        self.steps.iter().fold(0_u64, |total, step| {
            total.saturating_add(step.app.read(|record| record.download_size.unwrap_or(0)))
        })
    }

    pub fn apps(&self) -> impl Iterator<Item = &AppHandle> {
        self.steps.iter().map(|step| &step.app)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("{0} is already installed")]
    AlreadyInstalled(String),
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("{0} is already being changed by another transaction")]
    Busy(String),
    #[error("{app} cannot be installed: remote '{origin}' is disabled")]
    Unavailable { app: String, origin: String },
    #[error(transparent)]
    Unresolved(#[from] Diagnostic),
    #[error("{0} has no origin remote")]
    NoOrigin(String),
}

/// Plans installing `app`, putting its runtime first when the runtime is
/// available but not installed.
pub fn plan_install(
    resolver: &StateResolver<'_>,
    app: &AppHandle,
) -> Result<InstallPlan, PlanError> {
    let resolution = resolver.refine(app);
    if let Some(diagnostic) = resolution.diagnostic {
        return Err(PlanError::Unresolved(diagnostic));
    }

    match resolution.state {
        AppState::Available | AppState::AvailableLocal => {}
        state if state.is_installed() => {
            return Err(PlanError::AlreadyInstalled(app.key().to_string()));
        }
        AppState::Installing | AppState::Removing => {
            return Err(PlanError::Busy(app.key().to_string()));
        }
        AppState::Unavailable => {
            return Err(PlanError::Unavailable {
                app: app.key().to_string(),
                origin: app.origin().unwrap_or_default(),
            });
        }
        _ => return Err(PlanError::NoOrigin(app.key().to_string())),
    }

    let mut plan = InstallPlan::default();
    if app.kind() == AppKind::Application {
        push_missing_runtime(resolver, app, &mut plan)?;
    }
    plan.steps.push(step(PlanStepKind::Install, app)?);
    Ok(plan)
}

/// Plans updating an installed `app`. A missing runtime is installed ahead
/// of the update.
pub fn plan_update(
    resolver: &StateResolver<'_>,
    app: &AppHandle,
) -> Result<InstallPlan, PlanError> {
    let resolution = resolver.refine(app);
    if let Some(diagnostic) = resolution.diagnostic {
        return Err(PlanError::Unresolved(diagnostic));
    }
    if resolution.state.is_transient() {
        return Err(PlanError::Busy(app.key().to_string()));
    }
    if !resolution.state.is_installed() {
        return Err(PlanError::NotInstalled(app.key().to_string()));
    }

    let mut plan = InstallPlan::default();
    let (missing_runtime, has_update) = app.read(|record| {
        (
            record.missing_runtime,
            record.update_commit.is_some() && record.update_commit != record.commit,
        )
    });
    if missing_runtime {
        push_missing_runtime(resolver, app, &mut plan)?;
    }
    if has_update {
        plan.steps.push(step(PlanStepKind::Update, app)?);
    }
    if plan.steps.is_empty() {
        debug!("{app} is up to date");
    }
    Ok(plan)
}

fn push_missing_runtime(
    resolver: &StateResolver<'_>,
    app: &AppHandle,
    plan: &mut InstallPlan,
) -> Result<(), PlanError> {
    let Some(runtime) = app.runtime() else {
        return Ok(());
    };

    let resolution = resolver.refine(&runtime);
    match resolution.state {
        AppState::Available => plan.steps.push(step(PlanStepKind::Install, &runtime)?),
        state if state.is_installed() || state.is_transient() => {}
        _ => warn!(
            "runtime {runtime} of {app} could not be resolved; leaving it to the transaction"
        ),
    }
    Ok(())
}

fn step(kind: PlanStepKind, app: &AppHandle) -> Result<PlanStep, PlanError> {
    let (bundle_ref, remote) =
        app.read(|record| (record.bundle_ref.clone(), record.origin.clone()));
    let bundle_ref = bundle_ref.ok_or_else(|| Diagnostic::NoMetadata(app.key().to_string()))?;
    let remote = remote.ok_or_else(|| PlanError::NoOrigin(app.key().to_string()))?;
    Ok(PlanStep {
        kind,
        app: app.clone(),
        bundle_ref,
        remote,
    })
}
