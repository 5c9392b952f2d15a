mod plan;
mod refine;

pub use plan::{plan_install, plan_update, InstallPlan, PlanError, PlanStep, PlanStepKind};
pub use refine::{Diagnostic, Resolution, StateResolver};
