mod collaborators;
mod engine;
mod error;
mod flows;
mod operation;
mod progress;
mod ref_registry;
mod simulated;

pub use collaborators::{CommandHelper, DownloadPermit, DownloadScheduler, PrivilegedHelper};
pub use engine::{CompletedOperation, TransactionEngine, TransactionReport, TransactionWarning};
pub use error::{ErrorClass, OperationError};
pub use flows::{Installer, Interaction, TransactionBackend};
pub use operation::{
    CancelToken, NewRemote, NewRemoteReason, OpId, OpKind, Operation, OperationProgress,
    TransactionEvents, TransactionPrimitive,
};
pub use progress::{aggregate_progress, apply_progress, related_set, ESTIMATING_THRESHOLD};
pub use ref_registry::{RefAppRegistry, RefLookup};
pub use simulated::{SimulatedBackend, SimulatedTransaction};
