use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bundlekit_core::BundleRef;
use bundlekit_registry::RemoteRef;

use crate::error::OperationError;

/// Position of an operation in its transaction's execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub usize);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Install,
    Update,
    /// Install from a local bundle file rather than a remote.
    InstallBundle,
    Uninstall,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::InstallBundle => "install-bundle",
            Self::Uninstall => "uninstall",
        }
    }
}

/// One unit of work inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
    pub target: BundleRef,
    pub remote: String,
    pub commit: Option<String>,
    pub download_size: u64,
    pub installed_size: u64,
    /// Operations this one was pulled in for.
    pub related_to: Vec<OpId>,
    /// Nothing to do, e.g. an update whose commit is already deployed.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationProgress {
    pub bytes_transferred: u64,
    /// The primitive does not yet know how much it will transfer.
    pub estimating: bool,
    pub percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewRemoteReason {
    GenericRepo,
    RuntimeDeps,
    Other(String),
}

/// A remote the primitive wants to add on the user's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRemote {
    pub reason: NewRemoteReason,
    pub from_id: String,
    pub suggested_name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle callbacks a primitive raises while it runs.
///
/// All callbacks for one transaction arrive on the thread that called
/// [`TransactionPrimitive::run`].
pub trait TransactionEvents {
    fn on_new_operation(&mut self, ops: &[Operation], op: OpId);

    fn on_progress(&mut self, ops: &[Operation], op: OpId, progress: &OperationProgress);

    fn on_done(&mut self, ops: &[Operation], op: OpId);

    /// Returns whether the primitive should carry on with the next operation.
    fn on_error(
        &mut self,
        ops: &[Operation],
        op: OpId,
        error: &OperationError,
        non_fatal: bool,
    ) -> bool;

    /// Picks one of `remotes` to pull `bundle_ref` from, or `None` to abort.
    fn on_choose_remote(&mut self, bundle_ref: &BundleRef, remotes: &[String]) -> Option<usize>;

    fn on_new_remote(&mut self, remote: &NewRemote) -> bool;

    fn on_end_of_life(&mut self, bundle_ref: &BundleRef, reason: &str, rebase: Option<&BundleRef>);
}

/// The low-level transaction mechanism. One primitive acts on one scope.
pub trait TransactionPrimitive {
    fn scope_name(&self) -> &str;

    fn add_install(&mut self, remote: &str, bundle_ref: &BundleRef) -> Result<(), OperationError>;

    /// `bundle` describes the contents of a local bundle file; `origin`
    /// names the remote recorded for it once installed.
    fn add_install_bundle(
        &mut self,
        origin: &str,
        bundle: &RemoteRef,
    ) -> Result<(), OperationError>;

    fn add_update(&mut self, bundle_ref: &BundleRef) -> Result<(), OperationError>;

    fn add_uninstall(&mut self, bundle_ref: &BundleRef) -> Result<(), OperationError>;

    /// True when nothing has been requested.
    fn is_empty(&self) -> bool;

    /// Operations in execution order. Only complete once `run` has resolved
    /// dependencies.
    fn operations(&self) -> &[Operation];

    fn run(
        &mut self,
        events: &mut dyn TransactionEvents,
        cancel: &CancelToken,
    ) -> Result<(), OperationError>;
}
