use bundlekit_registry::ScopeError;
use bundlekit_resolver::PlanError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("operation skipped: {0}")]
    Skipped(String),
    #[error("{0} is already installed")]
    AlreadyInstalled(String),
    #[error("{0} is not installed")]
    NotInstalled(String),
    #[error("remote '{0}' not found")]
    RemoteNotFound(String),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(
        "not enough free space in scope '{scope}': {required} bytes required, {available} available"
    )]
    NoFreeSpace {
        scope: String,
        required: u64,
        available: u64,
    },
    #[error("transaction cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    pub fn is_already_installed(&self) -> bool {
        matches!(self, Self::AlreadyInstalled(_))
    }

    /// How the engine treats this error; `non_fatal` is the primitive's own
    /// verdict.
    pub fn class(&self, non_fatal: bool) -> ErrorClass {
        match self {
            Self::Skipped(_)
            | Self::AlreadyInstalled(_)
            | Self::Scope(ScopeError::NoCounterpart(_)) => ErrorClass::Skipped,
            _ if non_fatal => ErrorClass::NonFatal,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_remote_not_found(&self) -> bool {
        matches!(
            self,
            Self::RemoteNotFound(_) | Self::Scope(ScopeError::RemoteNotFound { .. })
        )
    }
}

impl From<PlanError> for OperationError {
    fn from(value: PlanError) -> Self {
        match value {
            PlanError::AlreadyInstalled(app) => Self::AlreadyInstalled(app),
            PlanError::NotInstalled(app) => Self::NotInstalled(app),
            other => Self::Failed(other.to_string()),
        }
    }
}

/// How the engine treats an operation-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Skipped,
    /// Keep going, but tell the user.
    NonFatal,
    /// Stop the transaction.
    Fatal,
}
