use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, warn};

use crate::bundle_ref::BundleRef;
use crate::kind::AppKind;
use crate::metadata::AppMetadata;
use crate::state::{AppState, PendingAction, Progress};

/// Installation scope an application record declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleScope {
    #[default]
    Unknown,
    System,
    User,
}

impl BundleScope {
    pub fn from_is_user(is_user: bool) -> Self {
        if is_user {
            Self::User
        } else {
            Self::System
        }
    }

    /// An unknown scope is compatible with everything.
    pub fn is_compatible(self, other: BundleScope) -> bool {
        self == Self::Unknown || other == Self::Unknown || self == other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::System => "system",
            Self::User => "user",
        }
    }
}

/// Identity tuple of an application record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AppKey {
    pub scope: BundleScope,
    pub kind: AppKind,
    pub name: String,
    pub arch: String,
    pub branch: String,
}

impl AppKey {
    pub fn new(scope: BundleScope, kind: AppKind, name: &str, arch: &str, branch: &str) -> Self {
        Self {
            scope,
            kind,
            name: name.to_string(),
            arch: arch.to_string(),
            branch: branch.to_string(),
        }
    }

    pub fn for_ref(scope: BundleScope, bundle_ref: &BundleRef) -> Self {
        let kind = match bundle_ref.kind {
            crate::RefKind::App => AppKind::Application,
            crate::RefKind::Runtime => AppKind::Runtime,
        };
        Self::new(
            scope,
            kind,
            &bundle_ref.name,
            &bundle_ref.arch,
            &bundle_ref.branch,
        )
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.scope.as_str(),
            self.kind,
            self.name,
            self.arch,
            self.branch
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppRecord {
    pub key: AppKey,
    pub summary: Option<String>,
    /// Name of the scope (installation) that owns the record once resolved.
    pub installation: Option<String>,
    pub origin: Option<String>,
    pub bundle_ref: Option<BundleRef>,
    #[serde(skip)]
    pub runtime: Option<AppHandle>,
    pub state: AppState,
    pub progress: Progress,
    pub pending_action: Option<PendingAction>,
    pub download_size: Option<u64>,
    pub installed_size: Option<u64>,
    pub install_date: Option<u64>,
    pub commit: Option<String>,
    pub update_commit: Option<String>,
    pub missing_runtime: bool,
    pub end_of_life: Option<String>,
    pub end_of_life_rebase: Option<BundleRef>,
}

impl AppRecord {
    pub fn new(key: AppKey) -> Self {
        Self {
            key,
            summary: None,
            installation: None,
            origin: None,
            bundle_ref: None,
            runtime: None,
            state: AppState::Unknown,
            progress: Progress::Unknown,
            pending_action: None,
            download_size: None,
            installed_size: None,
            install_date: None,
            commit: None,
            update_commit: None,
            missing_runtime: false,
            end_of_life: None,
            end_of_life_rebase: None,
        }
    }

    /// Copies catalog metadata onto the record. The runtime declaration is
    /// not resolved here; that needs the record cache.
    pub fn apply_metadata(&mut self, metadata: &AppMetadata) {
        if self.summary.is_none() {
            self.summary = metadata.summary.clone();
        }
        match metadata.bundle_ref() {
            Ok(bundle_ref) => self.bundle_ref = bundle_ref,
            Err(err) => debug!("no ref for {}: {err:#}", self.key),
        }
    }
}

/// Shared, in-place mutable application record.
///
/// Equality and hashing only look at the identity tuple, never at the
/// allocation.
#[derive(Clone)]
pub struct AppHandle {
    key: AppKey,
    inner: Arc<Mutex<AppRecord>>,
}

impl AppHandle {
    pub fn new(record: AppRecord) -> Self {
        Self {
            key: record.key.clone(),
            inner: Arc::new(Mutex::new(record)),
        }
    }

    pub fn key(&self) -> &AppKey {
        &self.key
    }

    pub fn kind(&self) -> AppKind {
        self.key.kind
    }

    pub fn read<R>(&self, f: impl FnOnce(&AppRecord) -> R) -> R {
        f(&self.lock())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut AppRecord) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> AppRecord {
        self.lock().clone()
    }

    pub fn state(&self) -> AppState {
        self.lock().state
    }

    /// Moves to `next` if the transition table allows it.
    pub fn set_state(&self, next: AppState) -> bool {
        let mut record = self.lock();
        if !record.state.allows_transition(next) {
            warn!(
                "refusing state change {} -> {} on {}",
                record.state, next, self.key
            );
            return false;
        }
        if record.state != next {
            debug!("{}: {} -> {}", self.key, record.state, next);
        }
        record.state = next;
        true
    }

    /// Puts back a previously observed state without consulting the
    /// transition table.
    pub fn restore_state(&self, state: AppState) {
        let mut record = self.lock();
        if record.state != state {
            debug!("{}: restoring {} -> {}", self.key, record.state, state);
        }
        record.state = state;
    }

    pub fn progress(&self) -> Progress {
        self.lock().progress
    }

    pub fn set_progress(&self, progress: Progress) {
        self.lock().progress = progress;
    }

    pub fn bundle_ref(&self) -> Option<BundleRef> {
        self.lock().bundle_ref.clone()
    }

    pub fn runtime(&self) -> Option<AppHandle> {
        self.lock().runtime.clone()
    }

    pub fn set_runtime(&self, runtime: Option<AppHandle>) {
        self.lock().runtime = runtime;
    }

    pub fn origin(&self) -> Option<String> {
        self.lock().origin.clone()
    }

    pub fn installation(&self) -> Option<String> {
        self.lock().installation.clone()
    }

    pub fn set_pending_action(&self, action: Option<PendingAction>) {
        self.lock().pending_action = action;
    }

    fn lock(&self) -> MutexGuard<'_, AppRecord> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("record lock for {} poisoned, recovering", self.key);
            poisoned.into_inner()
        })
    }
}

impl PartialEq for AppHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for AppHandle {}

impl Hash for AppHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for AppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AppHandle").field(&self.key).finish()
    }
}

impl fmt::Display for AppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}
