use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bundlekit_core::BundleRef;
use bundlekit_registry::{InstalledRef, RemoteRef, Scope, ScopeStore};
use tracing::{debug, warn};

use crate::error::OperationError;
use crate::flows::TransactionBackend;
use crate::operation::{
    CancelToken, NewRemote, NewRemoteReason, OpId, OpKind, Operation, OperationProgress,
    TransactionEvents, TransactionPrimitive,
};

const DEFAULT_CHUNKS: u64 = 4;
const ESTIMATING_PERCENT: u32 = 5;

type SharedScopes = Arc<Mutex<BTreeMap<String, Scope>>>;
type Failures = BTreeMap<BundleRef, (OperationError, bool)>;

#[derive(Debug, Clone)]
struct Request {
    kind: OpKind,
    target: BundleRef,
    remote: Option<String>,
    bundle: Option<RemoteRef>,
}

#[derive(Debug, Clone)]
struct Planned {
    kind: OpKind,
    target: BundleRef,
    remote: String,
    commit: Option<String>,
    download_size: u64,
    installed_size: u64,
    related_to: Vec<BundleRef>,
    skipped: bool,
}

/// Primitive that moves refs between a scope's remotes and its installed
/// set without touching any payload. Transfers are reported in a fixed
/// number of equal chunks.
#[derive(Debug)]
pub struct SimulatedTransaction {
    scope: Scope,
    requests: Vec<Request>,
    ops: Vec<Operation>,
    chunks: u64,
    failures: Failures,
    shared: Option<SharedScopes>,
    store: Option<ScopeStore>,
}

impl SimulatedTransaction {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            requests: Vec::new(),
            ops: Vec::new(),
            chunks: DEFAULT_CHUNKS,
            failures: BTreeMap::new(),
            shared: None,
            store: None,
        }
    }

    /// Makes the operation on `bundle_ref` report `error` instead of running.
    pub fn fail_operation(
        mut self,
        bundle_ref: BundleRef,
        error: OperationError,
        non_fatal: bool,
    ) -> Self {
        self.failures.insert(bundle_ref, (error, non_fatal));
        self
    }

    pub fn with_chunks(mut self, chunks: u64) -> Self {
        self.chunks = chunks.max(1);
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn into_scope(self) -> Scope {
        self.scope
    }

    fn queued(&self, bundle_ref: &BundleRef) -> bool {
        self.requests.iter().any(|request| &request.target == bundle_ref)
    }

    fn resolve(&mut self, events: &mut dyn TransactionEvents) -> Result<(), OperationError> {
        let requests = std::mem::take(&mut self.requests);
        let mut planned: Vec<Planned> = Vec::new();

        for request in requests {
            if planned.iter().any(|entry| entry.target == request.target) {
                debug!("{} already pulled in as a dependency", request.target);
                continue;
            }

            if request.kind == OpKind::Uninstall {
                let installed_size = self
                    .scope
                    .installed_ref(&request.target)
                    .map(|installed| installed.installed_size)
                    .unwrap_or(0);
                planned.push(Planned {
                    kind: OpKind::Uninstall,
                    target: request.target.clone(),
                    remote: String::new(),
                    commit: None,
                    download_size: 0,
                    installed_size,
                    related_to: Vec::new(),
                    skipped: false,
                });
                continue;
            }

            let (remote, entry) = self.entry_for(&request)?;
            self.plan_runtime(&entry, &request.target, &mut planned, events)?;

            let skipped = request.kind == OpKind::Update
                && self
                    .scope
                    .installed_ref(&request.target)
                    .is_some_and(|installed| installed.commit == entry.commit);
            planned.push(Planned {
                kind: request.kind,
                target: request.target.clone(),
                remote: remote.clone(),
                commit: Some(entry.commit.clone()),
                download_size: if skipped { 0 } else { entry.download_size },
                installed_size: entry.installed_size,
                related_to: Vec::new(),
                skipped,
            });
            self.plan_related(&remote, &entry, &request.target, &mut planned);

            if let Some(reason) = &entry.eol {
                events.on_end_of_life(&entry.bundle_ref, reason, entry.eol_rebase.as_ref());
            }
        }

        let positions = planned
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.target.clone(), index))
            .collect::<HashMap<_, _>>();
        self.ops = planned
            .into_iter()
            .enumerate()
            .map(|(index, entry)| Operation {
                id: OpId(index),
                kind: entry.kind,
                related_to: entry
                    .related_to
                    .iter()
                    .filter_map(|target| positions.get(target).map(|position| OpId(*position)))
                    .collect(),
                target: entry.target,
                remote: entry.remote,
                commit: entry.commit,
                download_size: entry.download_size,
                installed_size: entry.installed_size,
                skipped: entry.skipped,
            })
            .collect();
        Ok(())
    }

    fn entry_for(&self, request: &Request) -> Result<(String, RemoteRef), OperationError> {
        let remote = match (request.kind, &request.remote) {
            (OpKind::InstallBundle, Some(origin)) => {
                return request
                    .bundle
                    .clone()
                    .map(|bundle| (origin.clone(), bundle))
                    .ok_or_else(|| {
                        OperationError::Failed(format!("no bundle for {}", request.target))
                    });
            }
            (OpKind::Update, _) => self
                .scope
                .installed_ref(&request.target)
                .map(|installed| installed.origin.clone())
                .ok_or_else(|| OperationError::NotInstalled(request.target.to_string()))?,
            (_, Some(remote)) => remote.clone(),
            (_, None) => {
                return Err(OperationError::Failed(format!(
                    "no remote for {}",
                    request.target
                )))
            }
        };

        let entry = self
            .scope
            .remote(&remote)
            .ok_or_else(|| OperationError::RemoteNotFound(remote.clone()))?
            .find(&request.target)
            .cloned()
            .ok_or_else(|| {
                OperationError::Failed(format!(
                    "{} is not offered by remote '{remote}'",
                    request.target
                ))
            })?;
        Ok((remote, entry))
    }

    /// Queues the runtime `entry` needs ahead of it, unless it is already
    /// installed or queued.
    fn plan_runtime(
        &mut self,
        entry: &RemoteRef,
        dependent: &BundleRef,
        planned: &mut Vec<Planned>,
        events: &mut dyn TransactionEvents,
    ) -> Result<(), OperationError> {
        let Some(decl) = &entry.runtime else {
            return Ok(());
        };
        let runtime = BundleRef::parse_runtime_decl(decl)
            .map_err(|err| OperationError::Failed(format!("{dependent}: {err:#}")))?;
        if self.scope.is_installed(&runtime) {
            return Ok(());
        }
        if let Some(existing) = planned.iter_mut().find(|queued| queued.target == runtime) {
            existing.related_to.push(dependent.clone());
            return Ok(());
        }

        let mut candidates = self.enabled_candidates(&runtime);
        if candidates.is_empty() {
            if let Some(url) = &entry.runtime_repo {
                self.offer_runtime_remote(url, &runtime, dependent, events)?;
                candidates = self.enabled_candidates(&runtime);
            }
        }
        if candidates.is_empty() {
            return Err(OperationError::Failed(format!(
                "runtime {runtime} needed by {dependent} is not offered by any enabled remote"
            )));
        }

        let chosen = if candidates.len() == 1 {
            0
        } else {
            let names = candidates
                .iter()
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>();
            events
                .on_choose_remote(&runtime, &names)
                .filter(|index| *index < candidates.len())
                .ok_or_else(|| OperationError::Failed(format!("no remote chosen for {runtime}")))?
        };
        let (remote, runtime_entry) = candidates.swap_remove(chosen);

        planned.push(Planned {
            kind: OpKind::Install,
            target: runtime,
            remote,
            commit: Some(runtime_entry.commit),
            download_size: runtime_entry.download_size,
            installed_size: runtime_entry.installed_size,
            related_to: vec![dependent.clone()],
            skipped: false,
        });
        Ok(())
    }

    /// A disabled remote with the runtime repo's URL is proposed for
    /// enabling.
    fn offer_runtime_remote(
        &mut self,
        url: &str,
        runtime: &BundleRef,
        dependent: &BundleRef,
        events: &mut dyn TransactionEvents,
    ) -> Result<(), OperationError> {
        let Some(name) = self
            .scope
            .remotes
            .iter()
            .find(|remote| remote.url == url && !remote.enabled)
            .map(|remote| remote.name.clone())
        else {
            debug!("no configured remote at {url} for {runtime}");
            return Ok(());
        };

        let proposal = NewRemote {
            reason: NewRemoteReason::RuntimeDeps,
            from_id: dependent.to_string(),
            suggested_name: name.clone(),
            url: url.to_string(),
        };
        if !events.on_new_remote(&proposal) {
            return Ok(());
        }

        if let Some(remote) = self.scope.remote_mut(&name) {
            remote.enabled = true;
        }
        if let Some(store) = &self.store {
            store
                .save_remotes(&self.scope)
                .map_err(|err| OperationError::Failed(format!("{err:#}")))?;
        }
        self.publish();
        Ok(())
    }

    fn enabled_candidates(&self, bundle_ref: &BundleRef) -> Vec<(String, RemoteRef)> {
        self.scope
            .remotes_offering(bundle_ref)
            .filter(|(remote, _)| remote.enabled)
            .map(|(remote, entry)| (remote.name.clone(), entry.clone()))
            .collect()
    }

    fn plan_related(
        &self,
        remote: &str,
        entry: &RemoteRef,
        dependent: &BundleRef,
        planned: &mut Vec<Planned>,
    ) {
        for related in &entry.related {
            if self.scope.is_installed(related)
                || planned.iter().any(|queued| &queued.target == related)
            {
                continue;
            }
            let Some(related_entry) = self
                .scope
                .remote(remote)
                .and_then(|source| source.find(related))
            else {
                debug!("{related} is not offered by '{remote}', skipping");
                continue;
            };
            planned.push(Planned {
                kind: OpKind::Install,
                target: related.clone(),
                remote: remote.to_string(),
                commit: Some(related_entry.commit.clone()),
                download_size: related_entry.download_size,
                installed_size: related_entry.installed_size,
                related_to: vec![dependent.clone()],
                skipped: false,
            });
        }
    }

    fn apply(&mut self, op: &Operation) -> Result<()> {
        match op.kind {
            OpKind::Install | OpKind::InstallBundle => {
                self.scope.installed.insert(
                    op.target.clone(),
                    InstalledRef {
                        bundle_ref: op.target.clone(),
                        origin: op.remote.clone(),
                        commit: op.commit.clone().unwrap_or_default(),
                        installed_size: op.installed_size,
                        installed_at_unix: now_unix(),
                    },
                );
            }
            OpKind::Update => {
                if let Some(installed) = self.scope.installed.get_mut(&op.target) {
                    installed.commit = op.commit.clone().unwrap_or_default();
                    installed.installed_size = op.installed_size;
                }
            }
            OpKind::Uninstall => {
                self.scope.installed.remove(&op.target);
            }
        }

        if let Some(store) = &self.store {
            store.save_installed(&self.scope)?;
        }
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        if let Some(shared) = &self.shared {
            lock_scopes(shared).insert(self.scope.name.clone(), self.scope.clone());
        }
    }
}

impl TransactionPrimitive for SimulatedTransaction {
    fn scope_name(&self) -> &str {
        &self.scope.name
    }

    fn add_install(&mut self, remote: &str, bundle_ref: &BundleRef) -> Result<(), OperationError> {
        if self.scope.is_installed(bundle_ref) {
            return Err(OperationError::AlreadyInstalled(bundle_ref.to_string()));
        }
        if self.queued(bundle_ref) {
            return Ok(());
        }
        let source = self
            .scope
            .remote(remote)
            .ok_or_else(|| OperationError::RemoteNotFound(remote.to_string()))?;
        if !source.enabled {
            return Err(OperationError::Failed(format!("remote '{remote}' is disabled")));
        }
        if source.find(bundle_ref).is_none() {
            return Err(OperationError::Failed(format!(
                "{bundle_ref} is not offered by remote '{remote}'"
            )));
        }

        self.requests.push(Request {
            kind: OpKind::Install,
            target: bundle_ref.clone(),
            remote: Some(remote.to_string()),
            bundle: None,
        });
        Ok(())
    }

    fn add_install_bundle(
        &mut self,
        origin: &str,
        bundle: &RemoteRef,
    ) -> Result<(), OperationError> {
        if self.scope.is_installed(&bundle.bundle_ref) {
            return Err(OperationError::AlreadyInstalled(bundle.bundle_ref.to_string()));
        }
        if self.queued(&bundle.bundle_ref) {
            return Ok(());
        }
        self.requests.push(Request {
            kind: OpKind::InstallBundle,
            target: bundle.bundle_ref.clone(),
            remote: Some(origin.to_string()),
            bundle: Some(bundle.clone()),
        });
        Ok(())
    }

    fn add_update(&mut self, bundle_ref: &BundleRef) -> Result<(), OperationError> {
        let installed = self
            .scope
            .installed_ref(bundle_ref)
            .ok_or_else(|| OperationError::NotInstalled(bundle_ref.to_string()))?;
        if self.scope.remote(&installed.origin).is_none() {
            return Err(OperationError::RemoteNotFound(installed.origin.clone()));
        }
        if self.queued(bundle_ref) {
            return Ok(());
        }

        self.requests.push(Request {
            kind: OpKind::Update,
            target: bundle_ref.clone(),
            remote: None,
            bundle: None,
        });
        Ok(())
    }

    fn add_uninstall(&mut self, bundle_ref: &BundleRef) -> Result<(), OperationError> {
        if !self.scope.is_installed(bundle_ref) {
            return Err(OperationError::NotInstalled(bundle_ref.to_string()));
        }
        if self.queued(bundle_ref) {
            return Ok(());
        }

        self.requests.push(Request {
            kind: OpKind::Uninstall,
            target: bundle_ref.clone(),
            remote: None,
            bundle: None,
        });
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.ops.is_empty()
    }

    fn operations(&self) -> &[Operation] {
        &self.ops
    }

    fn run(
        &mut self,
        events: &mut dyn TransactionEvents,
        cancel: &CancelToken,
    ) -> Result<(), OperationError> {
        self.resolve(events)?;
        let ops = self.ops.clone();

        for op in &ops {
            if cancel.is_cancelled() {
                return Err(OperationError::Cancelled);
            }
            if op.skipped {
                debug!("operation {} on {} has nothing to do", op.id, op.target);
                continue;
            }

            events.on_new_operation(&ops, op.id);
            if let Some((error, non_fatal)) = self.failures.get(&op.target).cloned() {
                if events.on_error(&ops, op.id, &error, non_fatal) {
                    continue;
                }
                return Err(error);
            }

            events.on_progress(
                &ops,
                op.id,
                &OperationProgress {
                    bytes_transferred: 0,
                    estimating: true,
                    percent: ESTIMATING_PERCENT,
                },
            );
            for step in 1..=self.chunks {
                if cancel.is_cancelled() {
                    return Err(OperationError::Cancelled);
                }
                events.on_progress(
                    &ops,
                    op.id,
                    &OperationProgress {
                        bytes_transferred: chunk_bytes(op.download_size, step, self.chunks),
                        estimating: false,
                        percent: (step * 100 / self.chunks) as u32,
                    },
                );
            }

            if let Err(err) = self.apply(op) {
                let error = OperationError::Failed(format!("{err:#}"));
                if events.on_error(&ops, op.id, &error, false) {
                    continue;
                }
                return Err(error);
            }
            events.on_done(&ops, op.id);
        }
        Ok(())
    }
}

/// Hands out [`SimulatedTransaction`]s and remembers the scope state they
/// leave behind.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    store: Option<ScopeStore>,
    scopes: SharedScopes,
    failures: Failures,
    chunks: u64,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            store: None,
            scopes: Arc::new(Mutex::new(BTreeMap::new())),
            failures: BTreeMap::new(),
            chunks: DEFAULT_CHUNKS,
        }
    }

    /// Persists every applied operation through `store`.
    pub fn with_store(store: ScopeStore) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn fail_operation(
        mut self,
        bundle_ref: BundleRef,
        error: OperationError,
        non_fatal: bool,
    ) -> Self {
        self.failures.insert(bundle_ref, (error, non_fatal));
        self
    }

    /// Last state a transaction published for `name`.
    pub fn scope(&self, name: &str) -> Option<Scope> {
        lock_scopes(&self.scopes).get(name).cloned()
    }
}

impl TransactionBackend for SimulatedBackend {
    fn begin(&self, scope: &Scope) -> Box<dyn TransactionPrimitive> {
        let mut transaction = SimulatedTransaction::new(scope.clone()).with_chunks(self.chunks);
        transaction.failures = self.failures.clone();
        transaction.shared = Some(Arc::clone(&self.scopes));
        transaction.store = self.store.clone();
        Box::new(transaction)
    }

    fn reload_scope(&self, scope: &Scope) -> Result<Scope> {
        Ok(self.scope(&scope.name).unwrap_or_else(|| scope.clone()))
    }

    fn refresh_metadata(&self, scope: &Scope, remote: &str) -> Result<()> {
        debug!("refreshed metadata for remote '{remote}' in scope '{}'", scope.name);
        Ok(())
    }
}

fn lock_scopes(scopes: &SharedScopes) -> MutexGuard<'_, BTreeMap<String, Scope>> {
    scopes.lock().unwrap_or_else(|poisoned| {
        warn!("simulated scope state lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn chunk_bytes(total: u64, step: u64, chunks: u64) -> u64 {
    (u128::from(total) * u128::from(step) / u128::from(chunks)) as u64
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
