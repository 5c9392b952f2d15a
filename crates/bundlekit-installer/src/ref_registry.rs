use std::collections::HashMap;

use bundlekit_core::{AppCache, AppHandle, BundleRef};
use tracing::{debug, warn};

/// Resolves a ref that the registry has not seen, typically against the
/// application cache.
pub trait RefLookup {
    fn lookup_ref(&self, bundle_ref: &BundleRef) -> Option<AppHandle>;
}

impl RefLookup for AppCache {
    fn lookup_ref(&self, bundle_ref: &BundleRef) -> Option<AppHandle> {
        self.find_by_ref(bundle_ref)
    }
}

/// Maps operation refs to the application records they act on, for the
/// lifetime of one transaction.
#[derive(Debug, Default)]
pub struct RefAppRegistry {
    apps: HashMap<BundleRef, AppHandle>,
}

impl RefAppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `app` under `bundle_ref`, and its runtime under the
    /// runtime's own ref. A later registration replaces an earlier one.
    pub fn add(&mut self, bundle_ref: BundleRef, app: &AppHandle) {
        if let Some(runtime) = app.runtime() {
            if let Some(runtime_ref) = runtime.bundle_ref() {
                self.apps.insert(runtime_ref, runtime);
            }
        }
        self.apps.insert(bundle_ref, app.clone());
    }

    /// Registers `app` under its own ref; records without one are ignored.
    pub fn add_app(&mut self, app: &AppHandle) {
        match app.bundle_ref() {
            Some(bundle_ref) => self.add(bundle_ref, app),
            None => debug!("not registering {app}: it has no ref"),
        }
    }

    pub fn lookup(&self, bundle_ref: &BundleRef) -> Option<AppHandle> {
        self.apps.get(bundle_ref).cloned()
    }

    pub fn resolve_or_ask(
        &mut self,
        bundle_ref: &BundleRef,
        fallback: Option<&dyn RefLookup>,
    ) -> Option<AppHandle> {
        if let Some(app) = self.lookup(bundle_ref) {
            return Some(app);
        }

        match fallback.and_then(|lookup| lookup.lookup_ref(bundle_ref)) {
            Some(app) => {
                self.apps.insert(bundle_ref.clone(), app.clone());
                Some(app)
            }
            None => {
                warn!("no application record for {bundle_ref}");
                None
            }
        }
    }

    pub fn apps(&self) -> impl Iterator<Item = &AppHandle> {
        self.apps.values()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
