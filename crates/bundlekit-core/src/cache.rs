use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::app::{AppHandle, AppKey, AppRecord};
use crate::bundle_ref::BundleRef;
use crate::metadata::AppMetadata;

/// Arena of application records keyed by identity tuple.
///
/// Every consumer that asks for the same key gets a handle to the same record.
#[derive(Debug, Default)]
pub struct AppCache {
    records: BTreeMap<AppKey, AppHandle>,
}

impl AppCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &AppKey) -> Option<AppHandle> {
        self.records.get(key).cloned()
    }

    pub fn get_or_create(&mut self, key: AppKey) -> AppHandle {
        self.records
            .entry(key)
            .or_insert_with_key(|key| AppHandle::new(AppRecord::new(key.clone())))
            .clone()
    }

    /// Record for a ref; a fresh record carries the ref itself.
    pub fn get_or_create_for_ref(&mut self, key: AppKey, bundle_ref: &BundleRef) -> AppHandle {
        let handle = self.get_or_create(key);
        handle.update(|record| {
            if record.bundle_ref.is_none() {
                record.bundle_ref = Some(bundle_ref.clone());
            }
        });
        handle
    }

    /// Looks a record up by operation ref, across declared scopes.
    pub fn find_by_ref(&self, bundle_ref: &BundleRef) -> Option<AppHandle> {
        self.records
            .values()
            .find(|handle| handle.bundle_ref().as_ref() == Some(bundle_ref))
            .cloned()
    }

    /// Creates (or refreshes) the record described by catalog metadata and
    /// links its declared runtime record.
    pub fn insert_metadata(&mut self, metadata: &AppMetadata) -> Result<AppHandle> {
        let kind = metadata
            .kind()
            .with_context(|| format!("cannot create record for '{}'", metadata.id))?;
        let scope = metadata.scope()?;
        let key = AppKey::new(
            scope,
            kind,
            &metadata.id,
            metadata.arch.as_deref().unwrap_or_default(),
            metadata.branch.as_deref().unwrap_or_default(),
        );
        let handle = self.get_or_create(key);
        handle.update(|record| record.apply_metadata(metadata));

        if let Some(runtime_ref) = metadata.runtime_ref()? {
            let runtime_key = AppKey::for_ref(scope, &runtime_ref);
            let runtime = self.get_or_create_for_ref(runtime_key, &runtime_ref);
            handle.set_runtime(Some(runtime));
        }

        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppHandle> {
        self.records.values()
    }
}
