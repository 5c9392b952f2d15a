mod app;
mod bundle_ref;
mod cache;
mod kind;
mod metadata;
mod state;

pub use app::{AppHandle, AppKey, AppRecord, BundleScope};
pub use bundle_ref::{BundleRef, RefKind};
pub use cache::AppCache;
pub use kind::{AppKind, KindError};
pub use metadata::{AppMetadata, Catalog, MetadataCatalog};
pub use state::{AppState, PendingAction, Progress};

#[cfg(test)]
mod tests;
