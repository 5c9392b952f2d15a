mod config;
mod resolver;
mod scope;
mod space;
mod store;

pub use config::{default_state_root, EngineConfig, ScopeDecl, DEFAULT_MIN_FREE_HEADROOM_BYTES};
pub use resolver::{ScopeError, ScopeResolver};
pub use scope::{InstalledRef, Remote, RemoteRef, Scope, ScopeSet};
pub use space::{check_free_space, SpaceCheck, StatvfsProbe, StorageProbe};
pub use store::ScopeStore;
