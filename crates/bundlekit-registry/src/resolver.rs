use bundlekit_core::{AppHandle, BundleRef};

use crate::scope::{Scope, ScopeSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("scope '{0}' has no counterpart scope")]
    NoCounterpart(String),
    #[error("no configured scope is compatible with {0}")]
    NoCompatibleScope(String),
    #[error("scope '{0}' is not configured")]
    UnknownScope(String),
    #[error("remote '{remote}' in scope '{scope}' not found")]
    RemoteNotFound { scope: String, remote: String },
    #[error("remote '{remote}' is still the origin of installed refs: {refs}")]
    RemoteInUse { remote: String, refs: String },
}

/// Picks the scope an application belongs to. Iteration always follows
/// declaration order.
#[derive(Debug, Clone, Copy)]
pub struct ScopeResolver<'a> {
    scopes: &'a ScopeSet,
}

impl<'a> ScopeResolver<'a> {
    pub fn new(scopes: &'a ScopeSet) -> Self {
        Self { scopes }
    }

    pub fn scope_for(&self, app: &AppHandle) -> Result<&'a Scope, ScopeError> {
        if let Some(installation) = app.installation() {
            return self
                .scopes
                .get(&installation)
                .ok_or(ScopeError::UnknownScope(installation));
        }

        let declared = app.key().scope;
        self.scopes
            .scopes()
            .iter()
            .find(|scope| declared.is_compatible(scope.bundle_scope()))
            .ok_or_else(|| ScopeError::NoCompatibleScope(app.key().to_string()))
    }

    /// The user scope for a system scope and the other way round.
    pub fn counterpart_of(&self, scope: &Scope) -> Result<&'a Scope, ScopeError> {
        self.scopes
            .scopes()
            .iter()
            .find(|candidate| candidate.is_user != scope.is_user)
            .ok_or_else(|| ScopeError::NoCounterpart(scope.name.clone()))
    }

    pub fn owning_scope_of_installed_ref(&self, bundle_ref: &BundleRef) -> Option<&'a Scope> {
        self.scopes
            .scopes()
            .iter()
            .find(|scope| scope.is_installed(bundle_ref))
    }

    pub fn scopes(&self) -> &'a [Scope] {
        self.scopes.scopes()
    }
}
