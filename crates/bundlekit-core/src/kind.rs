use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bundle_ref::RefKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KindError {
    #[error("unrecognized application kind: '{0}'")]
    Unrecognized(String),
}

/// What an application record stands for.
///
/// Catalog metadata stores this as a free-text tag; it is parsed once into this
/// enum and anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AppKind {
    Application,
    Runtime,
    Repository,
}

impl AppKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Runtime => "runtime",
            Self::Repository => "repository",
        }
    }

    /// Ref kind used for transaction operations. Repository sources have none.
    pub fn ref_kind(self) -> Option<RefKind> {
        match self {
            Self::Application => Some(RefKind::App),
            Self::Runtime => Some(RefKind::Runtime),
            Self::Repository => None,
        }
    }
}

impl FromStr for AppKind {
    type Err = KindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "application" | "app" | "desktop" | "desktop-application" => Ok(Self::Application),
            "runtime" | "extension" | "locale" => Ok(Self::Runtime),
            "repository" | "repository-source" => Ok(Self::Repository),
            _ => Err(KindError::Unrecognized(value.to_string())),
        }
    }
}

impl TryFrom<String> for AppKind {
    type Error = KindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AppKind> for String {
    fn from(value: AppKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
