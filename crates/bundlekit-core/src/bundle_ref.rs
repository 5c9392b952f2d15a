use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    App,
    Runtime,
}

impl RefKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Runtime => "runtime",
        }
    }
}

/// Target of one transaction operation: `kind/name/arch/branch`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BundleRef {
    pub kind: RefKind,
    pub name: String,
    pub arch: String,
    pub branch: String,
}

impl BundleRef {
    pub fn new(
        kind: RefKind,
        name: impl Into<String>,
        arch: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            arch: arch.into(),
            branch: branch.into(),
        }
    }

    pub fn app(name: &str, arch: &str, branch: &str) -> Self {
        Self::new(RefKind::App, name, arch, branch)
    }

    pub fn runtime(name: &str, arch: &str, branch: &str) -> Self {
        Self::new(RefKind::Runtime, name, arch, branch)
    }

    /// Runtimes, and the locale/debug extensions shipped as runtimes.
    pub fn is_runtime_class(&self) -> bool {
        self.kind == RefKind::Runtime
    }

    /// Parses the `name/arch/branch` form used by applications to declare
    /// their runtime. The kind is always runtime.
    pub fn parse_runtime_decl(value: &str) -> Result<Self> {
        let parts = value.split('/').collect::<Vec<_>>();
        let [name, arch, branch] = parts.as_slice() else {
            return Err(anyhow!(
                "invalid runtime declaration '{value}': expected name/arch/branch"
            ));
        };
        Self::validated(RefKind::Runtime, name, arch, branch)
            .map_err(|err| anyhow!("invalid runtime declaration '{value}': {err}"))
    }

    fn validated(kind: RefKind, name: &str, arch: &str, branch: &str) -> Result<Self> {
        for (field, part) in [("name", name), ("arch", arch), ("branch", branch)] {
            if part.is_empty() {
                return Err(anyhow!("{field} must not be empty"));
            }
            if part.chars().any(|ch| ch.is_whitespace()) {
                return Err(anyhow!("{field} must not contain whitespace"));
            }
        }
        Ok(Self::new(kind, name, arch, branch))
    }
}

impl FromStr for BundleRef {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let parts = value.split('/').collect::<Vec<_>>();
        let [kind, name, arch, branch] = parts.as_slice() else {
            return Err(anyhow!(
                "invalid ref '{value}': expected kind/name/arch/branch"
            ));
        };
        let kind = match *kind {
            "app" => RefKind::App,
            "runtime" => RefKind::Runtime,
            other => return Err(anyhow!("invalid ref '{value}': unknown kind '{other}'")),
        };
        Self::validated(kind, name, arch, branch)
            .map_err(|err| anyhow!("invalid ref '{value}': {err}"))
    }
}

impl TryFrom<String> for BundleRef {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BundleRef> for String {
    fn from(value: BundleRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind.as_str(),
            self.name,
            self.arch,
            self.branch
        )
    }
}
