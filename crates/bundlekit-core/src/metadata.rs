use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::app::BundleScope;
use crate::bundle_ref::BundleRef;
use crate::kind::{AppKind, KindError};

/// Catalog entry for one application, as found in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppMetadata {
    pub id: String,
    pub kind: String,
    pub arch: Option<String>,
    pub branch: Option<String>,
    /// Runtime dependency as `name/arch/branch`.
    pub runtime: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub bundle_scope: Option<String>,
}

impl AppMetadata {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let metadata: Self = toml::from_str(input).context("failed to parse app metadata")?;
        if metadata.id.trim().is_empty() {
            return Err(anyhow!("app metadata id must not be empty"));
        }
        metadata
            .kind()
            .with_context(|| format!("invalid metadata for '{}'", metadata.id))?;
        metadata
            .scope()
            .with_context(|| format!("invalid metadata for '{}'", metadata.id))?;
        if let Some(runtime) = &metadata.runtime {
            BundleRef::parse_runtime_decl(runtime)
                .with_context(|| format!("invalid metadata for '{}'", metadata.id))?;
        }
        Ok(metadata)
    }

    pub fn kind(&self) -> Result<AppKind, KindError> {
        self.kind.parse()
    }

    pub fn scope(&self) -> Result<BundleScope> {
        match self.bundle_scope.as_deref() {
            None => Ok(BundleScope::Unknown),
            Some("system") => Ok(BundleScope::System),
            Some("user") => Ok(BundleScope::User),
            Some(other) => Err(anyhow!("unrecognized bundle scope: '{other}'")),
        }
    }

    /// Operation reference derived from the metadata. `None` when arch or
    /// branch is missing, or for repository sources.
    pub fn bundle_ref(&self) -> Result<Option<BundleRef>> {
        let Some(ref_kind) = self.kind()?.ref_kind() else {
            return Ok(None);
        };
        let (Some(arch), Some(branch)) = (&self.arch, &self.branch) else {
            return Ok(None);
        };
        Ok(Some(BundleRef::new(ref_kind, &self.id, arch, branch)))
    }

    pub fn runtime_ref(&self) -> Result<Option<BundleRef>> {
        self.runtime
            .as_deref()
            .map(BundleRef::parse_runtime_decl)
            .transpose()
    }
}

/// Read-only source of application metadata.
pub trait Catalog {
    fn metadata(&self, id: &str) -> Result<Option<AppMetadata>>;

    fn search(&self, needle: &str) -> Result<Vec<AppMetadata>>;
}

/// Catalog backed by a directory of `<id>.toml` files.
#[derive(Debug, Clone)]
pub struct MetadataCatalog {
    root: PathBuf,
}

impl MetadataCatalog {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_entry(&self, path: &Path) -> Result<AppMetadata> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed reading app metadata: {}", path.display()))?;
        AppMetadata::from_toml_str(&content)
            .with_context(|| format!("failed parsing app metadata: {}", path.display()))
    }
}

impl Catalog for MetadataCatalog {
    fn metadata(&self, id: &str) -> Result<Option<AppMetadata>> {
        if id.contains('/') || id.contains("..") {
            return Err(anyhow!("invalid app id: '{id}'"));
        }
        let path = self.root.join(format!("{id}.toml"));
        if !path.exists() {
            return Ok(None);
        }
        self.read_entry(&path).map(Some)
    }

    fn search(&self, needle: &str) -> Result<Vec<AppMetadata>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let needle = needle.to_ascii_lowercase();
        let mut matches = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to read catalog: {}", self.root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file()
                || path.extension().and_then(|v| v.to_str()) != Some("toml")
            {
                continue;
            }
            let metadata = self.read_entry(&path)?;
            let summary = metadata.summary.as_deref().unwrap_or_default();
            if metadata.id.to_ascii_lowercase().contains(&needle)
                || summary.to_ascii_lowercase().contains(&needle)
            {
                matches.push(metadata);
            }
        }

        matches.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(matches)
    }
}
