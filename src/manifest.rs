//! Project manifest schema: the declarative list of plugin references.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory holding the project's durable state, relative to the project root.
pub const PROJECT_STATE_DIR: &str = ".langforge";

/// Manifest file name inside [`PROJECT_STATE_DIR`].
pub const PROJECT_MANIFEST_FILE: &str = "PROJECT.json";

/// Kind of remote entity a reference resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// A compiler plugin providing file handlers.
    Language,
    /// A library plugin, built into a build manifest on installation.
    Library,
}

impl PluginKind {
    /// Directory segment used in the on-disk cache layout.
    pub fn cache_segment(&self) -> &'static str {
        match self {
            Self::Language => "language",
            Self::Library => "library",
        }
    }
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Language => "language",
            Self::Library => "library",
        };
        write!(f, "{}", name)
    }
}

/// Where a plugin's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Remote {
    /// Revision-controlled remote repository.
    Vcs {
        /// Repository owner (organization or user).
        owner: String,
    },
    /// Local directory, never pinned or cached.
    Local {
        /// Path to the plugin tree on disk.
        path: PathBuf,
    },
}

impl Remote {
    /// Returns true for local-path references.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

/// A single entry in the project manifest.
///
/// `name` is the composite `"<category>-<ident>/<version-ref>"`, e.g.
/// `"lang-script/stable"`. The version ref names a branch or tag of the
/// remote repository and defaults to `stable` when omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginReference {
    /// Composite plugin name.
    pub name: String,
    /// Content source.
    pub remote: Remote,
    /// Plugins that must be loaded before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_after: Vec<String>,
}

impl PluginReference {
    /// Create a VCS-backed reference.
    pub fn vcs(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: Remote::Vcs {
                owner: owner.into(),
            },
            load_after: Vec::new(),
        }
    }

    /// Create a local-path reference.
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            remote: Remote::Local { path: path.into() },
            load_after: Vec::new(),
        }
    }

    /// Add a load-ordering dependency.
    pub fn with_load_after(mut self, dep: impl Into<String>) -> Self {
        self.load_after.push(dep.into());
        self
    }

    /// Repository name: everything before the version ref.
    pub fn repo_name(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }

    /// Short identifier with the category prefix stripped.
    pub fn ident(&self) -> &str {
        self.repo_name()
            .trim_start_matches("lang-")
            .trim_start_matches("lib-")
    }

    /// Branch or tag name; `stable` when the composite name omits one.
    pub fn version_ref(&self) -> &str {
        match self.name.split_once('/') {
            Some((_, v)) if !v.is_empty() => v,
            _ => "stable",
        }
    }

    /// Validate the composite name.
    pub fn validate(&self) -> Result<()> {
        if !self.name.starts_with("lang-") && !self.name.starts_with("lib-") {
            return Err(Error::InvalidPluginName(self.name.clone()));
        }
        if self.ident().is_empty() {
            return Err(Error::InvalidPluginName(self.name.clone()));
        }
        Ok(())
    }
}

/// The project's durable plugin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectManifest {
    /// Language plugins, in load order.
    #[serde(default)]
    pub languages: Vec<PluginReference>,
    /// Library plugins, in load order.
    #[serde(default)]
    pub libraries: Vec<PluginReference>,
}

impl ProjectManifest {
    /// Manifest path for a project root.
    pub fn path_for(project_root: &Path) -> PathBuf {
        project_root
            .join(PROJECT_STATE_DIR)
            .join(PROJECT_MANIFEST_FILE)
    }

    /// Load the manifest from its project-relative path.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = Self::path_for(project_root);
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Load the manifest, writing a default one if none exists yet.
    pub fn load_or_init(project_root: &Path) -> Result<Self> {
        let path = Self::path_for(project_root);
        if path.exists() {
            Self::load(project_root)
        } else {
            let manifest = Self::default();
            manifest.save(project_root)?;
            Ok(manifest)
        }
    }

    /// Persist the manifest to its project-relative path.
    pub fn save(&self, project_root: &Path) -> Result<()> {
        let path = Self::path_for(project_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// All references with their kinds, languages first (manifest order).
    pub fn entries(&self) -> Vec<(PluginKind, &PluginReference)> {
        self.languages
            .iter()
            .map(|r| (PluginKind::Language, r))
            .chain(self.libraries.iter().map(|r| (PluginKind::Library, r)))
            .collect()
    }

    /// Look up a language reference by ident.
    pub fn language(&self, ident: &str) -> Option<&PluginReference> {
        self.languages.iter().find(|r| r.ident() == ident)
    }

    /// Append a validated language reference; duplicates are rejected.
    pub fn add_language(&mut self, reference: PluginReference) -> Result<()> {
        reference.validate()?;
        if self.languages.iter().any(|r| r.name == reference.name) {
            return Err(Error::PluginAlreadyAdded(reference.name));
        }
        self.languages.push(reference);
        Ok(())
    }

    /// Append a validated library reference; duplicates are rejected.
    pub fn add_library(&mut self, reference: PluginReference) -> Result<()> {
        reference.validate()?;
        if self.libraries.iter().any(|r| r.name == reference.name) {
            return Err(Error::PluginAlreadyAdded(reference.name));
        }
        self.libraries.push(reference);
        Ok(())
    }
}
