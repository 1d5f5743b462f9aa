//! Error types for the build engine.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// How an error affects the current build pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Environment or infrastructure failure; aborts the build pass.
    Critical,
    /// A plugin reported malformed input; the file's task fails, the pass continues.
    Compiler,
    /// Misconfiguration; the specific operation aborts, unrelated files are unaffected.
    User,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::Compiler => "compiler",
            Self::User => "user",
        };
        write!(f, "{}", name)
    }
}

/// Errors that can occur during resolution, loading, and builds.
#[derive(Error, Debug)]
pub enum Error {
    /// Infrastructure failure that aborts the current build pass.
    #[error("critical: {0}")]
    Critical(String),

    /// A plugin reported malformed input.
    #[error("compile error in {}: {}", .path.display(), .message)]
    Compiler {
        /// Offending source file.
        path: PathBuf,
        /// Plugin-reported message, with source location context where available.
        message: String,
        /// Line number within the source file, if the plugin reported one.
        line: Option<u32>,
    },

    /// Misconfiguration reported back to the user.
    #[error("{0}")]
    User(String),

    /// Remote request quota exhausted.
    #[error("remote rate limit exhausted, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the remote resets its quota.
        retry_after_secs: u64,
    },

    /// The project source directory does not exist.
    #[error("source directory not found: {}", .0.display())]
    MissingSourceDir(PathBuf),

    /// No compile handler is registered for a file extension.
    #[error("did not find handler for file type '{0}'")]
    UnknownExtension(String),

    /// Plugin referenced but not known to the engine.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin is already present in the project manifest.
    #[error("plugin already in the current project: {0}")]
    PluginAlreadyAdded(String),

    /// Plugin name missing from the remote catalog.
    #[error("did not find entry for {kind} '{name}' in catalog")]
    NotInCatalog {
        /// Entity kind ("language" or "library").
        kind: String,
        /// Requested name.
        name: String,
    },

    /// Composite plugin name failed validation.
    #[error("malformed plugin name '{0}': expected 'lang-' or 'lib-' prefix")]
    InvalidPluginName(String),

    /// No entry point registered for an installed plugin.
    #[error("no entry point registered for plugin '{0}'")]
    MissingEntryPoint(String),

    /// Capability namespace unknown to the registry.
    #[error("unknown capability namespace in request '{0}'")]
    UnknownNamespace(String),

    /// Capability request failed to resolve.
    #[error("failed to resolve capability '{path}': {message}")]
    Capability {
        /// Full request path.
        path: String,
        /// Resolver failure message.
        message: String,
    },

    /// Project manifest or descriptor could not be parsed.
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// Remote archive could not be unpacked.
    #[error("archive error: {0}")]
    Archive(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a critical error.
    pub fn critical(msg: impl Into<String>) -> Self {
        Self::Critical(msg.into())
    }

    /// Create a compiler-reported error for a source file.
    pub fn compiler(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Compiler {
            path: path.into(),
            message: msg.into(),
            line: None,
        }
    }

    /// Create a compiler-reported error with a line number.
    pub fn compiler_at(path: impl Into<PathBuf>, msg: impl Into<String>, line: u32) -> Self {
        Self::Compiler {
            path: path.into(),
            message: msg.into(),
            line: Some(line),
        }
    }

    /// Create a user-caused error.
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    /// Create a catalog-miss error.
    pub fn not_in_catalog(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotInCatalog {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Classify this error. Anything not explicitly task-scoped is Critical.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Compiler { .. } => Severity::Compiler,
            Self::User(_)
            | Self::UnknownExtension(_)
            | Self::PluginNotFound(_)
            | Self::PluginAlreadyAdded(_)
            | Self::NotInCatalog { .. }
            | Self::InvalidPluginName(_)
            | Self::ManifestParse(_) => Severity::User,
            _ => Severity::Critical,
        }
    }

    /// Returns true if this error is caught at the single-file compile
    /// boundary instead of aborting the build pass.
    pub fn is_task_scoped(&self) -> bool {
        self.severity() != Severity::Critical
    }
}
