//! Plugin resolution and the local content-addressed cache.
//!
//! Turns manifest references into on-disk, buildable installations. Revision
//! lookups for the whole manifest run concurrently; downloads and library
//! builds run one at a time in manifest order so child build output never
//! interleaves.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;

use crate::error::{Error, Result};
use crate::manifest::{PluginKind, PluginReference, ProjectManifest, Remote};
use crate::plugin::BUILD_MANIFEST_FILE;

/// An immutable content fingerprint for a plugin installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Revision {
    /// Commit id of the remote tree; the cache key.
    Pinned(String),
    /// Local-path reference: never pinned, always read from disk.
    Local,
}

impl Revision {
    /// Returns true for pinned revisions.
    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Pinned(_))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pinned(rev) => write!(f, "{}", rev),
            Self::Local => write!(f, "<local>"),
        }
    }
}

/// Result of a remote revision lookup for one reference.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The manifest reference.
    pub reference: PluginReference,
    /// Language or library.
    pub kind: PluginKind,
    /// Resolved revision.
    pub revision: Revision,
}

/// A reference resolved all the way to an on-disk installation.
///
/// Two resolved plugins with equal pinned revisions hold bit-identical
/// content; that invariant is what makes cache reuse safe.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    /// The manifest reference.
    pub reference: PluginReference,
    /// Language or library.
    pub kind: PluginKind,
    /// Installed revision.
    pub revision: Revision,
    /// Installation directory.
    pub install_path: PathBuf,
}

/// Callback that builds a library plugin in place.
///
/// Invoked for library installs that lack a build manifest; the same build
/// pipeline re-enters in library mode for the plugin's own source tree, and
/// resolution continues only after it returns.
pub type LibraryBuilder<'a> = dyn FnMut(&str, &Path) -> Result<()> + 'a;

/// Configuration for the resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Root of the per-user plugin cache.
    pub cache_root: PathBuf,
    /// Base URL of the revision lookup API.
    pub api_base: String,
    /// Base URL archives are downloaded from.
    pub archive_base: String,
    /// Skip all network resolution and reuse cached installs verbatim.
    pub offline: bool,
    /// Command run inside a fresh install to set up its dependencies.
    pub install_command: Option<Vec<String>>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            cache_root: data_dir.join("langforge").join("local"),
            api_base: "https://api.github.com".to_string(),
            archive_base: "https://github.com".to_string(),
            offline: false,
            install_command: None,
        }
    }
}

impl ResolverConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache root.
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    /// Set the revision lookup API base.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Set the archive download base.
    pub fn with_archive_base(mut self, base: impl Into<String>) -> Self {
        self.archive_base = base.into();
        self
    }

    /// Enable offline mode.
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Set the per-install dependency command.
    pub fn with_install_command(mut self, command: Vec<String>) -> Self {
        self.install_command = Some(command);
        self
    }
}

#[derive(Deserialize)]
struct BranchInfo {
    commit: CommitInfo,
}

#[derive(Deserialize)]
struct CommitInfo {
    sha: String,
}

#[derive(Deserialize)]
struct RateLimitInfo {
    rate: RateWindow,
}

#[derive(Deserialize)]
struct RateWindow {
    reset: u64,
}

/// Resolves manifest references and owns the on-disk plugin cache.
pub struct Resolver {
    config: ResolverConfig,
    http: reqwest::blocking::Client,
}

impl Resolver {
    /// Create a resolver.
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            http: reqwest::blocking::Client::new(),
        }
    }

    /// The resolver configuration.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Marker file holding the last installed revision for a reference.
    pub fn marker_path(&self, kind: PluginKind, reference: &PluginReference) -> PathBuf {
        self.config
            .cache_root
            .join(".sha")
            .join(kind.cache_segment())
            .join(reference.ident())
            .join(reference.version_ref())
    }

    /// Cache directory for a reference's installed content.
    pub fn cache_dir(&self, kind: PluginKind, reference: &PluginReference) -> PathBuf {
        self.config
            .cache_root
            .join(".cache")
            .join(kind.cache_segment())
            .join(reference.ident())
            .join(reference.version_ref())
    }

    /// Resolve one reference to its current revision.
    ///
    /// A lightweight lookup: no content is fetched.
    pub fn resolve(&self, kind: PluginKind, reference: &PluginReference) -> Result<Resolution> {
        reference.validate()?;

        let revision = match &reference.remote {
            Remote::Local { .. } => Revision::Local,
            Remote::Vcs { owner } => {
                let url = format!(
                    "{}/repos/{}/{}/branches/{}",
                    self.config.api_base,
                    owner,
                    reference.repo_name(),
                    reference.version_ref()
                );
                let response = self
                    .http
                    .get(&url)
                    .header(reqwest::header::USER_AGENT, "langforge")
                    .send()?;

                if response.status() == reqwest::StatusCode::FORBIDDEN {
                    return Err(self.rate_limit_error());
                }
                if !response.status().is_success() {
                    return Err(Error::critical(format!(
                        "failed to resolve '{}': {}",
                        reference.name,
                        response.status()
                    )));
                }

                let info: BranchInfo = response.json()?;
                Revision::Pinned(info.commit.sha)
            }
        };

        Ok(Resolution {
            reference: reference.clone(),
            kind,
            revision,
        })
    }

    /// Resolve every manifest entry, one concurrent lookup per reference.
    ///
    /// Results come back in manifest order (languages, then libraries).
    pub fn resolve_manifest(&self, manifest: &ProjectManifest) -> Result<Vec<Resolution>> {
        let entries = manifest.entries();
        let results: Vec<Result<Resolution>> = std::thread::scope(|scope| {
            let handles: Vec<_> = entries
                .iter()
                .map(|(kind, reference)| {
                    let kind = *kind;
                    scope.spawn(move || self.resolve(kind, reference))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::critical("revision lookup panicked")))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    /// Install one resolution, reusing the cache when the revision matches.
    pub fn install(
        &self,
        resolution: &Resolution,
        build_library: &mut LibraryBuilder<'_>,
    ) -> Result<ResolvedPlugin> {
        let reference = &resolution.reference;
        let install_path = match &reference.remote {
            Remote::Local { path } => path.clone(),
            Remote::Vcs { owner } => {
                let dir = self.cache_dir(resolution.kind, reference);
                if self.config.offline {
                    if !dir.exists() {
                        return Err(Error::critical(format!(
                            "offline mode: no cached install for '{}'",
                            reference.name
                        )));
                    }
                    dir
                } else {
                    let rev = match &resolution.revision {
                        Revision::Pinned(rev) => rev,
                        Revision::Local => {
                            return Err(Error::critical(format!(
                                "unpinned revision for remote reference '{}'",
                                reference.name
                            )))
                        }
                    };
                    let marker = self.marker_path(resolution.kind, reference);
                    let cached = marker.exists()
                        && std::fs::read_to_string(&marker)?.trim() == rev.as_str();

                    if cached {
                        tracing::info!(
                            "using cache for {} '{}'",
                            resolution.kind,
                            reference.name
                        );
                    } else {
                        let start = Instant::now();
                        tracing::info!(
                            "downloading {} {} ref {} at revision {}",
                            resolution.kind,
                            reference.repo_name(),
                            reference.version_ref(),
                            rev
                        );
                        if dir.exists() {
                            std::fs::remove_dir_all(&dir)?;
                        }
                        self.download_and_unpack(owner, reference, rev, &dir)?;
                        self.install_dependencies(&dir);
                        if let Some(parent) = marker.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&marker, rev)?;
                        tracing::info!(
                            "finished download in {}ms",
                            start.elapsed().as_millis()
                        );
                    }
                    dir
                }
            }
        };

        if resolution.kind == PluginKind::Library
            && !install_path.join(BUILD_MANIFEST_FILE).exists()
        {
            let start = Instant::now();
            tracing::info!("building library {}", reference.ident());
            build_library(reference.ident(), &install_path)?;
            tracing::info!(
                "done building library {} in {}ms",
                reference.ident(),
                start.elapsed().as_millis()
            );
        }

        Ok(ResolvedPlugin {
            reference: reference.clone(),
            kind: resolution.kind,
            revision: resolution.revision.clone(),
            install_path,
        })
    }

    /// Resolve and install the whole manifest.
    ///
    /// Revision lookups are concurrent; installs run strictly sequentially
    /// in manifest order.
    pub fn install_manifest(
        &self,
        manifest: &ProjectManifest,
        build_library: &mut LibraryBuilder<'_>,
    ) -> Result<Vec<ResolvedPlugin>> {
        let resolutions = if self.config.offline {
            manifest
                .entries()
                .into_iter()
                .map(|(kind, reference)| {
                    let marker = self.marker_path(kind, reference);
                    let revision = std::fs::read_to_string(&marker)
                        .map(|rev| Revision::Pinned(rev.trim().to_string()))
                        .unwrap_or(Revision::Local);
                    Resolution {
                        reference: reference.clone(),
                        kind,
                        revision,
                    }
                })
                .collect()
        } else {
            self.resolve_manifest(manifest)?
        };

        resolutions
            .iter()
            .map(|resolution| self.install(resolution, build_library))
            .collect()
    }

    // Helper methods

    /// Build the Critical error for an exhausted request quota.
    ///
    /// Queries the remote for its reset time so the message can carry a
    /// concrete retry-after; the caller never retries or blocks.
    fn rate_limit_error(&self) -> Error {
        let url = format!("{}/rate_limit", self.config.api_base);
        let reset = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, "langforge")
            .send()
            .and_then(|response| response.json::<RateLimitInfo>())
            .map(|info| info.rate.reset)
            .ok();

        match reset {
            Some(reset) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Error::RateLimited {
                    retry_after_secs: reset.saturating_sub(now),
                }
            }
            None => Error::critical("remote rate limit exhausted, reset time unavailable"),
        }
    }

    fn download_and_unpack(
        &self,
        owner: &str,
        reference: &PluginReference,
        rev: &str,
        dest: &Path,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/{}/archive/{}.tar.gz",
            self.config.archive_base,
            owner,
            reference.repo_name(),
            rev
        );
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, "langforge")
            .send()?;
        if !response.status().is_success() {
            return Err(Error::critical(format!(
                "archive download failed for '{}': {}",
                reference.name,
                response.status()
            )));
        }
        let bytes = response.bytes()?;
        unpack_tar_gz(&bytes, dest)
    }

    fn install_dependencies(&self, dir: &Path) {
        let Some(command) = &self.config.install_command else {
            return;
        };
        if command.is_empty() {
            return;
        }
        tracing::info!("installing dependencies");
        let status = std::process::Command::new(&command[0])
            .args(&command[1..])
            .current_dir(dir)
            .status();
        match status {
            Ok(status) if status.success() => {
                tracing::info!("successfully installed dependencies")
            }
            _ => tracing::error!("failed to install dependencies"),
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .finish()
    }
}

/// Unpack a gzipped tar archive, stripping the leading path component.
fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(bytes);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        // Remote archives nest everything under "<repo>-<rev>/".
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }

        let dest_path = dest.join(&stripped);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest_path)?;
    }

    Ok(())
}
