//! Virtual file system: incremental diffing of generated outputs.
//!
//! For every source file the engine records which outputs the last compile
//! pass produced and their content hashes. Reconciling a new pass against
//! that record yields the minimal set of writes and deletions: unchanged
//! outputs are skipped, stale outputs are removed from disk, and directory
//! chains emptied by a removal are pruned up to a configured boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::plugin::GeneratedFile;
use crate::store::{CrossRunStore, VFS_KEY};

/// Default width of the bounded write pool.
pub const DEFAULT_POOL_SIZE: usize = 32;

/// Map of output path (project-relative) to content hash.
pub type OutputRecord = BTreeMap<String, String>;

/// Configuration for the diff engine.
#[derive(Debug, Clone)]
pub struct VfsConfig {
    /// Root all record keys are relative to.
    pub project_root: PathBuf,
    /// Boundary for upward directory pruning; never removed itself.
    pub prune_root: PathBuf,
    /// Maximum number of writes in flight.
    pub pool_size: usize,
    /// Library mode: update records without touching the disk.
    pub dry_run: bool,
}

impl VfsConfig {
    /// Create a configuration rooted at a project directory.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            prune_root: project_root.clone(),
            project_root,
            pool_size: DEFAULT_POOL_SIZE,
            dry_run: false,
        }
    }

    /// Set the write pool width.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the prune boundary.
    pub fn with_prune_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.prune_root = root.into();
        self
    }

    /// Enable dry-run (library) mode.
    pub fn with_dry_run(mut self, dry: bool) -> Self {
        self.dry_run = dry;
        self
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Outputs written (new or changed hash).
    pub written: usize,
    /// Stale outputs deleted.
    pub deleted: usize,
    /// Outputs left untouched (hash unchanged).
    pub unchanged: usize,
}

/// Compute the content hash used for output records.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// The per-source output record table plus its reconciliation logic.
pub struct VirtualFs {
    config: VfsConfig,
    records: BTreeMap<String, OutputRecord>,
}

impl VirtualFs {
    /// Create an empty virtual file system.
    pub fn new(config: VfsConfig) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
        }
    }

    /// Restore records persisted in the cross-run store.
    pub fn from_store(config: VfsConfig, store: &CrossRunStore) -> Self {
        let records = store
            .get(VFS_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        Self { config, records }
    }

    /// Persist the records into the cross-run store.
    pub fn persist_into(&self, store: &CrossRunStore) -> Result<()> {
        store.set(VFS_KEY, serde_json::to_value(&self.records)?);
        Ok(())
    }

    /// The engine configuration.
    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    /// Record for one source file, if any.
    pub fn record(&self, source: &Path) -> Option<&OutputRecord> {
        self.records.get(&self.key_for(source))
    }

    /// All records, keyed by project-relative source path.
    pub fn records(&self) -> &BTreeMap<String, OutputRecord> {
        &self.records
    }

    /// Recorded source paths.
    pub fn sources(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Drop every record without touching disk.
    ///
    /// Used when a structural change invalidates incremental assumptions and
    /// a full rebuild will regenerate the authoritative record.
    pub fn flush(&mut self) {
        self.records.clear();
    }

    /// Reconcile one source file's fresh outputs against its previous record.
    pub fn reconcile(
        &mut self,
        source: &Path,
        outputs: Vec<GeneratedFile>,
    ) -> Result<ReconcileStats> {
        let source_key = self.key_for(source);
        let previous = self.records.remove(&source_key).unwrap_or_default();

        // Last emit wins when a pass produces the same path twice.
        let mut pending: BTreeMap<String, GeneratedFile> = BTreeMap::new();
        for file in outputs {
            pending.insert(self.key_for(&file.path), file);
        }

        let mut stats = ReconcileStats::default();
        let mut fresh = OutputRecord::new();
        let mut to_write: Vec<(PathBuf, Vec<u8>)> = Vec::new();

        for (key, file) in pending {
            let hash = hash_bytes(&file.contents);
            if previous.get(&key).map(String::as_str) == Some(hash.as_str()) {
                stats.unchanged += 1;
            } else {
                to_write.push((self.abs_for(&key), file.contents));
            }
            fresh.insert(key, hash);
        }

        let stale: Vec<String> = previous
            .keys()
            .filter(|k| !fresh.contains_key(*k))
            .cloned()
            .collect();
        stats.deleted = stale.len();
        stats.written = to_write.len();

        if !self.config.dry_run {
            self.write_bounded(to_write)?;

            let mut emptied_dirs = BTreeSet::new();
            for key in &stale {
                let path = self.abs_for(key);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                if let Some(parent) = path.parent() {
                    emptied_dirs.insert(parent.to_path_buf());
                }
            }
            for dir in emptied_dirs {
                self.prune_upward(&dir);
            }
        }

        if !fresh.is_empty() {
            self.records.insert(source_key, fresh);
        }

        Ok(stats)
    }

    /// Reconcile every recorded source whose file no longer exists on disk.
    ///
    /// Run at idle or shutdown so that deleting a source outside the watched
    /// pipeline still cleans up its orphaned outputs.
    pub fn sweep_missing_sources(&mut self) -> Result<Vec<String>> {
        let missing: Vec<String> = self
            .records
            .keys()
            .filter(|key| !self.config.project_root.join(key).exists())
            .cloned()
            .collect();

        for key in &missing {
            tracing::info!("cleaning up outputs of removed source {}", key);
            let abs = self.config.project_root.join(key);
            self.reconcile(&abs, Vec::new())?;
        }

        Ok(missing)
    }

    // Helper methods

    fn key_for(&self, path: &Path) -> String {
        let rel = path
            .strip_prefix(&self.config.project_root)
            .unwrap_or(path);
        rel.to_string_lossy().replace('\\', "/")
    }

    fn abs_for(&self, key: &str) -> PathBuf {
        self.config.project_root.join(key)
    }

    /// Write outputs through a pool of at most `pool_size` worker threads.
    ///
    /// Workers pull from a rendezvous channel, so a saturated pool blocks
    /// the producer instead of queueing buffers.
    fn write_bounded(&self, files: Vec<(PathBuf, Vec<u8>)>) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        for (path, _) in &files {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let width = self.config.pool_size.max(1).min(files.len());
        let (tx, rx) = mpsc::sync_channel::<(PathBuf, Vec<u8>)>(0);
        let rx = Mutex::new(rx);
        let failures: Mutex<Vec<std::io::Error>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..width {
                scope.spawn(|| loop {
                    let next = { rx.lock().recv() };
                    let (path, contents) = match next {
                        Ok(item) => item,
                        Err(_) => break,
                    };
                    if let Err(e) = std::fs::write(&path, &contents) {
                        failures.lock().push(e);
                    }
                });
            }

            for item in files {
                if tx.send(item).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        if let Some(e) = failures.into_inner().pop() {
            return Err(Error::critical(format!("output write failed: {}", e)));
        }
        Ok(())
    }

    fn prune_upward(&self, start: &Path) {
        let mut dir = start.to_path_buf();
        loop {
            if dir == self.config.prune_root || !dir.starts_with(&self.config.prune_root) {
                break;
            }
            let empty = match std::fs::read_dir(&dir) {
                Ok(mut entries) => entries.next().is_none(),
                Err(_) => break,
            };
            if !empty || std::fs::remove_dir(&dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

impl std::fmt::Debug for VirtualFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFs")
            .field("config", &self.config)
            .field("sources", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(pairs: &[(&str, &str)]) -> Vec<GeneratedFile> {
        pairs
            .iter()
            .map(|(p, c)| GeneratedFile::new(*p, c.as_bytes().to_vec()))
            .collect()
    }

    fn vfs_in(dir: &Path) -> VirtualFs {
        VirtualFs::new(VfsConfig::new(dir))
    }

    #[test]
    fn test_first_reconcile_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = vfs_in(dir.path());

        let stats = vfs
            .reconcile(
                Path::new("src/a.mcs"),
                outputs(&[("out/a.json", "{}"), ("out/b.json", "[]")]),
            )
            .unwrap();

        assert_eq!(stats.written, 2);
        assert_eq!(stats.deleted, 0);
        assert!(dir.path().join("out/a.json").exists());
        assert!(dir.path().join("out/b.json").exists());

        let record = vfs.record(Path::new("src/a.mcs")).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record["out/a.json"], hash_bytes(b"{}"));
    }

    #[test]
    fn test_identical_second_pass_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = vfs_in(dir.path());

        vfs.reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "{}")]))
            .unwrap();
        let stats = vfs
            .reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "{}")]))
            .unwrap();

        assert_eq!(stats.written, 0);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn test_changed_hash_rewrites_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = vfs_in(dir.path());

        vfs.reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "h1")]))
            .unwrap();
        let stats = vfs
            .reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "h2")]))
            .unwrap();

        assert_eq!(stats.written, 1);
        assert_eq!(stats.deleted, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/a.json")).unwrap(),
            "h2"
        );
    }

    #[test]
    fn test_stale_outputs_deleted_and_dirs_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = vfs_in(dir.path());

        vfs.reconcile(
            Path::new("src/a.mcs"),
            outputs(&[("out/deep/nested/a.json", "{}"), ("out/b.json", "[]")]),
        )
        .unwrap();

        let stats = vfs
            .reconcile(Path::new("src/a.mcs"), outputs(&[("out/b.json", "[]")]))
            .unwrap();

        assert_eq!(stats.deleted, 1);
        assert!(!dir.path().join("out/deep/nested/a.json").exists());
        // Emptied ancestors pruned, but not past the boundary.
        assert!(!dir.path().join("out/deep").exists());
        assert!(dir.path().join("out").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_empty_fresh_mapping_drops_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = vfs_in(dir.path());

        vfs.reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "{}")]))
            .unwrap();
        vfs.reconcile(Path::new("src/a.mcs"), Vec::new()).unwrap();

        assert!(vfs.record(Path::new("src/a.mcs")).is_none());
        assert!(!dir.path().join("out/a.json").exists());
    }

    #[test]
    fn test_missing_stale_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = vfs_in(dir.path());

        vfs.reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "{}")]))
            .unwrap();
        std::fs::remove_file(dir.path().join("out/a.json")).unwrap();

        // Already gone on disk; reconciliation must not fail.
        let stats = vfs.reconcile(Path::new("src/a.mcs"), Vec::new()).unwrap();
        assert_eq!(stats.deleted, 1);
    }

    #[test]
    fn test_sweep_cleans_up_removed_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/kept.mcs"), "x").unwrap();

        let mut vfs = vfs_in(dir.path());
        vfs.reconcile(
            Path::new("src/kept.mcs"),
            outputs(&[("out/kept.json", "{}")]),
        )
        .unwrap();
        vfs.reconcile(
            Path::new("src/gone.mcs"),
            outputs(&[("out/gone.json", "{}")]),
        )
        .unwrap();

        let swept = vfs.sweep_missing_sources().unwrap();
        assert_eq!(swept, vec!["src/gone.mcs".to_string()]);
        assert!(!dir.path().join("out/gone.json").exists());
        assert!(dir.path().join("out/kept.json").exists());
        assert!(vfs.record(Path::new("src/kept.mcs")).is_some());
        assert!(vfs.record(Path::new("src/gone.mcs")).is_none());
    }

    #[test]
    fn test_flush_clears_records_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = vfs_in(dir.path());

        vfs.reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "{}")]))
            .unwrap();
        vfs.flush();

        assert!(vfs.records().is_empty());
        assert!(dir.path().join("out/a.json").exists());
    }

    #[test]
    fn test_dry_run_updates_records_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = VirtualFs::new(VfsConfig::new(dir.path()).with_dry_run(true));

        let stats = vfs
            .reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "{}")]))
            .unwrap();

        assert_eq!(stats.written, 1);
        assert!(!dir.path().join("out/a.json").exists());
        assert!(vfs.record(Path::new("src/a.mcs")).is_some());
    }

    #[test]
    fn test_bounded_pool_small_width() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = VirtualFs::new(VfsConfig::new(dir.path()).with_pool_size(2));

        let many: Vec<(String, String)> = (0..40)
            .map(|i| (format!("out/f{}.txt", i), format!("{}", i)))
            .collect();
        let files = many
            .iter()
            .map(|(p, c)| GeneratedFile::new(p.as_str(), c.as_bytes().to_vec()))
            .collect();

        let stats = vfs.reconcile(Path::new("src/a.mcs"), files).unwrap();
        assert_eq!(stats.written, 40);
        for (p, c) in &many {
            assert_eq!(&std::fs::read_to_string(dir.path().join(p)).unwrap(), c);
        }
    }

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CrossRunStore::load(dir.path()).unwrap();

        let mut vfs = vfs_in(dir.path());
        vfs.reconcile(Path::new("src/a.mcs"), outputs(&[("out/a.json", "{}")]))
            .unwrap();
        vfs.persist_into(&store).unwrap();

        let restored = VirtualFs::from_store(VfsConfig::new(dir.path()), &store);
        assert_eq!(restored.records(), vfs.records());
    }
}
