use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;
use tracing::{debug, warn};

use crate::dataset::{AdapterRegistry, Dataset, FormatAdapter, GroupPredicate, SentinelGroups};
use crate::domain::{DataFormat, identify_data_format};
use crate::error::PreloadError;

/// Directory below the cache root that holds scratch files of a batch.
pub const SCRATCH_DIR: &str = "downloads";

/// Persistent store of materialized datasets, keyed by data id.
pub trait CacheStore: Send + Sync {
    fn root(&self) -> &Utf8Path;

    fn has(&self, id: &str) -> bool;

    fn list_ids(&self) -> Result<Vec<String>, PreloadError>;

    fn open(
        &self,
        id: &str,
        adapter: Option<&dyn FormatAdapter>,
    ) -> Result<Dataset, PreloadError>;

    fn write(
        &self,
        id: &str,
        dataset: &Dataset,
        format: DataFormat,
        replace: bool,
    ) -> Result<(), PreloadError>;

    /// Stores the file or directory at `source` under `id` byte for byte.
    fn write_raw(&self, id: &str, source: &Utf8Path, replace: bool) -> Result<(), PreloadError>;

    fn delete(&self, id: &str) -> Result<(), PreloadError>;
}

/// A file or dataset group found while walking a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub path: Utf8PathBuf,
    /// Set when the leaf is a directory recognized as one dataset group.
    pub group: Option<DataFormat>,
    pub size: u64,
}

impl Leaf {
    pub fn format(&self) -> Option<DataFormat> {
        self.group.or_else(|| identify_data_format(self.path.as_str()))
    }
}

/// Lists every file below `root`, treating directories accepted by
/// `groups` as single leaves. Results are sorted by path.
pub fn walk_leaves(root: &Utf8Path, groups: &dyn GroupPredicate) -> Result<Vec<Leaf>, PreloadError> {
    walk(root, groups, None)
}

fn walk(
    root: &Utf8Path,
    groups: &dyn GroupPredicate,
    exclude: Option<&Utf8Path>,
) -> Result<Vec<Leaf>, PreloadError> {
    let mut leaves = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| PreloadError::Filesystem(format!("read {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| PreloadError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
                PreloadError::Filesystem(format!("non-utf8 path: {}", path.display()))
            })?;
            if exclude.is_some_and(|excluded| path.as_path() == excluded) {
                continue;
            }
            if path.as_std_path().is_dir() {
                match groups.group_format(&path) {
                    Some(format) => leaves.push(Leaf {
                        size: dir_size(path.as_std_path())?,
                        path,
                        group: Some(format),
                    }),
                    None => stack.push(path),
                }
            } else {
                let size = entry
                    .metadata()
                    .map_err(|err| PreloadError::Filesystem(err.to_string()))?
                    .len();
                leaves.push(Leaf {
                    path,
                    group: None,
                    size,
                });
            }
        }
    }
    leaves.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(leaves)
}

pub fn dir_size(root: &Path) -> Result<u64, PreloadError> {
    let mut total = 0;
    for path in walk_dir(root)? {
        if path.is_file() {
            total += fs::metadata(&path)
                .map_err(|err| PreloadError::Filesystem(err.to_string()))?
                .len();
        }
    }
    Ok(total)
}

/// Cache store keeping every dataset at `{root}/{id}`.
#[derive(Clone)]
pub struct FsCacheStore {
    root: Utf8PathBuf,
    adapters: Arc<AdapterRegistry>,
    groups: Arc<dyn GroupPredicate>,
}

impl FsCacheStore {
    pub fn new(
        root: Utf8PathBuf,
        adapters: Arc<AdapterRegistry>,
        groups: Arc<dyn GroupPredicate>,
    ) -> Self {
        Self {
            root,
            adapters,
            groups,
        }
    }

    /// Store with pass-through adapters and the default zarr group markers.
    pub fn with_defaults(root: Utf8PathBuf) -> Self {
        Self::new(
            root,
            Arc::new(AdapterRegistry::passthrough()),
            Arc::new(SentinelGroups::default()),
        )
    }

    pub fn default_root() -> Result<Utf8PathBuf, PreloadError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.cache_dir().join("zenodo-preload")).ok()
            })
            .ok_or_else(|| {
                PreloadError::Filesystem("unable to resolve cache directory".to_string())
            })
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn groups(&self) -> &Arc<dyn GroupPredicate> {
        &self.groups
    }

    pub fn scratch_root(&self) -> Utf8PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    pub fn ensure_root(&self) -> Result<(), PreloadError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))
    }

    /// Removes every cached dataset and any scratch leftovers.
    pub fn clear(&self) -> Result<(), PreloadError> {
        if self.root.as_std_path().exists() {
            fs::remove_dir_all(self.root.as_std_path())
                .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn entry_path(&self, id: &str) -> Result<Utf8PathBuf, PreloadError> {
        let relative = Utf8Path::new(id);
        let valid = !id.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, camino::Utf8Component::Normal(_)))
            && relative.components().next().map(|first| first.as_str()) != Some(SCRATCH_DIR);
        if !valid {
            return Err(PreloadError::InvalidIdentifier(id.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn adapter_for(&self, path: &Utf8Path) -> Result<Arc<dyn FormatAdapter>, PreloadError> {
        let format = self
            .groups
            .group_format(path)
            .or_else(|| identify_data_format(path.as_str()))
            .ok_or_else(|| PreloadError::UnsupportedFormat(path.to_string()))?;
        self.adapters.require(format)
    }

    fn prepare_destination(&self, path: &Utf8Path, replace: bool) -> Result<(), PreloadError> {
        if path.as_std_path().exists() {
            if !replace {
                return Err(PreloadError::Filesystem(format!(
                    "cache entry already exists: {path}"
                )));
            }
            remove_path(path.as_std_path())
                .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Removes directories left empty by a delete, stopping at the root.
    fn prune_empty_parents(&self, path: &Utf8Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root.as_path() || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(dir.as_std_path()).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    pub fn copy_dir_recursive(source: &Utf8Path, dest: &Utf8Path) -> Result<(), PreloadError> {
        fs::create_dir_all(dest.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        for entry in walk_dir(source.as_std_path())? {
            let relative = entry
                .strip_prefix(source.as_std_path())
                .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
            let target = dest.as_std_path().join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
                }
                fs::copy(&entry, &target)
                    .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn copy_dir_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), PreloadError> {
        let parent = dest
            .parent()
            .ok_or_else(|| PreloadError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        let temp_dir = Builder::new()
            .prefix(".zenodo-preload-copy")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        let temp_path = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf())
            .map_err(|_| PreloadError::Filesystem("invalid temp dir".to_string()))?;
        Self::copy_dir_recursive(source, &temp_path)?;
        atomic_rename_dir(temp_path.as_std_path(), dest.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), PreloadError> {
        let parent = dest
            .parent()
            .ok_or_else(|| PreloadError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".zenodo-preload-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        if dest.as_std_path().exists() {
            fs::remove_file(dest.as_std_path())
                .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        }
        temp.persist(dest.as_std_path())
            .map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl CacheStore for FsCacheStore {
    fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn has(&self, id: &str) -> bool {
        self.entry_path(id)
            .map(|path| path.as_std_path().exists())
            .unwrap_or(false)
    }

    fn list_ids(&self) -> Result<Vec<String>, PreloadError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let scratch = self.scratch_root();
        let leaves = walk(&self.root, self.groups.as_ref(), Some(scratch.as_path()))?;
        let mut ids = Vec::new();
        for leaf in leaves {
            let Ok(relative) = leaf.path.strip_prefix(&self.root) else {
                continue;
            };
            if relative.components().any(|part| part.as_str().starts_with('.')) {
                continue;
            }
            if leaf.format().is_some() {
                ids.push(relative.as_str().to_string());
            }
        }
        Ok(ids)
    }

    fn open(
        &self,
        id: &str,
        adapter: Option<&dyn FormatAdapter>,
    ) -> Result<Dataset, PreloadError> {
        let path = self.entry_path(id)?;
        if !path.as_std_path().exists() {
            return Err(PreloadError::NotFound(id.to_string()));
        }
        match adapter {
            Some(adapter) => adapter.open(&path),
            None => self.adapter_for(&path)?.open(&path),
        }
    }

    fn write(
        &self,
        id: &str,
        dataset: &Dataset,
        format: DataFormat,
        replace: bool,
    ) -> Result<(), PreloadError> {
        let adapter = self.adapters.require(format)?;
        let path = self.entry_path(id)?;
        self.prepare_destination(&path, replace)?;
        debug!(%id, %format, "writing dataset to cache");
        if let Err(err) = adapter.write(dataset, &path) {
            if let Err(cleanup) = remove_path(path.as_std_path()) {
                warn!(%path, error = %cleanup, "failed to remove incomplete cache entry");
            }
            return Err(err);
        }
        Ok(())
    }

    fn write_raw(&self, id: &str, source: &Utf8Path, replace: bool) -> Result<(), PreloadError> {
        let path = self.entry_path(id)?;
        self.prepare_destination(&path, replace)?;
        debug!(%id, %source, "copying dataset to cache");
        if source.as_std_path().is_dir() {
            Self::copy_dir_atomic(source, &path)
        } else {
            Self::copy_file_atomic(source, &path)
        }
    }

    fn delete(&self, id: &str) -> Result<(), PreloadError> {
        let path = self.entry_path(id)?;
        if !path.as_std_path().exists() {
            return Err(PreloadError::NotFound(id.to_string()));
        }
        remove_path(path.as_std_path()).map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        self.prune_empty_parents(&path);
        Ok(())
    }
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, PreloadError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| PreloadError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PreloadError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

pub fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}
