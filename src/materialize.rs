use std::collections::HashSet;
use std::fs;

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::config::ProgressBudget;
use crate::dataset::{AdapterRegistry, GroupPredicate};
use crate::domain::{ArchiveIdentifier, DataFormat, split_suffix};
use crate::error::PreloadError;
use crate::progress::{CancelToken, ItemProgress, PreloadStatus};
use crate::store::{CacheStore, Leaf, walk_leaves};

pub struct MaterializeContext<'a> {
    pub cache: &'a dyn CacheStore,
    pub adapters: &'a AdapterRegistry,
    pub groups: &'a dyn GroupPredicate,
    pub budget: &'a ProgressBudget,
    pub target_format: Option<DataFormat>,
    pub chunks: Option<&'a [usize]>,
}

#[derive(Debug, Default)]
pub struct Materialized {
    pub written: Vec<String>,
    pub failed: Vec<(String, PreloadError)>,
    pub skipped: usize,
}

impl Materialized {
    pub fn summary(&self) -> String {
        let mut message = format!("Preloaded {} dataset(s).", self.written.len());
        if !self.failed.is_empty() {
            let names = self
                .failed
                .iter()
                .map(|(leaf, err)| format!("{leaf}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            message.push_str(&format!(" {} leaf(s) failed: {names}", self.failed.len()));
        }
        message
    }
}

struct PlannedLeaf<'l> {
    leaf: &'l Leaf,
    format: DataFormat,
    data_id: String,
}

/// Registers every openable leaf below `extract_dir` in the cache and
/// removes the extracted tree afterwards.
///
/// A failing leaf does not stop its siblings. The item only fails when no
/// leaf at all could be stored.
pub fn materialize(
    ctx: &MaterializeContext<'_>,
    id: &ArchiveIdentifier,
    extract_dir: &Utf8Path,
    item: &ItemProgress,
    cancel: &CancelToken,
) -> Result<Materialized, PreloadError> {
    item.update(
        PreloadStatus::Preparing,
        Some(ctx.budget.unpacked()),
        "File processing started.",
    );

    let leaves = walk_leaves(extract_dir, ctx.groups)?;
    let total_bytes: u64 = leaves.iter().map(|leaf| leaf.size).sum();
    let openable = leaves
        .iter()
        .filter_map(|leaf| match leaf.format() {
            Some(format) if ctx.adapters.is_openable(&leaf.path, format) => Some((leaf, format)),
            _ => {
                debug!(
                    leaf = %leaf.path,
                    "file cannot be opened, and thus will not be considered"
                );
                None
            }
        })
        .collect::<Vec<_>>();

    let single = openable.len() == 1;
    let planned = openable
        .into_iter()
        .map(|(leaf, format)| PlannedLeaf {
            data_id: derive_data_id(id, leaf, format, ctx.target_format, single),
            leaf,
            format,
        })
        .collect::<Vec<_>>();

    let mut outcome = Materialized {
        skipped: leaves.len() - planned.len(),
        ..Materialized::default()
    };
    let mut seen = HashSet::new();
    let mut processed = 0u64;
    let mut plan = planned.iter().peekable();

    for leaf in &leaves {
        if cancel.is_cancelled() {
            return Err(PreloadError::Cancelled);
        }
        if let Some(next) = plan.next_if(|planned| std::ptr::eq(planned.leaf, leaf)) {
            let stored = if seen.insert(next.data_id.clone()) {
                store_leaf(ctx, next)
            } else {
                Err(PreloadError::Conversion {
                    leaf: next.leaf.path.to_string(),
                    reason: format!("duplicate data id {}", next.data_id),
                })
            };
            match stored {
                Ok(()) => {
                    info!(data_id = %next.data_id, "dataset written to cache");
                    outcome.written.push(next.data_id.clone());
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(leaf = %next.leaf.path, error = %err, "failed to preload leaf");
                    outcome.failed.push((relative_name(extract_dir, &next.leaf.path), err));
                }
            }
        }
        processed += leaf.size;
        item.update(
            PreloadStatus::Preparing,
            Some(ctx.budget.process_progress(processed, total_bytes)),
            "File processing.",
        );
    }

    fs::remove_dir_all(extract_dir.as_std_path())
        .map_err(|err| PreloadError::Filesystem(format!("remove {extract_dir}: {err}")))?;

    if outcome.written.is_empty() {
        let reason = if outcome.failed.is_empty() {
            "archive contains no dataset that can be opened".to_string()
        } else {
            outcome.summary()
        };
        return Err(PreloadError::Conversion {
            leaf: id.to_string(),
            reason,
        });
    }
    Ok(outcome)
}

fn store_leaf(ctx: &MaterializeContext<'_>, planned: &PlannedLeaf<'_>) -> Result<(), PreloadError> {
    match ctx.target_format {
        Some(target) if target != planned.format => {
            let adapter = ctx.adapters.require(planned.format)?;
            let mut dataset = adapter.open(&planned.leaf.path)?;
            let stripped = dataset.strip_grid_mappings();
            if stripped > 0 {
                debug!(leaf = %planned.leaf.path, stripped, "removed grid mapping attributes");
            }
            if let Some(chunks) = ctx.chunks {
                dataset.rechunk(chunks)?;
            }
            ctx.cache.write(&planned.data_id, &dataset, target, true)
        }
        _ => {
            if ctx.chunks.is_some() {
                warn!(
                    leaf = %planned.leaf.path,
                    "dataset is copied without conversion; chunks are ignored"
                );
            }
            ctx.cache.write_raw(&planned.data_id, &planned.leaf.path, true)
        }
    }
}

/// `{record}/{stem}.{suffix}` for the only leaf of an archive, otherwise
/// `{record}/{stem}/{leaf-stem}.{suffix}`. The suffix is the target
/// format's when the leaf gets converted, else the leaf keeps its own.
pub fn derive_data_id(
    id: &ArchiveIdentifier,
    leaf: &Leaf,
    format: DataFormat,
    target: Option<DataFormat>,
    single: bool,
) -> String {
    let file_name = leaf.path.file_name().unwrap_or(leaf.path.as_str());
    let (leaf_stem, own_suffix) = split_suffix(file_name);
    let suffix = match target {
        Some(target) if target != format => target.suffix(),
        _ => own_suffix.unwrap_or(format.suffix()),
    };
    if single {
        format!("{}.{suffix}", id.stem_id())
    } else {
        format!("{}/{leaf_stem}.{suffix}", id.stem_id())
    }
}

fn relative_name(root: &Utf8Path, path: &Utf8Path) -> String {
    path.strip_prefix(root)
        .map(|relative| relative.to_string())
        .unwrap_or_else(|_| path.to_string())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn leaf(path: &str) -> Leaf {
        Leaf {
            path: Utf8PathBuf::from(path),
            group: None,
            size: 1,
        }
    }

    #[test]
    fn single_leaf_takes_archive_stem() {
        let id: ArchiveIdentifier = "13333034/andorra.zip".parse().unwrap();
        let derived = derive_data_id(
            &id,
            &leaf("/scratch/13333034/andorra/sub/tile.tif"),
            DataFormat::GeoTiff,
            Some(DataFormat::Zarr),
            true,
        );
        assert_eq!(derived, "13333034/andorra.zarr");
    }

    #[test]
    fn multiple_leaves_nest_under_stem() {
        let id: ArchiveIdentifier = "13333034/andorra.tar.gz".parse().unwrap();
        let derived = derive_data_id(
            &id,
            &leaf("/scratch/13333034/andorra/tile_7.tif"),
            DataFormat::GeoTiff,
            Some(DataFormat::NetCdf),
            false,
        );
        assert_eq!(derived, "13333034/andorra/tile_7.nc");
    }

    #[test]
    fn copied_leaf_keeps_its_suffix() {
        let id: ArchiveIdentifier = "1/bundle.zip".parse().unwrap();
        let derived = derive_data_id(
            &id,
            &leaf("/scratch/1/bundle/a.tiff"),
            DataFormat::GeoTiff,
            None,
            false,
        );
        assert_eq!(derived, "1/bundle/a.tiff");

        let derived = derive_data_id(
            &id,
            &leaf("/scratch/1/bundle/cube.zarr"),
            DataFormat::Zarr,
            Some(DataFormat::Zarr),
            true,
        );
        assert_eq!(derived, "1/bundle.zarr");
    }
}
