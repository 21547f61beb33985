use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_ENDPOINT, PreloadParams, ProgressBudget};
use crate::dataset::{AdapterRegistry, GroupPredicate, SentinelGroups};
use crate::domain::ArchiveIdentifier;
use crate::error::PreloadError;
use crate::fetch::{fetch_archive, scratch_archive_path};
use crate::materialize::{MaterializeContext, materialize};
use crate::progress::{
    CancelToken, ItemProgress, LogObserver, PreloadObserver, PreloadState, PreloadStatus,
};
use crate::store::{CacheStore, SCRATCH_DIR};
use crate::transport::{Transport, record_file_uri};
use crate::unpack::unpack_archive;

#[derive(Debug, Clone, Copy)]
enum Stage {
    Download,
    Decompress,
    Prepare,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => write!(f, "Download"),
            Stage::Decompress => write!(f, "Decompression"),
            Stage::Prepare => write!(f, "File processing"),
        }
    }
}

/// A data id that was not accepted into a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedId {
    pub data_id: String,
    pub reason: String,
}

/// Builds preload batches against one cache store.
///
/// Only one batch per cache store may be in flight at a time; batches
/// share the scratch directory below the cache root.
#[derive(Clone)]
pub struct Preloader {
    cache: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    adapters: Arc<AdapterRegistry>,
    groups: Arc<dyn GroupPredicate>,
    budget: ProgressBudget,
    endpoint: String,
    scratch_root: Utf8PathBuf,
}

impl Preloader {
    pub fn new(cache: Arc<dyn CacheStore>, transport: Arc<dyn Transport>) -> Self {
        let scratch_root = cache.root().join(SCRATCH_DIR);
        Self {
            cache,
            transport,
            adapters: Arc::new(AdapterRegistry::passthrough()),
            groups: Arc::new(SentinelGroups::default()),
            budget: ProgressBudget::default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            scratch_root,
        }
    }

    pub fn with_adapters(mut self, adapters: Arc<AdapterRegistry>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_groups(mut self, groups: Arc<dyn GroupPredicate>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_budget(mut self, budget: ProgressBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: Utf8PathBuf) -> Self {
        self.scratch_root = scratch_root;
        self
    }

    pub fn scratch_root(&self) -> &Utf8Path {
        &self.scratch_root
    }

    /// Validates the request and sorts the data ids into skipped, dropped
    /// and queued items. Nothing is downloaded until `PreloadHandle::run`.
    pub fn prepare<I, S>(
        &self,
        data_ids: I,
        params: PreloadParams,
    ) -> Result<PreloadHandle, PreloadError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let params = params.validate()?;
        purge_scratch(&self.scratch_root)?;
        let cached = self.cache.list_ids()?;

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut dropped = Vec::new();
        let mut skipped = Vec::new();
        for raw in data_ids {
            let raw = raw.as_ref();
            let id = match raw.parse::<ArchiveIdentifier>() {
                Ok(id) => id,
                Err(err) => {
                    warn!(data_id = %raw, "{err}; data id is ignored");
                    dropped.push(DroppedId {
                        data_id: raw.to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(id.clone()) {
                debug!(data_id = %id, "duplicate data id collapsed");
                continue;
            }
            let already = !params.force && cached.iter().any(|cache_id| id.owns(cache_id));
            if !already && !id.is_archive() {
                let err = PreloadError::UnsupportedFormat(format!(
                    "{id} is not a supported archive and needs no preload"
                ));
                warn!(data_id = %id, "{err}; data id is ignored");
                dropped.push(DroppedId {
                    data_id: id.to_string(),
                    reason: err.to_string(),
                });
                continue;
            }
            if already {
                skipped.push(items.len());
            }
            items.push(BatchItem {
                progress: Arc::new(ItemProgress::new(id.as_str())),
                id,
            });
        }

        if !params.silent {
            let observer: Arc<dyn PreloadObserver> = Arc::new(LogObserver);
            for item in &items {
                item.progress.subscribe(Arc::clone(&observer));
            }
        }
        for &index in &skipped {
            let item = &items[index];
            info!(data_id = %item.id, "data id is already preloaded");
            item.progress
                .update(PreloadStatus::Preloaded, Some(1.0), "Already preloaded.");
        }
        let queue = (0..items.len())
            .filter(|index| !skipped.contains(index))
            .collect();

        let batch = Batch {
            cache: Arc::clone(&self.cache),
            transport: Arc::clone(&self.transport),
            adapters: Arc::clone(&self.adapters),
            groups: Arc::clone(&self.groups),
            budget: self.budget,
            endpoint: self.endpoint.clone(),
            scratch_root: self.scratch_root.clone(),
            params,
            items,
            queue,
            cancel: CancelToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            run_lock: Mutex::new(()),
        };
        Ok(PreloadHandle {
            batch: Arc::new(batch),
            dropped,
            runner: Mutex::new(None),
        })
    }

    /// `prepare` followed by `run`. With `blocking` set the call returns
    /// once every item is terminal and the batch has been closed.
    pub fn preload<I, S>(
        &self,
        data_ids: I,
        params: PreloadParams,
    ) -> Result<PreloadHandle, PreloadError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let handle = self.prepare(data_ids, params)?;
        handle.run()?;
        Ok(handle)
    }
}

fn purge_scratch(scratch_root: &Utf8Path) -> Result<(), PreloadError> {
    if scratch_root.as_std_path().exists() {
        debug!(%scratch_root, "removing stale scratch files");
        fs::remove_dir_all(scratch_root.as_std_path())
            .map_err(|err| PreloadError::Filesystem(format!("remove {scratch_root}: {err}")))?;
    }
    Ok(())
}

struct BatchItem {
    id: ArchiveIdentifier,
    progress: Arc<ItemProgress>,
}

struct Batch {
    cache: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    adapters: Arc<AdapterRegistry>,
    groups: Arc<dyn GroupPredicate>,
    budget: ProgressBudget,
    endpoint: String,
    scratch_root: Utf8PathBuf,
    params: PreloadParams,
    items: Vec<BatchItem>,
    queue: Vec<usize>,
    cancel: CancelToken,
    started: AtomicBool,
    closed: AtomicBool,
    run_lock: Mutex<()>,
}

impl Batch {
    fn download(&self, item: &BatchItem) -> Result<Utf8PathBuf, PreloadError> {
        let uri = record_file_uri(&self.endpoint, &item.id);
        let destination =
            scratch_archive_path(&self.scratch_root, item.id.record(), item.id.filename());
        fetch_archive(
            self.transport.as_ref(),
            &uri,
            &destination,
            &self.budget,
            &item.progress,
            &self.cancel,
        )?;
        Ok(destination)
    }

    fn decompress(&self, item: &BatchItem, archive: &Utf8Path) -> Result<Utf8PathBuf, PreloadError> {
        let container = item
            .id
            .container()
            .ok_or_else(|| PreloadError::UnsupportedFormat(item.id.to_string()))?;
        let target_dir = self
            .scratch_root
            .join(item.id.record())
            .join(format!("{}.unpacked", item.id.filename()));
        unpack_archive(archive, container, &target_dir, &self.budget, &item.progress)?;
        Ok(target_dir)
    }

    fn prepare(&self, item: &BatchItem, extract_dir: &Utf8Path) -> Result<(), PreloadError> {
        let ctx = MaterializeContext {
            cache: self.cache.as_ref(),
            adapters: self.adapters.as_ref(),
            groups: self.groups.as_ref(),
            budget: &self.budget,
            target_format: self.params.target_format,
            chunks: self.params.chunks.as_deref(),
        };
        let outcome = materialize(&ctx, &item.id, extract_dir, &item.progress, &self.cancel)?;
        info!(
            data_id = %item.id,
            written = outcome.written.len(),
            failed = outcome.failed.len(),
            skipped = outcome.skipped,
            "preload finished"
        );
        item.progress
            .update(PreloadStatus::Preloaded, Some(1.0), outcome.summary());
        Ok(())
    }

    fn begin(&self, item: &BatchItem) {
        item.progress
            .update(PreloadStatus::Started, Some(0.0), "Preload started.");
    }

    fn settle(&self, item: &BatchItem, stage: Stage, err: PreloadError) {
        if err.is_cancelled() {
            item.progress.cancel("Preload has been cancelled by user.");
            return;
        }
        warn!(data_id = %item.id, %stage, error = %err, "preload failed");
        item.progress.fail(format!("{stage} failed."), &err);
    }

    fn run_sequential(&self) {
        let _running = lock(&self.run_lock);
        for &index in &self.queue {
            if self.cancel.is_cancelled() {
                break;
            }
            let item = &self.items[index];
            self.begin(item);
            let archive = match self.download(item) {
                Ok(archive) => archive,
                Err(err) => {
                    self.settle(item, Stage::Download, err);
                    continue;
                }
            };
            let extract_dir = match self.decompress(item, &archive) {
                Ok(dir) => dir,
                Err(err) => {
                    self.settle(item, Stage::Decompress, err);
                    continue;
                }
            };
            if let Err(err) = self.prepare(item, &extract_dir) {
                self.settle(item, Stage::Prepare, err);
            }
        }
        self.finish();
    }

    /// One worker per stage. Each stage consumes the previous stage's
    /// output for an item only after that stage has sent it.
    fn run_pipeline(self: Arc<Self>) {
        let _running = lock(&self.run_lock);
        let (fetched_tx, fetched_rx) = mpsc::channel::<(usize, Utf8PathBuf)>();
        let (unpacked_tx, unpacked_rx) = mpsc::channel::<(usize, Utf8PathBuf)>();

        let workers = [
            {
                let batch = Arc::clone(&self);
                spawn_stage("preload-download", move || batch.download_worker(fetched_tx))
            },
            {
                let batch = Arc::clone(&self);
                spawn_stage("preload-decompress", move || {
                    batch.decompress_worker(fetched_rx, unpacked_tx)
                })
            },
            {
                let batch = Arc::clone(&self);
                spawn_stage("preload-prepare", move || batch.prepare_worker(unpacked_rx))
            },
        ];
        for worker in workers.into_iter().flatten() {
            if worker.join().is_err() {
                warn!("preload stage worker panicked");
            }
        }
        self.finish();
    }

    fn download_worker(&self, fetched: Sender<(usize, Utf8PathBuf)>) {
        for &index in &self.queue {
            if self.cancel.is_cancelled() {
                break;
            }
            let item = &self.items[index];
            self.begin(item);
            match self.download(item) {
                Ok(archive) => {
                    if fetched.send((index, archive)).is_err() {
                        break;
                    }
                }
                Err(err) => self.settle(item, Stage::Download, err),
            }
        }
    }

    fn decompress_worker(
        &self,
        fetched: Receiver<(usize, Utf8PathBuf)>,
        unpacked: Sender<(usize, Utf8PathBuf)>,
    ) {
        for (index, archive) in fetched {
            if self.cancel.is_cancelled() {
                break;
            }
            let item = &self.items[index];
            match self.decompress(item, &archive) {
                Ok(dir) => {
                    if unpacked.send((index, dir)).is_err() {
                        break;
                    }
                }
                Err(err) => self.settle(item, Stage::Decompress, err),
            }
        }
    }

    fn prepare_worker(&self, unpacked: Receiver<(usize, Utf8PathBuf)>) {
        for (index, extract_dir) in unpacked {
            if self.cancel.is_cancelled() {
                break;
            }
            let item = &self.items[index];
            if let Err(err) = self.prepare(item, &extract_dir) {
                self.settle(item, Stage::Prepare, err);
            }
        }
    }

    /// Settles items a run left behind and closes the batch.
    fn finish(&self) {
        if self.cancel.is_cancelled() {
            self.mark_cancelled();
        } else {
            for item in self.items.iter().filter(|item| !item.progress.is_terminal()) {
                item.progress.fail(
                    "Preload did not complete.",
                    PreloadError::Worker("stage worker stopped before the item finished".into()),
                );
            }
        }
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to clean up after preload");
        }
    }

    fn mark_cancelled(&self) {
        for item in &self.items {
            item.progress.cancel("Preload has been cancelled by user.");
        }
    }

    /// Removes cache entries of every item that did not reach `preloaded`,
    /// unless a preloaded item owns them too, and deletes the scratch
    /// directory. Runs at most once.
    fn close(&self) -> Result<(), PreloadError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (kept, stale): (Vec<_>, Vec<_>) = self
            .items
            .iter()
            .partition(|item| item.progress.status() == PreloadStatus::Preloaded);
        if !stale.is_empty() {
            match self.cache.list_ids() {
                Ok(ids) => {
                    for cache_id in ids {
                        // A preloaded sibling sharing the stem keeps its entries.
                        if kept.iter().any(|item| item.id.owns(&cache_id)) {
                            continue;
                        }
                        if stale.iter().any(|item| item.id.owns(&cache_id)) {
                            debug!(%cache_id, "removing incomplete cache entry");
                            if let Err(err) = self.cache.delete(&cache_id) {
                                warn!(%cache_id, error = %err, "failed to remove cache entry");
                            }
                        }
                    }
                }
                Err(err) => warn!(error = %err, "failed to list cache entries"),
            }
        }
        purge_scratch(&self.scratch_root)
    }
}

fn spawn_stage<F>(name: &str, work: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(work) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(worker = name, error = %err, "failed to start preload worker");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle on one preload batch.
///
/// Observers run on the stage threads; they must not call `cancel`, `close`
/// or `wait` on the handle. Use the `CancelToken` from `cancel_token`
/// instead.
pub struct PreloadHandle {
    batch: Arc<Batch>,
    dropped: Vec<DroppedId>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PreloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadHandle")
            .field("items", &self.states())
            .field("dropped", &self.dropped)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PreloadHandle {
    /// Executes the batch: in the calling thread when `blocking` is set,
    /// otherwise on background stage workers. Calling it twice is a no-op.
    pub fn run(&self) -> Result<(), PreloadError> {
        if self.batch.closed.load(Ordering::SeqCst) {
            warn!("preload batch is already closed");
            return Ok(());
        }
        if self.batch.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.batch.params.blocking {
            self.batch.run_sequential();
            return Ok(());
        }
        let batch = Arc::clone(&self.batch);
        let runner = thread::Builder::new()
            .name("preload-supervisor".to_string())
            .spawn(move || batch.run_pipeline())
            .map_err(|err| PreloadError::Worker(err.to_string()))?;
        *lock(&self.runner) = Some(runner);
        Ok(())
    }

    /// Blocks until a background run has finished and the batch is closed.
    pub fn wait(&self) {
        let runner = lock(&self.runner).take();
        if let Some(runner) = runner {
            if runner.join().is_err() {
                warn!("preload supervisor panicked");
            }
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.batch.cancel.clone()
    }

    /// Stops the batch at the next chunk, leaf or item boundary, marks all
    /// unfinished items cancelled and cleans up.
    pub fn cancel(&self) {
        self.batch.cancel.cancel();
        self.wait();
        let _idle = lock(&self.batch.run_lock);
        self.batch.mark_cancelled();
        if let Err(err) = self.batch.close() {
            warn!(error = %err, "failed to clean up after cancellation");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.batch.cancel.is_cancelled()
    }

    /// Cleans up scratch files and incomplete cache entries. A batch that
    /// is still running is cancelled first.
    pub fn close(&self) -> Result<(), PreloadError> {
        if self.batch.started.load(Ordering::SeqCst) && !self.is_finished() {
            self.cancel();
            return Ok(());
        }
        self.batch.close()
    }

    pub fn is_closed(&self) -> bool {
        self.batch.closed.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.batch
            .items
            .iter()
            .all(|item| item.progress.is_terminal())
            && self.is_closed()
    }

    pub fn subscribe(&self, observer: Arc<dyn PreloadObserver>) {
        for item in &self.batch.items {
            item.progress.subscribe(Arc::clone(&observer));
        }
    }

    pub fn states(&self) -> Vec<PreloadState> {
        self.batch
            .items
            .iter()
            .map(|item| item.progress.snapshot())
            .collect()
    }

    pub fn state(&self, data_id: &str) -> Option<PreloadState> {
        self.batch
            .items
            .iter()
            .find(|item| item.id.as_str() == data_id)
            .map(|item| item.progress.snapshot())
    }

    pub fn dropped(&self) -> &[DroppedId] {
        &self.dropped
    }

    pub fn params(&self) -> &PreloadParams {
        &self.batch.params
    }
}
