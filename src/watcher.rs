//! Filesystem watcher.
//!
//! Subscribes recursively under the project root, normalizes platform events
//! into a small tagged set, and feeds debounced work items to a single
//! background worker that serializes behind the indexer's writer mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{IndexError, IndexResult};
use crate::filter::PathFilter;
use crate::indexer::Indexer;
use crate::status::StatusRegistry;

/// Debounce window: repeated events for one path within this interval
/// collapse to a single work item, and the timer resets on each event.
pub const DEBOUNCE_MS: u64 = 500;

/// Bound on queued work items.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Poll interval while the project root is missing.
const ROOT_POLL_SECS: u64 = 5;

type FsDebouncer =
    notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>;

/// Normalized filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Moved(PathBuf, PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkItem {
    Index(PathBuf),
    Remove(PathBuf),
}

impl WorkItem {
    fn key(&self) -> (PathBuf, bool) {
        match self {
            WorkItem::Index(p) => (p.clone(), false),
            WorkItem::Remove(p) => (p.clone(), true),
        }
    }
}

/// Collapse a debounced platform event into the tagged set. Renames become a
/// `Moved` pair when both ends are known, otherwise their visible half.
pub fn normalize_event(event: &DebouncedEvent) -> Vec<FsEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(FsEvent::Created).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(FsEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![FsEvent::Moved(event.paths[0].clone(), event.paths[1].clone())]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().cloned().map(FsEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(FsEvent::Created).collect()
        }
        EventKind::Modify(_) => event.paths.iter().cloned().map(FsEvent::Modified).collect(),
        _ => Vec::new(),
    }
}

/// Turn one normalized event into work items. Creations and modifications of
/// ineligible paths are dropped at emission time; deletions always propagate
/// so stale rows get removed. A move is a synthetic delete-then-create.
fn expand_event(event: FsEvent, filter: &PathFilter) -> Vec<WorkItem> {
    match event {
        FsEvent::Created(path) | FsEvent::Modified(path) => {
            if filter.is_eligible(&path) {
                vec![WorkItem::Index(path)]
            } else {
                Vec::new()
            }
        }
        FsEvent::Deleted(path) => vec![WorkItem::Remove(path)],
        FsEvent::Moved(src, dst) => {
            let mut items = vec![WorkItem::Remove(src)];
            if filter.is_eligible(&dst) {
                items.push(WorkItem::Index(dst));
            }
            items
        }
    }
}

pub struct ProjectWatcher {
    debouncer: Arc<parking_lot::Mutex<Option<FsDebouncer>>>,
    worker: tokio::task::JoinHandle<()>,
    monitor: tokio::task::JoinHandle<()>,
}

impl ProjectWatcher {
    /// Start watching the indexer's project root.
    pub fn spawn(indexer: Arc<Indexer>) -> IndexResult<Self> {
        let root = indexer.project_root().to_path_buf();
        let filter = indexer.filter().clone();
        let status = indexer.status().clone();

        let (tx, mut rx) = mpsc::channel::<WorkItem>(EVENT_QUEUE_CAPACITY);
        let pending: Arc<DashMap<(PathBuf, bool), ()>> = Arc::new(DashMap::new());

        let debouncer = build_debouncer(
            &root,
            filter,
            status.clone(),
            tx.clone(),
            pending.clone(),
        )?;
        let slot = Arc::new(parking_lot::Mutex::new(Some(debouncer)));
        info!(
            root = %root.display(),
            debounce_ms = DEBOUNCE_MS,
            "watching project root"
        );

        let worker = {
            let indexer = indexer.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    pending.remove(&item.key());
                    match item {
                        WorkItem::Index(path) => indexer.reconcile_path(&path).await,
                        WorkItem::Remove(path) => {
                            if let Some(rel) = indexer.filter().relative(&path) {
                                indexer.reconcile_removal(&rel).await;
                            }
                        }
                    }
                }
            })
        };

        let monitor = {
            let slot = slot.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(ROOT_POLL_SECS)).await;
                    if root.exists() {
                        continue;
                    }

                    warn!("project root unavailable, suspending watcher");
                    status.set_error("project root unavailable");
                    *slot.lock() = None;

                    while !root.exists() {
                        tokio::time::sleep(Duration::from_secs(ROOT_POLL_SECS)).await;
                    }

                    info!("project root reappeared, resuming watcher");
                    loop {
                        match build_debouncer(
                            &root,
                            indexer.filter().clone(),
                            status.clone(),
                            tx.clone(),
                            pending.clone(),
                        ) {
                            Ok(debouncer) => {
                                *slot.lock() = Some(debouncer);
                                // Reconcile whatever changed while suspended.
                                if let Err(e) = indexer.spawn_full_scan(false) {
                                    info!("skipping catch-up scan: {e}");
                                }
                                break;
                            }
                            Err(e) => {
                                error!("failed to resume watcher: {e}");
                                tokio::time::sleep(Duration::from_secs(ROOT_POLL_SECS)).await;
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            debouncer: slot,
            worker,
            monitor,
        })
    }

    /// Stop the event subscription and both background tasks.
    pub fn shutdown(&self) {
        *self.debouncer.lock() = None;
        self.worker.abort();
        self.monitor.abort();
        info!("watcher stopped");
    }
}

fn build_debouncer(
    root: &Path,
    filter: PathFilter,
    status: Arc<StatusRegistry>,
    tx: mpsc::Sender<WorkItem>,
    pending: Arc<DashMap<(PathBuf, bool), ()>>,
) -> IndexResult<FsDebouncer> {
    let mut debouncer = new_debouncer(
        Duration::from_millis(DEBOUNCE_MS),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in &events {
                    for fs_event in normalize_event(event) {
                        for item in expand_event(fs_event, &filter) {
                            enqueue(&tx, &pending, &status, item);
                        }
                    }
                }
            }
            Err(errors) => {
                for e in errors {
                    warn!("file watcher error: {e:?}");
                }
            }
        },
    )
    .map_err(|e| IndexError::Internal(anyhow::anyhow!("failed to create watcher: {e}")))?;

    debouncer
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| IndexError::Internal(anyhow::anyhow!("failed to watch root: {e}")))?;

    Ok(debouncer)
}

/// Queue one work item, coalescing duplicates for the same path. When the
/// queue is saturated the watcher flips to the overflow state and drops
/// events until a successful full scan drains the backlog.
fn enqueue(
    tx: &mpsc::Sender<WorkItem>,
    pending: &DashMap<(PathBuf, bool), ()>,
    status: &StatusRegistry,
    item: WorkItem,
) {
    if status.is_overflowed() {
        return;
    }
    let key = item.key();
    if pending.insert(key.clone(), ()).is_some() {
        // Already queued for this path.
        return;
    }
    if tx.try_send(item).is_err() {
        pending.remove(&key);
        warn!("watcher queue saturated, dropping events until the next successful scan");
        status.set_error("watcher backlog overflow");
        status.set_overflowed();
    }
}
