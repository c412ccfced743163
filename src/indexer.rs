use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ignore::WalkBuilder;
use rayon::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::chunker;
use crate::config::Settings;
use crate::embedder::EmbeddingProvider;
use crate::error::{IndexError, IndexResult};
use crate::filter::PathFilter;
use crate::status::{IndexState, ProjectStatus, StatusRegistry};
use crate::store::{ChunkRecord, ChunkStore, SearchHit};

/// Delay before the single embedding retry.
const EMBED_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// How long shutdown waits for an in-flight write to finish.
pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrates scan-and-reconcile and single-file updates. Owns the writer
/// mutex: every mutation of the vector store happens under it, while
/// searches and status reads bypass it entirely.
pub struct Indexer {
    settings: Arc<Settings>,
    filter: PathFilter,
    store: ChunkStore,
    embedder: Arc<dyn EmbeddingProvider>,
    status: Arc<StatusRegistry>,
    /// The writer mutex.
    writer: Mutex<()>,
    shutting_down: AtomicBool,
}

impl Indexer {
    pub fn new(
        settings: Arc<Settings>,
        store: ChunkStore,
        embedder: Arc<dyn EmbeddingProvider>,
        status: Arc<StatusRegistry>,
    ) -> IndexResult<Self> {
        let filter = PathFilter::new(&settings.project_root, &settings.ignore_patterns)?;
        Ok(Self {
            settings,
            filter,
            store,
            embedder,
            status,
            writer: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.status
    }

    pub fn status_snapshot(&self) -> ProjectStatus {
        self.status.snapshot()
    }

    pub fn project_root(&self) -> &Path {
        &self.settings.project_root
    }

    /// (Re-)index one file, replacing whatever rows it had.
    pub async fn index_file(&self, abs_path: &Path) -> IndexResult<()> {
        let _guard = self.writer.lock().await;
        self.index_file_locked(abs_path).await
    }

    /// Body of [`index_file`]; caller must hold the writer mutex.
    async fn index_file_locked(&self, abs_path: &Path) -> IndexResult<()> {
        if !self.filter.is_eligible(abs_path) {
            // The file may have rows from before it vanished or became
            // ignored; clear them out.
            if let Some(rel) = self.filter.relative(abs_path) {
                self.store.delete_where_file_path_eq(&rel).await?;
            }
            return Ok(());
        }
        let Some(rel) = self.filter.relative(abs_path) else {
            return Ok(());
        };

        let (hash, mtime) = chunker::hash_file(abs_path)?;

        if let Some((stored_hash, _)) = self.store.file_state(&rel).await? {
            if stored_hash == hash {
                debug!(file = %rel, "content unchanged, skipping re-embed");
                return Ok(());
            }
        }

        let chunks = chunker::extract_chunks(abs_path)?;
        if chunks.is_empty() {
            self.store.delete_where_file_path_eq(&rel).await?;
            return Ok(());
        }

        let vectors = self.embed_documents_with_retry(&chunks).await?;
        let total = chunks.len() as u32;
        let original = abs_path.to_string_lossy().to_string();
        let rows: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| ChunkRecord {
                document_id: format!("{rel}::{i}"),
                file_path: rel.clone(),
                content_hash: hash.clone(),
                last_modified_timestamp: mtime,
                chunk_index: i as u32,
                total_chunks: total,
                extracted_text_chunk: text,
                original_path: original.clone(),
                vector,
            })
            .collect();

        // One logical write: clear the prior generation, insert the new one.
        // Readers see either all old rows or all new rows for this file.
        self.store.delete_where_file_path_eq(&rel).await?;
        self.store.upsert(&rows).await?;
        debug!(file = %rel, chunks = total, "indexed file");
        Ok(())
    }

    /// Delete all rows for one project-relative path. Idempotent.
    pub async fn remove_file(&self, file_path: &str) -> IndexResult<()> {
        let _guard = self.writer.lock().await;
        self.store.delete_where_file_path_eq(file_path).await
    }

    /// Watcher entry point for created/modified paths: index, then refresh
    /// the status chunk count outside the writer mutex.
    pub async fn reconcile_path(&self, abs_path: &Path) {
        if let Err(e) = self.index_file(abs_path).await {
            warn!("incremental index of {} failed: {}", abs_path.display(), e);
        }
        self.refresh_count_if_watching().await;
    }

    /// Watcher entry point for deletions.
    pub async fn reconcile_removal(&self, file_path: &str) {
        if let Err(e) = self.remove_file(file_path).await {
            warn!("removal of {file_path} failed: {e}");
        }
        self.refresh_count_if_watching().await;
    }

    async fn refresh_count_if_watching(&self) {
        if self.status.state() == IndexState::Watching {
            if let Ok(count) = self.store.count().await {
                self.status.refresh_chunk_count(count);
            }
        }
    }

    /// Run a full reconciliation synchronously. Fails fast with
    /// `AlreadyScanning` when a scan is in flight.
    pub async fn full_scan(&self, force: bool) -> IndexResult<()> {
        self.status.begin_scan()?;
        self.scan_to_completion(force).await
    }

    /// Kick off a full reconciliation in the background. The conflict check
    /// happens synchronously so callers get a prompt accept/refuse answer.
    pub fn spawn_full_scan(self: &Arc<Self>, force: bool) -> IndexResult<()> {
        self.status.begin_scan()?;
        let indexer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = indexer.scan_to_completion(force).await {
                error!("background scan failed: {e}");
            }
        });
        Ok(())
    }

    /// Shared tail of both scan entry points; expects status already set to
    /// `Scanning`.
    async fn scan_to_completion(&self, force: bool) -> IndexResult<()> {
        let started = Instant::now();
        match self.run_scan(force).await {
            Ok(processed) => {
                let count = self.store.count().await.unwrap_or(0);
                self.status.set_watching(count);
                self.status.clear_overflow();
                info!(
                    files = processed,
                    chunks = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "scan complete"
                );
                Ok(())
            }
            Err(e) => {
                self.status.set_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_scan(&self, force: bool) -> IndexResult<usize> {
        // One store-level retry is allowed for the whole scan, covering the
        // force wipe, per-file writes, and the stale-row sweep alike; a
        // second store failure aborts.
        let mut store_retry_used = false;

        if force {
            let _guard = self.writer.lock().await;
            if let Err(err) = self.store.delete_all().await {
                spend_store_retry(&mut store_retry_used, err)?;
                self.store.delete_all().await?;
            }
        }

        let index_state = self.store.scan_index_state().await?;

        let root = self.settings.project_root.clone();
        let filter = self.filter.clone();
        let files = tokio::task::spawn_blocking(move || collect_eligible_files(&root, &filter))
            .await
            .map_err(|e| IndexError::Internal(anyhow::anyhow!("file walk panicked: {e}")))?;

        info!(
            eligible = files.len(),
            previously_indexed = index_state.len(),
            force,
            "reconciling index"
        );

        let mut processed = 0usize;
        for path in &files {
            if self.shutting_down.load(Ordering::SeqCst) {
                info!("shutdown requested, stopping scan early");
                return Ok(processed);
            }
            match self.index_file(path).await {
                Ok(()) => processed += 1,
                Err(err @ IndexError::Store(_)) => {
                    spend_store_retry(&mut store_retry_used, err)?;
                    self.index_file(path).await?;
                    processed += 1;
                }
                Err(e) => {
                    // Unreadable file or an embedding failure that survived
                    // its retry: skip this file, keep scanning.
                    warn!("skipping {}: {}", path.display(), e);
                }
            }
        }

        // Files present in the store but no longer eligible on disk.
        let present: HashSet<String> = files
            .iter()
            .filter_map(|p| self.filter.relative(p))
            .collect();
        let stale: Vec<String> = index_state
            .keys()
            .filter(|path| !present.contains(*path))
            .cloned()
            .collect();
        if !stale.is_empty() && !self.shutting_down.load(Ordering::SeqCst) {
            info!(stale = stale.len(), "removing rows for deleted files");
            let _guard = self.writer.lock().await;
            if let Err(err) = self.store.delete_where_file_path_in(&stale).await {
                spend_store_retry(&mut store_retry_used, err)?;
                self.store.delete_where_file_path_in(&stale).await?;
            }
        }

        Ok(processed)
    }

    /// Embed a search query and return the nearest chunks. Never takes the
    /// writer mutex.
    pub async fn search(&self, query: &str, k: usize) -> IndexResult<Vec<SearchHit>> {
        if self.status.state() == IndexState::Initializing {
            return Err(IndexError::NotReady);
        }

        let embedder = self.embedder.clone();
        let query = query.to_string();
        let vector = tokio::task::spawn_blocking(move || embedder.embed_query(&query))
            .await
            .map_err(|e| IndexError::Embed(format!("query embedding panicked: {e}")))??;

        self.store.search(&vector, k).await
    }

    pub async fn count(&self) -> IndexResult<usize> {
        self.store.count().await
    }

    /// Flag shutdown and wait for the in-flight writer, if any. Scans check
    /// the flag between files and exit early, leaving every fully processed
    /// file consistent.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, self.writer.lock()).await {
            Ok(_guard) => info!("writer drained"),
            Err(_) => warn!(
                "writer did not drain within {}s, shutting down anyway",
                WRITER_DRAIN_TIMEOUT.as_secs()
            ),
        }
    }

    async fn embed_documents_with_retry(&self, chunks: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        match self.embed_documents_blocking(chunks).await {
            Ok(vectors) => Ok(vectors),
            Err(e) => {
                warn!("embedding batch failed, retrying once: {e}");
                tokio::time::sleep(EMBED_RETRY_BACKOFF).await;
                self.embed_documents_blocking(chunks).await
            }
        }
    }

    async fn embed_documents_blocking(&self, chunks: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let embedder = self.embedder.clone();
        let texts = chunks.to_vec();
        tokio::task::spawn_blocking(move || embedder.embed_documents(&texts))
            .await
            .map_err(|e| IndexError::Embed(format!("embedding task panicked: {e}")))?
    }
}

/// Consume the scan's single store-retry allowance. Returns `Ok(())` when a
/// retry is still available for this store failure, handing the error back
/// once the allowance is spent (or for non-store errors).
fn spend_store_retry(used: &mut bool, err: IndexError) -> IndexResult<()> {
    if *used || !matches!(err, IndexError::Store(_)) {
        return Err(err);
    }
    *used = true;
    warn!("store write failed, retrying once: {err}");
    Ok(())
}

/// Walk the project tree and keep eligible files in lexicographic order.
/// Directories rejected by a component pattern are pruned outright; the
/// surviving candidates run through the full filter in parallel (the binary
/// sniff reads up to 8 KiB per file).
fn collect_eligible_files(root: &Path, filter: &PathFilter) -> Vec<PathBuf> {
    let prune = filter.clone();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            let name = entry.file_name().to_string_lossy();
            !(is_dir && prune.rejects_component(&name))
        })
        .build();

    let mut candidates = Vec::new();
    for entry in walker {
        match entry {
            Ok(e) if e.file_type().is_some_and(|ft| ft.is_file()) => {
                candidates.push(e.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!("walk error: {e}"),
        }
    }

    let mut files: Vec<PathBuf> = candidates
        .par_iter()
        .filter(|p| filter.is_eligible(p))
        .cloned()
        .collect();
    files.sort();
    files
}
