//! End-to-end reconciliation scenarios over a temporary project tree, using
//! a deterministic embedder so no model download is involved.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use vector_index_mcp::config::{parse_ignore_patterns, Settings, TABLE_NAME};
use vector_index_mcp::embedder::EmbeddingProvider;
use vector_index_mcp::error::{IndexError, IndexResult};
use vector_index_mcp::indexer::Indexer;
use vector_index_mcp::status::{IndexState, StatusRegistry};
use vector_index_mcp::store::ChunkStore;

const DIM: usize = 8;

/// Deterministic stand-in for the sentence-transformer: a cheap normalized
/// byte projection. Also counts embedding batches so tests can assert the
/// hash shortcut really skips re-embedding.
struct StubEmbedder {
    batches: AtomicUsize,
}

impl StubEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: AtomicUsize::new(0),
        })
    }

    fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

fn pseudo_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    for (i, b) in text.bytes().enumerate() {
        v[i % dim] += b as f32;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter().map(|x| x / norm).collect()
}

impl EmbeddingProvider for StubEmbedder {
    fn embed_documents(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| pseudo_vector(t, DIM)).collect())
    }

    fn embed_query(&self, text: &str) -> IndexResult<Vec<f32>> {
        Ok(pseudo_vector(text, DIM))
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

struct Harness {
    project: TempDir,
    _db: TempDir,
    indexer: Arc<Indexer>,
    embedder: Arc<StubEmbedder>,
    status: Arc<StatusRegistry>,
}

impl Harness {
    fn write(&self, rel: &str, content: impl AsRef<[u8]>) -> std::path::PathBuf {
        let path = self.project.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }
}

fn settings_for(project: &Path, db: &Path, patterns: &str) -> Arc<Settings> {
    Arc::new(Settings {
        project_root: dunce::canonicalize(project).unwrap(),
        lancedb_uri: db.join("db").to_string_lossy().to_string(),
        embedding_model_name: "all-MiniLM-L6-v2".to_string(),
        ignore_patterns: parse_ignore_patterns(patterns),
        log_level: "INFO".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
    })
}

async fn indexer_over(
    settings: Arc<Settings>,
    embedder: Arc<StubEmbedder>,
) -> (Arc<Indexer>, Arc<StatusRegistry>) {
    let store = ChunkStore::open_or_create(&settings.lancedb_uri, TABLE_NAME, DIM)
        .await
        .unwrap();
    let status = Arc::new(StatusRegistry::new(
        settings.project_root.to_string_lossy().to_string(),
    ));
    status.mark_idle();
    let indexer = Arc::new(
        Indexer::new(settings, store, embedder, status.clone()).unwrap(),
    );
    (indexer, status)
}

async fn harness(patterns: &str) -> Harness {
    let project = TempDir::new().unwrap();
    let db = TempDir::new().unwrap();
    let settings = settings_for(project.path(), db.path(), patterns);
    let embedder = StubEmbedder::new();
    let (indexer, status) = indexer_over(settings, embedder.clone()).await;
    Harness {
        project,
        _db: db,
        indexer,
        embedder,
        status,
    }
}

#[tokio::test]
async fn empty_project_scans_to_watching() {
    let h = harness("").await;
    h.indexer.full_scan(false).await.unwrap();

    let snap = h.status.snapshot();
    assert_eq!(snap.state, IndexState::Watching);
    assert_eq!(snap.indexed_chunk_count, 0);
    assert!(snap.last_scan_start_time.is_some());
    assert!(snap.last_scan_end_time.is_some());

    let hits = h.indexer.search("anything", 5).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn create_then_search_returns_the_chunk() {
    let h = harness("").await;
    h.write("a.txt", "alpha beta gamma");
    h.indexer.full_scan(false).await.unwrap();

    let hits = h.indexer.search("alpha", 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file_path, "a.txt");
    assert_eq!(hits[0].chunk_index, 0);
    assert_eq!(hits[0].total_chunks, 1);
    assert_eq!(hits[0].document_id, "a.txt::0");
    assert_eq!(hits[0].extracted_text_chunk, "alpha beta gamma");
    assert!(hits[0].last_modified_timestamp > 0.0);
}

#[tokio::test]
async fn unchanged_rescan_performs_zero_embeddings() {
    let h = harness("").await;
    h.write("a.txt", "alpha beta gamma");
    h.write("b.txt", "delta epsilon");
    h.indexer.full_scan(false).await.unwrap();

    let before = h.embedder.batches();
    assert!(before > 0);
    let count_before = h.indexer.count().await.unwrap();

    h.indexer.full_scan(false).await.unwrap();
    assert_eq!(h.embedder.batches(), before);
    assert_eq!(h.indexer.count().await.unwrap(), count_before);
    assert_eq!(h.status.state(), IndexState::Watching);
}

#[tokio::test]
async fn modified_file_is_reembedded_and_replaced() {
    let h = harness("").await;
    h.write("a.txt", "alpha beta gamma");
    h.indexer.full_scan(false).await.unwrap();
    let first_hash = h.indexer.search("alpha", 1).await.unwrap()[0]
        .content_hash
        .clone();

    let before = h.embedder.batches();
    h.write("a.txt", "alpha beta gamma delta");
    h.indexer.full_scan(false).await.unwrap();

    assert!(h.embedder.batches() > before);
    let hits = h.indexer.search("alpha", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_ne!(hits[0].content_hash, first_hash);
    assert!(hits[0].extracted_text_chunk.contains("delta"));
}

#[tokio::test]
async fn deleted_file_leaves_no_rows() {
    let h = harness("").await;
    let path = h.write("a.txt", "alpha beta gamma");
    h.indexer.full_scan(false).await.unwrap();
    assert_eq!(h.indexer.count().await.unwrap(), 1);

    std::fs::remove_file(path).unwrap();
    h.indexer.full_scan(false).await.unwrap();
    assert_eq!(h.indexer.count().await.unwrap(), 0);
}

#[tokio::test]
async fn emptied_file_leaves_no_rows() {
    let h = harness("").await;
    h.write("a.txt", "alpha beta gamma");
    h.indexer.full_scan(false).await.unwrap();
    assert_eq!(h.indexer.count().await.unwrap(), 1);

    h.write("a.txt", "");
    h.indexer.full_scan(false).await.unwrap();
    assert_eq!(h.indexer.count().await.unwrap(), 0);
}

#[tokio::test]
async fn ignore_patterns_keep_files_out() {
    let h = harness("*.log").await;
    h.write("x.log", "secret");
    h.write("a.txt", "visible words");
    h.indexer.full_scan(false).await.unwrap();

    assert_eq!(h.indexer.count().await.unwrap(), 1);
    let hits = h.indexer.search("secret", 5).await.unwrap();
    assert!(hits.iter().all(|hit| hit.file_path != "x.log"));
}

#[tokio::test]
async fn newly_ignored_file_is_purged_on_rescan() {
    let project = TempDir::new().unwrap();
    let db = TempDir::new().unwrap();
    std::fs::write(project.path().join("x.log"), "soon to be ignored").unwrap();

    // Index with no patterns, then reopen the same store with `*.log`.
    let open = settings_for(project.path(), db.path(), "");
    let embedder = StubEmbedder::new();
    let (first, _) = indexer_over(open, embedder.clone()).await;
    first.full_scan(false).await.unwrap();
    assert_eq!(first.count().await.unwrap(), 1);
    drop(first);

    let strict = settings_for(project.path(), db.path(), "*.log");
    let (second, _) = indexer_over(strict, embedder).await;
    second.full_scan(false).await.unwrap();
    assert_eq!(second.count().await.unwrap(), 0);
}

#[tokio::test]
async fn force_reindex_rebuilds_everything() {
    let h = harness("").await;
    h.write("a.txt", "alpha beta gamma");
    h.write("b.txt", "delta epsilon zeta");
    h.indexer.full_scan(false).await.unwrap();
    let count = h.indexer.count().await.unwrap();
    let before = h.embedder.batches();

    h.indexer.full_scan(true).await.unwrap();
    assert_eq!(h.indexer.count().await.unwrap(), count);
    // The table was emptied, so every file embedded again.
    assert!(h.embedder.batches() > before);
}

#[tokio::test]
async fn concurrent_scan_is_refused() {
    let h = harness("").await;
    h.write("a.txt", "alpha");

    // Simulate an in-flight scan holding the Scanning state.
    h.status.begin_scan().unwrap();
    let err = h.indexer.full_scan(false).await.unwrap_err();
    assert!(matches!(err, IndexError::AlreadyScanning));

    // Once the first scan finishes, triggering works again.
    h.status.set_watching(0);
    h.indexer.full_scan(false).await.unwrap();
    assert_eq!(h.status.state(), IndexState::Watching);
}

#[tokio::test]
async fn binary_files_are_rejected() {
    let h = harness("").await;
    h.write("blob.bin", b"payload\x00with a NUL byte".as_slice());
    h.write("a.txt", "plain text");
    h.indexer.full_scan(false).await.unwrap();

    assert_eq!(h.indexer.count().await.unwrap(), 1);
    let hits = h.indexer.search("payload", 5).await.unwrap();
    assert!(hits.iter().all(|hit| hit.file_path != "blob.bin"));
}

#[tokio::test]
async fn multi_chunk_file_covers_all_indices() {
    let h = harness("").await;
    let content = (0..600)
        .map(|i| format!("sentence {i} about the reconciliation pipeline"))
        .collect::<Vec<_>>()
        .join("\n");
    h.write("big.txt", &content);
    h.indexer.full_scan(false).await.unwrap();

    let hits = h.indexer.search("reconciliation", 100).await.unwrap();
    assert!(!hits.is_empty());

    let total = hits[0].total_chunks;
    assert!(total > 1);
    let mut indices: Vec<u32> = hits
        .iter()
        .filter(|hit| hit.file_path == "big.txt")
        .map(|hit| hit.chunk_index)
        .collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices, (0..total).collect::<Vec<u32>>());
    assert!(hits.iter().all(|hit| hit.content_hash == hits[0].content_hash));
    assert!(hits.iter().all(|hit| hit.total_chunks == total));
}

#[tokio::test]
async fn single_file_updates_mirror_the_watcher_path() {
    let h = harness("").await;
    h.indexer.full_scan(false).await.unwrap();
    assert_eq!(h.status.state(), IndexState::Watching);

    // Created file arrives through the watcher entry point.
    let path = h.write("fresh.txt", "brand new content");
    h.indexer.reconcile_path(&path).await;
    assert_eq!(h.indexer.count().await.unwrap(), 1);
    assert_eq!(h.status.snapshot().indexed_chunk_count, 1);

    // Unchanged content is a no-op for the embedder.
    let before = h.embedder.batches();
    h.indexer.reconcile_path(&path).await;
    assert_eq!(h.embedder.batches(), before);

    // Deletion clears the rows.
    std::fs::remove_file(&path).unwrap();
    h.indexer.reconcile_removal("fresh.txt").await;
    assert_eq!(h.indexer.count().await.unwrap(), 0);
    assert_eq!(h.status.snapshot().indexed_chunk_count, 0);
}

#[tokio::test]
async fn search_before_initialization_is_not_ready() {
    let project = TempDir::new().unwrap();
    let db = TempDir::new().unwrap();
    let settings = settings_for(project.path(), db.path(), "");
    let store = ChunkStore::open_or_create(&settings.lancedb_uri, TABLE_NAME, DIM)
        .await
        .unwrap();
    let status = Arc::new(StatusRegistry::new(
        settings.project_root.to_string_lossy().to_string(),
    ));
    // Deliberately no mark_idle: still Initializing.
    let indexer = Indexer::new(settings, store, StubEmbedder::new(), status).unwrap();

    let err = indexer.search("anything", 5).await.unwrap_err();
    assert!(matches!(err, IndexError::NotReady));
}
