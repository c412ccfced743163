//! LanceDB-backed chunk store.
//!
//! One table (`software_project_index`) holds every chunk row together with
//! its embedding. The schema is fixed at creation time; reads are safe under
//! concurrent writes (LanceDB versions data MVCC-style), so searches never
//! contend with the indexer's writer mutex.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, Float64Array, RecordBatch, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatchIterator;
use futures_util::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::Table;
use serde::Serialize;

use crate::error::{IndexError, IndexResult};

/// Candidate multiplier for k-NN queries; see [`ChunkStore::search`].
const SEARCH_OVERFETCH: usize = 4;

/// One row of the index table.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// `<relative_path>::<chunk_index>`, unique within the table.
    pub document_id: String,
    /// Project-relative path, forward-slash normalized.
    pub file_path: String,
    /// Hex SHA-256 of the whole file at indexing time.
    pub content_hash: String,
    /// File mtime at indexing time, epoch seconds.
    pub last_modified_timestamp: f64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub extracted_text_chunk: String,
    /// Absolute source path at indexing time (informational).
    pub original_path: String,
    pub vector: Vec<f32>,
}

/// A search result: the chunk record minus its vector, plus a similarity
/// score (1 − cosine distance for the unit-normalized default model).
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: String,
    pub file_path: String,
    pub content_hash: String,
    pub last_modified_timestamp: f64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub extracted_text_chunk: String,
    pub original_path: String,
    pub score: f32,
}

pub struct ChunkStore {
    table: Table,
    dimension: usize,
    schema: Arc<Schema>,
}

impl ChunkStore {
    /// Open the table at `uri`, creating it when absent. An existing table
    /// with a different vector dimension is a fatal schema mismatch.
    pub async fn open_or_create(uri: &str, table_name: &str, dimension: usize) -> IndexResult<Self> {
        let db = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| IndexError::Store(format!("failed to open store at {uri}: {e}")))?;

        let schema = Arc::new(build_schema(dimension));

        let names = db
            .table_names()
            .execute()
            .await
            .map_err(|e| IndexError::Store(format!("failed to list tables: {e}")))?;

        let table = if names.iter().any(|n| n == table_name) {
            let table = db
                .open_table(table_name)
                .execute()
                .await
                .map_err(|e| IndexError::Store(format!("failed to open {table_name}: {e}")))?;

            let existing = table
                .schema()
                .await
                .map_err(|e| IndexError::Store(format!("failed to read schema: {e}")))?;
            let stored_dim = vector_dimension(&existing).ok_or_else(|| {
                IndexError::SchemaMismatch(format!(
                    "table {table_name} has no fixed-size vector column"
                ))
            })?;
            if stored_dim != dimension {
                return Err(IndexError::SchemaMismatch(format!(
                    "table {table_name} stores {stored_dim}-dimension vectors, model produces {dimension}"
                )));
            }
            table
        } else {
            let empty = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![Ok(empty)], schema.clone());
            db.create_table(table_name, reader)
                .execute()
                .await
                .map_err(|e| IndexError::Store(format!("failed to create {table_name}: {e}")))?
        };

        Ok(Self {
            table,
            dimension,
            schema,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Replace rows matching on `document_id`: delete any stale versions,
    /// then append the new batch.
    pub async fn upsert(&self, rows: &[ChunkRecord]) -> IndexResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = rows.iter().map(|r| sql_quote(&r.document_id)).collect();
        self.table
            .delete(&format!("document_id IN ({})", ids.join(", ")))
            .await
            .map_err(|e| IndexError::Store(format!("upsert delete failed: {e}")))?;

        let batch = self.rows_to_batch(rows)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());
        self.table
            .add(reader)
            .execute()
            .await
            .map_err(|e| IndexError::Store(format!("upsert add failed: {e}")))?;
        Ok(())
    }

    /// Remove every row for one file. Idempotent.
    pub async fn delete_where_file_path_eq(&self, file_path: &str) -> IndexResult<()> {
        self.table
            .delete(&format!("file_path = {}", sql_quote(file_path)))
            .await
            .map_err(|e| IndexError::Store(format!("delete for {file_path} failed: {e}")))
    }

    /// Bulk variant of [`delete_where_file_path_eq`].
    pub async fn delete_where_file_path_in(&self, file_paths: &[String]) -> IndexResult<()> {
        if file_paths.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = file_paths.iter().map(|p| sql_quote(p)).collect();
        self.table
            .delete(&format!("file_path IN ({})", quoted.join(", ")))
            .await
            .map_err(|e| IndexError::Store(format!("bulk delete failed: {e}")))
    }

    /// Drop every row; used by forced reindexing.
    pub async fn delete_all(&self) -> IndexResult<()> {
        self.table
            .delete("true")
            .await
            .map_err(|e| IndexError::Store(format!("delete-all failed: {e}")))
    }

    /// Stored `(content_hash, total_chunks)` for one file, reading only the
    /// columns needed for the change check.
    pub async fn file_state(&self, file_path: &str) -> IndexResult<Option<(String, u32)>> {
        let mut stream = self
            .table
            .query()
            .only_if(format!("file_path = {}", sql_quote(file_path)))
            .select(Select::Columns(state_columns()))
            .limit(1)
            .execute()
            .await
            .map_err(|e| IndexError::Store(format!("state lookup failed: {e}")))?;

        while let Some(batch) = stream.next().await {
            let batch = batch.map_err(|e| IndexError::Store(format!("state read failed: {e}")))?;
            if batch.num_rows() > 0 {
                let hashes = string_col(&batch, "content_hash")?;
                let totals = u32_col(&batch, "total_chunks")?;
                return Ok(Some((hashes.value(0).to_string(), totals.value(0))));
            }
        }
        Ok(None)
    }

    /// Snapshot `file_path → (content_hash, total_chunks)` for the whole
    /// table, the input to filesystem reconciliation.
    pub async fn scan_index_state(&self) -> IndexResult<HashMap<String, (String, u32)>> {
        let mut stream = self
            .table
            .query()
            .select(Select::Columns(state_columns()))
            .execute()
            .await
            .map_err(|e| IndexError::Store(format!("index scan failed: {e}")))?;

        let mut state = HashMap::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.map_err(|e| IndexError::Store(format!("index scan failed: {e}")))?;
            let paths = string_col(&batch, "file_path")?;
            let hashes = string_col(&batch, "content_hash")?;
            let totals = u32_col(&batch, "total_chunks")?;
            for i in 0..batch.num_rows() {
                state.insert(
                    paths.value(i).to_string(),
                    (hashes.value(i).to_string(), totals.value(i)),
                );
            }
        }
        Ok(state)
    }

    /// k-NN search ordered by ascending distance; ties break by ascending
    /// `document_id` so results are deterministic.
    ///
    /// The store is asked for more than `k` candidates: with a tight limit,
    /// distance-tied rows at the cutoff would be kept or dropped by internal
    /// traversal order, and the tie-break below could only reorder the
    /// survivors.
    pub async fn search(&self, query_vector: &[f32], k: usize) -> IndexResult<Vec<SearchHit>> {
        if query_vector.len() != self.dimension {
            return Err(IndexError::Store(format!(
                "query vector has {} dimensions, table stores {}",
                query_vector.len(),
                self.dimension
            )));
        }
        if self.count().await? == 0 {
            return Ok(Vec::new());
        }

        let mut stream = self
            .table
            .vector_search(query_vector.to_vec())
            .map_err(|e| IndexError::Store(format!("vector search failed: {e}")))?
            .limit(k.saturating_mul(SEARCH_OVERFETCH))
            .execute()
            .await
            .map_err(|e| IndexError::Store(format!("vector search failed: {e}")))?;

        let mut scored: Vec<(f32, SearchHit)> = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.map_err(|e| IndexError::Store(format!("search read failed: {e}")))?;
            let ids = string_col(&batch, "document_id")?;
            let paths = string_col(&batch, "file_path")?;
            let hashes = string_col(&batch, "content_hash")?;
            let mtimes = f64_col(&batch, "last_modified_timestamp")?;
            let indices = u32_col(&batch, "chunk_index")?;
            let totals = u32_col(&batch, "total_chunks")?;
            let texts = string_col(&batch, "extracted_text_chunk")?;
            let originals = string_col(&batch, "original_path")?;
            let distances = f32_col(&batch, "_distance")?;

            for i in 0..batch.num_rows() {
                let distance = distances.value(i);
                scored.push((
                    distance,
                    SearchHit {
                        document_id: ids.value(i).to_string(),
                        file_path: paths.value(i).to_string(),
                        content_hash: hashes.value(i).to_string(),
                        last_modified_timestamp: mtimes.value(i),
                        chunk_index: indices.value(i),
                        total_chunks: totals.value(i),
                        extracted_text_chunk: texts.value(i).to_string(),
                        original_path: originals.value(i).to_string(),
                        score: 1.0 - distance,
                    },
                ));
            }
        }

        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.document_id.cmp(&b.1.document_id))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(_, hit)| hit).collect())
    }

    pub async fn count(&self) -> IndexResult<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| IndexError::Store(format!("count failed: {e}")))
    }

    fn rows_to_batch(&self, rows: &[ChunkRecord]) -> IndexResult<RecordBatch> {
        let ids: Vec<&str> = rows.iter().map(|r| r.document_id.as_str()).collect();
        let paths: Vec<&str> = rows.iter().map(|r| r.file_path.as_str()).collect();
        let hashes: Vec<&str> = rows.iter().map(|r| r.content_hash.as_str()).collect();
        let mtimes: Vec<f64> = rows.iter().map(|r| r.last_modified_timestamp).collect();
        let indices: Vec<u32> = rows.iter().map(|r| r.chunk_index).collect();
        let totals: Vec<u32> = rows.iter().map(|r| r.total_chunks).collect();
        let texts: Vec<&str> = rows.iter().map(|r| r.extracted_text_chunk.as_str()).collect();
        let originals: Vec<&str> = rows.iter().map(|r| r.original_path.as_str()).collect();

        let mut values: Vec<f32> = Vec::with_capacity(rows.len() * self.dimension);
        for row in rows {
            if row.vector.len() != self.dimension {
                return Err(IndexError::Store(format!(
                    "row {} has {}-dimension vector, table stores {}",
                    row.document_id,
                    row.vector.len(),
                    self.dimension
                )));
            }
            values.extend_from_slice(&row.vector);
        }
        let vectors = FixedSizeListArray::try_new(
            Arc::new(Field::new("item", DataType::Float32, false)),
            self.dimension as i32,
            Arc::new(Float32Array::from(values)),
            None,
        )
        .map_err(|e| IndexError::Store(format!("failed to build vector column: {e}")))?;

        RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(paths)),
                Arc::new(StringArray::from(hashes)),
                Arc::new(Float64Array::from(mtimes)),
                Arc::new(UInt32Array::from(indices)),
                Arc::new(UInt32Array::from(totals)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(originals)),
                Arc::new(vectors),
            ],
        )
        .map_err(|e| IndexError::Store(format!("failed to build record batch: {e}")))
    }
}

fn build_schema(dimension: usize) -> Schema {
    Schema::new(vec![
        Field::new("document_id", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("last_modified_timestamp", DataType::Float64, false),
        Field::new("chunk_index", DataType::UInt32, false),
        Field::new("total_chunks", DataType::UInt32, false),
        Field::new("extracted_text_chunk", DataType::Utf8, false),
        Field::new("original_path", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                dimension as i32,
            ),
            false,
        ),
    ])
}

fn vector_dimension(schema: &Schema) -> Option<usize> {
    schema.fields().iter().find_map(|f| match f.data_type() {
        DataType::FixedSizeList(_, size) if f.name() == "vector" => Some(*size as usize),
        _ => None,
    })
}

fn state_columns() -> Vec<String> {
    vec![
        "file_path".to_string(),
        "content_hash".to_string(),
        "total_chunks".to_string(),
    ]
}

/// Single-quote a string literal for a LanceDB SQL predicate.
fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> IndexResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| IndexError::Store(format!("missing or mistyped column {name}")))
}

fn u32_col<'a>(batch: &'a RecordBatch, name: &str) -> IndexResult<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
        .ok_or_else(|| IndexError::Store(format!("missing or mistyped column {name}")))
}

fn f64_col<'a>(batch: &'a RecordBatch, name: &str) -> IndexResult<&'a Float64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| IndexError::Store(format!("missing or mistyped column {name}")))
}

fn f32_col<'a>(batch: &'a RecordBatch, name: &str) -> IndexResult<&'a Float32Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
        .ok_or_else(|| IndexError::Store(format!("missing or mistyped column {name}")))
}
