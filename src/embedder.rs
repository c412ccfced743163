//! Embedding provider.
//!
//! Wraps a fastembed sentence-transformer loaded once per process. The
//! default model is all-MiniLM-L6-v2 (384 dimensions, unit-normalized
//! output), so cosine and L2 orderings agree in the store.

use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::info;

use crate::error::{IndexError, IndexResult};

/// Texts per inference batch.
pub const EMBED_BATCH_SIZE: usize = 32;

/// Batched text-to-vector transformation. The indexer only ever sees this
/// trait, so tests can substitute a deterministic implementation.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed document chunks; output order equals input order.
    fn embed_documents(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>>;

    /// Embed a search query, applying the model's query prefix convention
    /// when it has one.
    fn embed_query(&self, text: &str) -> IndexResult<Vec<f32>>;

    /// Vector dimension, constant for the process lifetime.
    fn dimension(&self) -> usize;
}

pub struct FastembedProvider {
    /// The tokenizer inside TextEmbedding is not Sync, hence the Mutex.
    model: Mutex<TextEmbedding>,
    dimension: usize,
    query_prefix: Option<&'static str>,
}

impl FastembedProvider {
    /// Load the named model, downloading weights on first use. Unknown model
    /// names are a configuration error.
    pub fn load(model_name: &str) -> IndexResult<Self> {
        let (model_id, query_prefix) = resolve_model(model_name)?;

        let dimension = TextEmbedding::get_model_info(&model_id)
            .map_err(|e| IndexError::Config(format!("unknown embedding model {model_name}: {e}")))?
            .dim;

        info!(model = model_name, dimension, "loading embedding model");
        let model = TextEmbedding::try_new(
            InitOptions::new(model_id).with_show_download_progress(false),
        )
        .map_err(|e| {
            IndexError::Embed(format!("failed to initialize model {model_name}: {e}"))
        })?;
        info!(model = model_name, "embedding model ready");

        Ok(Self {
            model: Mutex::new(model),
            dimension,
            query_prefix,
        })
    }

    fn embed_batch(&self, texts: Vec<String>) -> IndexResult<Vec<Vec<f32>>> {
        let model = self
            .model
            .lock()
            .map_err(|e| IndexError::Embed(format!("model lock poisoned: {e}")))?;
        model
            .embed(texts, Some(EMBED_BATCH_SIZE))
            .map_err(|e| IndexError::Embed(format!("embedding failed: {e}")))
    }
}

impl EmbeddingProvider for FastembedProvider {
    fn embed_documents(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.embed_batch(texts.to_vec())
    }

    fn embed_query(&self, text: &str) -> IndexResult<Vec<f32>> {
        let query = match self.query_prefix {
            Some(prefix) => format!("{prefix}{text}"),
            None => text.to_string(),
        };
        self.embed_batch(vec![query])?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embed("model returned no query vector".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Map a configured model name onto fastembed's catalog, together with the
/// query prefix the model family expects (E5 and nomic are trained with
/// instruction prefixes on the query side; MiniLM and BGE-small are not).
fn resolve_model(name: &str) -> IndexResult<(EmbeddingModel, Option<&'static str>)> {
    let short = name.rsplit('/').next().unwrap_or(name);
    match short {
        "all-MiniLM-L6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, None)),
        "all-MiniLM-L12-v2" => Ok((EmbeddingModel::AllMiniLML12V2, None)),
        "bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, None)),
        "nomic-embed-text-v1.5" => {
            Ok((EmbeddingModel::NomicEmbedTextV15, Some("search_query: ")))
        }
        "multilingual-e5-small" => {
            Ok((EmbeddingModel::MultilingualE5Small, Some("query: ")))
        }
        other => Err(IndexError::Config(format!(
            "unsupported embedding model: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_models() {
        assert!(resolve_model("all-MiniLM-L6-v2").unwrap().1.is_none());
        assert!(
            resolve_model("sentence-transformers/all-MiniLM-L6-v2")
                .unwrap()
                .1
                .is_none()
        );
        assert_eq!(
            resolve_model("intfloat/multilingual-e5-small").unwrap().1,
            Some("query: ")
        );
    }

    #[test]
    fn test_resolve_unknown_model() {
        assert!(matches!(
            resolve_model("gpt-17-embeddings"),
            Err(IndexError::Config(_))
        ));
    }
}
