//! Content extraction: file hashing and overlapping text chunking.

use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

/// Token budget per chunk.
pub const CHUNK_MAX_TOKENS: usize = 512;

/// Tokens shared between adjacent chunks.
pub const CHUNK_OVERLAP_TOKENS: usize = 64;

/// Rough chars-per-token ratio for sentence-transformer tokenizers. The same
/// estimate is applied everywhere, so chunk boundaries are stable across runs.
const CHARS_PER_TOKEN: usize = 4;

/// SHA-256 over the file's raw bytes, plus its mtime in epoch seconds.
pub fn hash_file(path: &Path) -> std::io::Result<(String, f64)> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash = format!("{:x}", hasher.finalize());

    let mtime = std::fs::metadata(path)?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    Ok((hash, mtime))
}

/// Decode a file as UTF-8 (lossy) and split it into overlapping chunks.
/// An empty or whitespace-only file yields no chunks.
pub fn extract_chunks(path: &Path) -> std::io::Result<Vec<String>> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(chunk_text(&text, CHUNK_MAX_TOKENS, CHUNK_OVERLAP_TOKENS))
}

fn approx_token_count(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Split one overlong line into segments that each fit the token budget.
fn split_long_line(line: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in line.chars() {
        current.push(ch);
        count += 1;
        if count >= max_chars {
            segments.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Chunk text into line-aligned segments of at most `max_tokens` estimated
/// tokens, with roughly `overlap_tokens` of trailing context repeated at the
/// start of the next chunk. Chunks come out in source order; whitespace-only
/// chunks are dropped.
pub fn chunk_text(content: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    // Flatten to segments that each fit the budget on their own; lines within
    // budget pass through unchanged, oversized lines get hard-split.
    let mut segments: Vec<String> = Vec::new();
    for line in content.lines() {
        if approx_token_count(line) > max_tokens {
            segments.extend(split_long_line(line, max_tokens));
        } else {
            segments.push(line.to_string());
        }
    }

    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0;

    for segment in segments {
        let tokens = approx_token_count(&segment);

        if current_tokens + tokens > max_tokens && !current.is_empty() {
            chunks.push(current.join("\n"));

            // Carry the tail of the emitted chunk forward as overlap.
            let mut kept: Vec<String> = Vec::new();
            let mut kept_tokens = 0;
            for prev in current.iter().rev() {
                if kept_tokens >= overlap_tokens {
                    break;
                }
                kept_tokens += approx_token_count(prev);
                kept.push(prev.clone());
            }
            kept.reverse();
            current = kept;
            current_tokens = kept_tokens;
        }

        current_tokens += tokens;
        current.push(segment);
    }

    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }

    chunks.retain(|c| !c.trim().is_empty());
    chunks
}
