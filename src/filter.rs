//! Path eligibility rules.
//!
//! A path is indexable when it is a regular file inside the project root,
//! matches no configured ignore pattern, and does not look binary. The
//! decision depends only on `(abs_path, project_root, patterns)`; no state
//! is carried between calls.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use crate::error::{IndexError, IndexResult};

/// How many leading bytes are sniffed for the binary heuristic.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

#[derive(Clone)]
pub struct PathFilter {
    root: PathBuf,
    /// Patterns containing a separator, matched against the full relative path.
    /// `*` does not cross `/`; `**` does.
    path_globs: Vec<GlobMatcher>,
    /// Patterns without a separator, matched against every path component, so
    /// `*.log` rejects basenames anywhere and `.*` rejects anything under a
    /// hidden directory.
    name_globs: Vec<GlobMatcher>,
}

impl PathFilter {
    pub fn new(root: &Path, patterns: &[String]) -> IndexResult<Self> {
        let mut path_globs = Vec::new();
        let mut name_globs = Vec::new();

        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    IndexError::Config(format!("invalid ignore pattern {pattern:?}: {e}"))
                })?
                .compile_matcher();

            if pattern.contains('/') {
                path_globs.push(glob);
            } else {
                name_globs.push(glob);
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            path_globs,
            name_globs,
        })
    }

    /// Project-relative path, forward-slash normalized. `None` when the path
    /// does not lie within the project root.
    pub fn relative(&self, abs_path: &Path) -> Option<String> {
        let rel = abs_path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Whether a single path component (file or directory name) is rejected
    /// by one of the separator-free patterns. Also used to prune ignored
    /// directories during the scan walk.
    pub fn rejects_component(&self, name: &str) -> bool {
        self.name_globs.iter().any(|g| g.is_match(name))
    }

    fn matches_ignore(&self, relative: &str) -> bool {
        if self.path_globs.iter().any(|g| g.is_match(relative)) {
            return true;
        }
        relative.split('/').any(|part| self.rejects_component(part))
    }

    /// Full eligibility decision for one absolute path.
    pub fn is_eligible(&self, abs_path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(abs_path) else {
            return false;
        };
        if !meta.is_file() {
            return false;
        }

        let Some(relative) = self.relative(abs_path) else {
            return false;
        };
        if self.matches_ignore(&relative) {
            return false;
        }

        match looks_binary(abs_path) {
            Ok(binary) => !binary,
            Err(e) => {
                debug!("binary sniff failed for {}: {}", abs_path.display(), e);
                false
            }
        }
    }
}

/// A file is treated as binary when its first 8 KiB contain a NUL byte.
pub fn looks_binary(path: &Path) -> std::io::Result<bool> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; BINARY_SNIFF_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf[..filled].contains(&0))
}
