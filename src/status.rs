//! Process-wide indexing status.
//!
//! A single record guarded by a short-held lock. The indexer is the only
//! writer; readers take consistent snapshots.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{IndexError, IndexResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexState {
    Initializing,
    IdleInitialScanRequired,
    Scanning,
    Watching,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub project_path: String,
    pub state: IndexState,
    pub last_scan_start_time: Option<DateTime<Utc>>,
    pub last_scan_end_time: Option<DateTime<Utc>>,
    pub indexed_chunk_count: usize,
    pub error_message: Option<String>,
}

pub struct StatusRegistry {
    inner: RwLock<ProjectStatus>,
    /// Set when the watcher queue saturates; cleared by a successful scan.
    watcher_overflow: AtomicBool,
}

impl StatusRegistry {
    pub fn new(project_path: String) -> Self {
        Self {
            inner: RwLock::new(ProjectStatus {
                project_path,
                state: IndexState::Initializing,
                last_scan_start_time: None,
                last_scan_end_time: None,
                indexed_chunk_count: 0,
                error_message: None,
            }),
            watcher_overflow: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> ProjectStatus {
        self.inner.read().clone()
    }

    pub fn state(&self) -> IndexState {
        self.inner.read().state
    }

    /// Startup complete; waiting for the first index trigger.
    pub fn mark_idle(&self) {
        self.inner.write().state = IndexState::IdleInitialScanRequired;
    }

    /// Check-and-set entry into `Scanning`. Fails when a scan is already
    /// running, without touching the record.
    pub fn begin_scan(&self) -> IndexResult<()> {
        let mut status = self.inner.write();
        if status.state == IndexState::Scanning {
            return Err(IndexError::AlreadyScanning);
        }
        status.state = IndexState::Scanning;
        status.last_scan_start_time = Some(Utc::now());
        status.error_message = None;
        Ok(())
    }

    pub fn set_watching(&self, indexed_chunk_count: usize) {
        let mut status = self.inner.write();
        status.state = IndexState::Watching;
        status.last_scan_end_time = Some(Utc::now());
        status.indexed_chunk_count = indexed_chunk_count;
    }

    /// Enter `Error`, preserving counts and timestamps.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut status = self.inner.write();
        status.state = IndexState::Error;
        status.error_message = Some(message.into());
    }

    /// Refresh the chunk count without a state transition (watcher updates).
    pub fn refresh_chunk_count(&self, indexed_chunk_count: usize) {
        self.inner.write().indexed_chunk_count = indexed_chunk_count;
    }

    pub fn set_overflowed(&self) {
        self.watcher_overflow.store(true, Ordering::SeqCst);
    }

    pub fn clear_overflow(&self) {
        self.watcher_overflow.store(false, Ordering::SeqCst);
    }

    pub fn is_overflowed(&self) -> bool {
        self.watcher_overflow.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_lifecycle() {
        let registry = StatusRegistry::new("/proj".into());
        assert_eq!(registry.state(), IndexState::Initializing);

        registry.mark_idle();
        assert_eq!(registry.state(), IndexState::IdleInitialScanRequired);

        registry.begin_scan().unwrap();
        assert_eq!(registry.state(), IndexState::Scanning);
        assert!(registry.snapshot().last_scan_start_time.is_some());

        // Re-entrant scan is refused and leaves the record untouched.
        let started = registry.snapshot().last_scan_start_time;
        assert!(matches!(
            registry.begin_scan(),
            Err(IndexError::AlreadyScanning)
        ));
        assert_eq!(registry.snapshot().last_scan_start_time, started);

        registry.set_watching(42);
        let snap = registry.snapshot();
        assert_eq!(snap.state, IndexState::Watching);
        assert_eq!(snap.indexed_chunk_count, 42);
        assert!(snap.last_scan_end_time.is_some());
    }

    #[test]
    fn test_error_preserves_counts() {
        let registry = StatusRegistry::new("/proj".into());
        registry.begin_scan().unwrap();
        registry.set_watching(7);
        registry.set_error("store write failed");

        let snap = registry.snapshot();
        assert_eq!(snap.state, IndexState::Error);
        assert_eq!(snap.indexed_chunk_count, 7);
        assert_eq!(snap.error_message.as_deref(), Some("store write failed"));

        // A new scan clears the error message.
        registry.begin_scan().unwrap();
        assert!(registry.snapshot().error_message.is_none());
    }
}
