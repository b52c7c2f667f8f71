//! Store statistics and the periodic reporter thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use dedupfs_cas::BlockStats;
use dedupfs_config::{log_stats_debug, log_stats_info};
use dedupfs_index::FileIndexStats;
use serde::Serialize;

use crate::{MetaStorage, Result};

/// Point-in-time view over all three stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub blocks: BlockStats,
    pub files: FileIndexStats,
    /// Path entries, the root included
    pub paths: u64,
    pub open_sessions: usize,
}

impl EngineStats {
    /// Block references per unique block.
    pub fn dedup_ratio(&self) -> f64 {
        self.blocks.dedup_ratio()
    }
}

impl MetaStorage {
    pub fn snapshot_stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            blocks: self.block_store().report()?,
            files: self.file_index().report()?,
            paths: self.path_table().len()?,
            open_sessions: self.open_sessions(),
        })
    }
}

/// Logs an [`EngineStats`] snapshot every `interval` until stopped.
pub struct StatsReporter {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    reports: Arc<AtomicU64>,
}

impl StatsReporter {
    pub fn spawn(storage: Arc<MetaStorage>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let reports = Arc::new(AtomicU64::new(0));
        let counter = reports.clone();

        let handle = thread::Builder::new()
            .name("dedupfs-stats".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match storage.snapshot_stats() {
                        Ok(stats) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            log_stats_info!(
                                "Storage statistics",
                                blocks = stats.blocks.block_count,
                                block_refs = stats.blocks.total_references,
                                stored_bytes = stats.blocks.stored_bytes,
                                files = stats.files.file_count,
                                file_refs = stats.files.total_references,
                                paths = stats.paths,
                                open_sessions = stats.open_sessions
                            );
                        }
                        Err(e) => {
                            log_stats_debug!(
                                "Statistics snapshot failed",
                                error = tracing::field::display(&e)
                            );
                        }
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            reports,
        })
    }

    /// Snapshots logged so far.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
