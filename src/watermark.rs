//! Write-behind cache of per-channel watermarks.
//!
//! Heights are loaded lazily from storage, advanced in memory as blocks are
//! ingested, and persisted by a periodic [`WatermarkCache::flush`].
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::StorageResult;
use crate::store::DatabaseAdapter;
use crate::types::Channel;

/// Cached watermark of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkEntry {
    pub channel: Channel,
    /// Advanced in memory but not yet persisted.
    pub dirty: bool,
}

/// What a call to [`WatermarkCache::flush`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush was already running.
    Skipped,
    Completed { persisted: usize, failed: usize },
}

/// Channel name → watermark, shared by every listener of one engine.
pub struct WatermarkCache {
    database: Arc<dyn DatabaseAdapter>,
    entries: Mutex<HashMap<String, WatermarkEntry>>,
    flushing: AtomicBool,
}

/// Clears the in-flight flag even if a flush pass unwinds.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WatermarkCache {
    pub fn new(database: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            database,
            entries: Mutex::new(HashMap::new()),
            flushing: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WatermarkEntry>> {
        // entries stay consistent across a poisoning panic: every update is a single insert
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached height of `name`, loading it from storage on first access.
    /// A channel missing from storage starts at height 0.
    pub async fn get_height(&self, name: &str) -> StorageResult<u64> {
        if let Some(entry) = self.lock().get(name) {
            return Ok(entry.channel.height);
        }

        let channel = match self.database.get_channel(name).await {
            Ok(channel) => channel,
            Err(e) if e.is_not_found() => Channel::empty(name),
            Err(e) => return Err(e),
        };

        let mut entries = self.lock();
        // a concurrent advance may have populated the entry while we were loading
        let entry = entries.entry(name.to_owned()).or_insert_with(|| {
            info!(channel = %name, height = channel.height, "loaded height from database");
            WatermarkEntry {
                channel,
                dirty: false,
            }
        });
        Ok(entry.channel.height)
    }

    /// Move the watermark forward. Returns `false` (and changes nothing) unless
    /// `height` is strictly greater than the cached height.
    pub fn advance(&self, name: &str, height: u64, hash: &str) -> bool {
        let mut entries = self.lock();
        if let Some(entry) = entries.get(name) {
            if height <= entry.channel.height {
                return false;
            }
        }
        entries.insert(
            name.to_owned(),
            WatermarkEntry {
                channel: Channel {
                    name: name.to_owned(),
                    height,
                    last_hash: hash.to_owned(),
                },
                dirty: true,
            },
        );
        true
    }

    /// Snapshot of one channel's cache entry.
    pub fn entry(&self, name: &str) -> Option<WatermarkEntry> {
        self.lock().get(name).cloned()
    }

    /// Persist every dirty entry. A pass already in flight makes this return
    /// [`FlushOutcome::Skipped`] immediately. Failed entries stay dirty.
    pub async fn flush(&self) -> FlushOutcome {
        if self.flushing.swap(true, Ordering::AcqRel) {
            debug!("flush already in progress");
            return FlushOutcome::Skipped;
        }
        let _guard = FlushGuard(&self.flushing);

        let pending: Vec<Channel> = self
            .lock()
            .values()
            .filter(|e| e.dirty)
            .map(|e| e.channel.clone())
            .collect();

        let (mut persisted, mut failed) = (0, 0);
        for channel in pending {
            match self.database.update_channel(&channel).await {
                Ok(_) => {
                    persisted += 1;
                    if let Some(entry) = self.lock().get_mut(&channel.name) {
                        // only clean if nothing advanced it during the write
                        if entry.channel.height == channel.height {
                            entry.dirty = false;
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!(channel = %channel.name, height = channel.height, error = %e, "unable to persist watermark");
                }
            }
        }

        FlushOutcome::Completed { persisted, failed }
    }

    /// Flush on a fixed interval until the returned task is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        debug!(interval_ms = interval.as_millis() as u64, "write interval set");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.flush().await;
            }
        })
    }
}
