//! Synchronization engine: owns the block listeners of every configured
//! channel and drives them into storage.
//!
//! Startup: connect network → connect storage → `setup` → start the flush
//! timer → resolve each channel's start block → subscribe.
//! Shutdown: stop the timer → final flush → unsubscribe → disconnect.
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ChannelOption, StartBlock};
use crate::error::SyncError;
use crate::network::{LedgerNetwork, ListenerHandle, Subscription};
use crate::store::DatabaseAdapter;
use crate::watermark::{FlushOutcome, WatermarkCache};

pub mod ingest;

pub use ingest::{BlockIngestor, BlockOutcome, EventOutcome};

/// Lifecycle of one channel's block listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Uninitialized,
    Subscribing,
    Listening,
    /// Still listening, but the last event failed (delivery or processing).
    Degraded,
    Stopped,
}

type States = Arc<Mutex<HashMap<String, ListenerState>>>;

fn set_state(states: &States, channel: &str, state: ListenerState) {
    states
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(channel.to_owned(), state);
}

struct Listener {
    channel: String,
    handle: Box<dyn ListenerHandle>,
    task: JoinHandle<()>,
}

/// Block-listener engine over a ledger network `N`.
pub struct ExplorerSync<N> {
    network: Arc<N>,
    database: Arc<dyn DatabaseAdapter>,
    cache: Arc<WatermarkCache>,
    ingestor: BlockIngestor,
    channels: Vec<ChannelOption>,
    write_interval: Duration,
    states: States,
    listeners: Vec<Listener>,
    flusher: Option<JoinHandle<()>>,
}

impl<N> ExplorerSync<N>
where
    N: LedgerNetwork + 'static,
{
    /// Create an engine; nothing happens until [`start`](Self::start).
    pub fn new(
        network: Arc<N>,
        database: Arc<dyn DatabaseAdapter>,
        channels: Vec<ChannelOption>,
        write_interval: Duration,
    ) -> Self {
        let cache = Arc::new(WatermarkCache::new(Arc::clone(&database)));
        let ingestor = BlockIngestor::new(Arc::clone(&database), Arc::clone(&cache));
        let states = channels
            .iter()
            .map(|c| (c.name.clone(), ListenerState::Uninitialized))
            .collect();
        Self {
            network,
            database,
            cache,
            ingestor,
            channels,
            write_interval,
            states: Arc::new(Mutex::new(states)),
            listeners: Vec::new(),
            flusher: None,
        }
    }

    /// The engine's watermark cache.
    pub fn cache(&self) -> &Arc<WatermarkCache> {
        &self.cache
    }

    /// Current listener state per channel.
    pub fn listener_states(&self) -> BTreeMap<String, ListenerState> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Run the startup sequence. Any failure is fatal: resources acquired so
    /// far are released and the error is returned.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.channels.is_empty() {
            return Err(SyncError::Config("unable to find any channels".into()));
        }
        info!(channels = %self.describe_channels(), "starting sync");

        self.network.connect().await.map_err(SyncError::Connect)?;
        self.database.connect().await.map_err(SyncError::Database)?;

        let names: Vec<String> = self.channels.iter().map(|c| c.name.clone()).collect();
        self.database.setup(&names).await.map_err(SyncError::Setup)?;

        self.flusher = Some(self.cache.spawn_flusher(self.write_interval));

        if let Err(e) = self.subscribe_all().await {
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }

    async fn subscribe_all(&mut self) -> Result<(), SyncError> {
        // warm the cache so every stored height is loaded (and logged) once
        for option in &self.channels {
            self.cache
                .get_height(&option.name)
                .await
                .map_err(SyncError::Database)?;
        }

        for option in self.channels.clone() {
            let name = option.name;
            set_state(&self.states, &name, ListenerState::Subscribing);

            let start = match option.start_block {
                StartBlock::Height(h) => h,
                StartBlock::Auto => self
                    .cache
                    .get_height(&name)
                    .await
                    .map_err(SyncError::Database)?,
            };

            let Subscription { events, handle } = self
                .network
                .subscribe(&name, start)
                .await
                .map_err(|source| SyncError::Subscribe {
                    channel: name.clone(),
                    start,
                    source,
                })?;

            set_state(&self.states, &name, ListenerState::Listening);
            let ingestor = self.ingestor.clone();
            let states = Arc::clone(&self.states);
            let channel = name.clone();
            let task = tokio::spawn(async move {
                let mut events = events;
                while let Some(item) = events.next().await {
                    let state = match ingestor.on_event(&channel, item).await {
                        EventOutcome::Block(_) => ListenerState::Listening,
                        EventOutcome::DeliveryFailed | EventOutcome::ProcessingFailed => {
                            ListenerState::Degraded
                        }
                    };
                    set_state(&states, &channel, state);
                }
                debug!(channel = %channel, "block stream ended");
            });

            debug!(channel = %name, start_block = start, "added block listener");
            self.listeners.push(Listener {
                channel: name,
                handle,
                task,
            });
        }
        Ok(())
    }

    /// Stop the flush timer, flush once more, release every listener, then
    /// disconnect the network and storage. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
            // an interrupted timer flush must release its guard first
            if let Err(err) = flusher.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "flush timer task failed");
                }
            }
        }

        match self.cache.flush().await {
            FlushOutcome::Completed { failed, .. } if failed > 0 => {
                warn!(failed, "final flush left unsaved watermarks")
            }
            outcome => debug!(?outcome, "final flush"),
        }

        info!("cleaning up listeners");
        for listener in self.listeners.drain(..) {
            listener.handle.unsubscribe();
            listener.task.abort();
            set_state(&self.states, &listener.channel, ListenerState::Stopped);
        }

        self.network.disconnect().await;
        self.database.disconnect().await;
    }

    fn describe_channels(&self) -> String {
        self.channels
            .iter()
            .map(|c| format!("{}={}", c.name, c.start_block))
            .collect::<Vec<_>>()
            .join(",")
    }
}
