//! Background flushing of dirty data stores
//!
//! Writers register a store with [`FlushQueue::add`] the first time it goes
//! dirty. A single worker thread wakes every interval, takes the pending set
//! and flushes each store through the callback given to
//! [`DataStoreFlusher::start`].
//!
//! The pending set has its own mutex, independent of every store's lock, so
//! registering a store never waits behind a flush that is in progress.

use crate::datastore::Guid;
use crate::error::{DataStoreError, Result};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct PendingFlushes {
    running: bool,
    guids: BTreeSet<Guid>,
}

/// Set of stores waiting for a background flush
#[derive(Debug, Default)]
pub struct FlushQueue {
    state: Mutex<PendingFlushes>,
}

impl FlushQueue {
    /// Schedule a store to be flushed; ignored while the flusher is stopped
    pub fn add(&self, guid: Guid) {
        let mut state = self.state.lock();
        if state.running {
            state.guids.insert(guid);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Stores currently waiting for a flush
    pub fn pending(&self) -> Vec<Guid> {
        self.state.lock().guids.iter().copied().collect()
    }

    /// Take the pending set, or `None` once the flusher has been stopped
    fn take(&self) -> Option<BTreeSet<Guid>> {
        let mut state = self.state.lock();
        if !state.running {
            return None;
        }
        Some(std::mem::take(&mut state.guids))
    }
}

struct FlushWorker {
    handle: JoinHandle<()>,
    stop_tx: Sender<()>,
}

/// Periodically flushes the stores registered in its [`FlushQueue`]
pub struct DataStoreFlusher {
    queue: Arc<FlushQueue>,
    worker: Mutex<Option<FlushWorker>>,
}

impl DataStoreFlusher {
    pub fn new() -> Self {
        DataStoreFlusher {
            queue: Arc::new(FlushQueue::default()),
            worker: Mutex::new(None),
        }
    }

    /// Handle writers use to schedule flushes
    pub fn queue(&self) -> Arc<FlushQueue> {
        Arc::clone(&self.queue)
    }

    /// Start the background flush thread
    ///
    /// # Arguments
    /// * `interval` - Time between the start of two flush passes
    /// * `flush_fn` - Called once per pending store on every pass
    pub fn start<F>(&self, interval: Duration, flush_fn: F) -> Result<()>
    where
        F: Fn(Guid) -> Result<()> + Send + 'static,
    {
        let mut worker = self.worker.lock();
        {
            let mut state = self.queue.state.lock();
            if state.running {
                return Err(DataStoreError::FlusherAlreadyRunning);
            }
            state.running = true;
        }

        let queue = Arc::clone(&self.queue);
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let spawned = thread::Builder::new()
            .name("datastore-flusher".to_string())
            .spawn(move || {
                tracing::debug!("Data store flusher running every {:?}", interval);
                loop {
                    let started = Instant::now();
                    let guids = match queue.take() {
                        Some(guids) => guids,
                        None => return,
                    };

                    for guid in guids {
                        if let Err(e) = flush_fn(guid) {
                            tracing::error!("Background flush of data store {} failed: {}", guid, e);
                        }
                    }

                    let wait = interval.saturating_sub(started.elapsed());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.queue.state.lock().running = false;
                return Err(e.into());
            }
        };

        tracing::info!("Started data store flusher (interval {:?})", interval);
        *worker = Some(FlushWorker { handle, stop_tx });
        Ok(())
    }

    /// Schedule a store for the next flush pass
    pub fn add(&self, guid: Guid) {
        self.queue.add(guid);
    }

    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    /// Stores currently waiting for a flush
    pub fn pending(&self) -> Vec<Guid> {
        self.queue.pending()
    }

    /// Stop the background thread and wait for it to exit
    pub fn stop(&self) {
        let mut worker = self.worker.lock();
        {
            let mut state = self.queue.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }

        if let Some(worker) = worker.take() {
            let _ = worker.stop_tx.try_send(());
            if worker.handle.join().is_err() {
                tracing::error!("Data store flusher thread panicked");
            }
        }

        self.queue.state.lock().guids.clear();
        tracing::info!("Stopped data store flusher");
    }
}

impl Default for DataStoreFlusher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DataStoreFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}
