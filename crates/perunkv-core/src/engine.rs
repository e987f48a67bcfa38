//! The persistence façade: recovery orchestration, the log-first mutation
//! path, and the periodic snapshot scheduler.
//!
//! Startup order is load-bearing: the snapshot is loaded first, then the
//! append-only log is replayed on top, because the log is authoritative for
//! everything written after the most recent snapshot.

use crate::aof::AofEngine;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::rdb;
use crate::store::Store;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Durable keyed engine: a [`Store`] in front of the append-only log, with
/// periodic snapshots and crash recovery.
///
/// Mutations are log-first: [`put`](Self::put) appends to the log and only
/// touches the store once the log has accepted the record, so a reader in
/// the same process observes a value only after it is (or is about to be,
/// within one flush interval) durable.
pub struct Engine {
    store: Arc<RwLock<Store>>,
    aof: AofEngine,
    rdb_path: PathBuf,
    scheduler: Option<SnapshotScheduler>,
}

struct SnapshotScheduler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Recovers state from disk and starts the engine.
    ///
    /// Loads the snapshot, opens the log (starting the batched writer if
    /// configured), replays the log over the snapshot, and arms the
    /// snapshot timer. Corruption in either file surfaces as an error here;
    /// a host receiving one must not serve traffic.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let mut store = Store::new();
        let snapshot_records = rdb::load(&mut store, &config.rdb_path)?;

        let aof = AofEngine::open(
            config.aof_path.clone(),
            config.ring_capacity,
            config.flush_interval(),
        )?;
        let log_records = aof.load(&mut store)?;

        tracing::info!(
            snapshot_records,
            log_records,
            live = store.len(),
            "recovery complete"
        );

        let store = Arc::new(RwLock::new(store));
        let scheduler = config
            .snapshot_interval()
            .map(|interval| spawn_scheduler(Arc::clone(&store), config.rdb_path.clone(), interval))
            .transpose()?;

        Ok(Self {
            store,
            aof,
            rdb_path: config.rdb_path.clone(),
            scheduler,
        })
    }

    /// Inserts or overwrites a record.
    ///
    /// The log append is the durability gate: if it fails, the store is
    /// untouched and the error maps to "try again later" at the caller.
    pub fn put(&self, id: i32, payload: &[u8]) -> Result<()> {
        let mut store = self.store.write();
        self.aof.append(id, payload)?;
        store.save(id, payload);
        Ok(())
    }

    /// Returns a copy of the value for `id`, if present.
    #[must_use]
    pub fn get(&self, id: i32) -> Option<Vec<u8>> {
        self.store.read().get(id).map(<[u8]>::to_vec)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Returns `true` when no records are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Writes a snapshot of the current state, synchronously.
    pub fn snapshot_now(&self) -> Result<()> {
        let store = self.store.read();
        rdb::dump(store.iter(), &self.rdb_path)
    }

    /// Synchronous compaction: a fresh snapshot, then a minimal log.
    ///
    /// Holding the store lock for the duration keeps appends out of the
    /// window between deriving the state and swapping the log, so the two
    /// files always agree on what "current" means.
    pub fn compact(&self) -> Result<()> {
        let store = self.store.read();
        rdb::dump(store.iter(), &self.rdb_path)?;
        self.aof.rewrite(&store)?;
        tracing::info!(live = store.len(), "compaction complete");
        Ok(())
    }

    /// Stops the snapshot timer and the log writer, flushing pending
    /// appends. Equivalent to dropping the engine, but explicit.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop_scheduler(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            // The send fails only if the thread is already gone.
            let _ = scheduler.stop_tx.send(());
            let _ = scheduler.handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_scheduler();
        // `self.aof` drops afterwards, joining the writer thread and
        // flushing whatever is still in the ring.
    }
}

/// Timer thread for periodic snapshots.
///
/// Each tick clones the live records under a read lock (the mutation path
/// pauses only for that in-memory copy) and then streams, fsyncs, and
/// renames without holding any lock. One thread runs ticks serially, so
/// overlapping snapshots cannot happen.
fn spawn_scheduler(
    store: Arc<RwLock<Store>>,
    rdb_path: PathBuf,
    interval: Duration,
) -> std::io::Result<SnapshotScheduler> {
    let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);
    let handle = std::thread::Builder::new()
        .name("perunkv-snapshot".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let records: Vec<(i32, Box<[u8]>)> = {
                        let store = store.read();
                        store
                            .iter()
                            .map(|(id, value)| (id, Box::from(value)))
                            .collect()
                    };
                    let iter = records.iter().map(|(id, value)| (*id, &value[..]));
                    if let Err(err) = rdb::dump(iter, &rdb_path) {
                        tracing::error!("background snapshot failed: {err}");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(SnapshotScheduler { stop_tx, handle })
}
