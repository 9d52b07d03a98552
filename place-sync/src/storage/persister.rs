//! Best-effort, non-blocking persistence of committed cells.
//!
//! Commits hand their cell to [`Persister::enqueue`], which only does a
//! `try_send` into a bounded queue. A dedicated thread drains the queue
//! into the [`PixelStore`]. A full queue or a failing store costs a
//! durability write and a log line, never a placement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};

use super::{PixelStore, StoreError};
use crate::grid::{Cell, GridStore};
use crate::palette::Palette;

/// Default number of pending writes before new ones are dropped.
pub const DEFAULT_PERSIST_QUEUE: usize = 4096;

enum PersistJob {
    Write { x: u16, y: u16, cell: Cell },
    Flush(oneshot::Sender<()>),
}

/// Persistence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub persisted: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct AtomicPersistStats {
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Cloneable handle to the persistence worker.
///
/// The worker thread exits once every handle is dropped.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::Sender<PersistJob>,
    stats: Arc<AtomicPersistStats>,
}

impl Persister {
    /// Start the worker thread.
    pub fn spawn(store: Arc<dyn PixelStore>, queue: usize) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<PersistJob>(queue.max(1));
        let stats = Arc::new(AtomicPersistStats::default());

        let worker_stats = stats.clone();
        thread::Builder::new()
            .name("place-persister".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    match job {
                        PersistJob::Write { x, y, cell } => match store.persist(x, y, &cell) {
                            Ok(()) => {
                                worker_stats.persisted.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                worker_stats.failed.fetch_add(1, Ordering::Relaxed);
                                log::error!("Failed to persist pixel ({x}, {y}): {e}");
                            }
                        },
                        PersistJob::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                log::debug!("Persister stopped");
            })?;

        Ok(Self { tx, stats })
    }

    /// Queue a cell for persistence. Never blocks; returns `false` if the
    /// write was dropped.
    pub fn enqueue(&self, x: u16, y: u16, cell: Cell) -> bool {
        match self.tx.try_send(PersistJob::Write { x, y, cell }) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("Persistence queue full or closed, dropped write for ({x}, {y}) ({dropped} total)");
                false
            }
        }
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistJob::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// [`flush`](Self::flush) for callers outside an async runtime.
    pub fn flush_blocking(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.blocking_send(PersistJob::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.blocking_recv();
        }
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Load every persisted cell into `grid`.
///
/// Records outside the grid or pointing past the end of the palette are
/// skipped with a warning. Returns the number of cells restored.
pub fn rehydrate(
    grid: &GridStore,
    store: &dyn PixelStore,
    palette: &Palette,
) -> Result<usize, StoreError> {
    let mut restored = 0;
    for (x, y, cell) in store.load_all()? {
        if let Some(color) = cell.color {
            if palette.color(color).is_none() {
                log::warn!("Skipping stored pixel ({x}, {y}): color index {} not in palette", color.0);
                continue;
            }
        }
        match grid.restore(i64::from(x), i64::from(y), cell) {
            Ok(()) => restored += 1,
            Err(e) => log::warn!("Skipping stored pixel: {e}"),
        }
    }
    Ok(restored)
}
