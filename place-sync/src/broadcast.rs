//! Fan-out of committed pixels to connected observers.
//!
//! Each observer owns a bounded mpsc channel. Publishing walks the observer
//! set and does a non-blocking `try_send` per channel, so one slow or dead
//! observer never holds up the rest:
//!
//! ```text
//!                         ┌─► observer A  [Snapshot, Delta, Delta, ...]
//! commit ─► publish ──────┼─► observer B  [Snapshot, Delta, ...]
//!  (row lock held)        └─► observer C  (full → dropped)
//! ```
//!
//! Exactly-once across the subscribe race: `subscribe` registers the new
//! channel while the grid is fully locked for its snapshot, and `publish`
//! runs while the committed cell's row is locked. A commit is therefore
//! either in the snapshot or delivered as a delta, never both and never
//! neither. Per-cell order follows from the row lock too.
//!
//! An observer whose channel fills up is removed instead of silently losing
//! deltas. Its receiver drains what was queued and then reports closed; the
//! connection layer disconnects it and the client resubscribes for a fresh
//! snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use uuid::Uuid;

use crate::grid::{CellEntry, GridStore};
use crate::palette::ColorIndex;

/// Connection-scoped observer identifier.
pub type ObserverId = Uuid;

/// Default number of events buffered per observer.
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

/// Whether a delta is sent back to the observer that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPolicy {
    #[default]
    IncludeOrigin,
    ExcludeOrigin,
}

/// Full canvas state at the instant an observer subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasSnapshot {
    pub size: u16,
    /// Non-default cells only.
    pub cells: Vec<CellEntry>,
}

/// One committed placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelDelta {
    pub x: u16,
    pub y: u16,
    pub color: ColorIndex,
    pub writer: Arc<str>,
    pub time: u64,
    /// Observer connection the placement arrived on, if any.
    pub origin: Option<ObserverId>,
}

/// What an observer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasEvent {
    Snapshot(Arc<CanvasSnapshot>),
    Delta(Arc<PixelDelta>),
}

/// Receiving side of a subscription.
pub struct ObserverHandle {
    id: ObserverId,
    events: mpsc::Receiver<CanvasEvent>,
}

impl ObserverHandle {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next event; `None` once the hub has dropped this observer and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<CanvasEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Result<CanvasEvent, TryRecvError> {
        self.events.try_recv()
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub deltas_published: u64,
    pub deliveries: u64,
    pub observers_dropped: u64,
    pub active_observers: usize,
}

/// Atomic broadcast stats, updated without the observer lock.
struct AtomicBroadcastStats {
    deltas_published: AtomicU64,
    deliveries: AtomicU64,
    observers_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            deltas_published: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            observers_dropped: AtomicU64::new(0),
        }
    }
}

/// Observer registry and fan-out.
pub struct BroadcastHub {
    grid: Arc<GridStore>,
    observers: RwLock<HashMap<ObserverId, mpsc::Sender<CanvasEvent>>>,
    /// Deltas buffered per observer before it counts as lagging
    capacity: usize,
    echo: EchoPolicy,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    pub fn new(grid: Arc<GridStore>, capacity: usize, echo: EchoPolicy) -> Self {
        Self {
            grid,
            observers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            echo,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a new observer.
    ///
    /// The returned handle yields one `Snapshot` first, then every delta
    /// committed after that snapshot.
    pub fn subscribe(&self) -> ObserverHandle {
        let id = Uuid::new_v4();
        // One extra slot so the snapshot never eats into the delta budget
        let (tx, rx) = mpsc::channel(self.capacity + 1);
        let size = self.grid.size();

        self.grid.snapshot_and_then(|cells| {
            let snapshot = Arc::new(CanvasSnapshot { size, cells });
            // Fresh channel with spare capacity: cannot fail
            let _ = tx.try_send(CanvasEvent::Snapshot(snapshot));
            self.observers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, tx);
        });

        log::debug!("Observer {id} subscribed");
        ObserverHandle { id, events: rx }
    }

    /// Remove an observer. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: &ObserverId) -> bool {
        let removed = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            log::debug!("Observer {id} unsubscribed");
        }
        removed
    }

    /// Deliver a delta to every observer (subject to the echo policy).
    ///
    /// Never blocks. Observers whose channel is full or closed are removed.
    /// Returns the number of observers the delta was queued for.
    pub fn publish(&self, delta: PixelDelta) -> usize {
        let origin = delta.origin;
        let event = CanvasEvent::Delta(Arc::new(delta));

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
            for (id, tx) in observers.iter() {
                if self.echo == EchoPolicy::ExcludeOrigin && origin == Some(*id) {
                    continue;
                }
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Observer {id} lagged past {} events, dropping it", self.capacity);
                        failed.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => failed.push(*id),
                }
            }
        }

        if !failed.is_empty() {
            let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
            for id in &failed {
                if observers.remove(id).is_some() {
                    self.atomic_stats.observers_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.atomic_stats.deltas_published.fetch_add(1, Ordering::Relaxed);
        self.atomic_stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_subscribed(&self, id: &ObserverId) -> bool {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            deltas_published: self.atomic_stats.deltas_published.load(Ordering::Relaxed),
            deliveries: self.atomic_stats.deliveries.load(Ordering::Relaxed),
            observers_dropped: self.atomic_stats.observers_dropped.load(Ordering::Relaxed),
            active_observers: self.observer_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn echo_policy(&self) -> EchoPolicy {
        self.echo
    }
}
