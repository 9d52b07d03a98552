//! Placement pipeline: validate → admit → commit → broadcast.
//!
//! ```text
//! PlacementRequest
//!       │ validate bounds / palette / identity ──► Invalid
//!       ▼
//! AdmissionController::check_and_record ─────────► Rejected(remaining)
//!       │ Accepted (record already updated)
//!       ▼
//! GridStore::set_and_then ── under row lock ──► BroadcastHub::publish
//!       │                                   └─► Persister::enqueue
//!       ▼
//! Committed(x, y, color)
//! ```
//!
//! `place` is synchronous and never yields, so once admission is recorded
//! the commit and broadcast always follow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::broadcast::{BroadcastHub, ObserverId, PixelDelta};
use crate::config::CanvasConfig;
use crate::cooldown::{Admission, AdmissionController};
use crate::grid::GridStore;
use crate::palette::{ColorIndex, Palette};
use crate::storage::Persister;

/// A client's request to paint one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub x: i64,
    pub y: i64,
    pub color: String,
    pub identity: Arc<str>,
    /// Unix millis
    pub request_time: u64,
    /// Observer connection the request came in on, for the echo policy.
    pub origin: Option<ObserverId>,
}

impl PlacementRequest {
    pub fn new(x: i64, y: i64, color: impl Into<String>, identity: impl Into<Arc<str>>) -> Self {
        Self {
            x,
            y,
            color: color.into(),
            identity: identity.into(),
            request_time: unix_millis(),
            origin: None,
        }
    }

    pub fn at(mut self, request_time: u64) -> Self {
        self.request_time = request_time;
        self
    }

    pub fn from_observer(mut self, origin: ObserverId) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Why a request was refused before admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    OutOfBounds { x: i64, y: i64 },
    UnknownColor(String),
    EmptyIdentity,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { x, y } => write!(f, "Coordinates ({x}, {y}) are off the canvas"),
            Self::UnknownColor(c) => write!(f, "Color '{c}' is not in the palette"),
            Self::EmptyIdentity => write!(f, "Missing client identity"),
        }
    }
}

/// Outcome of [`PlacementService::place`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementResult {
    /// The pixel is on the canvas; `color` is the palette's spelling.
    Committed { x: u16, y: u16, color: String },
    Rejected { remaining_secs: u64 },
    Invalid(InvalidReason),
}

/// Placement counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementStats {
    pub committed: u64,
    pub rejected: u64,
    pub invalid: u64,
}

#[derive(Default)]
struct AtomicPlacementStats {
    committed: AtomicU64,
    rejected: AtomicU64,
    invalid: AtomicU64,
}

/// Coordinates the grid, the cooldown table and the broadcast hub.
pub struct PlacementService {
    grid: Arc<GridStore>,
    hub: Arc<BroadcastHub>,
    admission: AdmissionController,
    palette: Arc<Palette>,
    cooldown: Duration,
    persister: Option<Persister>,
    stats: AtomicPlacementStats,
}

impl PlacementService {
    pub fn new(config: &CanvasConfig, grid: Arc<GridStore>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            grid,
            hub,
            admission: AdmissionController::new(),
            palette: Arc::new(config.palette.clone()),
            cooldown: config.cooldown,
            persister: None,
            stats: AtomicPlacementStats::default(),
        }
    }

    /// Mirror every commit to durable storage through `persister`.
    pub fn with_persister(mut self, persister: Persister) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Run one placement request through the pipeline.
    pub fn place(&self, request: PlacementRequest) -> PlacementResult {
        let (color_index, color) = match self.validate(&request) {
            Ok(valid) => valid,
            Err(reason) => {
                self.stats.invalid.fetch_add(1, Ordering::Relaxed);
                log::debug!("Invalid placement from {}: {reason}", request.identity);
                return PlacementResult::Invalid(reason);
            }
        };

        if let Admission::Rejected { remaining_secs } =
            self.admission
                .check_and_record(&request.identity, request.request_time, self.cooldown)
        {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return PlacementResult::Rejected { remaining_secs };
        }

        // Bounds were validated, so these casts are lossless.
        let (x, y) = (request.x as u16, request.y as u16);
        let committed = self.grid.set_and_then(
            request.x,
            request.y,
            color_index,
            request.identity.clone(),
            request.request_time,
            |_prior, current| {
                self.hub.publish(PixelDelta {
                    x,
                    y,
                    color: color_index,
                    writer: request.identity.clone(),
                    time: request.request_time,
                    origin: request.origin,
                });
                if let Some(persister) = &self.persister {
                    persister.enqueue(x, y, current.clone());
                }
            },
        );

        match committed {
            Ok(_) => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                log::debug!("{} placed {color} at ({x}, {y})", request.identity);
                PlacementResult::Committed { x, y, color }
            }
            Err(e) => {
                log::error!("Admitted placement failed to commit: {e}");
                self.stats.invalid.fetch_add(1, Ordering::Relaxed);
                PlacementResult::Invalid(InvalidReason::OutOfBounds {
                    x: request.x,
                    y: request.y,
                })
            }
        }
    }

    fn validate(&self, request: &PlacementRequest) -> Result<(ColorIndex, String), InvalidReason> {
        if !self.grid.contains(request.x, request.y) {
            return Err(InvalidReason::OutOfBounds {
                x: request.x,
                y: request.y,
            });
        }
        let index = self
            .palette
            .lookup(&request.color)
            .ok_or_else(|| InvalidReason::UnknownColor(request.color.clone()))?;
        if request.identity.trim().is_empty() {
            return Err(InvalidReason::EmptyIdentity);
        }
        let canonical = self.palette.color(index).unwrap_or(&request.color).to_string();
        Ok((index, canonical))
    }

    pub fn grid(&self) -> &Arc<GridStore> {
        &self.grid
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn palette(&self) -> &Arc<Palette> {
        &self.palette
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn persister(&self) -> Option<&Persister> {
        self.persister.as_ref()
    }

    pub fn stats(&self) -> PlacementStats {
        PlacementStats {
            committed: self.stats.committed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            invalid: self.stats.invalid.load(Ordering::Relaxed),
        }
    }
}

/// Current wall-clock time in Unix millis.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{CanvasEvent, EchoPolicy, ObserverHandle};
    use crate::storage::MemoryPixelStore;
    use std::sync::Barrier;
    use std::thread;

    const SECOND: u64 = 1000;

    fn service_with(size: u16, echo: EchoPolicy) -> PlacementService {
        let config = CanvasConfig {
            size,
            cooldown: Duration::from_secs(10),
            palette: Palette::new(["#FF0000", "#00FF00", "#000000", "blue"]).unwrap(),
        };
        let grid = Arc::new(GridStore::new(config.size));
        let hub = Arc::new(BroadcastHub::new(grid.clone(), 1024, echo));
        PlacementService::new(&config, grid, hub)
    }

    fn service() -> PlacementService {
        service_with(1000, EchoPolicy::IncludeOrigin)
    }

    fn drain_deltas(obs: &mut ObserverHandle) -> Vec<(u16, u16, ColorIndex)> {
        let mut out = Vec::new();
        while let Ok(event) = obs.try_recv() {
            if let CanvasEvent::Delta(d) = event {
                out.push((d.x, d.y, d.color));
            }
        }
        out
    }

    #[test]
    fn test_cooldown_scenario() {
        let svc = service();

        let first = svc.place(PlacementRequest::new(5, 5, "#FF0000", "A").at(0));
        assert_eq!(
            first,
            PlacementResult::Committed { x: 5, y: 5, color: "#FF0000".into() }
        );

        let early = svc.place(PlacementRequest::new(5, 5, "#00FF00", "A").at(3 * SECOND));
        assert_eq!(early, PlacementResult::Rejected { remaining_secs: 7 });

        let later = svc.place(PlacementRequest::new(5, 5, "#00FF00", "A").at(11 * SECOND));
        assert_eq!(
            later,
            PlacementResult::Committed { x: 5, y: 5, color: "#00FF00".into() }
        );

        let cell = svc.grid().get(5, 5).unwrap();
        assert_eq!(svc.palette().color(cell.color.unwrap()), Some("#00FF00"));
        assert_eq!(cell.last_writer.as_deref(), Some("A"));
        assert_eq!(cell.last_write_time, 11 * SECOND);

        assert_eq!(
            svc.stats(),
            PlacementStats { committed: 2, rejected: 1, invalid: 0 }
        );
    }

    #[test]
    fn test_out_of_range_is_invalid() {
        let svc = service();
        let result = svc.place(PlacementRequest::new(1000, 0, "#000000", "B"));
        assert_eq!(
            result,
            PlacementResult::Invalid(InvalidReason::OutOfBounds { x: 1000, y: 0 })
        );
    }

    #[test]
    fn test_bounds_invariant_leaves_grid_untouched() {
        let svc = service_with(8, EchoPolicy::IncludeOrigin);
        let mut obs = svc.hub().subscribe();

        for (x, y) in [(-1, 0), (0, -1), (8, 0), (0, 8), (-5, -5), (8, 8), (i64::MIN, 0)] {
            let result = svc.place(PlacementRequest::new(x, y, "blue", format!("c{x}{y}")));
            assert!(matches!(
                result,
                PlacementResult::Invalid(InvalidReason::OutOfBounds { .. })
            ));
        }

        assert!(svc.grid().snapshot().is_empty());
        assert_eq!(svc.grid().write_count(), 0);
        assert_eq!(svc.admission().tracked_identities(), 0);
        assert!(drain_deltas(&mut obs).is_empty());
    }

    #[test]
    fn test_unknown_color_is_invalid() {
        let svc = service();
        assert_eq!(
            svc.place(PlacementRequest::new(1, 1, "#123456", "A")),
            PlacementResult::Invalid(InvalidReason::UnknownColor("#123456".into()))
        );
        // Rejected before admission: the identity can still place right away.
        assert!(matches!(
            svc.place(PlacementRequest::new(1, 1, "blue", "A")),
            PlacementResult::Committed { .. }
        ));
    }

    #[test]
    fn test_empty_identity_is_invalid() {
        let svc = service();
        assert_eq!(
            svc.place(PlacementRequest::new(1, 1, "blue", "  ")),
            PlacementResult::Invalid(InvalidReason::EmptyIdentity)
        );
        assert_eq!(svc.stats().invalid, 1);
    }

    #[test]
    fn test_color_matched_case_insensitively() {
        let svc = service();
        assert_eq!(
            svc.place(PlacementRequest::new(0, 0, "#ff0000", "A")),
            PlacementResult::Committed { x: 0, y: 0, color: "#FF0000".into() }
        );
    }

    #[test]
    fn test_rejection_has_no_side_effects() {
        let svc = service();
        let mut obs = svc.hub().subscribe();

        svc.place(PlacementRequest::new(1, 1, "blue", "A").at(0));
        let rejected = svc.place(PlacementRequest::new(2, 2, "blue", "A").at(SECOND));
        assert_eq!(rejected, PlacementResult::Rejected { remaining_secs: 9 });

        assert!(svc.grid().get(2, 2).unwrap().is_default());
        assert_eq!(svc.admission().last_accepted("A"), Some(0));
        assert_eq!(drain_deltas(&mut obs), vec![(1, 1, ColorIndex(3))]);
    }

    #[test]
    fn test_two_observers_see_one_delta() {
        let svc = service();
        let mut a = svc.hub().subscribe();
        let mut b = svc.hub().subscribe();

        svc.place(PlacementRequest::new(2, 2, "blue", "A"));

        assert_eq!(drain_deltas(&mut a), vec![(2, 2, ColorIndex(3))]);
        assert_eq!(drain_deltas(&mut b), vec![(2, 2, ColorIndex(3))]);
    }

    #[test]
    fn test_exclude_origin_skips_placer() {
        let svc = service_with(16, EchoPolicy::ExcludeOrigin);
        let mut placer = svc.hub().subscribe();
        let mut watcher = svc.hub().subscribe();

        svc.place(PlacementRequest::new(3, 3, "blue", "A").from_observer(placer.id()));

        assert!(drain_deltas(&mut placer).is_empty());
        assert_eq!(drain_deltas(&mut watcher), vec![(3, 3, ColorIndex(3))]);
    }

    #[test]
    fn test_concurrent_same_identity_race() {
        let svc = Arc::new(service());
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let now = unix_millis();

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let svc = svc.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    svc.place(PlacementRequest::new(i as i64, 0, "blue", "same").at(now))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let committed = results
            .iter()
            .filter(|r| matches!(r, PlacementResult::Committed { .. }))
            .count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, PlacementResult::Rejected { .. }))
            .count();

        assert_eq!(committed, 1);
        assert_eq!(rejected, threads - 1);
        assert_eq!(svc.grid().write_count(), 1);
    }

    #[test]
    fn test_per_cell_order_for_observers() {
        let svc = service();
        let mut obs = svc.hub().subscribe();

        svc.place(PlacementRequest::new(4, 4, "#FF0000", "a"));
        svc.place(PlacementRequest::new(4, 4, "#00FF00", "b"));
        svc.place(PlacementRequest::new(4, 4, "#000000", "c"));

        assert_eq!(
            drain_deltas(&mut obs),
            vec![(4, 4, ColorIndex(0)), (4, 4, ColorIndex(1)), (4, 4, ColorIndex(2))]
        );
    }

    #[test]
    fn test_commit_is_persisted() {
        let store = Arc::new(MemoryPixelStore::new());
        let persister = Persister::spawn(store.clone(), 16).unwrap();
        let svc = service().with_persister(persister);

        svc.place(PlacementRequest::new(9, 8, "blue", "A").at(77));
        svc.persister().unwrap().flush_blocking();

        let stored = store.get(9, 8).unwrap();
        assert_eq!(stored.color, Some(ColorIndex(3)));
        assert_eq!(stored.last_write_time, 77);
    }

    #[test]
    fn test_store_outage_does_not_affect_placement() {
        let store = Arc::new(MemoryPixelStore::new());
        store.set_available(false);
        let persister = Persister::spawn(store.clone(), 16).unwrap();
        let svc = service().with_persister(persister);
        let mut obs = svc.hub().subscribe();

        let result = svc.place(PlacementRequest::new(1, 2, "blue", "A"));
        assert!(matches!(result, PlacementResult::Committed { .. }));
        svc.persister().unwrap().flush_blocking();

        assert_eq!(svc.persister().unwrap().stats().failed, 1);
        assert_eq!(svc.grid().get(1, 2).unwrap().color, Some(ColorIndex(3)));
        assert_eq!(drain_deltas(&mut obs).len(), 1);
    }
}
