//! Canonical canvas state: one [`Cell`] per coordinate.
//!
//! Layout:
//! ```text
//! rows[0]   Mutex ─► [ Cell | Cell | ... | Cell ]   (size cells)
//! rows[1]   Mutex ─► [ Cell | Cell | ... | Cell ]
//!   ...
//! rows[N-1] Mutex ─► [ Cell | Cell | ... | Cell ]
//! ```
//!
//! Every row has its own lock, so writes to different rows proceed in
//! parallel and a single cell write is atomic. A snapshot takes all row
//! locks in ascending order, which gives a point-in-time view and never
//! deadlocks with single-row writers.
//!
//! The `*_and_then` variants run a caller hook while the locks are still
//! held. The placement path uses this to publish a delta in the same
//! critical section as the write, and the broadcast hub uses it to register
//! an observer in the same critical section as its snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::palette::ColorIndex;

/// Default canvas edge length.
pub const DEFAULT_CANVAS_SIZE: u16 = 1000;

/// Largest edge length accepted from configuration (about 128 MiB of cells).
pub const MAX_CANVAS_SIZE: u16 = 2048;

/// State of one grid position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    /// `None` is the background color.
    pub color: Option<ColorIndex>,
    pub last_writer: Option<Arc<str>>,
    /// Unix millis of the last write, 0 if never written.
    pub last_write_time: u64,
}

impl Cell {
    pub fn is_default(&self) -> bool {
        self.color.is_none() && self.last_writer.is_none()
    }
}

/// `(x, y, cell)` as produced by [`GridStore::snapshot`].
pub type CellEntry = (u16, u16, Cell);

/// Grid access errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    OutOfBounds { x: i64, y: i64, size: u16 },
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { x, y, size } => {
                write!(f, "Coordinates ({x}, {y}) outside {size}x{size} canvas")
            }
        }
    }
}

impl std::error::Error for GridError {}

/// Array-backed square grid with per-row locking.
pub struct GridStore {
    size: u16,
    rows: Box<[Mutex<Box<[Cell]>>]>,
    writes: AtomicU64,
}

impl GridStore {
    /// Create a `size`×`size` grid with every cell at its default.
    pub fn new(size: u16) -> Self {
        let rows = (0..size)
            .map(|_| Mutex::new(vec![Cell::default(); size as usize].into_boxed_slice()))
            .collect();
        Self {
            size,
            rows,
            writes: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        let n = i64::from(self.size);
        (0..n).contains(&x) && (0..n).contains(&y)
    }

    /// Read a cell. Never-written cells come back as [`Cell::default`].
    pub fn get(&self, x: i64, y: i64) -> Result<Cell, GridError> {
        let (col, row) = self.index(x, y)?;
        Ok(self.lock_row(row)[col].clone())
    }

    /// Overwrite a cell and return what it held before.
    pub fn set(
        &self,
        x: i64,
        y: i64,
        color: ColorIndex,
        writer: Arc<str>,
        time: u64,
    ) -> Result<Cell, GridError> {
        self.set_and_then(x, y, color, writer, time, |_, _| ())
            .map(|(prior, ())| prior)
    }

    /// Overwrite a cell, then run `hook(prior, current)` before the row
    /// lock is released.
    ///
    /// The hook must not touch the grid again.
    pub fn set_and_then<R>(
        &self,
        x: i64,
        y: i64,
        color: ColorIndex,
        writer: Arc<str>,
        time: u64,
        hook: impl FnOnce(&Cell, &Cell) -> R,
    ) -> Result<(Cell, R), GridError> {
        let (col, row) = self.index(x, y)?;
        let mut cells = self.lock_row(row);

        let current = Cell {
            color: Some(color),
            last_writer: Some(writer),
            last_write_time: time,
        };
        let prior = std::mem::replace(&mut cells[col], current);
        self.writes.fetch_add(1, Ordering::Relaxed);

        let out = hook(&prior, &cells[col]);
        Ok((prior, out))
    }

    /// Install a cell loaded from durable storage. Does not count as a write.
    pub fn restore(&self, x: i64, y: i64, cell: Cell) -> Result<(), GridError> {
        let (col, row) = self.index(x, y)?;
        self.lock_row(row)[col] = cell;
        Ok(())
    }

    /// All non-default cells, as one consistent point-in-time view.
    pub fn snapshot(&self) -> Vec<CellEntry> {
        self.snapshot_and_then(|cells| cells)
    }

    /// Build a snapshot and hand it to `f` while every row is still locked.
    ///
    /// No write can land between the snapshot and the end of `f`. The
    /// closure must not touch the grid again.
    pub fn snapshot_and_then<R>(&self, f: impl FnOnce(Vec<CellEntry>) -> R) -> R {
        let guards: Vec<_> = (0..self.rows.len()).map(|row| self.lock_row(row)).collect();

        let mut cells = Vec::new();
        for (y, row) in guards.iter().enumerate() {
            for (x, cell) in row.iter().enumerate() {
                if !cell.is_default() {
                    cells.push((x as u16, y as u16, cell.clone()));
                }
            }
        }

        let out = f(cells);
        drop(guards);
        out
    }

    /// Number of committed writes since startup (restores excluded).
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn index(&self, x: i64, y: i64) -> Result<(usize, usize), GridError> {
        if !self.contains(x, y) {
            return Err(GridError::OutOfBounds { x, y, size: self.size });
        }
        Ok((x as usize, y as usize))
    }

    // A panic in a hook poisons the row; the cells themselves are always
    // left whole, so the guard is recovered.
    fn lock_row(&self, row: usize) -> MutexGuard<'_, Box<[Cell]>> {
        self.rows[row].lock().unwrap_or_else(PoisonError::into_inner)
    }
}
