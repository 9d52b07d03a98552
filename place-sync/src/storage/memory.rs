//! In-process pixel store.
//!
//! Used when no data directory is configured and by tests. Outages can be
//! simulated with [`MemoryPixelStore::set_available`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{PixelStore, StoreError};
use crate::grid::Cell;

pub struct MemoryPixelStore {
    cells: Mutex<BTreeMap<(u16, u16), Cell>>,
    available: AtomicBool,
}

impl MemoryPixelStore {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Pre-populated store, as if a previous run had persisted `cells`.
    pub fn with_cells(cells: impl IntoIterator<Item = (u16, u16, Cell)>) -> Self {
        let store = Self::new();
        {
            let mut map = store.cells.lock().unwrap_or_else(PoisonError::into_inner);
            for (x, y, cell) in cells {
                map.insert((x, y), cell);
            }
        }
        store
    }

    /// While unavailable, `persist` fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn get(&self, x: u16, y: u16) -> Option<Cell> {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(x, y))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryPixelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelStore for MemoryPixelStore {
    fn load_all(&self) -> Result<Vec<(u16, u16, Cell)>, StoreError> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cells
            .iter()
            .map(|(&(x, y), cell)| (x, y, cell.clone()))
            .collect())
    }

    fn persist(&self, x: u16, y: u16, cell: &Cell) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((x, y), cell.clone());
        Ok(())
    }
}
