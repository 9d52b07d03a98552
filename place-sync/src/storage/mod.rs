//! Durable mirror of the canvas.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  enqueue (never blocks)  ┌───────────┐  persist  ┌──────────────┐
//! │ Placement   │ ───────────────────────► │ Persister │ ────────► │ PixelStore   │
//! │ (row lock)  │                          │ (thread)  │           │ RocksDB/mem  │
//! └─────────────┘                          └───────────┘           └──────┬───────┘
//!        ▲                                                                │
//!        │                       rehydrate on startup                     │
//!        └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The in-memory grid is the source of truth for live observers. The store
//! is written best-effort after each commit and only read back at startup.

pub mod memory;
pub mod persister;
pub mod rocks;

pub use memory::MemoryPixelStore;
pub use persister::{rehydrate, PersistStats, Persister, DEFAULT_PERSIST_QUEUE};
pub use rocks::{RocksPixelStore, StoreConfig};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::grid::Cell;
use crate::palette::ColorIndex;

/// Narrow interface the core uses to reach durable storage.
pub trait PixelStore: Send + Sync {
    /// Every persisted cell, used to rehydrate the grid at startup.
    fn load_all(&self) -> Result<Vec<(u16, u16, Cell)>, StoreError>;

    /// Record the current state of one cell.
    fn persist(&self, x: u16, y: u16, cell: &Cell) -> Result<(), StoreError>;
}

/// On-disk form of a [`Cell`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub color: Option<u8>,
    pub writer: Option<String>,
    pub time: u64,
}

impl CellRecord {
    pub fn from_cell(cell: &Cell) -> Self {
        Self {
            color: cell.color.map(|c| c.0),
            writer: cell.last_writer.as_deref().map(str::to_string),
            time: cell.last_write_time,
        }
    }

    pub fn into_cell(self) -> Cell {
        Cell {
            color: self.color.map(ColorIndex),
            last_writer: self.writer.map(Arc::from),
            last_write_time: self.time,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Store cannot take writes right now
    Unavailable(String),
    /// Store was created for a different canvas size
    CanvasMismatch { stored: u16, configured: u16 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::CanvasMismatch { stored, configured } => write!(
                f,
                "Store holds a {stored}x{stored} canvas, configured size is {configured}x{configured}"
            ),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
