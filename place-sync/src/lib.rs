//! # place-sync: Shared pixel canvas core
//!
//! An N×N grid where clients paint one pixel at a time, limited by a
//! per-client cooldown, with every change pushed to all connected observers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CanvasClient │ ◄─────────────────► │ CanvasServer │
//! │ (per user)   │    Binary Proto     │ (central)    │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                    ┌────────┴─────────┐
//!                                    │ PlacementService │
//!                                    └────────┬─────────┘
//!                     ┌──────────────┬────────┴───────┬──────────────┐
//!                     ▼              ▼                ▼              ▼
//!              ┌────────────┐ ┌────────────┐ ┌──────────────┐ ┌────────────┐
//!              │ Admission  │ │ GridStore  │ │ BroadcastHub │ │ Persister  │
//!              │ (cooldown) │ │ (row locks)│ │ (fan-out)    │ │ (RocksDB)  │
//!              └────────────┘ └────────────┘ └──────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`palette`]: Allowed colors and their indices
//! - [`grid`]: Row-locked canvas storage
//! - [`cooldown`]: Per-identity admission control
//! - [`placement`]: Validate, admit, commit, broadcast
//! - [`broadcast`]: Snapshot-then-deltas observer fan-out
//! - [`storage`]: Best-effort durable mirror (RocksDB)
//! - [`protocol`]: Binary wire protocol (bincode)
//! - [`config`]: Startup configuration
//! - [`server`]: WebSocket canvas server
//! - [`client`]: WebSocket canvas client

pub mod palette;
pub mod grid;
pub mod cooldown;
pub mod placement;
pub mod broadcast;
pub mod storage;
pub mod protocol;
pub mod config;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use palette::{ColorIndex, Palette, PaletteError, DEFAULT_PALETTE};
pub use grid::{Cell, GridError, GridStore, DEFAULT_CANVAS_SIZE, MAX_CANVAS_SIZE};
pub use cooldown::{Admission, AdmissionController, AdmissionStats, DEFAULT_COOLDOWN};
pub use placement::{
    InvalidReason, PlacementRequest, PlacementResult, PlacementService, PlacementStats,
};
pub use broadcast::{
    BroadcastHub, BroadcastStats, CanvasEvent, CanvasSnapshot, EchoPolicy, ObserverHandle,
    ObserverId, PixelDelta,
};
pub use storage::{
    MemoryPixelStore, PersistStats, Persister, PixelStore, RocksPixelStore, StoreConfig,
    StoreError,
};
pub use protocol::{ClientMessage, PixelUpdate, ProtocolError, ServerMessage};
pub use config::{CanvasConfig, ConfigError, ServerConfig};
pub use server::{CanvasServer, ServerStats};
pub use client::{CanvasClient, ClientEvent, ConnectionState};
