//! Startup configuration.
//!
//! Everything here is fixed once the server starts. [`ServerConfig::from_env`]
//! reads `PLACE_*` variables on top of the defaults:
//!
//! | Variable                     | Default            |
//! |------------------------------|--------------------|
//! | `PLACE_BIND_ADDR`            | `127.0.0.1:4000`   |
//! | `PLACE_CANVAS_SIZE`          | `1000` (max 2048)  |
//! | `PLACE_COOLDOWN_SECS`        | `10`               |
//! | `PLACE_PALETTE`              | 16 r/place colors  |
//! | `PLACE_STORAGE_PATH`         | unset (memory)     |
//! | `PLACE_MAX_OBSERVERS`        | `10000`            |
//! | `PLACE_OBSERVER_BUFFER`      | `256`              |
//! | `PLACE_JOIN_BACKLOG`         | `65536`            |
//! | `PLACE_HEARTBEAT_SECS`       | `30`               |
//! | `PLACE_PERSIST_QUEUE`        | `4096`             |
//! | `PLACE_ECHO_ORIGIN`          | `true`             |
//! | `PLACE_TRUST_FORWARDED_FOR`  | `false`            |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::broadcast::{EchoPolicy, DEFAULT_OBSERVER_BUFFER};
use crate::cooldown::DEFAULT_COOLDOWN;
use crate::grid::{DEFAULT_CANVAS_SIZE, MAX_CANVAS_SIZE};
use crate::palette::{Palette, PaletteError};
use crate::storage::DEFAULT_PERSIST_QUEUE;

/// Default for [`ServerConfig::join_backlog`].
pub const DEFAULT_JOIN_BACKLOG: usize = 65_536;

/// Canvas shape and placement rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanvasConfig {
    /// Edge length; the canvas is `size`×`size`.
    pub size: u16,
    pub cooldown: Duration,
    pub palette: Palette,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CANVAS_SIZE,
            cooldown: DEFAULT_COOLDOWN,
            palette: Palette::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections beyond this are refused
    pub max_observers: usize,
    /// Deltas buffered per observer before it is dropped as lagging
    pub observer_buffer: usize,
    /// Deltas held on a connection while its snapshot is being written
    pub join_backlog: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Pending persistence writes before new ones are dropped
    pub persist_queue: usize,
    pub echo_policy: EchoPolicy,
    /// Take the client identity from `X-Forwarded-For` (behind a proxy)
    pub trust_forwarded_for: bool,
    pub canvas: CanvasConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            max_observers: 10_000,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            join_backlog: DEFAULT_JOIN_BACKLOG,
            heartbeat_interval_secs: 30,
            storage_path: None,
            persist_queue: DEFAULT_PERSIST_QUEUE,
            echo_policy: EchoPolicy::IncludeOrigin,
            trust_forwarded_for: false,
            canvas: CanvasConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PLACE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("PLACE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(size) = parse_var::<u16>(&lookup, "PLACE_CANVAS_SIZE")? {
            if size == 0 || size > MAX_CANVAS_SIZE {
                return Err(ConfigError::Invalid {
                    key: "PLACE_CANVAS_SIZE",
                    value: size.to_string(),
                });
            }
            config.canvas.size = size;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PLACE_COOLDOWN_SECS")? {
            config.canvas.cooldown = Duration::from_secs(secs);
        }
        if let Some(colors) = lookup("PLACE_PALETTE") {
            let colors = colors.split(',').map(str::trim).filter(|c| !c.is_empty());
            config.canvas.palette = Palette::new(colors).map_err(ConfigError::Palette)?;
        }
        if let Some(path) = lookup("PLACE_STORAGE_PATH") {
            if !path.trim().is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        }
        if let Some(n) = parse_var(&lookup, "PLACE_MAX_OBSERVERS")? {
            config.max_observers = n;
        }
        if let Some(n) = parse_var(&lookup, "PLACE_OBSERVER_BUFFER")? {
            config.observer_buffer = n;
        }
        if let Some(n) = parse_var(&lookup, "PLACE_JOIN_BACKLOG")? {
            config.join_backlog = n;
        }
        if let Some(n) = parse_var(&lookup, "PLACE_HEARTBEAT_SECS")? {
            config.heartbeat_interval_secs = n;
        }
        if let Some(n) = parse_var(&lookup, "PLACE_PERSIST_QUEUE")? {
            config.persist_queue = n;
        }
        if let Some(echo) = parse_flag(&lookup, "PLACE_ECHO_ORIGIN")? {
            config.echo_policy = if echo {
                EchoPolicy::IncludeOrigin
            } else {
                EchoPolicy::ExcludeOrigin
            };
        }
        if let Some(trust) = parse_flag(&lookup, "PLACE_TRUST_FORWARDED_FOR")? {
            config.trust_forwarded_for = trust;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(None),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
        None => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    Palette(PaletteError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { key, value } => write!(f, "Invalid value for {key}: '{value}'"),
            Self::Palette(e) => write!(f, "Invalid PLACE_PALETTE: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
