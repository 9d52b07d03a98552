//! RocksDB-backed pixel store.
//!
//! Column families:
//! - `pixels`:   one record per written cell, keyed by `x:u16 BE | y:u16 BE`
//! - `metadata`: canvas size the store was created for
//!
//! Keys sort by x, then y, so `load_all` is a single forward scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{CellRecord, PixelStore, StoreError};
use crate::grid::Cell;

const CF_PIXELS: &str = "pixels";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_PIXELS, CF_METADATA];

const META_CANVAS_SIZE: &[u8] = b"canvas_size";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("place_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// RocksDB pixel store.
pub struct RocksPixelStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    canvas_size: u16,
}

impl RocksPixelStore {
    /// Open (or create) the store for a `canvas_size`×`canvas_size` canvas.
    ///
    /// Fails with [`StoreError::CanvasMismatch`] if the directory already
    /// holds a canvas of another size.
    pub fn open(config: StoreConfig, canvas_size: u16) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self {
            db,
            config,
            canvas_size,
        };
        store.check_canvas_size()?;
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PIXELS => {
                // Small, frequently overwritten records
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Record the canvas size on first open, compare on later opens.
    fn check_canvas_size(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, META_CANVAS_SIZE)? {
            Some(bytes) if bytes.len() == 2 => {
                let stored = u16::from_be_bytes([bytes[0], bytes[1]]);
                if stored != self.canvas_size {
                    return Err(StoreError::CanvasMismatch {
                        stored,
                        configured: self.canvas_size,
                    });
                }
                Ok(())
            }
            Some(_) => Err(StoreError::DeserializationError(
                "Malformed canvas size in metadata".into(),
            )),
            None => {
                self.db
                    .put_cf(&cf, META_CANVAS_SIZE, self.canvas_size.to_be_bytes())?;
                Ok(())
            }
        }
    }

    /// Load one persisted cell, if any.
    pub fn load_pixel(&self, x: u16, y: u16) -> Result<Option<Cell>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        match self.db.get_cf(&cf, Self::pixel_key(x, y))? {
            Some(bytes) => Ok(Some(CellRecord::decode(&bytes)?.into_cell())),
            None => Ok(None),
        }
    }

    /// Number of persisted cells (full scan).
    pub fn pixel_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn canvas_size(&self) -> u16 {
        self.canvas_size
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn pixel_key(x: u16, y: u16) -> [u8; 4] {
        let [x0, x1] = x.to_be_bytes();
        let [y0, y1] = y.to_be_bytes();
        [x0, x1, y0, y1]
    }

    fn parse_key(key: &[u8]) -> Option<(u16, u16)> {
        match key {
            [x0, x1, y0, y1] => Some((
                u16::from_be_bytes([*x0, *x1]),
                u16::from_be_bytes([*y0, *y1]),
            )),
            _ => None,
        }
    }
}

impl PixelStore for RocksPixelStore {
    fn load_all(&self) -> Result<Vec<(u16, u16, Cell)>, StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let mut cells = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let Some((x, y)) = Self::parse_key(&key) else {
                log::warn!("Skipping pixel record with malformed key ({} bytes)", key.len());
                continue;
            };
            cells.push((x, y, CellRecord::decode(&value)?.into_cell()));
        }

        Ok(cells)
    }

    fn persist(&self, x: u16, y: u16, cell: &Cell) -> Result<(), StoreError> {
        let cf = self.cf(CF_PIXELS)?;
        let value = CellRecord::from_cell(cell).encode()?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, Self::pixel_key(x, y), value, &write_opts)?;
        Ok(())
    }
}
