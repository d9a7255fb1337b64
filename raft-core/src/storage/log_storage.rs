//! The concrete, RocksDB-backed `LogStorage` (spec.md §4.1/§6).
//!
//! Two column families: `default` holds user log entries keyed by an
//! 8-byte big-endian index; `conf` holds configuration-change entries
//! (dual-written at the same key as their `default`-CF counterpart) plus a
//! single metadata key, `meta/firstLogIndex`, recording the oldest index
//! still retained after the last prefix truncation.

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use rocksdb::ColumnFamilyDescriptor;
use rocksdb::Options;
use rocksdb::WriteBatch;
use rocksdb::WriteOptions;
use rocksdb::DB;

use crate::config::LogStorageConfig;
use crate::error::StorageError;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft_types::LogId;
use crate::storage::codec::decode_index_key;
use crate::storage::codec::decode_value;
use crate::storage::codec::encode_value;
use crate::storage::codec::index_key;
use crate::storage::codec::BincodeCodec;
use crate::storage::codec::EntryCodec;
use crate::storage::config_manager::ConfigurationManager;
use crate::AppData;

pub const CF_DEFAULT: &str = "default";
pub const CF_CONF: &str = "conf";
const META_FIRST_LOG_INDEX: &[u8] = b"meta/firstLogIndex";

/// The durably persisted subset of a node's term/vote state, written
/// synchronously on every change (spec.md §4.1, "HardState").
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<crate::NodeId>,
}

const META_HARD_STATE: &[u8] = b"meta/hardState";

/// The state a `Node` restores itself to on startup, derived from
/// `LogStorage::init`.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub hard_state: HardState,
    pub last_log_id: LogId,
    pub last_applied: LogId,
    pub membership: crate::raft_types::Configuration,
}

/// The durable log store a `Node` appends to and replays from.
///
/// Every write-failure is treated as fatal by the caller (spec.md §4.1): a
/// `LogStorage` implementation must never silently drop or reorder an
/// acknowledged append.
#[async_trait]
pub trait LogStorage<D: AppData>: Send + Sync + 'static {
    async fn get_initial_state(&self) -> Result<InitialState, StorageError>;

    async fn save_hard_state(&self, hs: &HardState) -> Result<(), StorageError>;

    /// Append one entry, returning its index.
    async fn append_entry(&self, entry: Entry<D>) -> Result<u64, StorageError> {
        let mut appended = self.append_entries(vec![entry]).await?;
        Ok(appended.pop().expect("append_entries(1) returns exactly one index"))
    }

    /// Append a batch of entries atomically, returning their indices in
    /// order.
    async fn append_entries(&self, entries: Vec<Entry<D>>) -> Result<Vec<u64>, StorageError>;

    async fn get_entry(&self, index: u64) -> Result<Option<Entry<D>>, StorageError>;

    async fn get_term(&self, index: u64) -> Result<u64, StorageError> {
        Ok(self.get_entry(index).await?.map(|e| e.log_id.term).unwrap_or(0))
    }

    fn first_log_index(&self) -> u64;

    fn last_log_index(&self) -> u64;

    /// Drop every entry below `first_index_kept`, compacting the reclaimed
    /// range. Idempotent: truncating a prefix already applied is a no-op.
    async fn truncate_prefix(&self, first_index_kept: u64) -> Result<(), StorageError>;

    /// Drop every entry above `last_index_kept`. Used to resolve
    /// `AppendEntries` conflicts on a follower.
    async fn truncate_suffix(&self, last_index_kept: u64) -> Result<(), StorageError>;

    /// Destroy and recreate the store, writing a synthetic no-op anchor
    /// entry at `next_log_index` so subsequent appends have a known
    /// predecessor. Used after installing a snapshot.
    async fn reset(&self, next_log_index: u64) -> Result<(), StorageError>;

    fn configuration_manager(&self) -> &ConfigurationManager;
}

fn cf_opts(cfg: &LogStorageConfig) -> Options {
    let mut opts = Options::default();
    if cfg.cf_write_buffer_size > 0 {
        opts.set_write_buffer_size(cfg.cf_write_buffer_size);
    }
    if cfg.cf_max_write_buffer_number > 0 {
        opts.set_max_write_buffer_number(cfg.cf_max_write_buffer_number);
    }
    if cfg.cf_min_write_buffer_number_to_merge > 0 {
        opts.set_min_write_buffer_number_to_merge(cfg.cf_min_write_buffer_number_to_merge);
    }
    if cfg.cf_max_compaction_bytes > 0 {
        opts.set_max_compaction_bytes(cfg.cf_max_compaction_bytes);
    }
    if cfg.cf_arena_block_size > 0 {
        opts.set_arena_block_size(cfg.cf_arena_block_size);
    }
    opts
}

fn db_opts(cfg: &LogStorageConfig) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    if cfg.db_max_total_wal_size > 0 {
        opts.set_max_total_wal_size(cfg.db_max_total_wal_size);
    }
    if cfg.db_max_subcompactions > 0 {
        opts.set_max_subcompactions(cfg.db_max_subcompactions);
    }
    if cfg.db_recycle_log_file_num > 0 {
        opts.set_recycle_log_file_num(cfg.db_recycle_log_file_num);
    }
    if cfg.db_keep_log_file_num > 0 {
        opts.set_keep_log_file_num(cfg.db_keep_log_file_num);
    }
    if cfg.db_write_buffer_size > 0 {
        opts.set_db_write_buffer_size(cfg.db_write_buffer_size);
    }
    if cfg.db_max_background_jobs > 0 {
        opts.set_max_background_jobs(cfg.db_max_background_jobs);
    }
    if cfg.db_max_manifest_file_size > 0 {
        opts.set_max_manifest_file_size(cfg.db_max_manifest_file_size as usize);
    }
    opts
}

struct Inner {
    db: DB,
    path: std::path::PathBuf,
    cfg: LogStorageConfig,
    sync: bool,
}

/// The embedded RocksDB-backed log store.
pub struct RocksLogStorage<D: AppData> {
    inner: RwLock<Inner>,
    first_log_index: AtomicU64,
    last_log_index: AtomicU64,
    config_manager: ConfigurationManager,
    codec: BincodeCodec,
    _marker: std::marker::PhantomData<D>,
}

impl<D: AppData> RocksLogStorage<D> {
    /// Open (or create) the store at `path`. Replays the `conf` column
    /// family into the returned `ConfigurationManager` and restores
    /// `first_log_index`/`last_log_index` from persisted state.
    pub fn open(path: impl AsRef<Path>, cfg: LogStorageConfig, sync: bool) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let opts = db_opts(&cfg);
        let cf_default = ColumnFamilyDescriptor::new(CF_DEFAULT, cf_opts(&cfg));
        let cf_conf = ColumnFamilyDescriptor::new(CF_CONF, cf_opts(&cfg));
        let db = DB::open_cf_descriptors(&opts, &path, vec![cf_default, cf_conf])?;

        let config_manager = ConfigurationManager::new();

        let first_log_index = {
            let cf = db.cf_handle(CF_CONF).expect("conf CF exists");
            match db.get_cf(cf, META_FIRST_LOG_INDEX)? {
                Some(bytes) => decode_index_key(&bytes).unwrap_or(1).max(1),
                None => 1,
            }
        };

        let mut last_log_index = 0;
        {
            let cf = db.cf_handle(CF_DEFAULT).expect("default CF exists");
            let mut iter = db.full_iterator_cf(cf, rocksdb::IteratorMode::Start);
            let conf_cf = db.cf_handle(CF_CONF).expect("conf CF exists");
            let codec = BincodeCodec;
            while let Some(item) = iter.next() {
                let (key, value) = item?;
                if let Some(index) = decode_index_key(&key) {
                    last_log_index = last_log_index.max(index);
                    let entry: Entry<D> = codec.decode(&value)?;
                    if let EntryPayload::ConfigChange(c) = &entry.payload {
                        config_manager.add(entry.log_id, c.membership.clone());
                    } else if let Ok(Some(conf_bytes)) = db.get_cf(conf_cf, &key) {
                        let conf: crate::raft_types::Configuration = decode_value(&conf_bytes)?;
                        config_manager.add(entry.log_id, conf);
                    }
                }
            }
        }

        Ok(Self {
            inner: RwLock::new(Inner { db, path, cfg, sync }),
            first_log_index: AtomicU64::new(first_log_index),
            last_log_index: AtomicU64::new(last_log_index),
            config_manager,
            codec: BincodeCodec,
            _marker: std::marker::PhantomData,
        })
    }

    fn write_opts(sync: bool) -> WriteOptions {
        let mut wo = WriteOptions::default();
        wo.set_sync(sync);
        wo
    }
}

#[async_trait]
impl<D: AppData> LogStorage<D> for RocksLogStorage<D> {
    async fn get_initial_state(&self) -> Result<InitialState, StorageError> {
        let inner = self.inner.read().unwrap();
        let conf_cf = inner.db.cf_handle(CF_CONF).expect("conf CF exists");
        let hard_state = match inner.db.get_cf(conf_cf, META_HARD_STATE)? {
            Some(bytes) => decode_value(&bytes)?,
            None => HardState::default(),
        };
        drop(inner);

        let last_index = self.last_log_index();
        let last_log_id = if last_index == 0 {
            LogId::none()
        } else {
            self.get_entry(last_index).await?.map(|e| e.log_id).unwrap_or_else(LogId::none)
        };

        let membership = self
            .config_manager
            .last_configuration()
            .unwrap_or_else(|| crate::raft_types::Configuration::new_initial(0));

        Ok(InitialState {
            hard_state,
            last_log_id,
            last_applied: LogId::none(),
            membership,
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<(), StorageError> {
        let inner = self.inner.read().unwrap();
        let conf_cf = inner.db.cf_handle(CF_CONF).expect("conf CF exists");
        inner
            .db
            .put_cf_opt(conf_cf, META_HARD_STATE, encode_value(hs)?, &Self::write_opts(inner.sync))?;
        Ok(())
    }

    async fn append_entries(&self, entries: Vec<Entry<D>>) -> Result<Vec<u64>, StorageError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().unwrap();
        let default_cf = inner.db.cf_handle(CF_DEFAULT).expect("default CF exists");
        let conf_cf = inner.db.cf_handle(CF_CONF).expect("conf CF exists");

        let mut batch = WriteBatch::default();
        let mut indices = Vec::with_capacity(entries.len());
        let mut new_configs = Vec::new();

        for entry in &entries {
            let key = index_key(entry.log_id.index);
            let bytes = self.codec.encode(entry)?;
            batch.put_cf(default_cf, key, &bytes);
            if let EntryPayload::ConfigChange(c) = &entry.payload {
                let conf_bytes = encode_value(&c.membership)?;
                batch.put_cf(conf_cf, key, conf_bytes);
                new_configs.push((entry.log_id, c.membership.clone()));
            }
            indices.push(entry.log_id.index);
        }

        inner.db.write_opt(batch, &Self::write_opts(inner.sync))?;
        drop(inner);

        for (log_id, conf) in new_configs {
            self.config_manager.add(log_id, conf);
        }

        let max_index = *indices.iter().max().unwrap();
        self.last_log_index.fetch_max(max_index, Ordering::AcqRel);
        self.first_log_index.fetch_min(
            *indices.iter().min().unwrap(),
            Ordering::AcqRel,
        );
        // first_log_index only ever tracks the oldest *retained* index, set
        // explicitly by truncate_prefix/reset; appends never lower it below
        // its persisted floor of 1.
        self.first_log_index.fetch_max(1, Ordering::AcqRel);

        Ok(indices)
    }

    async fn get_entry(&self, index: u64) -> Result<Option<Entry<D>>, StorageError> {
        if index < self.first_log_index() || index > self.last_log_index() || index == 0 {
            return Ok(None);
        }
        let inner = self.inner.read().unwrap();
        let cf = inner.db.cf_handle(CF_DEFAULT).expect("default CF exists");
        match inner.db.get_cf(cf, index_key(index))? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn first_log_index(&self) -> u64 {
        self.first_log_index.load(Ordering::Acquire)
    }

    fn last_log_index(&self) -> u64 {
        self.last_log_index.load(Ordering::Acquire)
    }

    async fn truncate_prefix(&self, first_index_kept: u64) -> Result<(), StorageError> {
        let old_first = self.first_log_index();
        if first_index_kept <= old_first {
            return Ok(());
        }
        let inner = self.inner.read().unwrap();
        let default_cf = inner.db.cf_handle(CF_DEFAULT).expect("default CF exists");
        let conf_cf = inner.db.cf_handle(CF_CONF).expect("conf CF exists");

        let from = index_key(old_first);
        let to = index_key(first_index_kept);

        let mut batch = WriteBatch::default();
        batch.delete_range_cf(default_cf, &from, &to);
        batch.delete_range_cf(conf_cf, &from, &to);
        batch.put_cf(conf_cf, META_FIRST_LOG_INDEX, index_key(first_index_kept));
        inner.db.write_opt(batch, &Self::write_opts(inner.sync))?;

        inner.db.compact_range_cf(default_cf, Some(from.as_slice()), Some(to.as_slice()));
        inner.db.compact_range_cf(conf_cf, Some(from.as_slice()), Some(to.as_slice()));
        drop(inner);

        self.first_log_index.store(first_index_kept, Ordering::Release);
        self.config_manager.truncate_prefix(first_index_kept);
        Ok(())
    }

    async fn truncate_suffix(&self, last_index_kept: u64) -> Result<(), StorageError> {
        let old_last = self.last_log_index();
        if last_index_kept >= old_last {
            return Ok(());
        }
        let inner = self.inner.read().unwrap();
        let default_cf = inner.db.cf_handle(CF_DEFAULT).expect("default CF exists");
        let conf_cf = inner.db.cf_handle(CF_CONF).expect("conf CF exists");

        let from = index_key(last_index_kept + 1);
        let to = index_key(old_last + 1);

        let mut batch = WriteBatch::default();
        batch.delete_range_cf(default_cf, &from, &to);
        batch.delete_range_cf(conf_cf, &from, &to);
        inner.db.write_opt(batch, &Self::write_opts(inner.sync))?;
        drop(inner);

        self.last_log_index.store(last_index_kept, Ordering::Release);
        self.config_manager.truncate_suffix(last_index_kept);
        Ok(())
    }

    async fn reset(&self, next_log_index: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let path = inner.path.clone();
        let cfg = inner.cfg.clone();
        let sync = inner.sync;

        DB::destroy(&db_opts(&cfg), &path).map_err(StorageError::from)?;

        let cf_default = ColumnFamilyDescriptor::new(CF_DEFAULT, cf_opts(&cfg));
        let cf_conf = ColumnFamilyDescriptor::new(CF_CONF, cf_opts(&cfg));
        let new_db = DB::open_cf_descriptors(&db_opts(&cfg), &path, vec![cf_default, cf_conf])?;

        let anchor = Entry::<D>::new_purged_marker(LogId::new(0, next_log_index.saturating_sub(1)));
        let key = index_key(anchor.log_id.index);
        let bytes = self.codec.encode(&anchor)?;
        let default_cf = new_db.cf_handle(CF_DEFAULT).expect("default CF exists");
        let conf_cf = new_db.cf_handle(CF_CONF).expect("conf CF exists");
        new_db.put_cf_opt(default_cf, key, &bytes, &Self::write_opts(sync))?;
        new_db.put_cf_opt(conf_cf, META_FIRST_LOG_INDEX, index_key(anchor.log_id.index), &Self::write_opts(sync))?;

        inner.db = new_db;
        drop(inner);

        self.first_log_index.store(anchor.log_id.index, Ordering::Release);
        self.last_log_index.store(anchor.log_id.index, Ordering::Release);
        self.config_manager.truncate_prefix(u64::MAX);
        Ok(())
    }

    fn configuration_manager(&self) -> &ConfigurationManager {
        &self.config_manager
    }
}

impl<D: AppData> std::fmt::Debug for RocksLogStorage<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksLogStorage")
            .field("first_log_index", &self.first_log_index())
            .field("last_log_index", &self.last_log_index())
            .finish()
    }
}

impl From<anyhow::Error> for StorageError {
    fn from(e: anyhow::Error) -> Self {
        StorageError::Codec(e.to_string())
    }
}

/// `Arc`-friendly alias used throughout `core/` and `replication/`.
pub type SharedLogStorage<D> = Arc<dyn LogStorage<D>>;
