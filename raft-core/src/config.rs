//! Runtime configuration for the consensus core (spec.md §6 "Configuration
//! knobs"), built and validated the way the teacher's `Config::build(..).validate()`
//! is.

use rand::thread_rng;
use rand::Rng;
use thiserror::Error;

/// Log-compaction / snapshot policy. Only one policy is currently
/// supported (the teacher ships exactly one variant too): snapshot once
/// `last_applied` has advanced `threshold` entries past the last snapshot.
#[derive(Clone, Debug)]
pub enum SnapshotPolicy {
    LogsSinceLast(u64),
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy::LogsSinceLast(5000)
    }
}

/// Tuning knobs for the embedded RocksDB log store (spec.md §6,
/// `raftLogStorage.*`). `0` means "use the engine's built-in default" for
/// every field, matching the spec's stated convention.
#[derive(Clone, Debug, Default)]
pub struct LogStorageConfig {
    pub db_max_total_wal_size: u64,
    pub db_max_subcompactions: u32,
    pub db_recycle_log_file_num: usize,
    pub db_keep_log_file_num: usize,
    pub db_write_buffer_size: usize,
    pub db_max_background_jobs: i32,
    pub db_max_background_compactions: i32,
    pub db_max_background_flushes: i32,
    pub db_max_manifest_file_size: u64,
    pub cf_block_size: usize,
    pub cf_block_cache_size: usize,
    pub cf_arena_block_size: usize,
    pub cf_min_write_buffer_number_to_merge: i32,
    pub cf_max_write_buffer_number: i32,
    pub cf_max_compaction_bytes: u64,
    pub cf_write_buffer_size: usize,
}

/// The Raft node's runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Human readable name for the cluster, used purely for tracing spans.
    pub cluster_name: String,

    /// Lower bound, in milliseconds, for the randomized election timeout.
    /// Also caps how long a ReadIndex heartbeat round is allowed to run.
    pub election_timeout_min: u64,
    /// Upper bound, in milliseconds, for the randomized election timeout.
    pub election_timeout_max: u64,
    /// The interval, in milliseconds, at which idle leaders emit
    /// heartbeats to followers.
    pub heartbeat_interval: u64,

    /// The maximum number of entries to batch into one outbound
    /// `AppendEntries` payload.
    pub max_payload_entries: u64,
    /// Once a replicator's unacknowledged backlog (relative to its match
    /// index) exceeds this many entries, the replicator drops from
    /// line-rate into lagging mode to avoid unbounded buffering.
    pub replication_lag_threshold: u64,

    /// Timeout, in milliseconds, for an `InstallSnapshot` chunk RPC.
    pub install_snapshot_timeout: u64,

    /// Policy governing when log compaction (snapshotting) is triggered.
    pub snapshot_policy: SnapshotPolicy,
    /// How often, in seconds, the background snapshot scheduler wakes to
    /// re-evaluate `snapshot_policy` even absent new applies.
    pub snapshot_interval_secs: u64,
    /// Minimum number of uncompacted log entries required before a
    /// snapshot is considered, independent of `snapshot_policy`'s own
    /// threshold. `0` disables the extra margin check.
    pub snapshot_log_index_margin: u64,

    /// Capacity of the bounded ring buffer backing the apply/read-index
    /// pipelines (`ReadOnlyService::add_request`, `Node::apply`).
    pub disruptor_buffer_size: usize,
    /// Batch size at which a full buffer is drained into one downstream
    /// unit of work (one `AppendEntries` payload, one `ReadIndexRequest`).
    pub apply_batch: usize,

    /// Once a follower's applied index falls this many entries behind the
    /// leader's recorded commit index at ReadIndex time, the read fails
    /// fast instead of parking (spec.md §4.5/§8 scenario 4).
    pub max_read_index_lag: u64,

    /// Whether log appends must wait for a synchronous WAL flush before
    /// being considered durable.
    pub sync: bool,

    /// Default timeout, in milliseconds, applied to outbound RPCs.
    pub rpc_default_timeout: u64,
    /// Timeout, in milliseconds, for establishing a `ClientService`
    /// connection.
    pub rpc_connect_timeout_ms: u64,
    /// Size of the thread/task pool dispatching inbound RPC handlers.
    pub rpc_processor_thread_pool_size: usize,

    /// Whether linearizable reads may use the lease-read fast path
    /// (skipping the heartbeat confirmation round while within
    /// `leader_lease_timeout` of the last confirmed heartbeat).
    pub enable_lease_read: bool,
    /// How long, in milliseconds, a leader's heartbeat lease remains
    /// valid for lease reads and for detecting loss of quorum.
    pub leader_lease_timeout: u64,

    pub raft_log_storage: LogStorageConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("election_timeout_min ({min}) must be less than election_timeout_max ({max})")]
    ElectionTimeoutBoundsInverted { min: u64, max: u64 },

    #[error("heartbeat_interval ({heartbeat}) must be less than election_timeout_min ({min})")]
    HeartbeatGreaterThanElectionTimeout { heartbeat: u64, min: u64 },

    #[error("max_payload_entries must be greater than 0")]
    ZeroMaxPayloadEntries,

    #[error("disruptor_buffer_size must be greater than 0")]
    ZeroDisruptorBufferSize,

    #[error("apply_batch must be greater than 0 and no larger than disruptor_buffer_size")]
    InvalidApplyBatch,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "raft-cluster".into(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_payload_entries: 300,
            replication_lag_threshold: 1000,
            install_snapshot_timeout: 200,
            snapshot_policy: SnapshotPolicy::default(),
            snapshot_interval_secs: 600,
            snapshot_log_index_margin: 0,
            disruptor_buffer_size: 1024,
            apply_batch: 64,
            max_read_index_lag: 100_000,
            sync: true,
            rpc_default_timeout: 1000,
            rpc_connect_timeout_ms: 1000,
            rpc_processor_thread_pool_size: 8,
            enable_lease_read: false,
            leader_lease_timeout: 900,
            raft_log_storage: LogStorageConfig::default(),
        }
    }
}

impl Config {
    /// Start building a config for the named cluster, with defaults for
    /// every other knob.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            inner: Config {
                cluster_name,
                ..Config::default()
            },
        }
    }

    /// Check the invariants the rest of the core relies on; called once by
    /// `ConfigBuilder::validate`.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::ElectionTimeoutBoundsInverted {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatGreaterThanElectionTimeout {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        if self.max_payload_entries == 0 {
            return Err(ConfigError::ZeroMaxPayloadEntries);
        }
        if self.disruptor_buffer_size == 0 {
            return Err(ConfigError::ZeroDisruptorBufferSize);
        }
        if self.apply_batch == 0 || self.apply_batch > self.disruptor_buffer_size {
            return Err(ConfigError::InvalidApplyBatch);
        }
        Ok(self)
    }

    /// Generate a new randomized election timeout duration, in
    /// milliseconds, within `[election_timeout_min, election_timeout_max)`.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// Builder for `Config`, mirroring the teacher's fluent `Config::build(..)`
/// entry point.
pub struct ConfigBuilder {
    inner: Config,
}

macro_rules! builder_field {
    ($name:ident: $ty:ty) => {
        pub fn $name(mut self, $name: $ty) -> Self {
            self.inner.$name = $name;
            self
        }
    };
}

impl ConfigBuilder {
    builder_field!(election_timeout_min: u64);
    builder_field!(election_timeout_max: u64);
    builder_field!(heartbeat_interval: u64);
    builder_field!(max_payload_entries: u64);
    builder_field!(replication_lag_threshold: u64);
    builder_field!(install_snapshot_timeout: u64);
    builder_field!(snapshot_policy: SnapshotPolicy);
    builder_field!(snapshot_interval_secs: u64);
    builder_field!(snapshot_log_index_margin: u64);
    builder_field!(disruptor_buffer_size: usize);
    builder_field!(apply_batch: usize);
    builder_field!(max_read_index_lag: u64);
    builder_field!(sync: bool);
    builder_field!(rpc_default_timeout: u64);
    builder_field!(rpc_connect_timeout_ms: u64);
    builder_field!(rpc_processor_thread_pool_size: usize);
    builder_field!(enable_lease_read: bool);
    builder_field!(leader_lease_timeout: u64);
    builder_field!(raft_log_storage: LogStorageConfig);

    pub fn validate(self) -> Result<Config, ConfigError> {
        self.inner.validate()
    }
}
