//! Durable log storage (spec.md §4.1, §6 "Log-file layout").
//!
//! [`LogStorage`] is the trait `core::RaftCore` and `replication::ReplicationStream`
//! depend on; [`log_storage::RocksLogStorage`] is the concrete, embedded-RocksDB
//! implementation described in the spec. [`codec`] is the serialization boundary
//! between `Entry<D>` and the bytes written to the log column family, and
//! [`config_manager`] is the in-memory configuration history rebuilt by replaying
//! the `conf` column family at open time.

pub mod codec;
pub mod config_manager;
pub mod log_storage;

pub use log_storage::HardState;
pub use log_storage::InitialState;
pub use log_storage::LogStorage;
pub use log_storage::RocksLogStorage;
pub use log_storage::SharedLogStorage;
pub use log_storage::CF_CONF;
pub use log_storage::CF_DEFAULT;
