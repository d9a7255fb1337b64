//! Shared test-cluster setup. The actual router and state machine live in
//! the `memstore` crate (the same role the teacher's `memstore` crate
//! plays for its own integration tests); this module just re-exports them
//! under the name every test in this directory imports.

#![allow(dead_code, unused_imports)]

pub use memstore::init_tracing;
pub use memstore::ClientRequest;
pub use memstore::ClientResponse;
pub use memstore::MemRaft;
pub use memstore::MemStore;
pub use memstore::RaftRouter;
