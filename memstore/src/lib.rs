//! An in-memory [`StateMachine`] and an in-process [`ClientService`] router,
//! used as the reference state machine and test harness for `raft-core`.
//!
//! Nothing here is meant to be shipped to production: a real embedder
//! brings its own durable state machine and its own gRPC/TCP transport.
//! This crate exists so `raft-core`'s test suite (and anyone reading it to
//! learn the API) has a small, complete example of both integration
//! points wired together.

mod router;
mod state_machine;

pub use router::MemRaft;
pub use router::RaftRouter;
pub use state_machine::ClientRequest;
pub use state_machine::ClientResponse;
pub use state_machine::MemStore;
pub use state_machine::MemStoreSnapshot;

use tracing_subscriber::prelude::*;

/// Install a global `tracing` subscriber that prints full span events,
/// guarded so repeated calls across tests in one binary don't panic.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::Layer::default()
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
            .with_ansi(false);
        let subscriber = tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(fmt_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
