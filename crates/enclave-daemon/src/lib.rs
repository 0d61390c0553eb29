//! enclave-daemon: relay transport and the long-running group listener
//!
//! The binary in `main.rs` is a thin CLI over `enclave_core::Enclave` plus
//! this crate's daemon. Everything network-facing goes through
//! `relay::RelayTransport`, so tests run the full daemon against the
//! in-memory relay.

pub mod daemon;
pub mod listener;
pub mod pipeline;
pub mod relay;
pub mod status;

pub use daemon::{start, DaemonConfig, DaemonHandle};
pub use pipeline::{Outcome, Pipeline, PipelineError};
pub use relay::{MemoryRelay, RelayError, RelayEvent, RelayPool, RelayTransport, TransportFactory, WsFactory};
pub use status::{ListenerState, StatusEvent};
