//! Logging setup.
//!
//! The library itself only emits `tracing` events; binaries, benches and
//! tests call [`init_tracing`] to see them.

mod logging;

pub use logging::{init_tracing, LOG_ENV};
