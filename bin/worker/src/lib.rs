//! keel worker process.
//!
//! Wires configuration, backends and the registry into a set of dispatcher
//! loops and runs them until shutdown.

pub mod config;
pub mod demo;
pub mod error;
pub mod runtime;
