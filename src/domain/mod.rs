//! Domain layer
//!
//! Persisted record shapes and the two ports the multishare core depends on:
//! the managed file service's long-running operations and the durable
//! resource store.

pub mod ports;

pub use ports::*;
