//! API Module
//!
//! REST API for share provisioning and controller inspection.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
