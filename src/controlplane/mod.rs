//! Control Plane
//!
//! Request handling and adapters:
//! - `controller`: share create/delete/expand and restart rebuild
//! - `api`: REST surface over the controller
//! - `backends`: operation backend and resource store adapters
//! - `metrics`: Prometheus collectors

pub mod api;
pub mod backends;
pub mod controller;
pub mod metrics;

pub use api::*;
pub use backends::*;
pub use controller::*;
pub use metrics::*;
