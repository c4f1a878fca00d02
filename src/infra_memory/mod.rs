//! In-process adapters: used by tests, local development and the
//! single-instance deployment where no Redis is available.

mod auth_backend_fake;
mod clock_manual;
mod counter_store_memory;

pub use auth_backend_fake::*;
pub use clock_manual::*;
pub use counter_store_memory::*;
