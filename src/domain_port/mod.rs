mod auth_backend;
mod clock;
mod counter_store;

pub use auth_backend::*;
pub use clock::*;
pub use counter_store::*;
