mod rate_limit_service_impl;
mod session_coordinator;

pub use rate_limit_service_impl::*;
pub use session_coordinator::*;
