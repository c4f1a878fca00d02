mod rate_limit_service;
mod session_service;

pub use rate_limit_service::*;
pub use session_service::*;
