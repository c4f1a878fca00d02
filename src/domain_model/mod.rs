mod rate_limit;
mod session;
mod user;

pub use rate_limit::*;
pub use session::*;
pub use user::*;
