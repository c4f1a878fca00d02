mod error;
mod handler;
mod rate_limit;
mod router;

pub use error::{ApiError, ApiErrorCode, RateLimited, recover_error};
pub use handler::ApiResponse;
pub use rate_limit::{client_identifier, identify_client, with_rate_limit};
pub use router::routes;
