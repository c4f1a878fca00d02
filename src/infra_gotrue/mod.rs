mod auth_backend_gotrue;

pub use auth_backend_gotrue::*;
