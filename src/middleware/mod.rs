pub mod admission;
mod auth;
mod error_handler;
pub mod rate_limit;
pub mod security_log;
mod security_headers;
pub mod validation;

pub use admission::{AdmissionMiddleware, AdmissionRequest, Admitted};
pub use auth::auth_middleware;
pub use error_handler::log_errors;
pub use rate_limit::RateLimiter;
pub use security_headers::security_headers;
pub use security_log::SecurityLog;
pub use validation::{InputValidator, SanitizedBody};
