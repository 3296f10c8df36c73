//! HTTP middleware
//! Mission: Request logging and rate limiting in front of the API surface

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimiter};
