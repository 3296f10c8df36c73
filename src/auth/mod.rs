//! Authentication & authorization
//! Mission: JWT bearer auth with admin/analyst/viewer roles for the admin surface

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod store;

pub use jwt::JwtHandler;
pub use middleware::{auth_middleware, require_role};
pub use models::{Claims, Operator, Role};
pub use store::OperatorStore;
