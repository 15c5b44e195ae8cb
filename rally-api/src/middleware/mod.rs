pub mod auth;

pub use auth::{auth_middleware, operator_auth_middleware, Claims};
