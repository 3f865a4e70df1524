//! Authentication: two-key JWT verification and bearer middleware.

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::{TokenKind, TokenVerifier};
pub use middleware::{auth_middleware, require_role, AuthError};
pub use models::{Claims, Principal, Role};
