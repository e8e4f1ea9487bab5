pub mod jwt_auth;

pub use jwt_auth::{BearerToken, JwtAuthMiddleware, TokenVerifier, UserId};
