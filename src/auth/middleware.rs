//! Bearer-token middleware for the RPC surface.

use crate::auth::jwt::TokenVerifier;
use crate::auth::models::{Principal, Role};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Validates the bearer token and attaches the [`Principal`] to the request.
///
/// Tokens are accepted from the `Authorization` header or, for WebSocket
/// handshakes where headers are awkward for browser clients, a `token` query
/// parameter.
pub async fn auth_middleware(
    State(verifier): State<Arc<TokenVerifier>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });

    let token_from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    let token = token_from_header
        .or(token_from_query)
        .ok_or(AuthError::MissingToken)?;

    let (claims, _kind) = verifier.verify(&token).map_err(|_| AuthError::InvalidToken)?;

    req.extensions_mut().insert(Principal::from(&claims));
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Pull the principal attached by [`auth_middleware`].
pub fn principal(req: &Request) -> Option<&Principal> {
    req.extensions().get::<Principal>()
}

/// Convenience check used by admin-only handlers.
pub fn require_role(principal: &Principal, allowed: &[Role]) -> Result<(), AuthError> {
    if allowed.contains(&principal.role) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                "Missing authorization token",
            ),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                "Invalid or expired token",
            ),
            AuthError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Insufficient role for this operation",
            ),
        };
        let body = serde_json::json!({ "error": code, "message": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_responses() {
        assert_eq!(
            AuthError::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_require_role() {
        let admin = Principal {
            user_id: "u".into(),
            role: Role::Admin,
        };
        assert!(require_role(&admin, &[Role::Admin]).is_ok());

        let porter = Principal {
            user_id: "p".into(),
            role: Role::Porter,
        };
        assert!(require_role(&porter, &[Role::Customer, Role::Admin]).is_err());
    }
}
