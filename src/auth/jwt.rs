//! Connection token verification.
//!
//! Two signing keys are in play: the short-lived access key used by the RPC
//! surface, and the long-lived socket key minted for realtime clients. The
//! gateway accepts either on handshake; verification tries the access key
//! first, then the socket key.

use crate::auth::models::{Claims, Role};
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

pub struct TokenVerifier {
    access_decoding: DecodingKey,
    socket_decoding: DecodingKey,
    access_encoding: EncodingKey,
    socket_encoding: EncodingKey,
}

/// Which key a token verified under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Socket,
}

impl TokenVerifier {
    pub fn new(access_key: &str, socket_key: &str) -> Self {
        Self {
            access_decoding: DecodingKey::from_secret(access_key.as_bytes()),
            socket_decoding: DecodingKey::from_secret(socket_key.as_bytes()),
            access_encoding: EncodingKey::from_secret(access_key.as_bytes()),
            socket_encoding: EncodingKey::from_secret(socket_key.as_bytes()),
        }
    }

    /// Validate a token under either key and extract its claims.
    pub fn verify(&self, token: &str) -> Result<(Claims, TokenKind)> {
        let validation = Validation::default();
        if let Ok(decoded) = decode::<Claims>(token, &self.access_decoding, &validation) {
            debug!(user = %decoded.claims.sub, "token verified under access key");
            return Ok((decoded.claims, TokenKind::Access));
        }
        let decoded = decode::<Claims>(token, &self.socket_decoding, &validation)
            .context("token did not verify under access or socket key")?;
        debug!(user = %decoded.claims.sub, "token verified under socket key");
        Ok((decoded.claims, TokenKind::Socket))
    }

    /// Mint a token under the access key. Used by tests and local tooling;
    /// production tokens come from the identity service.
    pub fn sign_access(&self, user_id: &str, role: Role, ttl_hours: i64) -> Result<String> {
        self.sign(&self.access_encoding, user_id, role, ttl_hours)
    }

    /// Mint a token under the socket key.
    pub fn sign_socket(&self, user_id: &str, role: Role, ttl_hours: i64) -> Result<String> {
        self.sign(&self.socket_encoding, user_id, role, ttl_hours)
    }

    fn sign(&self, key: &EncodingKey, user_id: &str, role: Role, ttl_hours: i64) -> Result<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(ttl_hours))
            .context("invalid expiry timestamp")?
            .timestamp() as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp,
        };
        encode(&Header::default(), &claims, key).context("failed to sign token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("test-access-key-1234567890", "test-socket-key-1234567890")
    }

    #[test]
    fn test_access_token_round_trip() {
        let v = verifier();
        let token = v.sign_access("u-1", Role::Customer, 1).unwrap();
        let (claims, kind) = v.verify(&token).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.role, Role::Customer);
        assert_eq!(kind, TokenKind::Access);
    }

    #[test]
    fn test_socket_token_round_trip() {
        let v = verifier();
        let token = v.sign_socket("p-1", Role::Porter, 24).unwrap();
        let (claims, kind) = v.verify(&token).unwrap();
        assert_eq!(claims.role, Role::Porter);
        assert_eq!(kind, TokenKind::Socket);
    }

    #[test]
    fn test_foreign_key_rejected() {
        let v = verifier();
        let other = TokenVerifier::new("other-access-key-0000000000", "other-socket-key-0000000000");
        let token = other.sign_access("u-1", Role::Customer, 1).unwrap();
        assert!(v.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(verifier().verify("not.a.token").is_err());
    }
}
