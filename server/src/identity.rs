//! Credential verification for the identify handshake.
//!
//! Tokens are issued elsewhere; the server only checks them. A token has the
//! form `{player_id}.{username}.{role}.{signature}` where the signature is the
//! hex HMAC-SHA256 of `{player_id}.{username}.{role}` keyed with the secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use shared::PlayerId;

use crate::error::{Result, ServerError};

/// Identity asserted by a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub player_id: PlayerId,
    pub username: String,
    pub role: String,
}

pub trait IdentityProvider: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims>;
}

type HmacSha256 = Hmac<Sha256>;

pub struct TokenVerifier {
    /// Keyed MAC, cloned for every token
    mac: HmacSha256,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(ServerError::Config("empty auth secret".into()));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ServerError::Config(format!("unusable auth secret: {}", e)))?;
        Ok(Self { mac })
    }

    fn keyed(&self, payload: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac
    }

    /// Produces a token this verifier accepts. Used by tooling and tests.
    pub fn sign(&self, claims: &Claims) -> String {
        let payload = format!("{}.{}.{}", claims.player_id, claims.username, claims.role);
        let signature = hex::encode(self.keyed(&payload).finalize().into_bytes());
        format!("{}.{}", payload, signature)
    }
}

impl IdentityProvider for TokenVerifier {
    fn verify(&self, token: &str) -> Result<Claims> {
        let (payload, signature) = token.rsplit_once('.').ok_or(ServerError::Unauthorized)?;

        let signature = hex::decode(signature).map_err(|_| ServerError::Unauthorized)?;
        self.keyed(payload)
            .verify_slice(&signature)
            .map_err(|_| ServerError::Unauthorized)?;

        let mut parts = payload.splitn(3, '.');
        let player_id = parts
            .next()
            .and_then(|id| id.parse::<PlayerId>().ok())
            .ok_or(ServerError::Unauthorized)?;
        let username = parts.next().filter(|name| !name.is_empty());
        let role = parts.next().filter(|role| !role.is_empty());

        match (username, role) {
            (Some(username), Some(role)) => Ok(Claims {
                player_id,
                username: username.to_string(),
                role: role.to_string(),
            }),
            _ => Err(ServerError::Unauthorized),
        }
    }
}
