//! Identity and token service
//!
//! Clients authenticate once with their external-provider user id and get
//! back a short-lived bearer token; every HTTP endpoint and the WebSocket
//! upgrade verify that token. The service is stateless: the signing secret is
//! either operator-provided or a cryptographically-random value minted at
//! process start, so a restart invalidates all outstanding tokens along with
//! the rest of the in-memory state.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tokens are valid for 24 hours from minting
pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Signed token payload binding a subject to its display name
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// External-provider user id
    sub: String,

    /// Display name at minting time
    name: String,

    /// Expiry, seconds since the Unix epoch
    exp: i64,
}

/// An authenticated identity, as carried by a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub display_name: String,
}

/// HS256 mint/verify pair around the process-wide signing secret
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenService {
    /// Build the service from an operator-provided secret, or generate a
    /// random one for this run when none is configured.
    pub fn new(secret: Option<String>) -> Self {
        let secret = match secret {
            Some(secret) => secret.into_bytes(),
            None => {
                tracing::warn!(
                    "JWT_SECRET not configured, using a random secret; tokens will not survive a restart"
                );
                rand::rng().random::<[u8; 32]>().to_vec()
            }
        };
        Self {
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
        }
    }

    /// Mint a bearer token for the given subject
    pub fn mint(
        &self,
        user_id: &str,
        display_name: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: user_id.to_string(),
            name: display_name.to_string(),
            exp: chrono::Utc::now().timestamp() + TOKEN_TTL_SECS,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
    }

    /// Verify a bearer token and recover the bound principal.
    ///
    /// Fails on bad signatures, malformed tokens and expired tokens alike;
    /// there is no partial success.
    pub fn verify(&self, token: &str) -> Result<Principal, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &self.decoding,
            &Validation::new(Algorithm::HS256),
        )?;
        Ok(Principal {
            user_id: data.claims.sub,
            display_name: data.claims.name,
        })
    }
}
