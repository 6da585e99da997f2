//! Signed, time-bounded device credentials.
//!
//! Tokens are standard HS256 JWTs: three dot-separated base64url segments,
//! so validity is computed from the token's own signed bytes and no
//! server-side credential store exists.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token encoding failed: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceClaims {
    #[serde(rename = "deviceId")]
    device_id: String,
    iat: i64,
    exp: i64,
    jti: String,
}

/// Issues and verifies device tokens with a process-wide secret.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: i64,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl_seconds,
        }
    }

    /// Issue a token binding `device_id` for the configured lifetime.
    pub fn issue(&self, device_id: &str) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let claims = DeviceClaims {
            device_id: device_id.to_string(),
            iat: now,
            exp: now + self.ttl_seconds,
            jti: Uuid::new_v4().simple().to_string(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Check signature, expiry, and identity binding. Malformed or truncated
    /// input is simply invalid, never an error.
    pub fn verify(&self, token: &str, device_id: &str) -> bool {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        match decode::<DeviceClaims>(token, &self.decoding, &validation) {
            // The expiry second itself is already invalid; the library alone
            // would still accept `exp == now`.
            Ok(data) => {
                data.claims.device_id == device_id && Utc::now().timestamp() < data.claims.exp
            }
            Err(_) => false,
        }
    }
}
