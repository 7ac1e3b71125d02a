//! Token validation and verified identity claims.
//!
//! The pipeline never parses raw bearer tokens. Transport layers hand the
//! token string to a [`TokenValidator`], and everything downstream consumes
//! the resulting [`CustomClaims`]. The shipped validator verifies an
//! ed25519-signed claims envelope: `base64url(claims).base64url(signature)`
//! with no padding. Signing lives next to verification so the console (and
//! the tests) can mint tokens against the same key material.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope key that grants every capability.
pub const ADMIN_SCOPE: &str = "admin";

/// Verified identity envelope extracted from a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomClaims {
    /// Subject of the token: a user or agent id.
    pub user_id: String,

    /// Capability grants, e.g. `{"jira.ticket.delete": true}` or
    /// `{"admin": true}`.
    #[serde(default)]
    pub scopes: HashMap<String, bool>,

    /// Expiry instant.
    pub expires_at: DateTime<Utc>,

    /// Issuing authority.
    pub issuer: String,
}

impl CustomClaims {
    /// True when the claims grant `capability_id`, directly or via the
    /// admin scope.
    #[must_use]
    pub fn allows(&self, capability_id: &str) -> bool {
        let granted = |key: &str| self.scopes.get(key).copied().unwrap_or(false);
        granted(ADMIN_SCOPE) || granted(capability_id)
    }
}

/// Token validation failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("missing access token")]
    MissingToken,

    /// The token is structurally invalid or its signature does not verify.
    #[error("invalid access token")]
    InvalidToken,

    /// The token verified but is past its expiry.
    #[error("access token expired")]
    Expired,

    /// Key material could not be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Pluggable token verification seam.
///
/// Implementations must be cheap: validation runs once per request on the
/// hot path.
pub trait TokenValidator: Send + Sync {
    /// Verifies `token` and returns its claims.
    ///
    /// # Errors
    ///
    /// [`AuthError`] describing why the token was refused.
    fn validate(&self, token: &str) -> Result<CustomClaims, AuthError>;
}

/// Validator for the ed25519 claims envelope.
pub struct Ed25519TokenValidator {
    verifying_key: VerifyingKey,
}

impl Ed25519TokenValidator {
    /// Builds a validator from a base64-encoded 32-byte public key.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidKey`] when the encoding or length is wrong.
    pub fn from_base64(encoded: &str) -> Result<Self, AuthError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| AuthError::InvalidKey("public key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    /// Builds a validator from an already-parsed key.
    #[must_use]
    pub const fn new(verifying_key: VerifyingKey) -> Self {
        Self { verifying_key }
    }
}

impl TokenValidator for Ed25519TokenValidator {
    fn validate(&self, token: &str) -> Result<CustomClaims, AuthError> {
        let (claims_part, signature_part) =
            token.split_once('.').ok_or(AuthError::InvalidToken)?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_part)
            .map_err(|_| AuthError::InvalidToken)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_part)
            .map_err(|_| AuthError::InvalidToken)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| AuthError::InvalidToken)?;

        self.verifying_key
            .verify(&claims_bytes, &signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let claims: CustomClaims =
            serde_json::from_slice(&claims_bytes).map_err(|_| AuthError::InvalidToken)?;

        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }
}

/// Token issuer holding the private half of the key pair.
///
/// Lives in the console process in production; the gateway only needs the
/// verifying side.
pub struct TokenSigner {
    signing_key: SigningKey,
    issuer: String,
    token_ttl: Duration,
}

impl TokenSigner {
    /// Builds a signer from a base64-encoded 32-byte secret key.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidKey`] when the encoding or length is wrong.
    pub fn from_base64(encoded: &str, issuer: &str, token_ttl: Duration) -> Result<Self, AuthError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| AuthError::InvalidKey("private key must be 32 bytes".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
            issuer: issuer.to_string(),
            token_ttl,
        })
    }

    /// Generates a signer with a fresh random key pair.
    #[must_use]
    pub fn generate(issuer: &str, token_ttl: Duration) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
            issuer: issuer.to_string(),
            token_ttl,
        }
    }

    /// The matching verifying key, base64-encoded for configuration.
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// A validator wired to this signer's public key.
    #[must_use]
    pub fn validator(&self) -> Ed25519TokenValidator {
        Ed25519TokenValidator::new(self.signing_key.verifying_key())
    }

    /// Mints a token for `subject` with the given scope grants.
    #[must_use]
    pub fn issue(&self, subject: &str, scopes: HashMap<String, bool>) -> String {
        let claims = CustomClaims {
            user_id: subject.to_string(),
            scopes,
            expires_at: Utc::now() + self.token_ttl,
            issuer: self.issuer.clone(),
        };
        // CustomClaims serialization cannot fail: all fields are plain data.
        let claims_bytes = serde_json::to_vec(&claims).unwrap_or_default();
        let signature = self.signing_key.sign(&claims_bytes);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&claims_bytes),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}

/// Builds a scope map from capability ids, for token minting call sites.
#[must_use]
pub fn scopes_from<I, S>(capabilities: I) -> HashMap<String, bool>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    capabilities
        .into_iter()
        .map(|cap| (cap.into(), true))
        .collect()
}
