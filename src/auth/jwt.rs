//! JWT-based session identity
//!
//! Validates bearer tokens presented on the WebSocket upgrade request.

use super::{IdentityVerifier, VerifiedIdentity};
use crate::config::IdentityConfig;
use crate::error::AuthError;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Claim that marks a token holder as administrator
const ADMIN_CLAIM: &str = "isAdmin";

/// JWT claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (usually user ID)
    pub sub: Option<String>,
    /// Issuer
    pub iss: Option<String>,
    /// Audience
    pub aud: Option<StringOrVec>,
    /// Expiration time (Unix timestamp)
    pub exp: Option<u64>,
    /// Issued at (Unix timestamp)
    pub iat: Option<u64>,
    /// User groups
    pub groups: Option<Vec<String>>,
    /// User roles
    pub roles: Option<Vec<String>>,
    /// Everything else, including the configurable user and org claims
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// String or array of strings (for audience claim)
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

/// JWT verifier
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    /// Claim to use as user id
    user_claim: String,
    /// Claim carrying the user's organization
    org_claim: String,
    /// Organization whose members bypass policy checks
    super_org: String,
}

impl JwtVerifier {
    /// Build a verifier from an HS256 secret or, failing that, an RS256 public key.
    pub fn from_config(config: &IdentityConfig) -> Result<Self, AuthError> {
        let (key, algorithm) = match (&config.jwt_secret, &config.jwt_public_key_pem) {
            (Some(secret), _) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
            (None, Some(pem)) => (
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| AuthError::InvalidKey(e.to_string()))?,
                Algorithm::RS256,
            ),
            (None, None) => return Err(AuthError::NotConfigured),
        };

        let mut validation = Validation::new(algorithm);

        if let Some(ref iss) = config.issuer {
            validation.set_issuer(&[iss]);
        }

        if let Some(ref aud) = config.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }

        Ok(Self {
            key,
            validation,
            user_claim: config.user_claim.clone(),
            org_claim: config.org_claim.clone(),
            super_org: config.super_org.clone(),
        })
    }

    fn claim_str(&self, claims: &Claims, name: &str) -> Option<String> {
        if name == "sub" {
            return claims.sub.clone();
        }
        match claims.extra.get(name) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    fn identity_from_claims(&self, claims: Claims) -> Result<VerifiedIdentity, AuthError> {
        let user_id = self
            .claim_str(&claims, &self.user_claim)
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingSubject)?;
        let org = self.claim_str(&claims, &self.org_claim);

        let is_admin = matches!(claims.extra.get(ADMIN_CLAIM), Some(serde_json::Value::Bool(true)));
        let is_super_user = is_admin || org.as_deref() == Some(self.super_org.as_str());

        Ok(VerifiedIdentity {
            user_id,
            org,
            roles: claims.roles.unwrap_or_default(),
            groups: claims.groups.unwrap_or_default(),
            is_super_user,
        })
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify_token(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let token_data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        self.identity_from_claims(token_data.claims)
    }
}
