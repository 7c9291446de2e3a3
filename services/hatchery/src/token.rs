//! Worker token issuance.
//!
//! Tokens are compact JWS strings (`header.claims.signature`, base64url
//! without padding) signed with EdDSA. The verifying key is published in
//! the hatchery registration, so the job server can check every token a
//! worker presents without talking back to the hatchery.

use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hatchery_sdk::{JobId, ModelId, SpawnArguments};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;

const HEADER: &str = r#"{"alg":"EdDSA","typ":"JWT"}"#;

/// Token errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("cannot encode claims: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed token")]
    Malformed,

    #[error("bad signature")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

/// What the worker is allowed to do with its token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub worker_name: String,
    pub model_id: ModelId,
    pub model_name: String,
    pub job_id: Option<JobId>,
    pub register_only: bool,
    pub hatchery_name: String,
}

impl WorkerPayload {
    pub fn from_args(args: &SpawnArguments) -> Self {
        Self {
            worker_name: args.worker_name.clone(),
            model_id: args.model.id,
            model_name: args.model.name.clone(),
            job_id: args.job_id,
            register_only: args.register_only,
            hatchery_name: args.hatchery_name.clone(),
        }
    }
}

/// Token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerClaims {
    pub iss: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub worker: WorkerPayload,
}

/// Signs worker tokens with the hatchery key.
pub struct TokenIssuer {
    issuer: String,
    key: SigningKey,
}

impl TokenIssuer {
    /// Issuer named after the hatchery, keyed by the configured seed.
    pub fn from_config(config: &Config) -> Result<Self, TokenError> {
        match &config.signing_key {
            Some(seed) => Self::from_seed(config.name.clone(), seed),
            None => {
                warn!("No signing key configured, worker tokens are signed with an ephemeral key");
                Ok(Self::ephemeral(config.name.clone()))
            }
        }
    }

    /// Issuer from a base64 encoded 32-byte seed.
    pub fn from_seed(issuer: impl Into<String>, seed_b64: &str) -> Result<Self, TokenError> {
        let bytes = STANDARD
            .decode(seed_b64.trim())
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            TokenError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self {
            issuer: issuer.into(),
            key: SigningKey::from_bytes(&seed),
        })
    }

    /// Issuer with a key generated for this process only.
    pub fn ephemeral(issuer: impl Into<String>) -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill(&mut seed);
        Self {
            issuer: issuer.into(),
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Verifying key as published in the hatchery registration.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.key.verifying_key().as_bytes())
    }

    /// Sign a token for the worker described by `args`, valid for `ttl`.
    pub fn issue(&self, args: &SpawnArguments, ttl: Duration) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = WorkerClaims {
            iss: self.issuer.clone(),
            sub: args.worker_name.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
            worker: WorkerPayload::from_args(args),
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(HEADER),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let signature = self.key.sign(signing_input.as_bytes());

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Check signature and expiry of a worker token.
pub fn verify(token: &str, key: &VerifyingKey) -> Result<WorkerClaims, TokenError> {
    let (signing_input, signature) = token.rsplit_once('.').ok_or(TokenError::Malformed)?;
    let (_, claims) = signing_input.split_once('.').ok_or(TokenError::Malformed)?;

    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Malformed)?;
    let signature = Signature::from_slice(&signature).map_err(|_| TokenError::Malformed)?;
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    let claims = URL_SAFE_NO_PAD
        .decode(claims)
        .map_err(|_| TokenError::Malformed)?;
    let claims: WorkerClaims = serde_json::from_slice(&claims).map_err(|_| TokenError::Malformed)?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}
