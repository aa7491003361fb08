//! Compact signed-token mint and verify.
//!
//! Wire form is `header.payload.sig`, each segment URL-safe base64 without
//! padding. Header: `{alg: "HS256", typ: "JWT", kid}`. The signature is
//! HMAC-SHA-256 of `header.payload` under the app's decrypted secret.
//!
//! Verification is atomic: the unique insert of the jti row is the proof of
//! first use, so two concurrent presentations of the same token cannot both
//! succeed.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, Kid, TeamId, UserId};
use meterline_shared::tenant::{JtiRecord, SecretStatus};
use meterline_shared::Clock;
use meterline_store::{AppStore, JtiStore, Store, StoreError};

use crate::messages;
use crate::vault::SecretVault;

type HmacSha256 = Hmac<Sha256>;

const ALG: &str = "HS256";
const AUDIENCE: &str = "billing-service";
const ISSUER_PREFIX: &str = "app:";

// ── Wire structs ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    kid: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    iss: String,
    aud: String,
    sub: String,
    #[serde(rename = "appId")]
    app_id: AppId,
    #[serde(rename = "teamId", skip_serializing_if = "Option::is_none")]
    team_id: Option<TeamId>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    scopes: Vec<String>,
    iat: i64,
    exp: i64,
    jti: String,
    kid: String,
}

/// Claims bound to the request after a successful verification.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedClaims {
    pub app_id: AppId,
    pub team_id: Option<TeamId>,
    pub user_id: Option<UserId>,
    pub scopes: Vec<String>,
    pub kid: Kid,
    pub jti: String,
}

impl VerifiedClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{}", messages::MALFORMED_AUTH_HEADER)]
    Malformed,
    #[error("{}", messages::UNSUPPORTED_ALG)]
    UnsupportedAlg,
    #[error("{}", messages::UNKNOWN_KID)]
    UnknownKid,
    #[error("{}", messages::REVOKED_KID)]
    RevokedKid,
    #[error("{}", messages::INVALID_SIGNATURE)]
    InvalidSignature,
    #[error("{}", messages::INVALID_ISSUER)]
    InvalidIssuer,
    #[error("{}", messages::ISSUER_APP_MISMATCH)]
    IssuerAppMismatch,
    #[error("{}", messages::INVALID_AUDIENCE)]
    InvalidAudience,
    #[error("{}", messages::APPID_KEY_MISMATCH)]
    AppIdKeyMismatch,
    #[error("{}", messages::TOKEN_FROM_FUTURE)]
    IssuedInFuture,
    #[error("{}", messages::TOKEN_EXPIRED)]
    Expired,
    #[error("{}", messages::TOKEN_REPLAYED)]
    Replayed,
    /// Secret on file cannot be decrypted; an operator problem, not a caller
    /// problem.
    #[error("secret decryption failed")]
    Vault,
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl From<VerifyError> for ServiceError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Vault | VerifyError::Store(_) => {
                ServiceError::internal("internal authentication failure")
            }
            other => ServiceError::auth(other.to_string()),
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Inputs for minting a token against one app secret.
#[derive(Clone, Debug)]
pub struct MintParams {
    pub app_id: AppId,
    pub kid: Kid,
    pub sub: String,
    pub team_id: Option<TeamId>,
    pub user_id: Option<UserId>,
    pub scopes: Vec<String>,
    pub ttl_seconds: i64,
}

pub struct TokenEngine {
    store: Arc<dyn Store>,
    vault: SecretVault,
    clock: Arc<dyn Clock>,
    /// Allowed clock skew in seconds for the iat/exp checks. Zero by default.
    skew_seconds: i64,
}

impl TokenEngine {
    pub fn new(store: Arc<dyn Store>, vault: SecretVault, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            vault,
            clock,
            skew_seconds: 0,
        }
    }

    pub fn with_skew(mut self, skew_seconds: i64) -> Self {
        self.skew_seconds = skew_seconds;
        self
    }

    /// Mint a token. The caller supplies the plaintext secret (only available
    /// at secret-creation time or inside tests); the service never stores it.
    pub fn mint(&self, params: &MintParams, secret: &[u8]) -> String {
        let now = self.clock.now().timestamp();
        let header = Header {
            alg: ALG.into(),
            typ: "JWT".into(),
            kid: params.kid.0.clone(),
        };
        let payload = Payload {
            iss: format!("{ISSUER_PREFIX}{}", params.app_id),
            aud: AUDIENCE.into(),
            sub: params.sub.clone(),
            app_id: params.app_id,
            team_id: params.team_id,
            user_id: params.user_id.clone(),
            scopes: params.scopes.clone(),
            iat: now,
            exp: now + params.ttl_seconds,
            jti: Uuid::new_v4().to_string(),
            kid: params.kid.0.clone(),
        };
        encode_signed(&header, &payload, secret)
    }

    /// Verify a token end to end: framing, algorithm, key resolution,
    /// signature, claim binding, time window, and replay.
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, VerifyError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(VerifyError::Malformed);
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != ALG {
            return Err(VerifyError::UnsupportedAlg);
        }

        let payload: Payload = decode_segment(payload_b64)?;
        let kid = Kid(header.kid.clone());
        let secret_row = self
            .store
            .get_secret_by_kid(&kid)
            .await?
            .ok_or(VerifyError::UnknownKid)?;
        if secret_row.status == SecretStatus::Revoked {
            return Err(VerifyError::RevokedKid);
        }

        let secret = self
            .vault
            .decrypt(&secret_row.encrypted_secret)
            .map_err(|_| VerifyError::Vault)?;

        let mut mac =
            HmacSha256::new_from_slice(&secret).map_err(|_| VerifyError::InvalidSignature)?;
        mac.update(format!("{header_b64}.{payload_b64}").as_bytes());
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| VerifyError::Malformed)?;
        mac.verify_slice(&sig)
            .map_err(|_| VerifyError::InvalidSignature)?;

        // Claim binding, after the signature proved authorship.
        let Some(iss_app) = payload.iss.strip_prefix(ISSUER_PREFIX) else {
            return Err(VerifyError::InvalidIssuer);
        };
        if iss_app != payload.app_id.to_string() {
            return Err(VerifyError::IssuerAppMismatch);
        }
        if payload.aud != AUDIENCE {
            return Err(VerifyError::InvalidAudience);
        }
        if secret_row.app_id != payload.app_id {
            return Err(VerifyError::AppIdKeyMismatch);
        }

        let now = self.clock.now().timestamp();
        if payload.iat > now + self.skew_seconds {
            return Err(VerifyError::IssuedInFuture);
        }
        if payload.exp <= now - self.skew_seconds {
            return Err(VerifyError::Expired);
        }

        // Replay: the unique insert is the atomic proof of first use.
        let expires_at = chrono::DateTime::from_timestamp(payload.exp + self.skew_seconds, 0)
            .unwrap_or_else(|| self.clock.now());
        match self
            .store
            .insert_jti(JtiRecord {
                jti: payload.jti.clone(),
                expires_at,
            })
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_unique_violation() => return Err(VerifyError::Replayed),
            Err(err) => return Err(VerifyError::Store(err)),
        }

        Ok(VerifiedClaims {
            app_id: payload.app_id,
            team_id: payload.team_id,
            user_id: payload.user_id,
            scopes: payload.scopes,
            kid,
            jti: payload.jti,
        })
    }
}

fn encode_signed(header: &Header, payload: &Payload, secret: &[u8]) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).expect("header is json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).expect("payload is json"));
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(format!("{header_b64}.{payload_b64}").as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header_b64}.{payload_b64}.{sig}")
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, VerifyError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| VerifyError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| VerifyError::Malformed)
}
