use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{ContractError, Result};

type HmacSha256 = Hmac<Sha256>;

/// The two ordered signing parties. There is no third role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningRole {
    Partner,
    Officer,
}

impl SigningRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningRole::Partner => "partner",
            SigningRole::Officer => "officer",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    c: Uuid,
    r: SigningRole,
    iat: i64,
}

/// Stateless, time-boxed, role-scoped signing tokens.
///
/// Wire format: `base64url(json payload) + "." + base64url(hmac_sha256)`.
/// Verification is purely computational; no storage is consulted. A rotated
/// server secret makes previously issued tokens fail MAC verification, which
/// is an expected condition, not a bug.
pub struct TokenIssuer {
    secret: Vec<u8>,
    ttl_minutes: i64,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_minutes: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_minutes,
        }
    }

    pub fn issue(&self, contract_id: Uuid, role: SigningRole) -> String {
        self.issue_at(contract_id, role, Utc::now())
    }

    pub(crate) fn issue_at(
        &self,
        contract_id: Uuid,
        role: SigningRole,
        issued_at: DateTime<Utc>,
    ) -> String {
        let payload = TokenPayload {
            c: contract_id,
            r: role,
            iat: issued_at.timestamp(),
        };
        // Serializing a struct of plain fields cannot fail.
        let body = serde_json::to_vec(&payload).expect("token payload serializes");
        let encoded = URL_SAFE_NO_PAD.encode(&body);
        let mac = self.mac(encoded.as_bytes());
        format!("{encoded}.{}", URL_SAFE_NO_PAD.encode(mac))
    }

    /// Checks MAC, TTL and role, in that order. Returns the contract id the
    /// token was issued for.
    pub fn verify(&self, token: &str, expected_role: SigningRole) -> Result<Uuid> {
        self.verify_at(token, expected_role, Utc::now())
    }

    pub(crate) fn verify_at(
        &self,
        token: &str,
        expected_role: SigningRole,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let (encoded, sig_b64) = token
            .split_once('.')
            .ok_or(ContractError::TokenSignatureInvalid)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| ContractError::TokenSignatureInvalid)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(encoded.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| ContractError::TokenSignatureInvalid)?;

        let body = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| ContractError::TokenSignatureInvalid)?;
        let payload: TokenPayload =
            serde_json::from_slice(&body).map_err(|_| ContractError::TokenSignatureInvalid)?;

        let age_seconds = now.timestamp() - payload.iat;
        if age_seconds > self.ttl_minutes * 60 || age_seconds < 0 {
            return Err(ContractError::TokenExpired);
        }
        if payload.r != expected_role {
            return Err(ContractError::TokenRoleMismatch {
                expected: expected_role.as_str().to_string(),
                found: payload.r.as_str().to_string(),
            });
        }
        Ok(payload.c)
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Absolute link the signer receives, built from the configured public base URL.
pub fn signing_link(base_url: &str, role: SigningRole, token: &str) -> String {
    format!(
        "{}/contracts/sign/{}?token={}",
        base_url.trim_end_matches('/'),
        role.as_str(),
        token
    )
}
