// src/core/auth.rs

//! Credential validation: the `Authenticator` seam and the built-in
//! `StaticAuthenticator` backed by configured users and signed tokens.

use crate::config::{AuthConfig, UserEntry};
use crate::connection::Identity;
use crate::core::errors::PeerLinkError;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Delay applied to every failed password check.
const FAILED_LOGIN_DELAY: Duration = Duration::from_millis(100);

/// A credential presented by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password {
        domain: Option<String>,
        username: String,
        password: String,
    },
    Token(String),
}

/// Why a credential was accepted or refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthReason {
    Success,
    BadCredential,
    Revoked,
    Expired,
    /// A token that names an impersonator, presented outside `SESSION.IMPERSONATE`.
    ImpersonationToken,
    InternalError,
}

impl AuthReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthReason::Success => "success",
            AuthReason::BadCredential => "bad_credential",
            AuthReason::Revoked => "revoked",
            AuthReason::Expired => "expired",
            AuthReason::ImpersonationToken => "impersonation_token",
            AuthReason::InternalError => "internal_error",
        }
    }
}

/// The result of validating a credential.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub identity: Option<Identity>,
    /// Claims to expose through `SESSION.SSO`.
    pub sso: Option<Value>,
    pub reason: AuthReason,
}

impl AuthOutcome {
    pub fn accepted(identity: Identity, sso: Option<Value>) -> Self {
        Self {
            identity: Some(identity),
            sso,
            reason: AuthReason::Success,
        }
    }

    pub fn refused(reason: AuthReason) -> Self {
        Self {
            identity: None,
            sso: None,
            reason,
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, credential: &Credential) -> AuthOutcome;
}

/// The claims carried by a signed token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// The user allowed to assume this identity via `SESSION.IMPERSONATE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonator: Option<String>,
    /// Expiry as unix seconds.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso: Option<Value>,
}

impl TokenClaims {
    fn identity(&self) -> Identity {
        Identity {
            user: self.user.clone(),
            domain: self.domain.clone(),
            impersonator: self.impersonator.clone(),
        }
    }
}

/// Signs `claims` as `hex(json) "." hex(hmac-sha256)`.
pub fn issue_token(secret: &[u8], claims: &TokenClaims) -> Result<String, PeerLinkError> {
    let body = serde_json::to_vec(claims)?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| PeerLinkError::Internal("Failed to create HMAC instance".to_string()))?;
    mac.update(&body);
    let signature = mac.finalize().into_bytes();
    Ok(format!("{}.{}", hex::encode(&body), hex::encode(signature)))
}

/// Checks a token's signature and expiry and returns its claims.
pub fn verify_token(secret: &[u8], token: &str, now_unix: i64) -> Result<TokenClaims, AuthReason> {
    let (body_hex, signature_hex) = token.split_once('.').ok_or(AuthReason::BadCredential)?;
    let body = hex::decode(body_hex).map_err(|_| AuthReason::BadCredential)?;
    let signature = hex::decode(signature_hex).map_err(|_| AuthReason::BadCredential)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthReason::InternalError)?;
    mac.update(&body);
    mac.verify_slice(&signature)
        .map_err(|_| AuthReason::BadCredential)?;

    let claims: TokenClaims =
        serde_json::from_slice(&body).map_err(|_| AuthReason::BadCredential)?;
    if claims.exp <= now_unix {
        return Err(AuthReason::Expired);
    }
    Ok(claims)
}

/// Hashes a password into an argon2 PHC string suitable for `[[auth.users]]`.
pub fn hash_password(password: &str) -> Result<String, PeerLinkError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| PeerLinkError::Internal("Password hashing failed".to_string()))
}

/// Validates credentials against the `[auth]` configuration section.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: Vec<UserEntry>,
    token_secret: Option<Vec<u8>>,
    revoked: HashSet<String>,
}

impl StaticAuthenticator {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            users: config.users.clone(),
            token_secret: config.token_secret.as_ref().map(|s| s.as_bytes().to_vec()),
            revoked: config.revoked_users.iter().cloned().collect(),
        }
    }

    fn check_password(&self, domain: Option<&str>, username: &str, password: &str) -> AuthReason {
        let Some(user) = self
            .users
            .iter()
            .find(|u| u.username == username && u.domain.as_deref() == domain)
        else {
            return AuthReason::BadCredential;
        };
        let Ok(parsed_hash) = PasswordHash::new(&user.password_hash) else {
            debug!("Stored password hash for '{}' is not a PHC string", username);
            return AuthReason::InternalError;
        };
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_err()
        {
            return AuthReason::BadCredential;
        }
        if self.revoked.contains(username) {
            return AuthReason::Revoked;
        }
        AuthReason::Success
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn validate(&self, credential: &Credential) -> AuthOutcome {
        match credential {
            Credential::Password {
                domain,
                username,
                password,
            } => match self.check_password(domain.as_deref(), username, password) {
                AuthReason::Success => {
                    AuthOutcome::accepted(Identity::new(username.clone(), domain.clone()), None)
                }
                reason => {
                    tokio::time::sleep(FAILED_LOGIN_DELAY).await;
                    AuthOutcome::refused(reason)
                }
            },
            Credential::Token(token) => {
                let Some(secret) = &self.token_secret else {
                    return AuthOutcome::refused(AuthReason::BadCredential);
                };
                match verify_token(secret, token, chrono::Utc::now().timestamp()) {
                    Ok(claims) if self.revoked.contains(&claims.user) => {
                        AuthOutcome::refused(AuthReason::Revoked)
                    }
                    Ok(claims) => {
                        let sso = serde_json::to_value(&claims).ok();
                        AuthOutcome::accepted(claims.identity(), sso)
                    }
                    Err(reason) => AuthOutcome::refused(reason),
                }
            }
        }
    }
}
