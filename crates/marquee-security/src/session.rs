//! Session handle resolution.
//!
//! A session only ever tells us *who* is asking. Any role carried on the
//! client-held token is ignored; the claims type below has no field for it.

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use marquee_common::config::SessionConfig;
use marquee_common::{Identity, StoreResult};
use serde::Deserialize;
use std::fmt;

/// Opaque client-presented session token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionHandle(<redacted>)")
    }
}

/// Maps a session handle to the identity it was issued for.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// `Ok(None)` when the handle names no live session.
    async fn resolve(&self, handle: &SessionHandle) -> StoreResult<Option<Identity>>;
}

/// The only claims decoded from a session token.
#[derive(Debug, Deserialize)]
struct IdentityClaims {
    sub: String,
}

/// Resolves HS256-signed session tokens.
pub struct JwtSessionResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtSessionResolver {
    pub fn new(secret: &[u8], issuer: Option<&str>, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.jwt_secret.as_bytes(),
            config.issuer.as_deref(),
            config.leeway_secs,
        )
    }
}

#[async_trait]
impl SessionResolver for JwtSessionResolver {
    async fn resolve(&self, handle: &SessionHandle) -> StoreResult<Option<Identity>> {
        match decode::<IdentityClaims>(handle.expose(), &self.key, &self.validation) {
            Ok(data) if !data.claims.sub.is_empty() => Ok(Some(Identity::new(data.claims.sub))),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::debug!("session token rejected: {}", e);
                Ok(None)
            }
        }
    }
}

/// In-memory handle table, for embedding and tests.
#[derive(Default)]
pub struct StaticSessionResolver {
    sessions: DashMap<String, Identity>,
}

impl StaticSessionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: &SessionHandle, identity: Identity) {
        self.sessions.insert(handle.expose().to_string(), identity);
    }

    pub fn revoke(&self, handle: &SessionHandle) {
        self.sessions.remove(handle.expose());
    }
}

#[async_trait]
impl SessionResolver for StaticSessionResolver {
    async fn resolve(&self, handle: &SessionHandle) -> StoreResult<Option<Identity>> {
        Ok(self.sessions.get(handle.expose()).map(|e| e.value().clone()))
    }
}
