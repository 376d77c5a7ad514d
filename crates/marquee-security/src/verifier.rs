//! Authoritative privilege decisions.
//!
//! `verify` resolves the session to an identity, then reads that identity's
//! role from the role store on every call. Nothing is remembered between
//! calls. Every way of failing funnels through [`cloak`], so callers only
//! ever see `Decision::Denied`.

use marquee_common::{Identity, Role, StoreError};
use std::sync::Arc;
use thiserror::Error;

use crate::roles::RoleStore;
use crate::session::{SessionHandle, SessionResolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Authorized(Identity),
    Denied,
}

impl Decision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Decision::Authorized(_))
    }

    pub fn into_identity(self) -> Option<Identity> {
        match self {
            Decision::Authorized(identity) => Some(identity),
            Decision::Denied => None,
        }
    }
}

/// Why a verification failed. Internal only; logged, never returned.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("no session or no identity behind it")]
    AuthenticationAbsent,
    #[error("role {actual} below required {required}")]
    AuthorizationInsufficient { required: Role, actual: Role },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

pub struct AccessVerifier {
    sessions: Arc<dyn SessionResolver>,
    roles: Arc<dyn RoleStore>,
}

impl AccessVerifier {
    pub fn new(sessions: Arc<dyn SessionResolver>, roles: Arc<dyn RoleStore>) -> Self {
        Self { sessions, roles }
    }

    /// Decide whether the holder of `handle` may act at `required` level.
    pub async fn verify(&self, handle: Option<&SessionHandle>, required: Role) -> Decision {
        cloak(self.evaluate(handle, required).await)
    }

    async fn evaluate(
        &self,
        handle: Option<&SessionHandle>,
        required: Role,
    ) -> Result<Identity, AccessError> {
        let handle = handle.ok_or(AccessError::AuthenticationAbsent)?;

        let identity = self
            .sessions
            .resolve(handle)
            .await
            .map_err(AccessError::StoreUnavailable)?
            .ok_or(AccessError::AuthenticationAbsent)?;

        let actual = self
            .roles
            .get_role(&identity)
            .await
            .map_err(AccessError::StoreUnavailable)?
            .ok_or(AccessError::AuthenticationAbsent)?;

        if !actual.satisfies(required) {
            return Err(AccessError::AuthorizationInsufficient { required, actual });
        }
        Ok(identity)
    }
}

/// Collapse every failure cause into the same outward decision.
fn cloak(result: Result<Identity, AccessError>) -> Decision {
    match result {
        Ok(identity) => Decision::Authorized(identity),
        Err(AccessError::StoreUnavailable(e)) => {
            tracing::warn!("access denied, store unavailable: {}", e);
            Decision::Denied
        }
        Err(reason) => {
            tracing::debug!("access denied: {}", reason);
            Decision::Denied
        }
    }
}
