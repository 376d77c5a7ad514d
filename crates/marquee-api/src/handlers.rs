use marquee_common::{Identity, ProfileId, Role};
use marquee_security::SessionHandle;
use marquee_sync::{LocalMirror, MirrorSnapshot, SyncReport};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;

use crate::boundary::{not_found, private_empty, private_error, private_json};
use crate::metrics;
use crate::AppState;

/// Verify and record; `None` means the caller must get [`not_found`].
async fn authorize(state: &AppState, session: Option<SessionHandle>, required: Role) -> Option<Identity> {
    let decision = state.verifier.verify(session.as_ref(), required).await;
    metrics::record_decision(&decision);
    decision.into_identity()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Overview {
    identity: Identity,
    collections: Option<marquee_sync::StoreStats>,
}

pub async fn admin_overview(
    session: Option<SessionHandle>,
    state: Arc<AppState>,
) -> Result<Response, Infallible> {
    let Some(identity) = authorize(&state, session, Role::SuperAdmin).await else {
        return Ok(not_found());
    };
    let collections = match state.synchronizer.store().stats().await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!("collection stats unavailable: {}", e);
            None
        }
    };
    Ok(private_json(
        StatusCode::OK,
        &Overview {
            identity,
            collections,
        },
    ))
}

#[derive(Deserialize)]
struct RoleUpdate {
    role: Role,
}

pub async fn set_role(
    target: String,
    session: Option<SessionHandle>,
    body: Bytes,
    state: Arc<AppState>,
) -> Result<Response, Infallible> {
    let Some(admin) = authorize(&state, session, Role::SuperAdmin).await else {
        return Ok(not_found());
    };
    let update: RoleUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => return Ok(private_error(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    let target = Identity::new(target);
    match state.roles.set_role(&target, update.role).await {
        Ok(()) => {
            tracing::info!(admin = %admin, target = %target, role = %update.role, "role changed by admin");
            Ok(private_empty(StatusCode::NO_CONTENT))
        }
        Err(e) => {
            tracing::warn!(target = %target, "role update failed: {}", e);
            Ok(private_error(StatusCode::SERVICE_UNAVAILABLE, "role store unavailable"))
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    report: SyncReport,
    mirror: MirrorSnapshot,
}

/// Reconcile the caller's submitted local entries with the store. The
/// identity comes from the verified session, never from the body.
pub async fn sync_profile(
    profile: String,
    session: Option<SessionHandle>,
    body: Bytes,
    state: Arc<AppState>,
) -> Result<Response, Infallible> {
    let Some(identity) = authorize(&state, session, Role::Standard).await else {
        return Ok(not_found());
    };
    let snapshot: MirrorSnapshot = if body.is_empty() {
        MirrorSnapshot::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(snapshot) => snapshot,
            Err(e) => return Ok(private_error(StatusCode::BAD_REQUEST, &e.to_string())),
        }
    };

    let profile = ProfileId::new(profile);
    let mirror = match LocalMirror::from_snapshot(profile.clone(), snapshot) {
        Ok(mirror) => mirror,
        Err(e) => return Ok(private_error(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    match state.synchronizer.sync(&identity, &profile, &mirror).await {
        Ok(report) => {
            metrics::record_sync(Some(&report));
            Ok(private_json(
                StatusCode::OK,
                &SyncResponse {
                    report,
                    mirror: mirror.snapshot(&profile),
                },
            ))
        }
        Err(e) => {
            metrics::record_sync(None);
            tracing::warn!(identity = %identity, profile = %profile, "sync failed: {}", e);
            Ok(private_error(StatusCode::SERVICE_UNAVAILABLE, "collection store unavailable"))
        }
    }
}
