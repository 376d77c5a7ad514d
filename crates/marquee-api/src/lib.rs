//! HTTP layer for Marquee.
//!
//! Privileged and per-user routes verify the caller on every request. A
//! denied caller cannot tell a missing route from a forbidden one.

pub mod boundary;
pub mod handlers;
pub mod metrics;

use marquee_security::{AccessVerifier, RoleAdmin};
use marquee_sync::Synchronizer;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Reply};

use crate::boundary::{handle_rejection, session};

/// Maximum accepted request body.
pub const BODY_LIMIT: u64 = 1024 * 1024;

pub struct AppState {
    pub verifier: Arc<AccessVerifier>,
    pub roles: Arc<dyn RoleAdmin>,
    pub synchronizer: Arc<Synchronizer>,
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path!("health").and(warp::get()).map(|| "OK");

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .map(metrics::render);

    let overview = warp::path!("admin" / "overview")
        .and(warp::get())
        .and(session())
        .and(with_state(state.clone()))
        .and_then(handlers::admin_overview);

    let set_role = warp::path!("admin" / "users" / String / "role")
        .and(warp::put())
        .and(session())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(handlers::set_role);

    let sync = warp::path!("profiles" / String / "sync")
        .and(warp::post())
        .and(session())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::bytes())
        .and(with_state(state))
        .and_then(handlers::sync_profile);

    health
        .or(metrics)
        .or(overview)
        .or(set_role)
        .or(sync)
        .recover(handle_rejection)
        .with(warp::trace::request())
}
