//! Response shaping at the HTTP edge.
//!
//! Every denied request, and every request that does not match a route,
//! leaves through [`not_found`]. Nothing else may produce a response for an
//! unverified caller.

use marquee_security::SessionHandle;
use serde::Serialize;
use std::convert::Infallible;
use warp::http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CACHE_CONTROL, COOKIE, EXPIRES, PRAGMA, VARY};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

pub const SESSION_COOKIE: &str = "marquee_session";

const NOT_FOUND_BODY: &str = "Not Found";

fn disable_caching(headers: &mut HeaderMap) {
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    headers.insert(VARY, HeaderValue::from_static("Authorization, Cookie"));
}

/// The single response for every denial cause.
pub fn not_found() -> Response {
    let mut response = warp::reply::with_status(NOT_FOUND_BODY, StatusCode::NOT_FOUND).into_response();
    disable_caching(response.headers_mut());
    response
}

/// JSON for a verified caller; never cacheable by shared caches.
pub fn private_json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    let mut response = warp::reply::with_status(warp::reply::json(body), status).into_response();
    disable_caching(response.headers_mut());
    response
}

pub fn private_empty(status: StatusCode) -> Response {
    let mut response = warp::reply::with_status(warp::reply(), status).into_response();
    disable_caching(response.headers_mut());
    response
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Error for an already-verified caller.
pub fn private_error(status: StatusCode, message: &str) -> Response {
    private_json(status, &ErrorBody { error: message })
}

/// Session handle from `Authorization: Bearer ...`, else the session cookie.
pub fn extract_session(headers: &HeaderMap) -> Option<SessionHandle> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(SessionHandle::new(token));
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|v| !v.is_empty())
        .map(SessionHandle::new)
}

/// Never rejects; a missing or unreadable session is `None`.
pub fn session() -> impl Filter<Extract = (Option<SessionHandle>,), Error = Infallible> + Clone {
    warp::header::headers_cloned().map(|headers: HeaderMap| extract_session(&headers))
}

/// Unmatched routes, wrong methods and oversized bodies all look like a
/// missing resource.
pub async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    tracing::trace!("request rejected: {:?}", rejection);
    Ok(not_found())
}
