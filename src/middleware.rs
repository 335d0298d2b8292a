//! HTTP middleware.
//!
//! From outermost to innermost the chain is: access log, version header, response cache, panic
//! handler, code introspection, method check. The access log sits outside the cache so that it
//! can report cache hits, and the cache sits outside every error path so that it sees final
//! responses.

use crate::app::{operation_for_route, VERSION};
use crate::app_state::SharedAppState;
use crate::cache::{cache_key, CacheDecision, HIT_HEADER, SOURCE_CODE_MEDIA_TYPE};
use crate::error::{ApiError, ErrorEnvelope};
use crate::introspect::extract_function;
use crate::metrics::CACHE_LOOKUPS;
use crate::tracing::ACCESS_LOG_TARGET;

use std::any::Any;
use std::time::Instant;

use axum::{
    body::{self, Body, Bytes, Full},
    extract::{MatchedPath, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Paths excluded from the access log.
const UNLOGGED_PATHS: [&str; 2] = ["/metrics", "/ready"];

/// Status of a replayed cache entry.
///
/// Error envelopes are replayed with their embedded status, anything else with 200.
pub fn replay_status(body: &[u8]) -> StatusCode {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) if envelope.error => envelope.status(),
        _ => StatusCode::OK,
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .map_or(false, |content_type| {
            content_type == mime::APPLICATION_JSON.as_ref()
        })
}

/// Build the response for a cache hit.
fn cached_response(body: Bytes, origin: Option<HeaderValue>) -> Response {
    let mut response = (
        replay_status(&body),
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (HIT_HEADER.clone(), HeaderValue::from_static("hit")),
        ],
        body,
    )
        .into_response();
    if let Some(origin) = origin {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

/// Serve requests from the response cache and store cacheable responses.
///
/// Only JSON responses with status 200, or 404 error envelopes, are stored.
pub async fn cache(
    State(state): State<SharedAppState>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    // Requests no route matched are answered by the fallback and never stored.
    let routed = request.extensions().get::<MatchedPath>().is_some();
    let decision =
        CacheDecision::for_request(request.method(), request.headers(), &path, query.as_deref());
    let key = cache_key(VERSION, &path, query.as_deref());

    if decision.bypass_read {
        CACHE_LOOKUPS.with_label_values(&["bypass"]).inc();
    } else if let Some(body) = state.cache.get(&key).await {
        CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
        let origin = request.headers().get(header::ORIGIN).cloned();
        return cached_response(body, origin);
    } else {
        CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
    }

    let response = next.run(request).await;
    let cacheable = matches!(response.status(), StatusCode::OK | StatusCode::NOT_FOUND)
        && is_json(response.headers());
    if decision.bypass_write || !routed || !cacheable {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match hyper::body::to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return ApiError::Internal(format!("failed to read response body: {}", err))
                .into_response()
        }
    };
    state.cache.set(&key, &bytes).await;
    Response::from_parts(parts, body::boxed(Full::from(bytes)))
}

/// Answer `Accept: text/x-sapi-python` requests with the source code of the operation behind
/// the route.
pub async fn introspect(
    State(state): State<SharedAppState>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let wants_source = request
        .headers()
        .get(header::ACCEPT)
        .map_or(false, |accept| accept == SOURCE_CODE_MEDIA_TYPE);
    if !wants_source {
        return next.run(request).await;
    }
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let code = operation_for_route(&route).and_then(|operation| {
        let source = state.registry.target(operation)?.source()?;
        extract_function(source, operation)
    });
    match code {
        Some(code) => (
            [(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref())],
            code.to_string(),
        )
            .into_response(),
        None => ApiError::SourceUnavailable(route).into_response(),
    }
}

/// Replace the empty 405 response of a route with the JSON error body, keeping its `Allow`
/// header.
pub async fn method_not_allowed(request: Request<Body>, next: Next<Body>) -> Response {
    let method = request.method().clone();
    let response = next.run(request).await;
    if response.status() != StatusCode::METHOD_NOT_ALLOWED || is_json(response.headers()) {
        return response;
    }
    let allow = response.headers().get(header::ALLOW).cloned();
    let mut replaced = ApiError::MethodNotAllowed(method).into_response();
    if let Some(allow) = allow {
        replaced.headers_mut().insert(header::ALLOW, allow);
    }
    replaced
}

/// Log every request to the access log target, answering 504 when the request timeout expires.
pub async fn access_log(
    State(state): State<SharedAppState>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let logged = !UNLOGGED_PATHS.contains(&uri.path());

    let (response, cache) =
        match tokio::time::timeout(state.args.request_timeout(), next.run(request)).await {
            Ok(response) => {
                let hit = response
                    .headers()
                    .get(&HIT_HEADER)
                    .map_or(false, |value| value == "hit");
                (response, if hit { "hit" } else { "miss" })
            }
            Err(_) => (ApiError::RequestTimeout.into_response(), "miss"),
        };

    if logged {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            target: ACCESS_LOG_TARGET,
            "{} {} {} {:.2}ms cache={}",
            method,
            uri,
            response.status().as_u16(),
            elapsed_ms,
            cache
        );
    }
    response
}

/// Turn a panic in a handler into a JSON 500 response.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    ApiError::Internal(details).into_response()
}
