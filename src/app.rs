//! HTTP application: routes, handlers and the middleware stack.

use crate::app_state::SharedAppState;
use crate::dispatch::Dispatched;
use crate::engine::MapType;
use crate::error::ApiError;
use crate::metrics;
use crate::middleware;
use crate::models::{Page, PageParams, TaskModel};
use crate::task_queue::{TaskHandle, TaskStatus};
use crate::validated_query::ValidatedQuery;

use axum::{
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower::Layer;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use validator::Validate;

/// Version of the service, stamped on every response and part of every cache key.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Response header carrying [VERSION].
pub static VERSION_HEADER: HeaderName = HeaderName::from_static("x-siibra-api-version");

/// Path prefixes under which the API is served.
pub const API_VERSIONS: [&str; 3] = ["v1_0", "v2_0", "v3_0"];

/// Operation behind each route, relative to the version prefix.
static OPERATIONS: [(&str, &str); 13] = [
    ("/atlases", "all_atlases"),
    ("/atlases/:atlas_id", "single_atlas"),
    ("/parcellations", "all_parcellations"),
    ("/parcellations/:parcellation_id", "single_parcellation"),
    ("/parcellations/:parcellation_id/regions", "all_regions"),
    ("/parcellations/:parcellation_id/regions/:region_id", "single_region"),
    ("/spaces", "all_spaces"),
    ("/spaces/:space_id", "single_space"),
    ("/map", "get_map"),
    ("/feature/_types", "feature_types"),
    ("/feature/:feature_type", "all_features"),
    ("/feature/_get/:feature_id", "single_feature"),
    ("/atlas_download", "atlas_download"),
];

/// The operation served by a matched route such as `/v3_0/atlases/:atlas_id`.
pub fn operation_for_route(route: &str) -> Option<&'static str> {
    let unversioned = API_VERSIONS
        .iter()
        .find_map(|version| route.strip_prefix(&format!("/{}", version)))?;
    OPERATIONS
        .iter()
        .find(|(path, _)| *path == unversioned)
        .map(|(_, operation)| *operation)
}

/// The axum [Service] serving the API.
pub type Service = NormalizePath<Router>;

/// Build the API service around `state`.
///
/// Trailing slashes are removed before routing.
pub fn service(state: SharedAppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

/// Build the router with every route and middleware.
pub fn router(state: SharedAppState) -> Router {
    fn api() -> Router<SharedAppState> {
        Router::new()
            .route("/atlases", get(all_atlases))
            .route("/atlases/:atlas_id", get(single_atlas))
            .route("/parcellations", get(all_parcellations))
            .route("/parcellations/:parcellation_id", get(single_parcellation))
            .route("/parcellations/:parcellation_id/regions", get(all_regions))
            .route(
                "/parcellations/:parcellation_id/regions/:region_id",
                get(single_region),
            )
            .route("/spaces", get(all_spaces))
            .route("/spaces/:space_id", get(single_space))
            .route("/map", get(get_map))
            .route("/feature/_types", get(feature_types))
            .route("/feature/:feature_type", get(all_features))
            .route("/feature/_get/:feature_id", get(single_feature))
            .route("/atlas_download", get(atlas_download))
            .route("/atlas_download/:task_id", get(atlas_download_result))
    }

    let mut router = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .route("/ready", get(ready));
    for version in API_VERSIONS {
        router = router.nest(&format!("/{}", version), api());
    }
    // The fallback must exist before the layers so that they wrap it too.
    router
        .fallback(not_found)
        .layer(axum::middleware::from_fn(middleware::method_not_allowed))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::introspect,
        ))
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::cache,
        ))
        .layer(SetResponseHeaderLayer::overriding(
            VERSION_HEADER.clone(),
            HeaderValue::from_static(VERSION),
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::access_log,
        ))
        .layer(
            TraceLayer::new_for_http()
                .on_request(metrics::request_counter)
                .on_response(metrics::record_response_metrics),
        )
        .with_state(state)
}

/// Answer requests that match no route.
async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound {
        kind: "route".to_string(),
        id: uri.path().to_string(),
    }
}

/// Call `operation`, expecting a result rather than a task handle.
async fn dispatch(state: &SharedAppState, operation: &str, args: Value) -> Result<Value, ApiError> {
    match state.call(operation, args).await? {
        Dispatched::Ready(value) => Ok(value),
        Dispatched::Queued(handle) => Err(ApiError::Internal(format!(
            "{} was unexpectedly queued as task {}",
            operation, handle.id
        ))),
    }
}

/// Call a list operation and return one page of its result.
async fn dispatch_page(
    state: &SharedAppState,
    operation: &str,
    args: Value,
    page: &PageParams,
) -> Result<Json<Page<Value>>, ApiError> {
    let value = dispatch(state, operation, args).await?;
    Ok(Json(Page::from_value(value, page)?))
}

async fn ready(State(state): State<SharedAppState>) -> Json<Value> {
    Json(json!({
        "role": state.args.role.to_string(),
        "version": VERSION,
        "cache_connected": state.cache.is_connected(),
    }))
}

async fn all_atlases(
    State(state): State<SharedAppState>,
    ValidatedQuery(page): ValidatedQuery<PageParams>,
) -> Result<Json<Page<Value>>, ApiError> {
    dispatch_page(&state, "all_atlases", Value::Null, &page).await
}

async fn single_atlas(
    State(state): State<SharedAppState>,
    Path(atlas_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let args = json!({ "atlas_id": atlas_id });
    Ok(Json(dispatch(&state, "single_atlas", args).await?))
}

async fn all_parcellations(
    State(state): State<SharedAppState>,
    ValidatedQuery(page): ValidatedQuery<PageParams>,
) -> Result<Json<Page<Value>>, ApiError> {
    dispatch_page(&state, "all_parcellations", Value::Null, &page).await
}

async fn single_parcellation(
    State(state): State<SharedAppState>,
    Path(parcellation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let args = json!({ "parcellation_id": parcellation_id });
    Ok(Json(dispatch(&state, "single_parcellation", args).await?))
}

#[derive(Debug, Deserialize, Validate)]
struct FindQuery {
    /// Substring of the region name
    #[validate(length(min = 1))]
    find: Option<String>,
}

async fn all_regions(
    State(state): State<SharedAppState>,
    Path(parcellation_id): Path<String>,
    ValidatedQuery(query): ValidatedQuery<FindQuery>,
    ValidatedQuery(page): ValidatedQuery<PageParams>,
) -> Result<Json<Page<Value>>, ApiError> {
    let args = json!({ "parcellation_id": parcellation_id, "find": query.find });
    dispatch_page(&state, "all_regions", args, &page).await
}

async fn single_region(
    State(state): State<SharedAppState>,
    Path((parcellation_id, region_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let args = json!({ "parcellation_id": parcellation_id, "region_id": region_id });
    Ok(Json(dispatch(&state, "single_region", args).await?))
}

async fn all_spaces(
    State(state): State<SharedAppState>,
    ValidatedQuery(page): ValidatedQuery<PageParams>,
) -> Result<Json<Page<Value>>, ApiError> {
    dispatch_page(&state, "all_spaces", Value::Null, &page).await
}

async fn single_space(
    State(state): State<SharedAppState>,
    Path(space_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let args = json!({ "space_id": space_id });
    Ok(Json(dispatch(&state, "single_space", args).await?))
}

#[derive(Debug, Deserialize, Validate)]
struct MapQuery {
    parcellation_id: String,
    space_id: String,
    maptype: Option<MapType>,
}

async fn get_map(
    State(state): State<SharedAppState>,
    ValidatedQuery(query): ValidatedQuery<MapQuery>,
) -> Result<Json<Value>, ApiError> {
    let args = json!({
        "parcellation_id": query.parcellation_id,
        "space_id": query.space_id,
        "maptype": query.maptype.unwrap_or(MapType::Labelled),
    });
    Ok(Json(dispatch(&state, "get_map", args).await?))
}

async fn feature_types(
    State(state): State<SharedAppState>,
    ValidatedQuery(page): ValidatedQuery<PageParams>,
) -> Result<Json<Page<Value>>, ApiError> {
    dispatch_page(&state, "feature_types", Value::Null, &page).await
}

#[derive(Debug, Deserialize, Validate)]
struct FeatureQuery {
    parcellation_id: Option<String>,
    region_id: Option<String>,
}

async fn all_features(
    State(state): State<SharedAppState>,
    Path(feature_type): Path<String>,
    ValidatedQuery(query): ValidatedQuery<FeatureQuery>,
    ValidatedQuery(page): ValidatedQuery<PageParams>,
) -> Result<Json<Page<Value>>, ApiError> {
    let args = json!({
        "feature_type": feature_type,
        "parcellation_id": query.parcellation_id,
        "region_id": query.region_id,
    });
    dispatch_page(&state, "all_features", args, &page).await
}

async fn single_feature(
    State(state): State<SharedAppState>,
    Path(feature_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let args = json!({ "feature_id": feature_id });
    Ok(Json(dispatch(&state, "single_feature", args).await?))
}

#[derive(Debug, Deserialize, Validate)]
struct DownloadQuery {
    parcellation_id: String,
    space_id: String,
}

/// Build an atlas bundle, or queue it and answer 202 with the task id.
async fn atlas_download(
    State(state): State<SharedAppState>,
    ValidatedQuery(query): ValidatedQuery<DownloadQuery>,
) -> Result<Response, ApiError> {
    let args = json!({ "parcellation_id": query.parcellation_id, "space_id": query.space_id });
    match state.call("atlas_download", args).await? {
        Dispatched::Ready(bundle) => Ok(Json(bundle).into_response()),
        Dispatched::Queued(handle) => {
            let task = TaskModel {
                task_id: handle.id,
                status: TaskStatus::Pending.to_string(),
            };
            Ok((StatusCode::ACCEPTED, Json(task)).into_response())
        }
    }
}

/// Report the state of a queued download, returning the bundle once it is finished.
async fn atlas_download_result(
    State(state): State<SharedAppState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let queue = state.registry.queue().ok_or_else(|| ApiError::NotFound {
        kind: "task".to_string(),
        id: task_id.clone(),
    })?;
    let handle = TaskHandle::new(task_id);
    let status = queue.status(&handle).await?;
    if status.is_terminal() {
        let bundle = queue.take_result(&handle).await?;
        Ok(Json(bundle).into_response())
    } else {
        let task = TaskModel {
            task_id: handle.id,
            status: status.to_string(),
        };
        Ok(Json(task).into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ResponseCache, BYPASS_HEADER, HIT_HEADER};
    use crate::compression::compress;
    use crate::task_queue::{TaskOutcome, TaskQueue};
    use crate::test_utils::{test_server_state, test_state, MemoryStore, MemoryTaskQueue};

    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use regex::Regex;
    use std::sync::Arc;
    use tower::ServiceExt; // for `oneshot` and `ready`

    async fn request(router: Router, request: Request<Body>) -> Response {
        router.oneshot(request).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    fn cached_state() -> (SharedAppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let state = test_state(ResponseCache::with_store(store.clone(), false));
        (state, store)
    }

    #[test]
    fn operations_of_routes() {
        assert_eq!(operation_for_route("/v3_0/atlases/:atlas_id"), Some("single_atlas"));
        assert_eq!(operation_for_route("/v1_0/map"), Some("get_map"));
        assert_eq!(operation_for_route("/atlases"), None);
        assert_eq!(operation_for_route("/v3_0/metrics"), None);
    }

    #[tokio::test]
    async fn every_version_is_served() {
        let state = test_state(ResponseCache::disabled());
        for version in API_VERSIONS {
            let response = request(router(state.clone()), get(&format!("/{}/atlases", version))).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[&VERSION_HEADER], VERSION);
            let page = body_json(response).await;
            assert_eq!(page["total"], 1);
            assert_eq!(page["items"][0]["@id"], "human");
        }
    }

    #[tokio::test]
    async fn trailing_slash_is_normalised() {
        let state = test_state(ResponseCache::disabled());
        let response = service(state).oneshot(get("/v3_0/spaces/mni152/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn not_found_is_json_envelope() {
        let state = test_state(ResponseCache::disabled());
        let response = request(router(state), get("/v3_0/atlases/rat")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(
            body_json(response).await,
            json!({"error": true, "status_code": 404, "message": "atlas rat not found"})
        );
    }

    #[tokio::test]
    async fn pagination() {
        let state = test_state(ResponseCache::disabled());
        let response = request(
            router(state.clone()),
            get("/v3_0/parcellations/julich/regions?page=2&size=3"),
        )
        .await;
        let page = body_json(response).await;
        assert_eq!(page["total"], 4);
        assert_eq!(page["pages"], 2);
        assert_eq!(page["items"][0]["name"], "area 45");

        let response = request(router(state), get("/v3_0/atlases?size=0")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn regions_and_features() {
        let state = test_state(ResponseCache::disabled());
        let response = request(
            router(state.clone()),
            get("/v3_0/parcellations/julich/regions?find=area"),
        )
        .await;
        assert_eq!(body_json(response).await["total"], 2);

        let response = request(
            router(state.clone()),
            get("/v3_0/parcellations/julich/regions/area%2044"),
        )
        .await;
        assert_eq!(body_json(response).await["parent"], "frontal lobe");

        let response = request(
            router(state.clone()),
            get("/v3_0/feature/ReceptorDensityFingerprint?parcellation_id=julich&region_id=area%2044"),
        )
        .await;
        let page = body_json(response).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["@id"], "fp-44");

        let response = request(router(state.clone()), get("/v3_0/feature/_types")).await;
        assert_eq!(body_json(response).await["total"], 2);

        let response = request(router(state), get("/v3_0/feature/_get/sc-1")).await;
        assert_eq!(body_json(response).await["name"], "streamline counts");
    }

    #[tokio::test]
    async fn map_query() {
        let state = test_state(ResponseCache::disabled());
        let response = request(
            router(state.clone()),
            get("/v3_0/map?parcellation_id=julich&space_id=mni152"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["@id"], "julich/mni152/labelled");

        let response = request(router(state), get("/v3_0/map?parcellation_id=julich")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        let re = Regex::new(r".*missing field `space_id`.*").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
    }

    #[tokio::test]
    async fn responses_are_cached() {
        let (state, store) = cached_state();
        let response = request(router(state.clone()), get("/v3_0/atlases?size=5&page=1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&HIT_HEADER).is_none());
        let first = body_string(response).await;
        let key = format!("[{}] /v3_0/atlases?page=1&size=5", VERSION);
        assert_eq!(store.keys(), vec![key]);

        // Same query, different order.
        let response = request(router(state), get("/v3_0/atlases?page=1&size=5")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&HIT_HEADER], "hit");
        assert_eq!(response.headers()[&VERSION_HEADER], VERSION);
        assert_eq!(body_string(response).await, first);
    }

    #[tokio::test]
    async fn cached_not_found_is_replayed_as_404() {
        let (state, store) = cached_state();
        let key = format!("[{}] /v3_0/atlases/rat", VERSION);
        let envelope = br#"{"error":true,"status_code":404,"message":"atlas rat not found"}"#;
        store.insert(&key, compress(envelope).unwrap().to_vec());

        let response = request(router(state), get("/v3_0/atlases/rat")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[&HIT_HEADER], "hit");
        assert_eq!(body_string(response).await.as_bytes(), envelope.as_slice());
    }

    #[tokio::test]
    async fn not_found_is_stored() {
        let (state, store) = cached_state();
        let response = request(router(state.clone()), get("/v3_0/spaces/colin")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = request(router(state), get("/v3_0/spaces/colin")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[&HIT_HEADER], "hit");
        assert_eq!(store.keys().len(), 1);
    }

    #[tokio::test]
    async fn bbox_queries_are_never_cached() {
        let (state, store) = cached_state();
        let uri = "/v3_0/feature/ReceptorDensityFingerprint?bbox=[[0,0,0],[1,1,1]]";
        let response = request(router(state), get(uri)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn find_queries_are_never_cached() {
        let (state, store) = cached_state();
        let response = request(
            router(state),
            get("/v3_0/parcellations/julich/regions?find=44"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn authorized_requests_are_never_cached() {
        let (state, store) = cached_state();
        let request_with_auth = Request::builder()
            .uri("/v3_0/atlases")
            .header(header::AUTHORIZATION, "Bearer token")
            .body(Body::empty())
            .unwrap();
        let response = request(router(state), request_with_auth).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn non_get_is_never_cached() {
        let (state, store) = cached_state();
        let post = Request::builder()
            .method(Method::POST)
            .uri("/v3_0/atlases")
            .body(Body::empty())
            .unwrap();
        let response = request(router(state), post).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (state, store) = cached_state();
        let response = request(router(state), get("/v3_0/no_such_route")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[&VERSION_HEADER], VERSION);
        let body = body_json(response).await;
        assert_eq!(body["error"], true);
        assert_eq!(body["status_code"], 404);
        assert_eq!(body["message"], "route /v3_0/no_such_route not found");
        // Unmatched paths must not fill the cache.
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn wrong_method_is_json_405() {
        let (state, _) = cached_state();
        let post = Request::builder()
            .method(Method::POST)
            .uri("/v3_0/atlases")
            .body(Body::empty())
            .unwrap();
        let response = request(router(state), post).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert!(response.headers()[header::ALLOW]
            .to_str()
            .unwrap()
            .contains("GET"));
        let body = body_json(response).await;
        assert_eq!(body["status_code"], 405);
        assert_eq!(body["message"], "method POST not allowed");
    }

    #[tokio::test]
    async fn bypass_header_refreshes_entry() {
        let (state, store) = cached_state();
        let key = format!("[{}] /v3_0/spaces", VERSION);
        store.insert(&key, compress(b"{\"stale\": true}").unwrap().to_vec());
        let bypass = Request::builder()
            .uri("/v3_0/spaces")
            .header(&BYPASS_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let response = request(router(state.clone()), bypass).await;
        assert!(response.headers().get(&HIT_HEADER).is_none());
        assert_eq!(body_json(response).await["total"], 1);

        let response = request(router(state), get("/v3_0/spaces")).await;
        assert_eq!(response.headers()[&HIT_HEADER], "hit");
        assert_eq!(body_json(response).await["total"], 1);
    }

    #[tokio::test]
    async fn degraded_cache_still_serves() {
        let (state, store) = cached_state();
        store.set_failing(true);
        let response = request(router(state), get("/v3_0/atlases")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn source_code_of_route() {
        let (state, store) = cached_state();
        let source_request = Request::builder()
            .uri("/v3_0/atlases/human")
            .header(header::ACCEPT, "text/x-sapi-python")
            .body(Body::empty())
            .unwrap();
        let response = request(router(state.clone()), source_request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.starts_with("pub fn single_atlas("), "body: {body}");
        assert!(store.keys().is_empty());

        let source_request = Request::builder()
            .uri("/ready")
            .header(header::ACCEPT, "text/x-sapi-python")
            .body(Body::empty())
            .unwrap();
        let response = request(router(state), source_request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ready_and_metrics_are_not_cached() {
        let (state, store) = cached_state();
        let response = request(router(state.clone()), get("/ready")).await;
        let ready = body_json(response).await;
        assert_eq!(ready["role"], "all");
        assert_eq!(ready["cache_connected"], true);
        let response = request(router(state), get("/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn download_runs_inline_in_all_role() {
        let state = test_state(ResponseCache::disabled());
        let response = request(
            router(state.clone()),
            get("/v3_0/atlas_download?parcellation_id=julich&space_id=mni152"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["regions"].as_array().unwrap().len(), 4);

        let response = request(router(state), get("/v3_0/atlas_download/some-task")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_is_queued_in_server_role() {
        let queue = Arc::new(MemoryTaskQueue::default());
        let state = test_server_state(queue.clone(), ResponseCache::disabled());
        let response = request(
            router(state.clone()),
            get("/v3_0/atlas_download?parcellation_id=julich&space_id=mni152"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let task = body_json(response).await;
        assert_eq!(task["status"], "PENDING");
        let task_id = task["task_id"].as_str().unwrap().to_string();
        let uri = format!("/v3_0/atlas_download/{}", task_id);

        let response = request(router(state.clone()), get(&uri)).await;
        assert_eq!(body_json(response).await["status"], "PENDING");

        queue
            .complete(&task_id, TaskOutcome::Success(json!({"regions": []})))
            .await
            .unwrap();
        let response = request(router(state), get(&uri)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"regions": []}));
    }

    #[tokio::test]
    async fn engine_unavailable_is_503() {
        let engine = Arc::new(crate::engine::CatalogEngine::open(std::path::Path::new(
            "/nonexistent/catalog.json",
        )));
        let state = Arc::new(
            crate::app_state::AppState::with_parts(
                &crate::test_utils::test_args(),
                None,
                engine,
                ResponseCache::disabled(),
            )
            .unwrap(),
        );
        let response = request(router(state), get("/v3_0/spaces")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"], true);
        assert_eq!(body["status_code"], 503);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_is_504() {
        let queue = Arc::new(MemoryTaskQueue::default());
        let mut args = crate::test_utils::test_args();
        args.role = crate::role::Role::Server;
        args.request_timeout = 5;
        let engine = Arc::new(crate::engine::CatalogEngine::from_catalog(
            crate::test_utils::test_catalog(),
        ));
        let state = Arc::new(
            crate::app_state::AppState::with_parts(
                &args,
                Some(queue as Arc<dyn TaskQueue>),
                engine,
                ResponseCache::disabled(),
            )
            .unwrap(),
        );
        // No worker consumes the queue, so the blocking dispatch never returns.
        let response = request(router(state), get("/v3_0/atlases")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["message"], "request timed out");
    }
}
