//! Measurement endpoint handlers and router assembly.
//!
//! # Responsibilities
//! - `small` / `large`: fixed-length downlink saturation streams
//! - `slurp`: uplink drain that counts every received byte
//! - `periodic`: interval-paced bursts for bufferbloat probing
//! - discovery: cached JSON document naming all endpoint URLs
//!
//! # Design Decisions
//! - One router per listener instance, so counters and discovery URLs
//!   stay per-binding
//! - Method filtering rides on the method router (GET implies HEAD);
//!   discovery is the exception and rejects everything but GET
//! - CORS is a layer, not per-handler header juggling

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::body::{ChunkedBody, PeriodicBody};
use crate::http::instance::ServerInstance;

/// Body length of the `small` endpoint.
pub const SMALL_CONTENT_LENGTH: u64 = 1;

/// Declared body length of the `large` and `periodic` endpoints. Clients
/// never read it to completion; it just has to outlast any test run.
pub const LARGE_CONTENT_LENGTH: u64 = 8 * 1024 * 1024 * 1024;

/// Builds the per-listener router, honoring the instance's context path.
pub fn router(instance: Arc<ServerInstance>) -> Router {
    let prefix = instance.context_path.clone();
    let path = |suffix: &str| format!("{prefix}{suffix}");
    let root = if prefix.is_empty() {
        "/".to_string()
    } else {
        format!("{prefix}/")
    };

    let mut router = Router::new()
        .route(&path("/small"), get(small))
        .route(&path("/large"), get(large))
        .route(&path("/slurp"), post(slurp))
        .route(&path("/periodic"), get(periodic))
        .route(&root, any(discovery))
        .route(&path("/config"), any(discovery))
        .route(&path("/.well-known/nq"), any(discovery))
        .with_state(Arc::clone(&instance));

    if instance.enable_cors {
        router = router.layer(CorsLayer::new().allow_origin(Any).allow_headers(Any));
    }

    router.layer(TraceLayer::new_for_http())
}

fn data_response(content_length: u64, body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

/// GET streams the filler; HEAD carries the same headers over no body.
fn download_body(instance: &ServerInstance, content_length: u64, method: &Method) -> Body {
    if method == Method::HEAD {
        Body::empty()
    } else {
        Body::new(ChunkedBody::new(
            content_length,
            Arc::clone(&instance.counters),
        ))
    }
}

async fn small(State(instance): State<Arc<ServerInstance>>, method: Method) -> Response {
    data_response(
        SMALL_CONTENT_LENGTH,
        download_body(&instance, SMALL_CONTENT_LENGTH, &method),
    )
}

async fn large(State(instance): State<Arc<ServerInstance>>, method: Method) -> Response {
    data_response(
        LARGE_CONTENT_LENGTH,
        download_body(&instance, LARGE_CONTENT_LENGTH, &method),
    )
}

#[derive(Debug, Deserialize)]
struct PeriodicParams {
    size: Option<String>,
}

async fn periodic(
    State(instance): State<Arc<ServerInstance>>,
    Query(params): Query<PeriodicParams>,
    method: Method,
) -> Response {
    // The burst size must be a positive integer; reject before any
    // bytes are written or counted.
    let size = params
        .size
        .as_deref()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|&size| size > 0);
    let Some(size) = size else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::new(PeriodicBody::new(
            size,
            LARGE_CONTENT_LENGTH,
            Arc::clone(&instance.counters),
        ))
    };
    data_response(LARGE_CONTENT_LENGTH, body)
}

/// Tells shared proxies to hold the response while clients never reuse
/// it, so upload tests exercise the path instead of a cache.
fn slurp_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        "proxy-cache-control",
        HeaderValue::from_static("max-age=604800, public"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, must-revalidate, private, max-age=0"),
    );
}

async fn slurp(State(instance): State<Arc<ServerInstance>>, request: Request<Body>) -> Response {
    let mut stream = request.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(data) => instance.counters.add_received(data.len() as u64),
            Err(err) => {
                let mut response = (StatusCode::BAD_REQUEST, err.to_string()).into_response();
                slurp_headers(response.headers_mut());
                return response;
            }
        }
    }

    let mut response = StatusCode::OK.into_response();
    slurp_headers(response.headers_mut());
    response
}

async fn discovery(State(instance): State<Arc<ServerInstance>>, method: Method) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let document = instance.discovery_document();
    let mut response = Response::new(Body::from(document));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(alt_svc) = instance.alt_svc() {
        if let Ok(value) = HeaderValue::from_str(&alt_svc) {
            response.headers_mut().insert(header::ALT_SVC, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Binding, Scheme, ServerConfig, TlsMaterial};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn plain_instance() -> Arc<ServerInstance> {
        let config = ServerConfig::default();
        Arc::new(ServerInstance::new(&config, config.bindings()[0]))
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn small_serves_exactly_one_byte() {
        let instance = plain_instance();
        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::GET, "/small"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"x");
        assert_eq!(instance.counters.served(), 1);
    }

    #[tokio::test]
    async fn large_declares_full_length_without_buffering_it() {
        let instance = plain_instance();
        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::GET, "/large"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            LARGE_CONTENT_LENGTH.to_string().as_str()
        );

        // Read a few chunks, then hang up like a real client.
        let mut stream = response.into_body().into_data_stream();
        let mut read = 0u64;
        for _ in 0..3 {
            read += stream.next().await.unwrap().unwrap().len() as u64;
        }
        drop(stream);

        assert_eq!(read, 3 * 64 * 1024);
        assert_eq!(instance.counters.served(), read);
    }

    #[tokio::test]
    async fn head_requests_carry_headers_but_no_body() {
        let instance = plain_instance();
        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::HEAD, "/large"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            LARGE_CONTENT_LENGTH.to_string().as_str()
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
        assert_eq!(instance.counters.served(), 0);
    }

    #[tokio::test]
    async fn wrong_method_is_rejected_without_counting() {
        let instance = plain_instance();
        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::DELETE, "/small"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(instance.counters.served(), 0);
        assert_eq!(instance.counters.received(), 0);
    }

    #[tokio::test]
    async fn periodic_requires_a_positive_numeric_size() {
        let instance = plain_instance();
        for uri in ["/periodic", "/periodic?size=abc", "/periodic?size=0"] {
            let response = router(Arc::clone(&instance))
                .oneshot(request(Method::GET, uri))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri {uri}");
        }
        assert_eq!(instance.counters.served(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_clamps_each_burst() {
        let instance = plain_instance();
        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::GET, "/periodic?size=999999"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let mut stream = response.into_body().into_data_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 4096);
        assert_eq!(instance.counters.served(), 4096);
    }

    #[tokio::test]
    async fn slurp_counts_every_uploaded_byte() {
        let instance = plain_instance();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/slurp")
            .body(Body::from("hello measurement world"))
            .unwrap();

        let response = router(Arc::clone(&instance)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-store, must-revalidate, private, max-age=0"
        );
        assert_eq!(
            response.headers()["proxy-cache-control"],
            "max-age=604800, public"
        );
        assert_eq!(instance.counters.received(), 23);
    }

    #[tokio::test]
    async fn slurp_accepts_an_empty_body() {
        let instance = plain_instance();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/slurp")
            .body(Body::empty())
            .unwrap();

        let response = router(Arc::clone(&instance)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(instance.counters.received(), 0);
    }

    #[tokio::test]
    async fn discovery_serves_cached_json_on_get_only() {
        let instance = plain_instance();

        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::GET, "/config"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(
            value["urls"]["small_download_url"],
            "http://networkquality.example.com:4080/small"
        );

        for method in [Method::HEAD, Method::POST, Method::DELETE] {
            let response = router(Arc::clone(&instance))
                .oneshot(request(method.clone(), "/config"))
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::METHOD_NOT_ALLOWED,
                "method {method}"
            );
        }
    }

    #[tokio::test]
    async fn discovery_well_known_and_root_aliases() {
        let instance = plain_instance();
        for uri in ["/", "/.well-known/nq"] {
            let response = router(Arc::clone(&instance))
                .oneshot(request(Method::GET, uri))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "uri {uri}");
        }
    }

    #[tokio::test]
    async fn cors_layer_marks_every_response() {
        let config = ServerConfig {
            enable_cors: true,
            ..ServerConfig::default()
        };
        let instance = Arc::new(ServerInstance::new(&config, config.bindings()[0]));

        let response = router(instance)
            .oneshot(request(Method::GET, "/small"))
            .await
            .unwrap();
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn alt_svc_advertised_on_discovery_when_http3_enabled() {
        let config = ServerConfig {
            tls: Some(TlsMaterial::SelfSigned),
            enable_http3: true,
            ..ServerConfig::default()
        };
        let instance = Arc::new(ServerInstance::new(
            &config,
            Binding {
                scheme: Scheme::Https,
                port: 4043,
            },
        ));

        let response = router(instance)
            .oneshot(request(Method::GET, "/config"))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::ALT_SVC], "h3=\":4043\"");
    }

    #[tokio::test]
    async fn context_path_prefixes_every_route() {
        let config = ServerConfig {
            context_path: "/nq".to_string(),
            ..ServerConfig::default()
        };
        let instance = Arc::new(ServerInstance::new(&config, config.bindings()[0]));

        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::GET, "/nq/small"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(Arc::clone(&instance))
            .oneshot(request(Method::GET, "/small"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router(instance)
            .oneshot(request(Method::GET, "/nq/config"))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value["urls"]["https_periodic_url"],
            "http://networkquality.example.com:4080/nq/periodic"
        );
    }
}
