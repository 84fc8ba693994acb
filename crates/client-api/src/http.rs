//! The HTTP protocol.
//!
//! Routing is by API version and verb only: the decoded path must contain a
//! registered version segment, and everything after it (joined, lower-cased)
//! selects the verb. Query strings and bodies go through the same parsing
//! ladder (JSON first, then form pairs, then a bare string), so both
//! protocols hand handlers identical data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::{header, HeaderMap, Method, StatusCode};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use validana_core::metrics::{ResponseClass, Transport};

use crate::errors::{RequestError, GENERIC_ERROR_MESSAGE};
use crate::message::RequestContext;
use crate::{ws, ApiShared, ListenerState};

/// Build the router for one listening socket. The same router serves plain
/// requests and WebSocket upgrades when the two ports coincide.
pub fn router(state: Arc<ListenerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(86_400));
    Router::new().fallback(entry).layer(cors).with_state(state)
}

async fn entry(State(state): State<Arc<ListenerState>>, request: Request) -> Response {
    if state.ws_enabled && wants_websocket(request.headers()) {
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => ws::handle_upgrade(state.shared.clone(), parts.uri.path(), upgrade),
            Err(rejection) => rejection.into_response(),
        };
    }
    if !state.http_enabled {
        return text_response(400, "This port only accepts WebSocket connections.");
    }

    let shared = state.shared.clone();
    let response = process(&shared, request).await;
    shared
        .metrics
        .record_request(Transport::Rest, ResponseClass::from_status(response.status().as_u16()));
    response
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

async fn process(shared: &ApiShared, request: Request) -> Response {
    let received_at = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let max_payload = shared.config.max_payload_size;

    if method == Method::OPTIONS {
        // Answered here for plain OPTIONS; genuine preflights never get past
        // the CORS layer.
        // The CORS layer contributes Access-Control-Allow-Origin.
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "POST, GET")
            .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "origin, content-type, accept")
            .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
            .body(Body::empty())
            .unwrap();
    }

    if max_payload > 0 && uri.to_string().len() > max_payload {
        return text_response(414, "Url too long.");
    }

    let Ok(path) = percent_decode_str(uri.path()).decode_utf8() else {
        return text_response(400, "Invalid url.");
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some(version_at) = segments
        .iter()
        .position(|segment| shared.dispatcher.has_version(segment))
    else {
        return text_response(400, "Invalid api version.");
    };
    let version = segments[version_at].to_lowercase();
    let verb = segments[version_at + 1..].join("/").to_lowercase();
    if segments.len() < 2 || verb.is_empty() {
        return text_response(400, "Invalid request url.");
    }

    let data = match method {
        Method::GET => match uri.query() {
            None => Value::Null,
            Some(query) => parse_query(query),
        },
        Method::POST => {
            let mut body = request.into_body().into_data_stream();
            let mut bytes: Vec<u8> = Vec::new();
            use futures::StreamExt;
            while let Some(chunk) = body.next().await {
                let Ok(chunk) = chunk else {
                    return text_response(400, "Invalid request body.");
                };
                if max_payload > 0 && bytes.len() + chunk.len() > max_payload {
                    // Anything still in flight is discarded with the stream.
                    return text_response(413, "Payload too large.");
                }
                bytes.extend_from_slice(&chunk);
            }
            let Ok(text) = std::str::from_utf8(&bytes) else {
                return text_response(400, "Invalid request body.");
            };
            parse_body(text)
        }
        _ => return text_response(405, "Method not allowed."),
    };

    let ctx = RequestContext::new_http(version, verb, received_at);
    let result = shared.dispatcher.receive(&ctx, data.clone()).await;

    if ctx.latency_tracked() {
        shared.metrics.observe_latency_ms(ctx.elapsed_ms());
    }
    respond(&ctx, result, &data)
}

/// Query strings are tried as JSON (percent-decoded), then as form pairs
/// when a `=` is present, then as a bare decoded string.
pub(crate) fn parse_query(raw: &str) -> Value {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map(|text| text.into_owned())
        .unwrap_or_else(|_| raw.to_owned());
    if let Ok(value) = serde_json::from_str(&decoded) {
        return value;
    }
    if raw.contains('=') {
        return form_pairs(raw);
    }
    if decoded.is_empty() {
        Value::Null
    } else {
        Value::String(decoded)
    }
}

/// Bodies follow the same ladder, but are already plain text.
pub(crate) fn parse_body(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return value;
    }
    if trimmed.contains('=') {
        return form_pairs(trimmed);
    }
    Value::String(trimmed.to_owned())
}

fn form_pairs(raw: &str) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        map.insert(key.into_owned(), Value::String(value.into_owned()));
    }
    Value::Object(map)
}

fn respond(ctx: &RequestContext, result: Result<Value, RequestError>, data: &Value) -> Response {
    match result {
        Ok(value) => {
            let status = ctx.status().unwrap_or(200);
            let mut builder = Response::builder().status(status);
            for (name, header_value) in ctx.headers() {
                builder = builder.header(name, header_value);
            }
            let body = if ctx.header("content-type").is_some() {
                // The handler serialised the body itself.
                match value {
                    Value::String(text) => text,
                    Value::Null => String::new(),
                    other => other.to_string(),
                }
            } else {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                if value.is_null() {
                    String::new()
                } else {
                    value.to_string()
                }
            };
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| text_response(500, GENERIC_ERROR_MESSAGE))
        }
        Err(RequestError::Client { status, message }) => text_response(status, &message),
        Err(RequestError::Server(error)) => {
            let mut body = data.to_string();
            body.truncate(512);
            tracing::error!(verb = %ctx.verb, request = %body, "error during request: {error:#}");
            text_response(500, GENERIC_ERROR_MESSAGE)
        }
    }
}

fn text_response(status: u16, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_owned()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;
    use validana_core::config::{Config, LogFormat};
    use validana_core::metrics::Metrics;

    fn test_config(max_payload: usize) -> Config {
        Config {
            db_user: "gw".into(),
            db_password: "secret".into(),
            db_name: "blockchain".into(),
            db_host: "localhost".into(),
            db_port: 5432,
            db_min_connections: 0,
            db_max_connections: 10,
            http_port: 8080,
            ws_port: 8080,
            tls: false,
            key_path: None,
            cert_path: None,
            max_payload_size: max_payload,
            keep_alive_interval: 60,
            max_memory_mb: 0,
            metrics_interval: 0,
            metrics_token: None,
            workers: 1,
            log_level: "info".into(),
            log_format: LogFormat::Text,
            caching: true,
            sentry_url: None,
        }
    }

    fn test_router(max_payload: usize) -> (Router, Arc<ApiShared>) {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("v1", "echo", true, |_ctx, data| {
            Box::pin(async move { Ok(json!({ "echo": data })) })
        });
        dispatcher.register("v1", "time", true, |_ctx, _data| {
            Box::pin(async move {
                Err::<Value, _>(RequestError::client("No existing blocks found."))
            })
        });
        dispatcher.register("v1", "raw", true, |ctx, _data| {
            Box::pin(async move {
                ctx.set_header("Content-Type", "text/plain; charset=UTF-8");
                Ok(Value::String("already text".to_owned()))
            })
        });

        let metrics = Metrics::shared();
        let shared = Arc::new(ApiShared {
            config: Arc::new(test_config(max_payload)),
            dispatcher: Arc::new(dispatcher),
            metrics: metrics.clone(),
            ws: ws::WsRegistry::new(metrics),
        });
        let state = Arc::new(ListenerState {
            shared: shared.clone(),
            http_enabled: true,
            ws_enabled: false,
        });
        (router(state), shared)
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn options_preflight_gets_cors_headers() {
        let (router, _) = test_router(0);
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/time")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "POST, GET"
        );
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn unknown_verb_lists_supported_types() {
        let (router, _) = test_router(0);
        let response = router.oneshot(get("/api/v1/nosuch")).await.unwrap();
        assert_eq!(response.status(), 400);
        let body = body_text(response).await;
        assert!(
            body.starts_with("Invalid type: nosuch, supported types:"),
            "{body}"
        );
    }

    #[tokio::test]
    async fn missing_version_is_rejected() {
        let (router, _) = test_router(0);
        let response = router.oneshot(get("/api/v9/echo")).await.unwrap();
        assert_eq!(response.status(), 400);
        assert_eq!(body_text(response).await, "Invalid api version.");
    }

    #[tokio::test]
    async fn version_without_verb_is_rejected() {
        let (router, _) = test_router(0);
        let response = router.oneshot(get("/v1")).await.unwrap();
        assert_eq!(response.status(), 400);
        assert_eq!(body_text(response).await, "Invalid request url.");
    }

    #[tokio::test]
    async fn version_match_is_case_insensitive_and_verb_joins_segments() {
        let (router, _) = test_router(0);
        let response = router.oneshot(get("/api/V1/Echo")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[tokio::test]
    async fn get_query_parses_json_then_form_then_string() {
        let (router, _) = test_router(0);

        let response = router
            .clone()
            .oneshot(get("/v1/echo?%7B%22a%22%3A1%7D"))
            .await
            .unwrap();
        assert_eq!(body_text(response).await, r#"{"echo":{"a":1}}"#);

        let response = router.clone().oneshot(get("/v1/echo?a=1&b=x%20y")).await.unwrap();
        assert_eq!(body_text(response).await, r#"{"echo":{"a":"1","b":"x y"}}"#);

        let response = router.oneshot(get("/v1/echo?hello")).await.unwrap();
        assert_eq!(body_text(response).await, r#"{"echo":"hello"}"#);
    }

    #[tokio::test]
    async fn post_body_parses_like_the_query() {
        let (router, _) = test_router(0);
        let response = router
            .clone()
            .oneshot(post("/v1/echo", r#"{"b": true}"#))
            .await
            .unwrap();
        assert_eq!(body_text(response).await, r#"{"echo":{"b":true}}"#);

        let response = router.oneshot(post("/v1/echo", "")).await.unwrap();
        assert_eq!(body_text(response).await, r#"{"echo":null}"#);
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let (router, _) = test_router(0);
        let request = Request::builder()
            .method("PUT")
            .uri("/v1/echo")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 405);
    }

    #[tokio::test]
    async fn overlong_url_is_414_at_the_exact_boundary() {
        let max = "/v1/echo?x".len();
        let (router, _) = test_router(max);
        let response = router.clone().oneshot(get("/v1/echo?x")).await.unwrap();
        assert_eq!(response.status(), 200);

        let response = router.oneshot(get("/v1/echo?xy")).await.unwrap();
        assert_eq!(response.status(), 414);
    }

    #[tokio::test]
    async fn oversized_post_body_is_413() {
        let (router, _) = test_router(8);
        let response = router
            .clone()
            .oneshot(post("/v1/echo", "12345678"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "body exactly at the limit passes");

        let (router, _) = test_router(8);
        let response = router.oneshot(post("/v1/echo", "123456789")).await.unwrap();
        assert_eq!(response.status(), 413);
    }

    #[tokio::test]
    async fn client_error_bodies_are_plain_messages() {
        let (router, _) = test_router(0);
        let response = router.oneshot(get("/api/v1/time")).await.unwrap();
        assert_eq!(response.status(), 400);
        assert_eq!(body_text(response).await, "No existing blocks found.");
    }

    #[tokio::test]
    async fn handler_content_type_sends_the_body_verbatim() {
        let (router, _) = test_router(0);
        let response = router.oneshot(get("/v1/raw")).await.unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=UTF-8"
        );
        assert_eq!(body_text(response).await, "already text");
    }

    #[tokio::test]
    async fn requests_are_counted_by_class() {
        let (router, shared) = test_router(0);
        let _ = router.clone().oneshot(get("/v1/echo")).await.unwrap();
        let _ = router.oneshot(get("/v1/nosuch")).await.unwrap();
        let totals: std::collections::HashMap<_, _> =
            shared.metrics.totals_snapshot().into_iter().collect();
        assert_eq!(totals["requestsSuccessRest"], 1);
        assert_eq!(totals["requestsClientErrorRest"], 1);
    }

    #[tokio::test]
    async fn all_responses_carry_cors_origin() {
        let (router, _) = test_router(0);
        let response = router.oneshot(get("/v1/nosuch")).await.unwrap();
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
