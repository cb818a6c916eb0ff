use axum::{http::header::LOCATION, routing::post, Router};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::state::AppState;

/// Echo the request origin so credentialed browser clients are accepted
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .expose_headers([LOCATION])
}

/// Create the WHEP router. Every path is a resource.
pub fn create_router(state: Arc<AppState>) -> Router {
    // CorsLayer answers every OPTIONS itself, so the preflight handler is
    // added after it and stays unwrapped
    let whep = post(handlers::whep_offer)
        .delete(handlers::whep_delete)
        .fallback(handlers::unsupported_method)
        .layer(cors_layer())
        .options(handlers::whep_preflight);

    Router::new()
        .route("/", whep.clone())
        .route("/*path", whep)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::extract::Request;
    use axum::http::{self, header, HeaderValue, Method, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt;

    use crate::testing::{MockSources, MockTransportFactory};
    use crate::webrtc::{CapabilitySet, IceProtocolPreference, SessionManager, TransportPolicy};

    fn app() -> (Router, Arc<MockTransportFactory>, Arc<AppState>) {
        let factory = Arc::new(MockTransportFactory::new());
        let manager = SessionManager::new(
            factory.clone(),
            Arc::new(MockSources::new(3, Duration::from_millis(5))),
            CapabilitySet::default_whep(),
            TransportPolicy::default(),
        );
        let state = AppState::new(manager, false);
        (create_router(state.clone()), factory, state)
    }

    fn offer(uri: &str, sdp: &str) -> Request {
        http::Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::HOST, "media.example.com:8082")
            .header(header::CONTENT_TYPE, "application/sdp")
            .body(Body::from(sdp.to_string()))
            .unwrap()
    }

    fn delete(uri: &str) -> Request {
        http::Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_post_creates_session() {
        let (app, _, state) = app();
        let response = app.oneshot(offer("/live/cam1", "v=0 test")).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://media.example.com:8082/live/cam1"
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/sdp");
        assert_eq!(body_text(response).await, "answer:v=0 test");
        assert!(state.sessions.get_session("/live/cam1").await.is_some());
    }

    #[tokio::test]
    async fn test_root_path_is_a_resource() {
        let (app, _, _) = app();
        let response = app.oneshot(offer("/", "v=0")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://media.example.com:8082/"
        );
    }

    #[tokio::test]
    async fn test_duplicate_post_is_bad_request() {
        let (app, _, _) = app();
        let first = app.clone().oneshot(offer("/x", "v=0")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app.oneshot(offer("/x", "v=0")).await.unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(second).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_negotiation_is_bad_request() {
        let (app, factory, state) = app();
        factory.set_fail_negotiate(true);
        let response = app.oneshot(offer("/x", "not sdp")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!state.sessions.is_occupied("/x").await);
    }

    #[tokio::test]
    async fn test_empty_offer_rejected() {
        let (app, factory, _) = app();
        let response = app.oneshot(offer("/x", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(factory.transports().is_empty());
    }

    #[tokio::test]
    async fn test_delete_then_delete_again() {
        let (app, factory, _) = app();
        app.clone().oneshot(offer("/x", "v=0")).await.unwrap();

        let response = app.clone().oneshot(delete("/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(factory.last().is_closed());

        let response = app.oneshot(delete("/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_preflight_echoes_request() {
        let (app, _, _) = app();
        let request = http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/live")
            .header(header::ORIGIN, "https://player.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "POST");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "content-type");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://player.example.com"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn test_origin_echoed_on_post() {
        let (app, _, _) = app();
        let mut request = offer("/live", "v=0");
        request.headers_mut().insert(
            header::ORIGIN,
            HeaderValue::from_static("https://player.example.com"),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://player.example.com"
        );
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS].to_str().unwrap().to_ascii_lowercase(),
            "location"
        );
    }

    #[tokio::test]
    async fn test_origin_echoed_on_delete_error() {
        let (app, _, _) = app();
        let mut request = delete("/missing");
        request.headers_mut().insert(
            header::ORIGIN,
            HeaderValue::from_static("https://player.example.com"),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://player.example.com"
        );
    }

    #[tokio::test]
    async fn test_no_cors_headers_without_origin() {
        let (app, _, _) = app();
        let response = app.oneshot(offer("/live", "v=0")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn test_other_methods_rejected() {
        let (app, _, _) = app();
        let request = http::Request::builder()
            .method(Method::GET)
            .uri("/live")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_query_overrides() {
        let (app, factory, _) = app();
        let response = app
            .clone()
            .oneshot(offer("/tcp?transport=tcp&flexfec=disable", "v=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        // Query string is not part of the resource
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://media.example.com:8082/tcp"
        );
        let policy = factory.policies().pop().unwrap();
        assert_eq!(policy.ice_protocol, IceProtocolPreference::TcpOnly);
        assert!(!policy.fec_enabled);

        let response = app
            .oneshot(offer("/bad?transport=carrier-pigeon", "v=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
