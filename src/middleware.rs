use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::error::GuardRejection;
use crate::guard::SecurityGuard;

/// Ingress middleware: resolves the [`RequestContext`](crate::RequestContext),
/// refuses blacklisted clients with 403 and stores the context in the request
/// extensions for handlers (`Extension<RequestContext>`).
///
/// ```ignore
/// let app = Router::new()
///     .route("/book", post(book))
///     .layer(axum::middleware::from_fn_with_state(guard.clone(), guard_ingress));
/// ```
pub async fn guard_ingress(State(guard): State<Arc<SecurityGuard>>, mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let ctx = guard.context_from_headers(request.headers(), peer);

    if guard.is_ip_blacklisted(&ctx, None).await {
        debug!(ip_address = %ctx.ip_address, path = %request.uri().path(), "Blacklisted client refused");
        return GuardRejection::Blacklisted.into_response();
    }

    request.extensions_mut().insert(ctx);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GuardConfig;
    use crate::context::RequestContext;
    use crate::error::{RejectionBody, RejectionCode};
    use crate::store::MemorySecurityStore;
    use axum::{
        Extension, Router,
        body::{Body, to_bytes},
        http::{Request as HttpRequest, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
    };
    use tower::ServiceExt;

    async fn whoami(Extension(ctx): Extension<RequestContext>) -> String {
        format!("{}|{}", ctx.ip_address, ctx.session_id.unwrap_or_default())
    }

    fn app() -> Router {
        let mut config = GuardConfig::default();
        config.reputation.blacklist = vec!["185.220.100.0/22".to_string()];
        let guard = Arc::new(
            SecurityGuard::new(
                config,
                Arc::new(MemorySecurityStore::new()),
                Arc::new(ManualClock::default()),
            )
            .unwrap(),
        );

        Router::new()
            .route("/", get(whoami))
            .layer(from_fn_with_state(guard, guard_ingress))
    }

    #[tokio::test]
    async fn test_context_reaches_handler() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header("x-forwarded-for", "8.8.8.8, 10.0.0.1")
                    .header("cookie", "session_id=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"8.8.8.8|abc");
    }

    #[tokio::test]
    async fn test_blacklisted_client_is_refused() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header("cf-connecting-ip", "185.220.101.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let rejection: RejectionBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(rejection.code, RejectionCode::Forbidden);
        assert_eq!(rejection.message, "Access denied");
    }
}
