//! Per-route request metrics

use askforge_common::metrics::RequestMetrics;
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};

/// Route template of a matched request, e.g. `/v1/chat/tasks/{task_id}/stop`
fn route_of(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string())
}

/// Count and time every routed request
pub async fn track_requests(request: Request, next: Next) -> Response {
    let metrics = RequestMetrics::start(request.method().as_str(), &route_of(&request));
    let response = next.run(request).await;
    metrics.finish(response.status().as_u16());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware::from_fn, routing::post, Router};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_requests_are_labelled_by_route_template() {
        let handle = PrometheusBuilder::new().install_recorder().unwrap();

        let chat = Router::new().route(
            "/chat/tasks/{task_id}/stop",
            post(|| async { StatusCode::ACCEPTED }),
        );
        let app = Router::new()
            .nest("/v1", chat)
            .route_layer(from_fn(track_requests));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/tasks/task-42/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let rendered = handle.render();
        assert!(rendered.contains("askforge_requests_total"));
        assert!(rendered.contains(r#"route="/v1/chat/tasks/{task_id}/stop""#));
        assert!(rendered.contains(r#"status="202""#));
        assert!(!rendered.contains("task-42"));
    }
}
