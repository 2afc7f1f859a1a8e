//! `GET /metrics`, Prometheus pull endpoint.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::registry::{CONTENT_TYPE, CounterRegistry};

pub async fn handler(State(registry): State<CounterRegistry>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], registry.render())
}

#[cfg(test)]
mod tests {
    use crate::*;
    use axum::http::{StatusCode, header};
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_scrape_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(dir.path().join("events.log")).await);

        let response = make_request(app, Method::GET, "/metrics", String::default()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            crate::registry::CONTENT_TYPE
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&body).is_ok());
    }

    #[tokio::test]
    async fn test_requests_are_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(dir.path().join("events.log")).await);

        make_request(app.clone(), Method::GET, "/metrics", String::default()).await;
        let response = make_request(app, Method::GET, "/metrics", String::default()).await;

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(r#"http_requests_total{method="GET",path="/metrics",status="200"} 1"#));
        assert!(body.contains("http_requests_duration_seconds_bucket"));
    }
}
