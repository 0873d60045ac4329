//! Axum extractor for request bodies that must be valid as well as well-formed

use crate::error::EngineError;

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Json},
    http::Request,
};
use serde::de::DeserializeOwned;
use validator::Validate;

/// Json extractor that also runs the body's [Validate] rules.
///
/// Malformed bodies and rule violations are both rejected with an [EngineError], so clients get
/// the same error document either way.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S, B> FromRequest<S, B> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    B: Send + 'static,
{
    type Rejection = EngineError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::RunRequest;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        response::Response,
        routing::post,
        Router,
    };
    use regex::Regex;
    use tower::ServiceExt; // for `oneshot`

    async fn describe(ValidatedJson(request): ValidatedJson<RunRequest>) -> String {
        format!(
            "{} partitions: {:?} roi: {:?}",
            request.dataset.path,
            request.partitions,
            request.roi.map(|roi| roi.len())
        )
    }

    async fn post_run(body: &str) -> Response {
        Router::new()
            .route("/", post(describe))
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header(http::header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    fn with_dataset(extra: &str) -> String {
        format!(
            r#"{{"dataset": {{"path": "/data/scan.raw", "dtype": "uint16",
                "nav_shape": [2, 2], "sig_shape": [4]}}{}}}"#,
            extra
        )
    }

    async fn assert_rejected(body: &str, pattern: &str) {
        let response = post_run(body).await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        let body = body_string(response).await;
        let re = Regex::new(r"request data is not valid").unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
        let re = Regex::new(pattern).unwrap();
        assert!(re.is_match(&body[..]), "body: {body}");
    }

    #[tokio::test]
    async fn valid_request() {
        let response = post_run(&with_dataset(
            r#", "roi": [true, false, false, true], "partitions": 2"#,
        ))
        .await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            "/data/scan.raw partitions: Some(2) roi: Some(4)",
            body_string(response).await
        );
    }

    #[tokio::test]
    async fn malformed_json() {
        assert_rejected("{\"", r"Failed to parse the request body as JSON").await;
    }

    #[tokio::test]
    async fn wrong_field_type() {
        assert_rejected(
            &with_dataset(r#", "partitions": "four""#),
            r"partitions: invalid type: string",
        )
        .await;
    }

    #[tokio::test]
    async fn zero_partitions() {
        assert_rejected(
            &with_dataset(r#", "partitions": 0"#),
            r"partitions must be greater than 0",
        )
        .await;
    }

    #[tokio::test]
    async fn roi_length_mismatch() {
        assert_rejected(
            &with_dataset(r#", "roi": [true, false, true]"#),
            r"ROI length must be equal to the product of nav_shape",
        )
        .await;
    }

    #[tokio::test]
    async fn invalid_nested_dataset() {
        let body = r#"{"dataset": {"path": "/data/scan.raw", "dtype": "uint16",
            "nav_shape": [2, 0], "sig_shape": [4]}}"#;
        assert_rejected(body, r"shape indices must be greater than 0").await;
    }
}
