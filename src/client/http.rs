//! HTTP transport for the backend correlation API
//!
//! Logical contract: `PUT` asserts and `DELETE` retracts an association at
//! `/v2/correlate/{dimension}/{value}/{kind}/{name}`. Responses are only
//! interpreted as success, transient failure (429/5xx, timeouts) or
//! permanent rejection (other 4xx).

use super::CorrelationTransport;
use crate::error::{CorrelationError, CorrelationResult};
use crate::types::{CorrelationOp, CorrelationRequest};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// HTTP client for the correlation API
pub struct HttpTransport {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpTransport {
    /// Create a new transport for `endpoint` with a per-request timeout
    pub fn new(
        endpoint: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> CorrelationResult<Self> {
        Url::parse(endpoint)?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!(
                "trace-correlation/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn request_url(&self, request: &CorrelationRequest) -> String {
        format!(
            "{}/v2/correlate/{}/{}/{}/{}",
            self.base_url,
            request.key.name,
            request.key.value,
            request.association.kind(),
            request.association.value()
        )
    }
}

#[async_trait]
impl CorrelationTransport for HttpTransport {
    async fn send(&self, request: &CorrelationRequest) -> CorrelationResult<()> {
        let method = match request.op {
            CorrelationOp::Associate => Method::PUT,
            CorrelationOp::Disassociate => Method::DELETE,
        };
        let url = self.request_url(request);

        let mut builder = self.client.request(method, &url);
        if let Some(token) = &self.access_token {
            builder = builder.header("X-Access-Token", token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CorrelationError::Timeout
            } else {
                CorrelationError::Network(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(url, "correlation request accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(CorrelationError::server(status.as_u16(), body))
        } else {
            Err(CorrelationError::rejected(status.as_u16(), body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Association, DimensionKey};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CorrelationRequest {
        CorrelationRequest::associate(
            DimensionKey::new("host", "localhost"),
            Association::Service("checkout".into()),
        )
    }

    fn transport(server: &MockServer, token: Option<String>) -> HttpTransport {
        HttpTransport::new(&server.uri(), token, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_rejects_invalid_endpoint() {
        assert!(HttpTransport::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_associate_uses_put_on_correlate_path() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/correlate/host/localhost/service/checkout"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        transport(&server, None).send(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_disassociate_uses_delete() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/correlate/host/localhost/environment/prod"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let req = CorrelationRequest::disassociate(
            DimensionKey::new("host", "localhost"),
            Association::Environment("prod".into()),
        );
        transport(&server, None).send(&req).await.unwrap();
    }

    #[tokio::test]
    async fn test_access_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("X-Access-Token", "abcd"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        transport(&server, Some("abcd".into()))
            .send(&request())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = transport(&server, None).send(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limited_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = transport(&server, None).send(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404).set_body_string("unknown dimension"))
            .mount(&server)
            .await;

        let err = transport(&server, None).send(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
        match err {
            CorrelationError::Rejected { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "unknown dimension");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
