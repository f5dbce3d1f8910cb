//! HTTP client for the ingest and dimension APIs

use crate::error::TransportError;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::time::Duration;

/// Per-request timeout for every writer request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the access token
pub const TOKEN_HEADER: &str = "X-SF-TOKEN";

pub(crate) const CONTENT_JSON: &str = "application/json";
pub(crate) const CONTENT_PROTOBUF: &str = "application/x-protobuf";

/// Thin wrapper over a shared `reqwest::Client`. Proxies come from the
/// process environment, as reqwest does by default.
#[derive(Clone)]
pub struct IngestClient {
    http: reqwest::Client,
}

impl IngestClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("signalfx-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    fn headers(token: &str, content_type: &'static str) -> Result<HeaderMap, String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        let token = HeaderValue::from_str(token).map_err(|e| format!("invalid token: {}", e))?;
        headers.insert(TOKEN_HEADER, token);
        Ok(headers)
    }

    /// POST `body` and require a 200 response
    pub async fn post(
        &self,
        url: &str,
        token: &str,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let headers = Self::headers(token, content_type).map_err(|reason| TransportError::Encode {
            url: url.to_string(),
            reason,
        })?;
        let request = self.http.post(url).headers(headers).body(body);
        Self::execute(url, request).await
    }

    /// PUT a JSON body and require a 200 response
    pub async fn put_json(
        &self,
        url: &str,
        token: &str,
        body: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let headers = Self::headers(token, CONTENT_JSON).map_err(|reason| TransportError::Encode {
            url: url.to_string(),
            reason,
        })?;
        let body = serde_json::to_vec(body).map_err(|e| TransportError::Encode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let request = self.http.put(url).headers(headers).body(body);
        Self::execute(url, request).await
    }

    async fn execute(url: &str, request: reqwest::RequestBuilder) -> Result<(), TransportError> {
        let response = request.send().await.map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            url: url.to_string(),
            status,
            body_snippet: TransportError::snippet(&body),
        })
    }
}

/// Join a base URL and an absolute path without doubling slashes
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://ingest.example.com/", "/v2/datapoint"),
            "https://ingest.example.com/v2/datapoint"
        );
        assert_eq!(join_url("http://h:1", "v1/trace"), "http://h:1/v1/trace");
    }

    #[tokio::test]
    async fn test_non_200_is_status_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/datapoint")
            .match_header("x-sf-token", "tok")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = IngestClient::new().unwrap();
        let url = join_url(&server.url(), "/v2/datapoint");
        let err = client
            .post(&url, "tok", CONTENT_JSON, b"{}".to_vec())
            .await
            .unwrap_err();
        match err {
            TransportError::Status {
                status,
                body_snippet,
                ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(body_snippet, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
