//! HTTP transport shared by the catalog client and the downloader

use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response};
use std::time::Duration;
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::{ProtocolError, Result};

/// HTTP transport client
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a client from configuration
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(config.user_agent.clone());

        if let Some(proxy) = &config.proxy {
            debug!("Routing requests through proxy {}", proxy);
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Start a GET request
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    /// GET from `offset` to the end of the object
    pub async fn get_from(&self, url: &str, offset: u64) -> Result<Response> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        request.send().await.map_err(classify)
    }

    /// Remote object size from a HEAD probe; `None` when unknown or zero
    pub async fn content_length(&self, url: &str) -> Option<u64> {
        let response = match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("HEAD {} returned {}", url, response.status());
                return None;
            }
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                return None;
            }
        };

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&len| len > 0)
    }
}

/// Normalise timeouts so retry decisions do not depend on reqwest internals
pub(crate) fn classify(err: reqwest::Error) -> ProtocolError {
    if err.is_timeout() {
        ProtocolError::Timeout
    } else {
        ProtocolError::Http(err)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_content_length_probe() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/fw.ipsw"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let client = HttpClient::new(&HttpConfig::default()).expect("Operation should succeed");
        let size = client.content_length(&format!("{}/fw.ipsw", server.uri())).await;
        assert_eq!(size, Some(4096));

        let missing = client.content_length(&format!("{}/other.ipsw", server.uri())).await;
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_get_from_sends_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fw.ipsw"))
            .and(header("range", "bytes=100-"))
            .respond_with(ResponseTemplate::new(206))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(&HttpConfig::default()).unwrap();
        let response = client
            .get_from(&format!("{}/fw.ipsw", server.uri()), 100)
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        let config = HttpConfig {
            proxy: Some("::not a url::".to_string()),
            ..HttpConfig::default()
        };
        assert!(HttpClient::new(&config).is_err());
    }
}
