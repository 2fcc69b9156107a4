//! Transport abstraction for text and binary downloads

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use url::Url;
use uuid::Uuid;

/// Query parameter carrying the cache-defeating token
pub const CACHE_BUST_PARAM: &str = "nocache";

/// Non-blocking GET transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Download a text resource
    async fn fetch_text(&self, url: &Url, mime_type: &str) -> Result<String>;

    /// Download a binary resource
    async fn fetch_binary(&self, url: &Url) -> Result<Bytes>;
}

/// Append a unique cache-defeating token to `url`.
///
/// Existing query pairs are preserved.
pub fn cache_bust(url: &Url) -> Url {
    let token = format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    );
    let mut busted = url.clone();
    busted.query_pairs_mut().append_pair(CACHE_BUST_PARAM, &token);
    busted
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::Error;
    use reqwest::{header, Client};
    use std::time::Duration;
    use tracing::{debug, instrument};

    /// `reqwest` backed transport
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        client: Client,
    }

    impl HttpTransport {
        pub fn new(timeout: Duration) -> Result<Self> {
            let client = Client::builder().timeout(timeout).build()?;
            Ok(Self { client })
        }

        pub fn with_client(client: Client) -> Self {
            Self { client }
        }

        async fn get(&self, url: &Url, accept: &str) -> Result<reqwest::Response> {
            let response = self
                .client
                .get(url.clone())
                .header(header::ACCEPT, accept)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::transport(url, format!("HTTP {status}")));
            }
            Ok(response)
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        #[instrument(skip(self), fields(url = %url))]
        async fn fetch_text(&self, url: &Url, mime_type: &str) -> Result<String> {
            let text = self.get(url, mime_type).await?.text().await?;
            debug!(bytes = text.len(), "Text fetched");
            Ok(text)
        }

        #[instrument(skip(self), fields(url = %url))]
        async fn fetch_binary(&self, url: &Url) -> Result<Bytes> {
            let data = self
                .get(url, "application/octet-stream")
                .await?
                .bytes()
                .await?;
            debug!(bytes = data.len(), "Binary fetched");
            Ok(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_bust_appends_token() {
        let url = Url::parse("https://cdn.example.com/movie/file.json").unwrap();
        let busted = cache_bust(&url);
        assert_eq!(busted.path(), url.path());
        assert!(busted
            .query_pairs()
            .any(|(k, v)| k == CACHE_BUST_PARAM && !v.is_empty()));
    }

    #[test]
    fn test_cache_bust_keeps_query_and_is_unique() {
        let url = Url::parse("https://cdn.example.com/moov.bin?sig=abc").unwrap();
        let a = cache_bust(&url);
        let b = cache_bust(&url);
        assert!(a.query_pairs().any(|(k, v)| k == "sig" && v == "abc"));
        assert_ne!(a, b);
    }

    #[cfg(feature = "http")]
    mod http_transport {
        use super::*;
        use std::time::Duration;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn test_fetch_text_and_binary() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/file.json"))
                .respond_with(ResponseTemplate::new(200).set_body_string("[{}, []]"))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/moov.bin"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 1, 2, 3]))
                .mount(&server)
                .await;

            let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
            let base = Url::parse(&server.uri()).unwrap();

            let text = transport
                .fetch_text(&cache_bust(&base.join("file.json").unwrap()), "application/json")
                .await
                .unwrap();
            assert_eq!(text, "[{}, []]");

            let data = transport
                .fetch_binary(&cache_bust(&base.join("moov.bin").unwrap()))
                .await
                .unwrap();
            assert_eq!(&data[..], &[0, 1, 2, 3]);
        }

        #[tokio::test]
        async fn test_http_error_status() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;

            let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
            let url = Url::parse(&server.uri()).unwrap().join("missing").unwrap();
            let err = transport.fetch_binary(&url).await.unwrap_err();
            assert_eq!(err.error_code(), "TRANSPORT");
        }
    }
}
