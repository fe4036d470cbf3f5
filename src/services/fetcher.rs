// src/services/fetcher.rs

//! Raw feed retrieval.
//!
//! A fetch either yields the document bytes or a [`FetchError`]; it never
//! retries. Retry and backoff belong to the crawler, which sees failures
//! per source.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{FetchError, Result};
use crate::models::CrawlerConfig;
use crate::utils::http::create_async_client;

pub type FetchResult = std::result::Result<Vec<u8>, FetchError>;

/// Retrieves the raw bytes of a remote feed document.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchResult;
}

/// [`Fetcher`] over HTTP(S).
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_body_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
            max_body_bytes: config.max_response_bytes,
        })
    }

    async fn get(&self, url: &str, timeout: Duration) -> FetchResult {
        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::status(url, status.as_u16()));
        }

        let limit = self.max_body_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(FetchError::too_large(url, limit));
        }

        // the declared length may be missing or wrong
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(url, e))? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::too_large(url, limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchResult {
        log::debug!("Fetching {}", url);
        // reqwest's timeout covers the request; this one also bounds the body read
        match tokio::time::timeout(timeout, self.get(url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::timeout(url)),
        }
    }
}

fn classify(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else if let Some(status) = error.status() {
        FetchError::status(url, status.as_u16())
    } else if error.is_decode() || error.is_body() {
        FetchError::parse(url, error)
    } else {
        FetchError::connection(url, error)
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! Scripted fetcher for crawler tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone)]
    pub enum Reply {
        Body(Vec<u8>),
        Fail(FetchError),
        /// Never answers; the caller's timeout fires.
        Hang,
    }

    #[derive(Default)]
    pub struct StubFetcher {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, url: &str, reply: Reply) -> Self {
            self.set(url, reply);
            self
        }

        pub fn set(&self, url: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(url.to_string(), reply);
        }

        pub fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &str, timeout: Duration) -> FetchResult {
            self.calls.lock().unwrap().push(url.to_string());
            let reply = self.replies.lock().unwrap().get(url).cloned();
            match reply {
                Some(Reply::Body(bytes)) => Ok(bytes),
                Some(Reply::Fail(error)) => Err(error),
                Some(Reply::Hang) => {
                    tokio::time::sleep(timeout).await;
                    Err(FetchError::timeout(url))
                }
                None => Err(FetchError::status(url, 404)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&CrawlerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/feed.xml");
                then.status(200).body("<channel></channel>");
            })
            .await;

        let bytes = fetcher()
            .fetch(&server.url("/feed.xml"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(bytes, b"<channel></channel>");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_status_is_reported_without_retry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/gone.xml");
                then.status(503);
            })
            .await;

        let url = server.url("/gone.xml");
        let err = fetcher().fetch(&url, Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(err, FetchError::status(url, 503));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow.xml");
                then.status(200).delay(Duration::from_secs(3)).body("late");
            })
            .await;

        let url = server.url("/slow.xml");
        let err = fetcher()
            .fetch(&url, Duration::from_millis(200))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::timeout(url));
    }

    #[tokio::test]
    async fn test_oversized_body_is_refused() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/huge.xml");
                then.status(200).body("x".repeat(64));
            })
            .await;

        let config = CrawlerConfig {
            max_response_bytes: 32,
            ..CrawlerConfig::default()
        };
        let url = server.url("/huge.xml");
        let err = HttpFetcher::new(&config)
            .unwrap()
            .fetch(&url, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::too_large(url, 32));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_connection_error() {
        let err = fetcher()
            .fetch("http://127.0.0.1:9/feed.xml", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Connection { .. }));
    }
}
