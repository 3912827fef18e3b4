//! HTTP access to the player API and the lyric sources.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Read-only network collaborator.  Both calls return `None` on any
/// failure (status, network, timeout, malformed JSON) after logging it.
pub trait DataSource: Send + Sync {
    fn fetch_json<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<Value>>;
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>>;
}

#[derive(Clone)]
pub struct HttpDataSource {
    client: reqwest::Client,
}

impl HttpDataSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("amll-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response, FetchError> {
        let response = self.client.get(url).header("Accept", accept).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }
        Ok(response)
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let body = self.get(url, "application/json").await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.get(url, "*/*").await?.text().await?)
    }
}

fn soften<T>(url: &str, result: Result<T, FetchError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        // 404s are routine for lyric mirrors
        Err(FetchError::Status(status)) => {
            debug!("GET {} returned {}", url, status);
            None
        }
        Err(e) => {
            warn!("GET {} failed: {}", url, e);
            None
        }
    }
}

impl DataSource for HttpDataSource {
    fn fetch_json<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<Value>> {
        Box::pin(async move { soften(url, self.get_json(url).await) })
    }

    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { soften(url, self.get_text(url).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the URL to hit.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}/player", addr)
    }

    fn source() -> HttpDataSource {
        HttpDataSource::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_json_body_is_returned() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\nConnection: close\r\n\r\n{\"progress\":12.5}",
        )
        .await;
        let body = source().fetch_json(&url).await.unwrap();
        assert_eq!(body["progress"], 12.5);
    }

    #[tokio::test]
    async fn test_error_status_is_soft_failure() {
        let url = serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        assert!(source().fetch_text(&url).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_json_is_soft_failure() {
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 8\r\nConnection: close\r\n\r\nnot json").await;
        assert!(source().fetch_json(&url).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_soft_failure() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let url = format!("http://{}/player", addr);
        assert!(source().fetch_json(&url).await.is_none());
    }
}
