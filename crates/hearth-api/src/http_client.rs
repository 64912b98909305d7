use std::time::Duration;

use bytes::{Bytes, BytesMut};

/// Largest response body read back from a command or webhook endpoint.
pub const MAX_INTEGRATION_RESPONSE_SIZE: usize = 1024 * 1024;

/// Outbound client shared by commands, webhooks and plugins. Cloning is
/// cheap; every clone reuses the same connection pool.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    /// `insecure` disables certificate validation for self-hosted integrations.
    pub fn new(insecure: bool, timeout: Duration) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hearth/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(insecure)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { inner })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner
    }
}

/// Read at most `limit` bytes of the body; the rest is discarded.
pub async fn read_limited(mut resp: reqwest::Response, limit: usize) -> Result<Bytes, reqwest::Error> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = limit - buf.len();
        if chunk.len() >= room {
            buf.extend_from_slice(&chunk[..room]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// The response's `Content-Type` header, or empty.
pub fn content_type(resp: &reqwest::Response) -> String {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    #[tokio::test]
    async fn body_is_capped() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/big");
            then.status(200).body("x".repeat(4096));
        });

        let http = HttpClient::new(false, Duration::from_secs(5)).unwrap();
        let resp = http.client().get(server.url("/big")).send().await.unwrap();
        let body = read_limited(resp, 1000).await.unwrap();
        assert_eq!(body.len(), 1000);
    }

    #[tokio::test]
    async fn small_bodies_are_read_whole() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/small");
            then.status(200).header("content-type", "text/plain").body("hello");
        });

        let http = HttpClient::new(true, Duration::from_secs(5)).unwrap();
        let resp = http.client().get(server.url("/small")).send().await.unwrap();
        assert_eq!(content_type(&resp), "text/plain");
        assert_eq!(&read_limited(resp, MAX_INTEGRATION_RESPONSE_SIZE).await.unwrap()[..], b"hello");
    }
}
