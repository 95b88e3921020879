//! Outbound calls from the monitor to fleet members
//!
//! Members expose two endpoints through their local proxy: the challenge
//! used during authentication and the filesystem grow after a volume resize.
//! Both try HTTPS first and fall back to plain HTTP.
//! The filesystem grow falls back only when no HTTPS connection was made.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

/// Header carrying the shared secret in both directions
pub const SECRET_HEADER: &str = "Agi-Monitor-Secret";

pub const CHALLENGE_PATH: &str = "/agi/monitor-challenge";
pub const RESIZE_FS_PATH: &str = "/agi/monitor-resize-fs";

const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);
const RESIZE_FS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Member status code meaning "secret mismatch"
const SECRET_MISMATCH: StatusCode = StatusCode::IM_A_TEAPOT;

/// Client side of the member contract
#[async_trait]
pub trait MemberApi: Send + Sync {
    /// Forward lookup of a member DNS name
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;

    /// Ask the member to confirm the secret. `Ok(false)` means it was refused.
    async fn challenge(&self, addr: &str, secret: &str) -> Result<bool>;

    /// Grow the member's filesystem to fill its volume, returning the member's output
    async fn resize_fs(&self, addr: &str, secret: &str) -> Result<String>;
}

/// [`MemberApi`] over HTTP(S)
#[derive(Clone)]
pub struct HttpMemberApi {
    client: reqwest::Client,
    port: Option<u16>,
}

impl HttpMemberApi {
    /// Member certificates are accepted unverified unless `strict_tls` is set
    pub fn new(strict_tls: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!strict_tls)
            .build()
            .context("Failed to create member HTTP client")?;
        Ok(Self { client, port: None })
    }

    /// Contact members on a fixed port instead of the scheme default
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    fn url(&self, scheme: &str, addr: &str, path: &str) -> String {
        let host = if addr.contains(':') && !addr.starts_with('[') {
            format!("[{addr}]")
        } else {
            addr.to_string()
        };
        match self.port {
            Some(port) => format!("{scheme}://{host}:{port}{path}"),
            None => format!("{scheme}://{host}{path}"),
        }
    }

    async fn challenge_with(&self, scheme: &str, addr: &str, secret: &str) -> Result<bool> {
        let url = self.url(scheme, addr, CHALLENGE_PATH);
        let resp = self
            .client
            .get(&url)
            .header(SECRET_HEADER, secret)
            .timeout(CHALLENGE_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("challenge request to {url}"))?;

        let status = resp.status();
        if status == SECRET_MISMATCH {
            return Ok(false);
        }
        if !status.is_success() {
            bail!("wrong error code: {}", status.as_u16());
        }
        Ok(true)
    }

    async fn send_resize_fs(
        &self,
        scheme: &str,
        addr: &str,
        secret: &str,
    ) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(scheme, addr, RESIZE_FS_PATH))
            .header(SECRET_HEADER, secret)
            .timeout(RESIZE_FS_TIMEOUT)
            .send()
            .await
    }
}

/// Run `attempt` over HTTPS, then once over plain HTTP if no HTTPS
/// connection could be made. Any answer from the member is final.
async fn with_plain_fallback<T, F, Fut>(addr: &str, attempt: F) -> reqwest::Result<T>
where
    F: Fn(&'static str) -> Fut,
    Fut: Future<Output = reqwest::Result<T>>,
{
    match attempt("https").await {
        Err(e) if e.is_connect() => {
            debug!(addr = %addr, error = %e, "HTTPS connect failed, retrying over HTTP");
            attempt("http").await
        }
        other => other,
    }
}

#[async_trait]
impl MemberApi for HttpMemberApi {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .with_context(|| format!("lookup {host}"))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }

    async fn challenge(&self, addr: &str, secret: &str) -> Result<bool> {
        match self.challenge_with("https", addr, secret).await {
            Ok(accepted) => Ok(accepted),
            Err(e) => {
                debug!(addr = %addr, error = %e, "HTTPS challenge failed, retrying over HTTP");
                self.challenge_with("http", addr, secret).await
            }
        }
    }

    async fn resize_fs(&self, addr: &str, secret: &str) -> Result<String> {
        let resp = with_plain_fallback(addr, |scheme| self.send_resize_fs(scheme, addr, secret))
            .await
            .with_context(|| format!("failed to connect to instance {addr}"))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == SECRET_MISMATCH {
            return Err(anyhow!("authentication failed"));
        }
        if !status.is_success() {
            bail!("resize-fs failed with status {}: {}", status.as_u16(), body);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn api_for(server: &mockito::Server) -> HttpMemberApi {
        let port = server.socket_address().port();
        HttpMemberApi::new(false).unwrap().with_port(Some(port))
    }

    #[test]
    fn test_url_building() {
        let api = HttpMemberApi::new(true).unwrap();
        assert_eq!(
            api.url("https", "10.0.0.1", CHALLENGE_PATH),
            "https://10.0.0.1/agi/monitor-challenge"
        );
        let api = api.with_port(Some(8443));
        assert_eq!(
            api.url("http", "2001:db8::1", RESIZE_FS_PATH),
            "http://[2001:db8::1]:8443/agi/monitor-resize-fs"
        );
    }

    #[tokio::test]
    async fn test_challenge_accepted_over_http_fallback() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", CHALLENGE_PATH)
            .match_header(SECRET_HEADER, "s3cret")
            .with_status(200)
            .create_async()
            .await;

        let api = api_for(&server).await;
        assert!(api.challenge("127.0.0.1", "s3cret").await.unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_challenge_teapot_means_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", CHALLENGE_PATH)
            .with_status(418)
            .create_async()
            .await;

        let api = api_for(&server).await;
        assert!(!api.challenge("127.0.0.1", "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn test_challenge_other_status_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", CHALLENGE_PATH)
            .with_status(500)
            .create_async()
            .await;

        let api = api_for(&server).await;
        let err = api.challenge("127.0.0.1", "s").await.unwrap_err();
        assert!(err.to_string().contains("wrong error code: 500"));
    }

    #[tokio::test]
    async fn test_resize_fs_outcomes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", RESIZE_FS_PATH)
            .match_header(SECRET_HEADER, "good")
            .with_status(200)
            .with_body("resized /dev/sdb to 200G")
            .create_async()
            .await;
        server
            .mock("POST", RESIZE_FS_PATH)
            .match_header(SECRET_HEADER, "bad")
            .with_status(418)
            .create_async()
            .await;

        let api = api_for(&server).await;
        assert_eq!(
            api.resize_fs("127.0.0.1", "good").await.unwrap(),
            "resized /dev/sdb to 200G"
        );
        let err = api.resize_fs("127.0.0.1", "bad").await.unwrap_err();
        assert_eq!(err.to_string(), "authentication failed");
    }

    #[tokio::test]
    async fn test_resize_fs_server_error_is_final() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", RESIZE_FS_PATH)
            .with_status(500)
            .with_body("resize2fs: device busy")
            .expect(1)
            .create_async()
            .await;

        let api = api_for(&server).await;
        let err = api.resize_fs("127.0.0.1", "good").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "resize-fs failed with status 500: resize2fs: device busy"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fallback_only_after_connect_failure() {
        let client = reqwest::Client::new();
        let schemes = std::sync::Mutex::new(Vec::new());

        // Nothing listens on port 1, so both schemes fail to connect.
        let err = with_plain_fallback("127.0.0.1", |scheme| {
            schemes.lock().unwrap().push(scheme);
            client.get(format!("{scheme}://127.0.0.1:1/")).send()
        })
        .await
        .unwrap_err();
        assert!(err.is_connect());
        assert_eq!(*schemes.lock().unwrap(), vec!["https", "http"]);

        // A failure that is not a connect error is returned as is.
        schemes.lock().unwrap().clear();
        let err = with_plain_fallback("127.0.0.1", |scheme| {
            schemes.lock().unwrap().push(scheme);
            client.get("not a url").send()
        })
        .await
        .unwrap_err();
        assert!(!err.is_connect());
        assert_eq!(*schemes.lock().unwrap(), vec!["https"]);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let api = HttpMemberApi::new(false).unwrap();
        let ips = api.resolve("localhost").await.unwrap();
        assert!(ips.iter().any(|ip| ip.is_loopback()));
    }
}
