//! HTTP client for the upstream Git server.
//!
//! Two calls are made per proxied request: the `info/refs` advertisement
//! fetch, bounded by the configured timeout, and for fetches the
//! `git-upload-pack` POST whose body is streamed both ways.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::UpstreamConfig;
use crate::repo::RepoId;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Upstream answered 401 or 404.
    #[error("repository not found")]
    NotFound,
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("upstream returned {0}")]
    Status(StatusCode),
    #[error("failed to read upstream response: {0}")]
    Read(#[source] reqwest::Error),
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    timeout: std::time::Duration,
    user_agent: HeaderValue,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let user_agent = HeaderValue::from_str(&config.user_agent)
            .context("upstream user_agent is not a valid header value")?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(user_agent.clone())
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            user_agent,
        })
    }

    /// Browser-facing URL of the upstream repository, used in error messages.
    pub fn repo_url(&self, repo: &RepoId) -> String {
        format!("{}/{}/{}", self.base_url, repo.owner, repo.name)
    }

    /// Fetch the v0 reference advertisement for `repo`.
    #[instrument(skip(self), fields(repo = %repo))]
    pub async fn fetch_refs(&self, repo: &RepoId) -> Result<Bytes, UpstreamError> {
        let url = format!(
            "{}/{}/{}.git/info/refs?service=git-upload-pack",
            self.base_url, repo.owner, repo.name
        );
        debug!(%url, "fetching reference advertisement");

        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(UpstreamError::Transport)?;
        check_status(resp.status())?;

        let body = resp.bytes().await.map_err(UpstreamError::Read)?;
        debug!(bytes = body.len(), "reference advertisement received");
        Ok(body)
    }

    /// Forward an upload-pack negotiation.  The returned response has a
    /// success status; its body has not been read yet.
    #[instrument(skip(self, headers, body), fields(repo = %repo))]
    pub async fn upload_pack(
        &self,
        repo: &RepoId,
        headers: &HeaderMap,
        body: reqwest::Body,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!(
            "{}/{}/{}/git-upload-pack",
            self.base_url, repo.owner, repo.name
        );
        debug!(%url, "relaying upload-pack");

        let mut forwarded = forwardable_headers(headers);
        // The body is re-streamed, so the framing is chosen by the client.
        forwarded.remove(header::CONTENT_LENGTH);
        forwarded.remove(header::USER_AGENT);
        forwarded.insert(header::USER_AGENT, self.user_agent.clone());

        let resp = self
            .http
            .post(&url)
            .headers(forwarded)
            .body(body)
            .send()
            .await
            .map_err(UpstreamError::Transport)?;
        check_status(resp.status())?;
        Ok(resp)
    }
}

fn check_status(status: StatusCode) -> Result<(), UpstreamError> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Err(UpstreamError::NotFound),
        other => Err(UpstreamError::Status(other)),
    }
}

/// Copy `headers` minus hop-by-hop headers, anything the `Connection`
/// header names, and `Host`.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || *name == header::HOST
            || listed.iter().any(|l| l == lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{body_bytes, header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer) -> UpstreamClient {
        let config = UpstreamConfig {
            base_url: server.uri(),
            timeout_secs: 1,
            ..UpstreamConfig::default()
        };
        UpstreamClient::new(&config).unwrap()
    }

    fn repo() -> RepoId {
        RepoId::parse("/octocat/Hello-World:main/info/refs").unwrap()
    }

    #[tokio::test]
    async fn fetch_refs_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/octocat/Hello-World.git/info/refs"))
            .and(query_param("service", "git-upload-pack"))
            .and(header_is("user-agent", "git/2.1.4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"001e# service=git-upload-pack\n0000".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let body = client_for(&server).fetch_refs(&repo()).await.unwrap();
        assert_eq!(&body[..], b"001e# service=git-upload-pack\n0000");
    }

    #[tokio::test]
    async fn fetch_refs_maps_401_and_404_to_not_found() {
        for status in [401, 404] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let err = client_for(&server).fetch_refs(&repo()).await.unwrap_err();
            assert!(matches!(err, UpstreamError::NotFound), "{status}: {err}");
        }
    }

    #[tokio::test]
    async fn fetch_refs_other_status_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_refs(&repo()).await.unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::Status(StatusCode::SERVICE_UNAVAILABLE)
        ));
    }

    #[tokio::test]
    async fn fetch_refs_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_refs(&repo()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(ref e) if e.is_timeout()), "{err}");
    }

    #[tokio::test]
    async fn fetch_refs_connection_refused() {
        let config = UpstreamConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            ..UpstreamConfig::default()
        };
        let client = UpstreamClient::new(&config).unwrap();
        let err = client.fetch_refs(&repo()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
    }

    #[tokio::test]
    async fn upload_pack_forwards_body_and_headers() {
        let server = MockServer::start().await;
        let request_body = b"0032want 1234567890abcdef1234567890abcdef12345678\n00000009done\n".to_vec();
        let pack = vec![0u8, 1, 2, 0xff, 0xfe, b'P', b'A', b'C', b'K'];
        Mock::given(method("POST"))
            .and(path("/octocat/Hello-World/git-upload-pack"))
            .and(header_is("user-agent", "git/2.1.4"))
            .and(header_is("content-type", "application/x-git-upload-pack-request"))
            .and(body_bytes(request_body.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(pack.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("git/2.43.0"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-git-upload-pack-request"),
        );

        let resp = client_for(&server)
            .upload_pack(&repo(), &headers, reqwest::Body::from(request_body))
            .await
            .unwrap();
        assert_eq!(resp.bytes().await.unwrap().to_vec(), pack);

        let received = server.received_requests().await.unwrap();
        let host = received[0].headers.get("host").unwrap().to_str().unwrap();
        assert_ne!(host, "proxy.local");
        assert!(received[0].headers.get("connection").map_or(true, |v| v != "keep-alive"));
    }

    #[tokio::test]
    async fn upload_pack_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .upload_pack(&repo(), &HeaderMap::new(), reqwest::Body::from("0000"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound));
    }

    #[test]
    fn forwardable_headers_drops_connection_scoped_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("git-protocol", HeaderValue::from_static("version=0"));
        headers.append(header::ACCEPT, HeaderValue::from_static("a"));
        headers.append(header::ACCEPT, HeaderValue::from_static("b"));

        let out = forwardable_headers(&headers);
        assert_eq!(out.len(), 3);
        assert_eq!(out.get("git-protocol").unwrap(), "version=0");
        assert_eq!(out.get_all(header::ACCEPT).iter().count(), 2);
    }

    #[test]
    fn repo_url_names_upstream_repository() {
        let config = UpstreamConfig {
            base_url: "https://github.com/".to_string(),
            ..UpstreamConfig::default()
        };
        let client = UpstreamClient::new(&config).unwrap();
        assert_eq!(client.repo_url(&repo()), "https://github.com/octocat/Hello-World");
    }
}
