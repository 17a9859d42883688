//! Rendezvous directory client
//!
//! Thin request/response wrapper over the directory's HTTP interface. No
//! state beyond the base URL; failures are reported, never retried.

use peerlink_core::{Error, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A peer's advertised address as stored by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub username: String,
    pub ip_address: String,
    pub port: u16,
    #[serde(default)]
    pub last_seen: String,
}

impl PeerRecord {
    /// `host:port` suitable for `TcpStream::connect`
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

#[derive(Debug, Serialize)]
struct Registration<'a> {
    username: &'a str,
    ip_address: &'a str,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct PeerList {
    peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: String,
}

/// Client for the rendezvous directory
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DirectoryClient {
    /// Create a client for the directory at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Directory(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register `username` as reachable at `ip_address:port`
    pub async fn register(&self, username: &str, ip_address: &str, port: u16) -> Result<()> {
        if username.chars().count() < 3 {
            return Err(Error::Directory(
                "username must be at least 3 characters long".to_string(),
            ));
        }

        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&Registration {
                username,
                ip_address,
                port,
            })
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                tracing::info!("Registered as '{}' with directory {}", username, self.base_url);
                Ok(())
            }
            StatusCode::CONFLICT => Err(Error::AlreadyRegistered(username.to_string())),
            status => Err(Error::Directory(format!(
                "registration failed ({}): {}",
                status,
                error_detail(response).await
            ))),
        }
    }

    /// List the usernames currently registered
    pub async fn list_peers(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/peers", self.base_url))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        if response.status() != StatusCode::OK {
            return Err(Error::Directory(format!(
                "failed to fetch peers ({})",
                response.status()
            )));
        }

        let list: PeerList = response
            .json()
            .await
            .map_err(|e| Error::Directory(format!("malformed peer list: {}", e)))?;
        Ok(list.peers)
    }

    /// Look up where `username` can be reached
    pub async fn peer_info(&self, username: &str) -> Result<PeerRecord> {
        let response = self
            .http
            .get(format!("{}/peerinfo/{}", self.base_url, username))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| Error::Directory(format!("malformed peer info for '{}': {}", username, e))),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("peer '{}'", username))),
            status => Err(Error::Directory(format!(
                "failed to get peer info for '{}' ({})",
                username, status
            ))),
        }
    }

    /// Remove `username` from the directory on clean exit
    pub async fn unregister(&self, username: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/unregister/{}", self.base_url, username))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => {
                tracing::info!("Unregistered '{}' from directory", username);
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("peer '{}'", username))),
            status => Err(Error::Directory(format!("unregister failed ({})", status))),
        }
    }

    /// Whether the directory answers its health endpoint
    pub async fn health_check(&self) -> bool {
        match self.http.get(format!("{}/health", self.base_url)).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!("Directory health check failed: {}", e);
                false
            }
        }
    }

    fn unreachable(&self, e: reqwest::Error) -> Error {
        Error::Unreachable(format!("{}: {}", self.base_url, e))
    }
}

async fn error_detail(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorDetail>(&body)
        .map(|d| d.detail)
        .unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the request line
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            request.lines().next().unwrap_or_default().to_string()
        });

        (url, handle)
    }

    fn client(url: &str) -> DirectoryClient {
        DirectoryClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_register_created() {
        let (url, server) = serve_once("201 Created", r#"{"message":"ok"}"#).await;
        client(&url).register("alice", "127.0.0.1", 5000).await.unwrap();
        assert_eq!(server.await.unwrap(), "POST /register HTTP/1.1");
    }

    #[tokio::test]
    async fn test_register_conflict() {
        let (url, _server) = serve_once("409 Conflict", r#"{"detail":"taken"}"#).await;
        let err = client(&url).register("alice", "127.0.0.1", 5000).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(name) if name == "alice"));
    }

    #[tokio::test]
    async fn test_register_rejects_short_username_locally() {
        let err = client("http://127.0.0.1:9").register("al", "127.0.0.1", 5000).await.unwrap_err();
        assert!(matches!(err, Error::Directory(_)));
    }

    #[tokio::test]
    async fn test_list_peers() {
        let (url, server) = serve_once("200 OK", r#"{"peers":["alice","bob"],"count":2}"#).await;
        let peers = client(&format!("{}/", url)).list_peers().await.unwrap();
        assert_eq!(peers, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(server.await.unwrap(), "GET /peers HTTP/1.1");
    }

    #[tokio::test]
    async fn test_peer_info_found_and_missing() {
        let (url, _server) = serve_once(
            "200 OK",
            r#"{"username":"bob","ip_address":"10.0.0.2","port":5001,"last_seen":"2024-01-01T00:00:00"}"#,
        )
        .await;
        let record = client(&url).peer_info("bob").await.unwrap();
        assert_eq!(record.socket_addr(), "10.0.0.2:5001");

        let (url, _server) = serve_once("404 Not Found", r#"{"detail":"Peer 'zed' not found"}"#).await;
        let err = client(&url).peer_info("zed").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_response_is_reported() {
        let (url, _server) = serve_once("200 OK", r#"{"nope":true}"#).await;
        let err = client(&url).list_peers().await.unwrap_err();
        assert!(matches!(err, Error::Directory(_)));
    }

    #[tokio::test]
    async fn test_unreachable_directory() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{}", addr)).list_peers().await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
        assert!(!client(&format!("http://{}", addr)).health_check().await);
    }
}
