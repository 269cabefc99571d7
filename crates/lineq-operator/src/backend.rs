//! Client for the lineq backend HTTP service
//!
//! The backend keeps the queue state for each room. The operator tells it
//! about new rooms (`POST /create`) and asks it which stick tables the proxy
//! should use (`GET /getConfig`). Notification is best-effort; only the
//! configuration fetch reports errors to the caller.

use std::time::Duration;

use async_trait::async_trait;
use lineq_common::Error;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::controller::{DesiredState, ResourceKey};

/// Default timeout for backend requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Table configuration served by the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendConfig {
    /// Room stick table name
    pub room_table: String,
    /// User stick table name
    pub user_table: String,
    /// Session lifetime in minutes
    pub session_duration: i32,
}

/// Operations the operator needs from the lineq backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LineqBackend: Send + Sync {
    /// Announce a room; failures are logged, never returned
    async fn notify(&self, state: &DesiredState, key: &ResourceKey);

    /// Fetch the stick table configuration
    async fn fetch_config(&self) -> Result<BackendConfig, Error>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    name: &'a str,
    path: &'a str,
    active_users: i32,
    host: &'a str,
    session_duration: i32,
}

#[derive(Debug, Default, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    lineq_room_table: String,
    lineq_user_table: String,
    lineq_session_duration: i32,
}

impl From<ConfigResponse> for BackendConfig {
    fn from(response: ConfigResponse) -> Self {
        Self {
            room_table: response.lineq_room_table,
            user_table: response.lineq_user_table,
            session_duration: response.lineq_session_duration,
        }
    }
}

/// [`LineqBackend`] over HTTP
#[derive(Clone, Debug)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Client for the backend at `http://{addr}:{port}`
    pub fn new(addr: &str, port: u16, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("backend", e.to_string()))?;
        Ok(Self::with_client(format!("http://{addr}:{port}"), client))
    }

    /// Client using a preconfigured `reqwest::Client`
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn post_create(&self, request: &CreateRequest<'_>) -> Result<StatusResponse, Error> {
        let url = self.url("/create");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::backend(&url, format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::backend(&url, format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| Error::backend(&url, format!("invalid JSON: {e}")))
    }
}

#[async_trait]
impl LineqBackend for HttpBackend {
    async fn notify(&self, state: &DesiredState, key: &ResourceKey) {
        let request = CreateRequest {
            name: key.as_str(),
            path: &state.path,
            active_users: state.active_users,
            host: &state.host,
            session_duration: state.session_duration,
        };

        match self.post_create(&request).await {
            Ok(response) => info!(
                key = %key,
                status = %response.status,
                message = %response.message,
                "Backend notified"
            ),
            Err(e) => warn!(key = %key, error = %e, "Backend notification failed"),
        }
    }

    async fn fetch_config(&self) -> Result<BackendConfig, Error> {
        let url = self.url("/getConfig");
        debug!(url = %url, "Fetching backend config");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::backend(&url, format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::backend(&url, format!("HTTP {}", response.status())));
        }

        let body: ConfigResponse = response
            .json()
            .await
            .map_err(|e| Error::backend(&url, format!("invalid JSON: {e}")))?;

        info!(status = %body.status, message = %body.message, "Fetched backend config");
        Ok(body.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::event::tests::sample_state;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn create_request_uses_camel_case() {
        let request = CreateRequest {
            name: "a_com_q",
            path: "/q",
            active_users: 5,
            host: "a.com",
            session_duration: 10,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "a_com_q",
                "path": "/q",
                "activeUsers": 5,
                "host": "a.com",
                "sessionDuration": 10
            })
        );
    }

    #[test]
    fn config_response_maps_table_names() {
        let body = r#"{"status":"ok","message":"","lineq_room_table":"rooms","lineq_user_table":"users","lineq_session_duration":30}"#;
        let response: ConfigResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            BackendConfig::from(response),
            BackendConfig {
                room_table: "rooms".to_string(),
                user_table: "users".to_string(),
                session_duration: 30,
            }
        );
    }

    #[tokio::test]
    async fn notify_posts_the_room() {
        let (base_url, server) = serve_once(r#"{"status":"ok","message":"created"}"#).await;
        let backend = HttpBackend::with_client(base_url, reqwest::Client::new());
        let state = sample_state("a.com", "/q");

        backend
            .notify(&state, &ResourceKey::derive(&state.host, &state.path))
            .await;

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /create HTTP/1.1"));
        assert!(request.contains(r#""name":"a_com_q""#));
        assert!(request.contains(r#""activeUsers":5"#));
    }

    #[tokio::test]
    async fn fetch_config_reads_tables() {
        let (base_url, server) = serve_once(
            r#"{"status":"ok","message":"","lineq_room_table":"rooms","lineq_user_table":"users","lineq_session_duration":30}"#,
        )
        .await;
        let backend = HttpBackend::with_client(base_url, reqwest::Client::new());

        let config = backend.fetch_config().await.unwrap();
        assert_eq!(config.room_table, "rooms");
        assert_eq!(config.session_duration, 30);
        assert!(server.await.unwrap().starts_with("GET /getConfig HTTP/1.1"));
    }

    #[tokio::test]
    async fn unreachable_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let backend = HttpBackend::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let state = sample_state("a.com", "/q");
        backend
            .notify(&state, &ResourceKey::derive(&state.host, &state.path))
            .await;

        let err = backend.fetch_config().await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
    }
}
