//! Container-runtime boundary and a minimal Docker Engine API client.
//!
//! The client speaks HTTP/1.1 over the daemon's unix socket, one connection
//! per request, and only implements the calls the agent needs.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const API_VERSION: &str = "v1.41";
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("container runtime protocol error: {0}")]
    Protocol(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("container runtime returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("unexpected container runtime response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid container reference {0:?}")]
    InvalidReference(String),
}

impl RuntimeError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RuntimeError::Unreachable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

impl ContainerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container ids and names as the runtime accepts them:
/// `[A-Za-z0-9][A-Za-z0-9_.-]*`. Anything else could reach another endpoint
/// once placed in a request path.
pub fn is_container_ref(reference: &str) -> bool {
    let mut chars = reference.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    }
}

/// One entry of the runtime's container listing, as the runtime reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "State", default)]
    pub state: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn container_action(&self, id: &str, action: ContainerAction)
        -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
}

impl DockerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Honors `DOCKER_HOST=unix://...`, otherwise uses `configured`.
    pub fn from_env_or(configured: &Path) -> Self {
        let from_env = std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|host| host.strip_prefix("unix://").map(PathBuf::from));
        Self::new(from_env.unwrap_or_else(|| configured.to_path_buf()))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(&self, method: Method, path: &str) -> Result<Bytes, RuntimeError> {
        let stream = connect(&self.socket_path)
            .await
            .map_err(|source| RuntimeError::Unreachable {
                path: self.socket_path.clone(),
                source,
            })?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "docker connection closed with error");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(format!("/{API_VERSION}{path}"))
            .header(HOST, "docker")
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(body);
        }
        Err(RuntimeError::Status {
            status,
            message: error_message(&body),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let path = if all {
            "/containers/json?all=1"
        } else {
            "/containers/json"
        };
        let body = self.request(Method::GET, path).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn container_action(
        &self,
        id: &str,
        action: ContainerAction,
    ) -> Result<(), RuntimeError> {
        if !is_container_ref(id) {
            return Err(RuntimeError::InvalidReference(id.to_string()));
        }
        let path = format!("/containers/{id}/{}", action.as_str());
        self.request(Method::POST, &path).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn connect(path: &Path) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(not(unix))]
async fn connect(_path: &Path) -> std::io::Result<tokio::net::TcpStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unix sockets are not supported on this platform",
    ))
}

/// Docker reports failures as `{"message": "..."}`.
fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_container_listing() {
        let body = r#"[
            {"Id":"4f66ad9a0b2e3c1d","Names":["/web"],"State":"running","Status":"Up 2 hours"},
            {"Id":"9c2b","State":"exited"}
        ]"#;
        let list: Vec<ContainerSummary> = serde_json::from_str(body).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].names, vec!["/web".to_string()]);
        assert_eq!(list[0].state, "running");
        assert!(list[1].names.is_empty());
    }

    #[test]
    fn error_message_prefers_json_message() {
        assert_eq!(
            error_message(br#"{"message":"No such container: abc"}"#),
            "No such container: abc"
        );
        assert_eq!(error_message(b"plain failure\n"), "plain failure");
    }

    #[test]
    fn container_refs_follow_runtime_charset() {
        assert!(is_container_ref("4f66ad9a"));
        assert!(is_container_ref("web_1.blue-green"));
        for bad in ["", "-web", ".hidden", "web/kill", "web?signal=9", "..", "a b", "web%2Fkill"] {
            assert!(!is_container_ref(bad), "{bad:?} accepted");
        }
    }

    #[tokio::test]
    async fn action_with_path_in_id_never_leaves_the_client() {
        let client = DockerClient::new("/nonexistent/aegis/docker.sock");
        let err = client
            .container_action("web/kill?signal=SIGKILL&x=", ContainerAction::Stop)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidReference(_)), "got {err}");
    }

    #[tokio::test]
    async fn missing_socket_is_unreachable() {
        let client = DockerClient::new("/nonexistent/aegis/docker.sock");
        let err = client.list_containers(true).await.unwrap_err();
        assert!(err.is_unreachable(), "got {err}");
    }
}
