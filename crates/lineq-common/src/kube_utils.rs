//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
///
/// Must stay above the watch timeout so idle watches are closed by the API
/// server before the client gives up on them.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Watch timeout (seconds) handed to every watcher
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
///
/// Without a path the configuration is inferred (in-cluster service account,
/// then `$KUBECONFIG` / `~/.kube/config`).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// True if the error is an API response with the given HTTP status code
pub fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

/// True if the API server answered 404
pub fn is_not_found(err: &kube::Error) -> bool {
    is_status(err, 404)
}

/// True if the API server answered 409 (conflict or already exists)
pub fn is_conflict(err: &kube::Error) -> bool {
    is_status(err, 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn status_helpers_match_codes() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
        assert!(is_status(&api_error(503), 503));
    }

    #[test]
    fn watch_timeout_is_below_read_timeout() {
        assert!(Duration::from_secs(u64::from(WATCH_TIMEOUT_SECS)) < DEFAULT_READ_TIMEOUT);
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_an_internal_error() {
        let err = create_client(Some(Path::new("/nonexistent/kubeconfig")))
            .await
            .err()
            .expect("create_client should fail for a missing kubeconfig");
        assert_eq!(err.context(), Some("create_client"));
    }
}
