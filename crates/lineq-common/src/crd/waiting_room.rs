//! WaitingRoom CRD
//!
//! A WaitingRoom puts a virtual queue in front of one host/path. The operator
//! turns it into an HAProxy Ingress route and a per-room stick table that the
//! proxy uses to admit at most `activeUsers` sessions at a time.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Session lifetime used when a WaitingRoom does not set one
pub const DEFAULT_SESSION_DURATION_MINUTES: i32 = 10;

/// WaitingRoom declares a queue in front of a backend service.
///
/// Example:
/// ```yaml
/// apiVersion: lineq.io/v1alpha1
/// kind: WaitingRoom
/// metadata:
///   name: shop-queue
///   namespace: shop
/// spec:
///   host: shop.example.com
///   path: /queue
///   activeUsers: 100
///   schema: https
///   backendSvcAddr: shop-frontend
///   backendSvcPort: 8080
///   sessionDuration: 15
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lineq.io",
    version = "v1alpha1",
    kind = "WaitingRoom",
    namespaced,
    shortname = "wr",
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"Active","type":"integer","jsonPath":".spec.activeUsers"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WaitingRoomSpec {
    /// Request path guarded by the room (must start with `/`)
    pub path: String,

    /// Maximum number of users admitted concurrently
    pub active_users: i32,

    /// URL scheme the room is served on
    #[serde(default = "default_scheme", rename = "schema", alias = "scheme")]
    pub scheme: String,

    /// Host the room is served on
    pub host: String,

    /// Name of the Service that admitted users are routed to
    pub backend_svc_addr: String,

    /// Port of the backend Service
    pub backend_svc_port: i32,

    /// Minutes an admitted session stays valid
    #[serde(default = "default_session_duration")]
    pub session_duration: i32,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_session_duration() -> i32 {
    DEFAULT_SESSION_DURATION_MINUTES
}

// Host and path end up in HAProxy identifiers and config lines, so both are
// limited to characters HAProxy accepts in a backend name once `.` and `/`
// are mapped to `_`.
fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-')
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-')
}

impl WaitingRoomSpec {
    /// Validate the spec before it is turned into routing resources
    pub fn validate(&self, name: &str) -> Result<(), crate::Error> {
        if self.host.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.host",
                "host cannot be empty",
            ));
        }
        if let Some(c) = self.host.chars().find(|c| !is_host_char(*c)) {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.host",
                format!("invalid character {c:?} in host (allowed: letters, digits, . -)"),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.path",
                format!("path must start with '/', got '{}'", self.path),
            ));
        }
        if let Some(c) = self.path.chars().find(|c| !is_path_char(*c)) {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.path",
                format!("invalid character {c:?} in path (allowed: letters, digits, / _ . -)"),
            ));
        }
        if !(1..=65535).contains(&self.backend_svc_port) {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.backendSvcPort",
                format!("port {} is out of range", self.backend_svc_port),
            ));
        }
        if self.backend_svc_addr.trim().is_empty() {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.backendSvcAddr",
                "backend service cannot be empty",
            ));
        }
        if self.active_users < 1 {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.activeUsers",
                "at least one active user must be admitted",
            ));
        }
        if self.session_duration < 1 {
            return Err(crate::Error::validation_for_field(
                name,
                "spec.sessionDuration",
                "session duration must be at least one minute",
            ));
        }
        Ok(())
    }
}
