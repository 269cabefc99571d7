//! Operator configuration
//!
//! Everything is read once at startup from flags or, more commonly, from the
//! environment of the operator's Deployment.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use lineq_common::leader_election::{LeaseTiming, DEFAULT_LEASE_NAME};
use lineq_common::Error;

use crate::controller::DEFAULT_WORKERS;
use crate::haproxy::{SnippetParams, DEFAULT_HAPROXY_NAMESPACE};

const CONFIG: &str = "operator-config";

/// Runtime configuration of the operator
#[derive(Args, Debug, Clone)]
pub struct OperatorConfig {
    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Number of reconcile workers
    #[arg(long, env = "NUM_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub num_workers: usize,

    /// Deployment environment; `local` switches to human-readable logs
    #[arg(long = "env", env = "ENV", default_value = "local")]
    pub environment: String,

    /// Default log level when `RUST_LOG` is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// OTLP collector endpoint
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Namespace of the HAProxy ingress controller
    #[arg(long, env = "HAPROXY_NAMESPACE", default_value = DEFAULT_HAPROXY_NAMESPACE)]
    pub haproxy_namespace: String,

    /// Leader election settings
    #[command(flatten)]
    pub ha: HaConfig,

    /// lineq backend settings
    #[command(flatten)]
    pub lineq: LineqConfig,
}

/// Leader election settings
#[derive(Args, Debug, Clone)]
pub struct HaConfig {
    /// Run with leader election
    #[arg(
        long = "ha-enabled",
        env = "HA_ENABLED",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    pub enabled: bool,

    /// Identity in the lease; falls back to POD_NAME, then HOSTNAME
    #[arg(long = "ha-node-id", env = "HA_NODE_ID")]
    pub node_id: Option<String>,

    /// Name of the Lease object
    #[arg(
        long = "ha-lease-lock-name",
        env = "HA_LEASE_LOCK_NAME",
        default_value = DEFAULT_LEASE_NAME
    )]
    pub lease_lock_name: String,

    /// Seconds a lease is valid without renewal
    #[arg(
        long = "ha-lease-duration-seconds",
        env = "HA_LEASE_DURATION_SECONDS",
        default_value_t = 15
    )]
    pub lease_duration_seconds: u64,

    /// Seconds the leader keeps retrying a failing renewal
    #[arg(
        long = "ha-renew-deadline-seconds",
        env = "HA_RENEW_DEADLINE_SECONDS",
        default_value_t = 10
    )]
    pub renew_deadline_seconds: u64,

    /// Seconds between acquisition and renewal attempts
    #[arg(long = "ha-retry-period-seconds", env = "HA_RETRY_PERIOD_SECONDS", default_value_t = 2)]
    pub retry_period_seconds: u64,
}

impl HaConfig {
    /// Lease timing built from the configured seconds
    pub fn lease_timing(&self) -> LeaseTiming {
        LeaseTiming {
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            renew_deadline: Duration::from_secs(self.renew_deadline_seconds),
            retry_period: Duration::from_secs(self.retry_period_seconds),
        }
    }

    /// Identity to hold the lease under
    pub fn identity(&self) -> Result<String, Error> {
        resolve_identity(
            self.node_id.as_deref(),
            std::env::var("POD_NAME").ok().as_deref(),
            std::env::var("HOSTNAME").ok().as_deref(),
        )
    }
}

/// First non-blank of the explicit id, the pod name, and the hostname
fn resolve_identity(
    node_id: Option<&str>,
    pod_name: Option<&str>,
    hostname: Option<&str>,
) -> Result<String, Error> {
    [node_id, pod_name, hostname]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::validation_for_field(
                CONFIG,
                "HA_NODE_ID",
                "no node id: set HA_NODE_ID, POD_NAME or HOSTNAME",
            )
        })
}

/// Addresses of the lineq backend and the default table configuration
#[derive(Args, Debug, Clone)]
pub struct LineqConfig {
    /// lineq peer address
    #[arg(long = "lineq-tcp-addr", env = "LINEQ_TCP_ADDR", default_value = "lineq-tcp.lineq.svc")]
    pub tcp_addr: String,

    /// lineq peer port
    #[arg(long = "lineq-tcp-port", env = "LINEQ_TCP_PORT", default_value_t = 11111)]
    pub tcp_port: u16,

    /// lineq HTTP address
    #[arg(
        long = "lineq-http-addr",
        env = "LINEQ_HTTP_ADDR",
        default_value = "lineq-http.lineq.svc"
    )]
    pub http_addr: String,

    /// lineq HTTP port
    #[arg(long = "lineq-http-port", env = "LINEQ_HTTP_PORT", default_value_t = 8060)]
    pub http_port: u16,

    /// Room stick table used when the backend does not answer
    #[arg(long = "lineq-room-table", env = "LINEQ_ROOM_TABLE", default_value = "lineq_room")]
    pub room_table: String,

    /// User stick table used when the backend does not answer
    #[arg(long = "lineq-user-table", env = "LINEQ_USER_TABLE", default_value = "lineq_user")]
    pub user_table: String,

    /// Session lifetime in minutes used when the backend does not answer
    #[arg(long = "lineq-session-duration", env = "LINEQ_SESSION_DURATION", default_value_t = 10)]
    pub session_duration: i32,
}

impl LineqConfig {
    /// Snippet parameters for the given table configuration
    pub fn snippet_params(
        &self,
        room_table: &str,
        user_table: &str,
        session_duration: i32,
    ) -> SnippetParams {
        SnippetParams {
            room_table: room_table.to_string(),
            user_table: user_table.to_string(),
            session_duration,
            lineq_tcp_addr: self.tcp_addr.clone(),
            lineq_tcp_port: self.tcp_port,
            lineq_http_addr: self.http_addr.clone(),
            lineq_http_port: self.http_port,
        }
    }

    /// Snippet parameters from the configured defaults
    pub fn default_snippet_params(&self) -> SnippetParams {
        self.snippet_params(&self.room_table, &self.user_table, self.session_duration)
    }
}

impl OperatorConfig {
    /// Reject configurations the operator cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_workers == 0 {
            return Err(Error::validation_for_field(
                CONFIG,
                "NUM_WORKERS",
                "at least one worker is required",
            ));
        }
        if self.haproxy_namespace.trim().is_empty() {
            return Err(Error::validation_for_field(
                CONFIG,
                "HAPROXY_NAMESPACE",
                "must not be empty",
            ));
        }
        for (field, value) in [
            ("LINEQ_TCP_ADDR", &self.lineq.tcp_addr),
            ("LINEQ_HTTP_ADDR", &self.lineq.http_addr),
            ("LINEQ_ROOM_TABLE", &self.lineq.room_table),
            ("LINEQ_USER_TABLE", &self.lineq.user_table),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation_for_field(CONFIG, field, "must not be empty"));
            }
        }
        if self.lineq.tcp_port == 0 || self.lineq.http_port == 0 {
            return Err(Error::validation_for_field(
                CONFIG,
                "LINEQ_TCP_PORT",
                "ports must be non-zero",
            ));
        }
        if self.lineq.session_duration < 1 {
            return Err(Error::validation_for_field(
                CONFIG,
                "LINEQ_SESSION_DURATION",
                "must be at least 1 minute",
            ));
        }
        if self.ha.enabled {
            self.ha
                .lease_timing()
                .validate()
                .map_err(|e| {
                    Error::validation_for_field(CONFIG, "HA_LEASE_DURATION_SECONDS", e.to_string())
                })?;
            if self.ha.lease_lock_name.trim().is_empty() {
                return Err(Error::validation_for_field(
                    CONFIG,
                    "HA_LEASE_LOCK_NAME",
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// Whether logs should be human-readable
    pub fn is_local(&self) -> bool {
        self.environment == "local"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: OperatorConfig,
    }

    pub(crate) fn parse(args: &[&str]) -> OperatorConfig {
        let mut argv = vec!["lineq-operator"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--num-workers",
            "8",
            "--ha-enabled",
            "true",
            "--ha-node-id",
            "replica-1",
            "--ha-lease-duration-seconds",
            "30",
            "--lineq-room-table",
            "rooms",
            "--haproxy-namespace",
            "ingress",
        ]);
        assert_eq!(config.num_workers, 8);
        assert!(config.ha.enabled);
        assert_eq!(config.ha.node_id.as_deref(), Some("replica-1"));
        assert_eq!(config.ha.lease_timing().lease_duration, Duration::from_secs(30));
        assert_eq!(config.lineq.room_table, "rooms");
        assert_eq!(config.haproxy_namespace, "ingress");
        config.validate().unwrap();
    }

    #[test]
    fn ha_flag_accepts_boolish_values() {
        assert!(parse(&["--ha-enabled", "yes"]).ha.enabled);
        assert!(!parse(&["--ha-enabled", "0"]).ha.enabled);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = parse(&["--num-workers", "0"]).validate().unwrap_err();
        assert!(matches!(err, Error::Validation { field: Some(ref f), .. } if f == "NUM_WORKERS"));
    }

    #[test]
    fn bad_lease_timing_is_rejected_only_with_ha() {
        let args = [
            "--ha-lease-duration-seconds",
            "5",
            "--ha-renew-deadline-seconds",
            "10",
        ];
        parse(&args).validate().unwrap();

        let mut with_ha = vec!["--ha-enabled", "true"];
        with_ha.extend_from_slice(&args);
        assert!(parse(&with_ha).validate().is_err());
    }

    #[test]
    fn session_duration_must_be_positive() {
        assert!(parse(&["--lineq-session-duration", "0"]).validate().is_err());
    }

    #[test]
    fn identity_falls_back_in_order() {
        assert_eq!(
            resolve_identity(Some("node"), Some("pod"), Some("host")).unwrap(),
            "node"
        );
        assert_eq!(resolve_identity(None, Some("pod"), Some("host")).unwrap(), "pod");
        assert_eq!(resolve_identity(Some("  "), None, Some("host")).unwrap(), "host");
        assert!(resolve_identity(None, None, Some("")).is_err());
    }

    #[test]
    fn snippet_params_carry_backend_addresses() {
        let config = parse(&["--lineq-tcp-port", "12000"]);
        let params = config.lineq.snippet_params("r", "u", 20);
        assert_eq!(params.room_table, "r");
        assert_eq!(params.user_table, "u");
        assert_eq!(params.session_duration, 20);
        assert_eq!(params.lineq_tcp_port, 12000);
        assert_eq!(params.lineq_http_port, config.lineq.http_port);
    }
}
