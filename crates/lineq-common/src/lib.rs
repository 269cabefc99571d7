//! Common types for lineq: CRDs, errors, leader election and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager / component name used on everything the operator writes
pub const OPERATOR_NAME: &str = "waitingroom-operator";

/// Label key marking resources created by the operator
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
