//! Error types for the lineq operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like the waiting room
//! name, the ConfigMap being edited, or the backend endpoint that failed.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for lineq operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.path")
        field: Option<String>,
    },

    /// lineq backend (HTTP) error
    #[error("backend error [{endpoint}]: {message}")]
    Backend {
        /// Backend endpoint that was called (e.g. "/getConfig")
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Shared HAProxy configuration error
    #[error("config store error for {config_map}: {message}")]
    ConfigStore {
        /// Name of the ConfigMap being read or written
        config_map: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization or rendering error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Watch cache failed to deliver its initial listing
    #[error("cache sync error for {kind}: {message}")]
    Sync {
        /// Kind of the watched resource (e.g. "Ingress")
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "pipeline", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without resource context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a backend error for the given endpoint
    pub fn backend(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a config store error for the given ConfigMap
    pub fn config_store(config_map: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConfigStore {
            config_map: config_map.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cache sync error for the given kind
    pub fn sync(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Sync {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require a spec fix).
    /// Kubernetes errors depend on the status code: 409 conflicts are retried
    /// because the next attempt reads a fresh resourceVersion.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Backend { .. } => true,
            Error::ConfigStore { .. } => true,
            Error::Serialization { .. } => false,
            Error::Sync { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the resource name if this error is associated with a specific resource
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::ConfigStore { config_map, .. } => Some(config_map),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Backend { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// True when the API server rejected a create because the object exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }
}
