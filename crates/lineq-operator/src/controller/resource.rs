//! Downstream resource naming and construction

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::ObjectMeta;
use lineq_common::{MANAGED_BY_LABEL_KEY, OPERATOR_NAME};
use sha2::{Digest, Sha256};

use super::event::DesiredState;

/// Ingress class served by the HAProxy ingress controller
pub const INGRESS_CLASS: &str = "haproxy";

/// Path matching left to the ingress controller
pub const PATH_TYPE: &str = "ImplementationSpecific";

/// Label carrying the partition key on created Ingresses
pub const ROOM_KEY_LABEL: &str = "lineq.io/room-key";

/// Hex digits of the key digest appended to Ingress names
const NAME_DIGEST_LEN: usize = 10;

/// Maximum length of a Kubernetes object name
const MAX_OBJECT_NAME_LEN: usize = 253;

/// Key identifying one waiting room downstream
///
/// `derive` replaces `.` in the host and `/` in the path with `_`, which is
/// the same index the HAProxy frontend computes for each request, so the key
/// names the room's stick table as well as its Ingress.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Derive the key for a host/path pair
    pub fn derive(host: &str, path: &str) -> Self {
        let mut key = String::with_capacity(host.len() + path.len());
        key.extend(host.chars().map(|c| if c == '.' { '_' } else { c }));
        key.extend(path.chars().map(|c| if c == '/' { '_' } else { c }));
        Self(key)
    }

    /// The key as used in HAProxy configuration and backend calls
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ingress name for this key
    ///
    /// The DNS-1123 form of the key loses case and the difference between
    /// `_` and `-`, so a digest of the raw key is appended to keep distinct
    /// keys on distinct names.
    pub fn object_name(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.0.as_bytes()));
        let suffix = &digest[..NAME_DIGEST_LEN];

        let sanitized: String = self
            .0
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '-' | '.' => c,
                'A'..='Z' => c.to_ascii_lowercase(),
                _ => '-',
            })
            .collect();
        let trimmed = sanitized.trim_matches(|c| c == '-' || c == '.');
        let mut prefix: String = trimmed
            .chars()
            .take(MAX_OBJECT_NAME_LEN - NAME_DIGEST_LEN - 1)
            .collect();
        while prefix.ends_with('-') || prefix.ends_with('.') {
            prefix.pop();
        }
        if prefix.is_empty() {
            suffix.to_string()
        } else {
            format!("{prefix}-{suffix}")
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the Ingress that routes a waiting room's host/path to its backend
pub fn build_ingress(state: &DesiredState, key: &ResourceKey) -> Ingress {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL_KEY.to_string(), OPERATOR_NAME.to_string()),
        (ROOM_KEY_LABEL.to_string(), label_value(key.as_str())),
    ]);

    Ingress {
        metadata: ObjectMeta {
            name: Some(key.object_name()),
            namespace: Some(state.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![state.owner.clone()]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            rules: Some(vec![IngressRule {
                host: Some(state.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(state.path.clone()),
                        path_type: PATH_TYPE.to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: state.backend_address.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(state.backend_port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Label values are limited to 63 alphanumeric/`-_.` characters
fn label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
