//! Read-only lookup of Ingresses the watch cache has already seen

use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{ObjectRef, Store};
use lineq_common::Error;
#[cfg(test)]
use mockall::automock;

/// Existence check against an eventually consistent cache
///
/// `false` means "try to create"; the API server's already-exists answer is
/// what actually prevents duplicates.
#[cfg_attr(test, automock)]
pub trait CacheLookup: Send + Sync {
    /// Whether an Ingress named `name` exists in `namespace`
    fn exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// [`CacheLookup`] over a kube-rs reflector store
#[derive(Clone)]
pub struct StoreCache {
    store: Store<Ingress>,
}

impl StoreCache {
    /// Wrap the reader half of an Ingress reflector
    pub fn new(store: Store<Ingress>) -> Self {
        Self { store }
    }
}

impl CacheLookup for StoreCache {
    fn exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let key = ObjectRef::<Ingress>::new(name).within(namespace);
        Ok(self.store.get(&key).is_some())
    }
}
