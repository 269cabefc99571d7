//! Shared HAProxy configuration
//!
//! The HAProxy ingress controller reads two ConfigMaps that the operator
//! owns the contents of:
//!
//! - the controller ConfigMap, whose `frontend-config-snippet` tracks every
//!   request against the room and user stick tables and routes queued users
//!   to the lineq backend;
//! - the auxiliary ConfigMap, declaring the lineq peers, the shared stick
//!   tables, and one `backend <key>` stick table per waiting room.
//!
//! Both are written once per cluster (guarded by an `initialized`
//! annotation). Per-room partitions are appended afterwards, at most once per
//! key. All writes are read-modify-replace with the resourceVersion that was
//! read, so concurrent writers conflict instead of overwriting each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use lineq_common::Error;
use minijinja::{context, Environment, UndefinedBehavior};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::{debug, info};

use crate::controller::ResourceKey;

/// Namespace of the HAProxy ingress controller
pub const DEFAULT_HAPROXY_NAMESPACE: &str = "haproxy-controller";

/// Annotation marking a ConfigMap whose snippet has been written
pub const INITIALIZED_ANNOTATION: &str = "initialized";

const FRONTEND_TEMPLATE: &str = r#"

  http-request set-var(txn.vwr_path) var(txn.host),concat('.vwr',txn.path),map(/etc/haproxy/maps/path-exact.map)
  http-request set-var(txn.has_cookie) req.cook_cnt(sessionid) if { var(txn.vwr_path) -m found }
  http-request set-var(txn.t2) uuid()  if { var(txn.vwr_path) -m found } !{ var(txn.has_cookie) -m int gt 0 }
  http-request set-var(txn.sessionid) req.cook(sessionid) if { var(txn.vwr_path) -m found }
  http-request set-var(txn.index) var(txn.host),regsub(\.,_,g),concat(,txn.path,),regsub(\/,_,g) if { var(txn.vwr_path) -m found }
  http-request track-sc0 var(txn.index) table {{ room_table }} if { var(txn.vwr_path) -m found }
  http-response add-header Set-Cookie "sessionid=%[var(txn.t2)]; path=%[var(txn.path)]" if { var(txn.vwr_path) -m found } !{ var(txn.has_cookie) -m int gt 0 }
  http-request track-sc1 var(txn.sessionid),concat('@',txn.index) table {{ user_table }} if { var(txn.vwr_path) -m found } { var(txn.has_cookie) -m int gt 0 }
  http-request track-sc1 var(txn.t2),concat('@',txn.index) table {{ user_table }} if { var(txn.vwr_path) -m found } !{ var(txn.has_cookie) -m int gt 0 }
  http-request sc-inc-gpc1(1) if { var(txn.vwr_path) -m found } { sc_get_gpc0(0) gt 0 } !{ sc_get_gpc1(1) eq 1 }
  use_backend %[var(txn.path_match),field(1,.)] if !{ var(txn.vwr_path) -m found } !{ path_sub /lineq }
  use_backend %[var(txn.vwr_path),field(1,.)] if { sc_get_gpc1(1) eq 1 } || { sc_get_gpc0(0) gt 0 }
  use_backend lineq

"#;

const AUXILIARY_TEMPLATE: &str = r#"

peers lineq
  server local
  server lineq {{ lineq_tcp_addr }}:{{ lineq_tcp_port }}
backend {{ room_table }}
  stick-table type string size 10 expire 1d store gpc0 peers lineq
backend {{ user_table }}
  stick-table type string len 72 size 100k expire {{ session_duration }}m store gpc1 peers lineq
backend lineq
  mode http
  server lineq {{ lineq_http_addr }}:{{ lineq_http_port }}

"#;

const PARTITION_TEMPLATE: &str = r#"

backend {{ key }}
  stick-table type string len 36 size 100k expire {{ session_duration }}m store gpc1 peers lineq

"#;

/// Values the snippets are rendered from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SnippetParams {
    /// Stick table counting admitted users per room
    pub room_table: String,
    /// Stick table tracking individual sessions
    pub user_table: String,
    /// Session lifetime in minutes
    pub session_duration: i32,
    /// lineq peer address
    pub lineq_tcp_addr: String,
    /// lineq peer port
    pub lineq_tcp_port: u16,
    /// lineq HTTP address
    pub lineq_http_addr: String,
    /// lineq HTTP port
    pub lineq_http_port: u16,
}

/// Renders HAProxy configuration snippets
pub struct SnippetRenderer {
    env: Environment<'static>,
}

impl SnippetRenderer {
    /// Create a renderer with all snippet templates loaded
    pub fn new() -> Result<Self, Error> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for (name, source) in [
            ("frontend.cfg", FRONTEND_TEMPLATE),
            ("auxiliary.cfg", AUXILIARY_TEMPLATE),
            ("partition.cfg", PARTITION_TEMPLATE),
        ] {
            env.add_template(name, source)
                .map_err(|e| Error::serialization_for_kind("haproxy", e.to_string()))?;
        }
        Ok(Self { env })
    }

    fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String, Error> {
        self.env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .map_err(|e| Error::serialization_for_kind("haproxy", format!("{name}: {e}")))
    }

    /// Frontend snippet for the ingress controller ConfigMap
    pub fn frontend(&self, params: &SnippetParams) -> Result<String, Error> {
        self.render("frontend.cfg", params)
    }

    /// Peers and shared stick tables for the auxiliary ConfigMap
    pub fn auxiliary(&self, params: &SnippetParams) -> Result<String, Error> {
        self.render("auxiliary.cfg", params)
    }

    /// Per-room stick table appended to the auxiliary ConfigMap
    ///
    /// The key becomes a `backend` name, so anything but a non-empty run of
    /// `[A-Za-z0-9_.-]` is refused instead of rendered.
    pub fn partition(&self, key: &ResourceKey, session_duration: i32) -> Result<String, Error> {
        if !is_backend_name(key.as_str()) {
            return Err(Error::validation_for(
                "haproxy",
                format!("{:?} is not a valid HAProxy backend name", key.as_str()),
            ));
        }
        self.render(
            "partition.cfg",
            context! { key => key.as_str(), session_duration => session_duration },
        )
    }
}

/// A ConfigMap and the data key the operator writes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigTarget {
    /// ConfigMap name
    pub name: String,
    /// Key inside `data`
    pub data_key: String,
}

/// Where the shared configuration lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedConfigLayout {
    /// ConfigMap carrying `frontend-config-snippet`
    pub frontend: ConfigTarget,
    /// ConfigMap carrying `haproxy-auxiliary.cfg`
    pub auxiliary: ConfigTarget,
}

impl Default for SharedConfigLayout {
    fn default() -> Self {
        Self {
            frontend: ConfigTarget {
                name: "haproxy-kubernetes-ingress".to_string(),
                data_key: "frontend-config-snippet".to_string(),
            },
            auxiliary: ConfigTarget {
                name: "haproxy-auxiliary-configmap".to_string(),
                data_key: "haproxy-auxiliary.cfg".to_string(),
            },
        }
    }
}

/// ConfigMap access used for the shared configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a ConfigMap; `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Error>;

    /// Replace a ConfigMap, failing with a conflict if it changed since read
    async fn replace(&self, config_map: &ConfigMap) -> Result<(), Error>;
}

/// [`ConfigStore`] backed by the Kubernetes API
pub struct KubeConfigStore {
    api: Api<ConfigMap>,
}

impl KubeConfigStore {
    /// Store over ConfigMaps in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn replace(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let name = config_map
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::config_store("<unnamed>", "ConfigMap has no name"))?;
        self.api
            .replace(name, &PostParams::default(), config_map)
            .await?;
        Ok(())
    }
}

/// Shared configuration writer used by the setup and the reconciler
pub struct SharedConfig {
    store: Arc<dyn ConfigStore>,
    layout: SharedConfigLayout,
    renderer: SnippetRenderer,
}

impl SharedConfig {
    /// Create a writer over `store`
    pub fn new(store: Arc<dyn ConfigStore>, layout: SharedConfigLayout) -> Result<Self, Error> {
        Ok(Self {
            store,
            layout,
            renderer: SnippetRenderer::new()?,
        })
    }

    /// Write both snippets unless already initialized
    ///
    /// Returns how many ConfigMaps were written by this call.
    pub async fn initialize(&self, params: &SnippetParams) -> Result<usize, Error> {
        let mut written = 0;
        let auxiliary = self.renderer.auxiliary(params)?;
        if self.initialize_target(&self.layout.auxiliary, auxiliary).await? {
            written += 1;
        }
        let frontend = self.renderer.frontend(params)?;
        if self.initialize_target(&self.layout.frontend, frontend).await? {
            written += 1;
        }
        Ok(written)
    }

    async fn initialize_target(
        &self,
        target: &ConfigTarget,
        content: String,
    ) -> Result<bool, Error> {
        let mut config_map = self.load(target).await?;

        let annotations = config_map.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if annotations.contains_key(INITIALIZED_ANNOTATION) {
            debug!(config_map = %target.name, "Shared config already initialized");
            return Ok(false);
        }
        annotations.insert(INITIALIZED_ANNOTATION.to_string(), "true".to_string());
        config_map
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(target.data_key.clone(), content);

        self.store.replace(&config_map).await?;
        info!(config_map = %target.name, key = %target.data_key, "Initialized shared config");
        Ok(true)
    }

    /// Append the stick table for `key` unless it is already declared
    ///
    /// Returns whether the ConfigMap was modified.
    pub async fn append_partition(
        &self,
        key: &ResourceKey,
        session_duration: i32,
    ) -> Result<bool, Error> {
        let target = &self.layout.auxiliary;
        let mut config_map = self.load(target).await?;

        let data = config_map.data.get_or_insert_with(BTreeMap::new);
        let current = data.entry(target.data_key.clone()).or_default();
        if declares_backend(current, key) {
            debug!(key = %key, "Partition already declared");
            return Ok(false);
        }
        current.push_str(&self.renderer.partition(key, session_duration)?);

        self.store.replace(&config_map).await?;
        info!(key = %key, config_map = %target.name, "Appended partition");
        Ok(true)
    }

    async fn load(&self, target: &ConfigTarget) -> Result<ConfigMap, Error> {
        self.store
            .get(&target.name)
            .await?
            .ok_or_else(|| Error::config_store(&target.name, "ConfigMap not found"))
    }
}

fn is_backend_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Whether `config` already has a `backend <key>` section
fn declares_backend(config: &str, key: &ResourceKey) -> bool {
    config.lines().any(|line| {
        line.trim()
            .strip_prefix("backend ")
            .is_some_and(|name| name.trim() == key.as_str())
    })
}
