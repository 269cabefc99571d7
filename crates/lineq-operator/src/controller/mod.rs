//! WaitingRoom controller
//!
//! Watch notifications are translated into [`Event`]s, queued in a
//! [`RetryQueue`], and drained by a pool of [`Worker`]s that hand each event
//! to the [`Reconciler`]. A [`Pipeline`] owns one run of all of this.

pub mod cache;
pub mod event;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod resource;
pub mod watch;
pub mod worker;

pub use cache::{CacheLookup, StoreCache};
pub use event::{DesiredState, Event, EventKind};
pub use pipeline::{Pipeline, PipelineState, DEFAULT_WORKERS};
pub use queue::{QueueItem, Retry, RetryQueue, MAX_RETRIES};
pub use reconciler::{CreateOutcome, IngressApi, KubeIngressApi, Reconciler};
pub use resource::{build_ingress, ResourceKey};
pub use watch::{KubeWatchSource, WatchSource};
pub use worker::Worker;
