//! Events flowing from the watch translation into the reconcile queue

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use lineq_common::crd::WaitingRoom;
use lineq_common::Error;

/// Snapshot of a WaitingRoom taken when its notification arrived
///
/// Owned by the queue item carrying it; later changes to the watched object
/// never reach an event already in flight.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    /// WaitingRoom name
    pub name: String,
    /// WaitingRoom namespace; the Ingress is created here
    pub namespace: String,
    /// Guarded request path
    pub path: String,
    /// Concurrently admitted users
    pub active_users: i32,
    /// Host the room is served on
    pub host: String,
    /// URL scheme
    pub scheme: String,
    /// Backend Service name
    pub backend_address: String,
    /// Backend Service port
    pub backend_port: i32,
    /// Session lifetime in minutes
    pub session_duration: i32,
    /// Controller reference back to the WaitingRoom
    pub owner: OwnerReference,
}

impl DesiredState {
    /// Copy a watched WaitingRoom into an owned snapshot
    ///
    /// Fails for objects that cannot be reconciled (missing metadata or an
    /// invalid spec); those are dropped, not retried.
    pub fn from_waiting_room(room: &WaitingRoom) -> Result<Self, Error> {
        let name = room.name_any();
        let namespace = room
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "waiting room has no namespace"))?;
        room.spec.validate(&name)?;
        let owner = room
            .controller_owner_ref(&())
            .ok_or_else(|| Error::validation_for(&name, "waiting room has no uid"))?;

        let spec = &room.spec;
        Ok(Self {
            name,
            namespace,
            path: spec.path.clone(),
            active_users: spec.active_users,
            host: spec.host.clone(),
            scheme: spec.scheme.clone(),
            backend_address: spec.backend_svc_addr.clone(),
            backend_port: spec.backend_svc_port,
            session_duration: spec.session_duration,
            owner,
        })
    }
}

/// Event kinds, used for logging and routing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A WaitingRoom appeared
    AddWaitingRoom,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::AddWaitingRoom => write!(f, "addWaitingRoom"),
        }
    }
}

/// Unit of work in the reconcile queue
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Create the routing resources for a new WaitingRoom
    AddWaitingRoom(DesiredState),
}

impl Event {
    /// Kind tag of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AddWaitingRoom(_) => EventKind::AddWaitingRoom,
        }
    }

    /// Name of the WaitingRoom this event is about
    pub fn room(&self) -> &str {
        match self {
            Event::AddWaitingRoom(state) => &state.name,
        }
    }
}
