//! Custom Resource Definitions for lineq
//!
//! This module contains all CRD definitions used by the waiting-room operator.

mod waiting_room;

pub use waiting_room::{WaitingRoom, WaitingRoomSpec, DEFAULT_SESSION_DURATION_MINUTES};
