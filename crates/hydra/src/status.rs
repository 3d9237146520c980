//! Head status and its projection from events.

use crate::event::{HydraEvent, RemoteHeadStatus};
use std::fmt;

/// Local view of the head lifecycle.
///
/// Canonical order is IDLE → INITIALIZING → OPEN → CLOSED → FANOUT_POSSIBLE → FINAL;
/// the connection values are only held until the first lifecycle status is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadStatus {
    Idle,
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Open,
    Closed,
    FanoutPossible,
    Final,
}

impl HeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadStatus::Idle => "IDLE",
            HeadStatus::Disconnected => "DISCONNECTED",
            HeadStatus::Connecting => "CONNECTING",
            HeadStatus::Connected => "CONNECTED",
            HeadStatus::Initializing => "INITIALIZING",
            HeadStatus::Open => "OPEN",
            HeadStatus::Closed => "CLOSED",
            HeadStatus::FanoutPossible => "FANOUT_POSSIBLE",
            HeadStatus::Final => "FINAL",
        }
    }

    /// True for the values that only mirror the transport (no head information yet).
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            HeadStatus::Disconnected | HeadStatus::Connecting | HeadStatus::Connected
        )
    }
}

impl fmt::Display for HeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport state of a connection, orthogonal to [HeadStatus].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl From<ConnectionState> for HeadStatus {
    fn from(s: ConnectionState) -> Self {
        match s {
            ConnectionState::Disconnected => HeadStatus::Disconnected,
            ConnectionState::Connecting => HeadStatus::Connecting,
            ConnectionState::Connected => HeadStatus::Connected,
        }
    }
}

/// Head status implied by `event`, or None when the event implies no change.
///
/// An explicit `headStatus` of `Open` wins over the tag. Other explicit values
/// are not consulted; only the lifecycle tags below map to a status.
pub fn project(event: &HydraEvent) -> Option<HeadStatus> {
    if event.head_status == Some(RemoteHeadStatus::Open) {
        return Some(HeadStatus::Open);
    }
    match event.tag() {
        "HeadIsInitializing" => Some(HeadStatus::Initializing),
        "HeadIsOpen" => Some(HeadStatus::Open),
        "HeadIsClosed" => Some(HeadStatus::Closed),
        "ReadyToFanout" => Some(HeadStatus::FanoutPossible),
        "HeadIsFinalized" => Some(HeadStatus::Final),
        _ => None,
    }
}
