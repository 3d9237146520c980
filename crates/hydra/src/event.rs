//! Hydra node events and their decoding from WebSocket text frames.
//!
//! Frames are discriminated by `tag` (or, for status-only frames, by a
//! top-level `headStatus`). Decoding never fails outward: frames with an
//! unknown tag, or whose payload does not match the expected shape, come back
//! as [EventKind::Unrecognized] carrying the raw JSON.

use crate::types::{HydraParty, HydraSnapshot, HydraTransaction, HydraUTxOs};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Tag reported for frames that carry no usable `tag`.
pub const UNRECOGNIZED_TAG: &str = "Unrecognized";
/// Tag of the status-only frame (`{"headStatus": ...}` without `tag`).
pub const HEAD_STATUS_REPORT_TAG: &str = "HeadStatusReport";
/// Tag of the client-side terminal event emitted when the transport goes away.
pub const DISCONNECTED_TAG: &str = "Disconnected";

/// Head status as spelled by the node in Greetings / status frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteHeadStatus {
    Idle,
    Initializing,
    Open,
    Closed,
    FanoutPossible,
    Final,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Me {
    #[serde(default)]
    pub vkey: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Greetings {
    #[serde(default)]
    pub me: Me,
    #[serde(default)]
    pub hydra_head_id: Option<String>,
    #[serde(default)]
    pub snapshot_utxo: Option<HydraUTxOs>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub hydra_node_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Peer {
    pub peer: String,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerHandshakeFailure {
    /// `{"tag": "IPv4", "ipv4": ..}` or `{"tag": "IPv6", "ipv6": ..}`.
    pub remote_host: Value,
    pub our_version: u64,
    pub their_versions: Vec<u64>,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeadIsInitializing {
    pub head_id: String,
    pub parties: Vec<HydraParty>,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Committed {
    pub head_id: String,
    pub party: Option<HydraParty>,
    pub parties: Vec<HydraParty>,
    pub utxo: HydraUTxOs,
    pub seq: u64,
    pub timestamp: String,
}

/// Shared shape of HeadIsOpen, HeadIsAborted, HeadIsFinalized and GetUTxOResponse.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeadUtxo {
    pub head_id: String,
    pub utxo: HydraUTxOs,
    pub seq: u64,
    pub timestamp: String,
}

/// Shared shape of HeadIsClosed and HeadIsContested.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeadClosing {
    pub head_id: String,
    pub snapshot_number: u64,
    pub contestation_deadline: String,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadyToFanout {
    pub head_id: String,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxValid {
    #[serde(default)]
    pub head_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub transaction: Option<HydraTransaction>,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub timestamp: String,
}

impl TxValid {
    /// Id of the validated transaction, from either wire shape.
    pub fn tx_id(&self) -> Option<&str> {
        self.transaction_id
            .as_deref()
            .or_else(|| self.transaction.as_ref().and_then(|t| t.tx_id.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInvalid {
    #[serde(default)]
    pub head_id: String,
    #[serde(default)]
    pub utxo: HydraUTxOs,
    #[serde(default)]
    pub transaction: Option<HydraTransaction>,
    #[serde(default)]
    pub validation_error: Value,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotConfirmed {
    pub head_id: String,
    pub snapshot: HydraSnapshot,
    pub signatures: Value,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvalidInput {
    pub reason: String,
    pub input: String,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostTxOnChainFailed {
    pub post_chain_tx: Value,
    pub post_tx_error: Value,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandFailed {
    /// The rejected client input, e.g. `{"tag": "Close"}`.
    pub client_input: Value,
    pub state: Value,
    pub seq: u64,
    pub timestamp: String,
}

impl CommandFailed {
    pub fn command_tag(&self) -> Option<&str> {
        self.client_input.get("tag").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IgnoredHeadInitializing {
    pub head_id: String,
    pub contestation_period: u64,
    pub parties: Vec<HydraParty>,
    pub participants: Vec<String>,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecommitInvalid {
    pub head_id: String,
    pub decommit_tx: Option<HydraTransaction>,
    pub decommit_invalid_reason: Value,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecommitRequested {
    pub head_id: String,
    pub decommit_tx: Option<HydraTransaction>,
    pub utxo_to_decommit: HydraUTxOs,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecommitApproved {
    pub head_id: String,
    pub decommit_tx_id: String,
    pub utxo_to_decommit: HydraUTxOs,
    pub seq: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecommitFinalized {
    pub head_id: String,
    pub decommit_tx_id: String,
    pub seq: u64,
    pub timestamp: String,
}

/// Frame the decoder could not map to a typed variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Unrecognized {
    /// The frame's `tag`, when it had one.
    pub tag: Option<String>,
    /// The parsed frame, or the raw text as a JSON string if it was not JSON.
    pub payload: Value,
    /// Why typed decoding failed; None for tags that are simply unknown.
    pub error: Option<String>,
}

/// Terminal event synthesized by the client when the transport closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub reason: String,
    /// True when the connection was lost rather than closed on request.
    pub error: bool,
}

/// A decoded head event: the tagged payload plus the frame's explicit `headStatus`.
#[derive(Debug, Clone, PartialEq)]
pub struct HydraEvent {
    pub kind: EventKind,
    /// Top-level `headStatus` of the frame, whatever its tag.
    pub head_status: Option<RemoteHeadStatus>,
}

/// Tagged payload of a [HydraEvent].
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Greetings(Greetings),
    /// Status-only frame; the status is in [HydraEvent::head_status].
    HeadStatusReport,
    PeerConnected(Peer),
    PeerDisconnected(Peer),
    PeerHandshakeFailure(PeerHandshakeFailure),
    HeadIsInitializing(HeadIsInitializing),
    Committed(Committed),
    HeadIsOpen(HeadUtxo),
    HeadIsClosed(HeadClosing),
    HeadIsContested(HeadClosing),
    ReadyToFanout(ReadyToFanout),
    HeadIsAborted(HeadUtxo),
    HeadIsFinalized(HeadUtxo),
    TxValid(TxValid),
    TxInvalid(TxInvalid),
    SnapshotConfirmed(SnapshotConfirmed),
    GetUTxOResponse(HeadUtxo),
    InvalidInput(InvalidInput),
    PostTxOnChainFailed(PostTxOnChainFailed),
    CommandFailed(CommandFailed),
    IgnoredHeadInitializing(IgnoredHeadInitializing),
    DecommitInvalid(DecommitInvalid),
    DecommitRequested(DecommitRequested),
    DecommitApproved(DecommitApproved),
    DecommitFinalized(DecommitFinalized),
    Disconnected(Disconnected),
    Unrecognized(Unrecognized),
}

impl From<EventKind> for HydraEvent {
    fn from(kind: EventKind) -> Self {
        Self {
            kind,
            head_status: None,
        }
    }
}

impl HydraEvent {
    /// Client-side terminal event.
    pub fn disconnected(reason: impl Into<String>, error: bool) -> Self {
        EventKind::Disconnected(Disconnected {
            reason: reason.into(),
            error,
        })
        .into()
    }

    /// Wire tag of the event (synthesized for client-side and untagged frames).
    pub fn tag(&self) -> &str {
        match &self.kind {
            EventKind::Greetings(_) => "Greetings",
            EventKind::HeadStatusReport => HEAD_STATUS_REPORT_TAG,
            EventKind::PeerConnected(_) => "PeerConnected",
            EventKind::PeerDisconnected(_) => "PeerDisconnected",
            EventKind::PeerHandshakeFailure(_) => "PeerHandshakeFailure",
            EventKind::HeadIsInitializing(_) => "HeadIsInitializing",
            EventKind::Committed(_) => "Committed",
            EventKind::HeadIsOpen(_) => "HeadIsOpen",
            EventKind::HeadIsClosed(_) => "HeadIsClosed",
            EventKind::HeadIsContested(_) => "HeadIsContested",
            EventKind::ReadyToFanout(_) => "ReadyToFanout",
            EventKind::HeadIsAborted(_) => "HeadIsAborted",
            EventKind::HeadIsFinalized(_) => "HeadIsFinalized",
            EventKind::TxValid(_) => "TxValid",
            EventKind::TxInvalid(_) => "TxInvalid",
            EventKind::SnapshotConfirmed(_) => "SnapshotConfirmed",
            EventKind::GetUTxOResponse(_) => "GetUTxOResponse",
            EventKind::InvalidInput(_) => "InvalidInput",
            EventKind::PostTxOnChainFailed(_) => "PostTxOnChainFailed",
            EventKind::CommandFailed(_) => "CommandFailed",
            EventKind::IgnoredHeadInitializing(_) => "IgnoredHeadInitializing",
            EventKind::DecommitInvalid(_) => "DecommitInvalid",
            EventKind::DecommitRequested(_) => "DecommitRequested",
            EventKind::DecommitApproved(_) => "DecommitApproved",
            EventKind::DecommitFinalized(_) => "DecommitFinalized",
            EventKind::Disconnected(_) => DISCONNECTED_TAG,
            EventKind::Unrecognized(u) => u.tag.as_deref().unwrap_or(UNRECOGNIZED_TAG),
        }
    }

    /// Full snapshot UTxO set carried by the event, if it carries one.
    pub fn snapshot_utxo(&self) -> Option<&HydraUTxOs> {
        match &self.kind {
            EventKind::Greetings(g) => g.snapshot_utxo.as_ref(),
            EventKind::HeadIsOpen(e) | EventKind::GetUTxOResponse(e) => Some(&e.utxo),
            EventKind::SnapshotConfirmed(e) => Some(&e.snapshot.utxo),
            _ => None,
        }
    }

    /// Head id carried by the event, if any.
    pub fn head_id(&self) -> Option<&str> {
        let id = match &self.kind {
            EventKind::Greetings(g) => g.hydra_head_id.as_deref(),
            EventKind::HeadIsInitializing(e) => Some(e.head_id.as_str()),
            EventKind::HeadIsOpen(e) | EventKind::HeadIsAborted(e) | EventKind::HeadIsFinalized(e) => {
                Some(e.head_id.as_str())
            }
            EventKind::HeadIsClosed(e) | EventKind::HeadIsContested(e) => Some(e.head_id.as_str()),
            EventKind::ReadyToFanout(e) => Some(e.head_id.as_str()),
            _ => None,
        };
        id.filter(|s| !s.is_empty())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Disconnected(_))
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has neither tag nor headStatus")]
    Untagged,
    #[error("unknown tag {0}")]
    UnknownTag(String),
    #[error("bad {tag} payload: {source}")]
    Payload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a text frame. Never fails: undecodable frames become [EventKind::Unrecognized].
pub fn decode(raw: &str) -> HydraEvent {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(reason = %e, "undecodable hydra frame");
            return EventKind::Unrecognized(Unrecognized {
                tag: None,
                payload: Value::String(raw.to_string()),
                error: Some(DecodeError::Json(e).to_string()),
            })
            .into();
        }
    };
    decode_value(value)
}

/// Decode an already-parsed frame. Never fails.
pub fn decode_value(value: Value) -> HydraEvent {
    let head_status = explicit_head_status(&value);
    let kind = match try_decode_kind(&value) {
        Ok(kind) => kind,
        Err(e) => {
            let tag = value.get("tag").and_then(Value::as_str).map(str::to_string);
            let error = match e {
                DecodeError::UnknownTag(ref t) => {
                    tracing::debug!(tag = %t, "unrecognized hydra event");
                    None
                }
                other => {
                    tracing::warn!(reason = %other, "hydra frame did not match its tag");
                    Some(other.to_string())
                }
            };
            EventKind::Unrecognized(Unrecognized {
                tag,
                payload: value,
                error,
            })
        }
    };
    HydraEvent { kind, head_status }
}

/// Strict decoding: reports why a frame could not be typed.
pub fn try_decode_value(value: &Value) -> Result<HydraEvent, DecodeError> {
    Ok(HydraEvent {
        kind: try_decode_kind(value)?,
        head_status: explicit_head_status(value),
    })
}

fn explicit_head_status(value: &Value) -> Option<RemoteHeadStatus> {
    value
        .get("headStatus")
        .and_then(|v| RemoteHeadStatus::deserialize(v).ok())
}

fn try_decode_kind(value: &Value) -> Result<EventKind, DecodeError> {
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let tag = match value.get("tag").and_then(Value::as_str) {
        Some(t) => t,
        None if explicit_head_status(value).is_some() => return Ok(EventKind::HeadStatusReport),
        None => return Err(DecodeError::Untagged),
    };
    let kind = match tag {
        "Greetings" => EventKind::Greetings(payload(tag, value)?),
        "PeerConnected" => EventKind::PeerConnected(payload(tag, value)?),
        "PeerDisconnected" => EventKind::PeerDisconnected(payload(tag, value)?),
        "PeerHandshakeFailure" => EventKind::PeerHandshakeFailure(payload(tag, value)?),
        "HeadIsInitializing" => EventKind::HeadIsInitializing(payload(tag, value)?),
        "Committed" => EventKind::Committed(payload(tag, value)?),
        "HeadIsOpen" => EventKind::HeadIsOpen(payload(tag, value)?),
        "HeadIsClosed" => EventKind::HeadIsClosed(payload(tag, value)?),
        "HeadIsContested" => EventKind::HeadIsContested(payload(tag, value)?),
        "ReadyToFanout" => EventKind::ReadyToFanout(payload(tag, value)?),
        "HeadIsAborted" => EventKind::HeadIsAborted(payload(tag, value)?),
        "HeadIsFinalized" => EventKind::HeadIsFinalized(payload(tag, value)?),
        "TxValid" => EventKind::TxValid(payload(tag, value)?),
        "TxInvalid" => EventKind::TxInvalid(payload(tag, value)?),
        "SnapshotConfirmed" => EventKind::SnapshotConfirmed(payload(tag, value)?),
        "GetUTxOResponse" => EventKind::GetUTxOResponse(payload(tag, value)?),
        "InvalidInput" => EventKind::InvalidInput(payload(tag, value)?),
        "PostTxOnChainFailed" => EventKind::PostTxOnChainFailed(payload(tag, value)?),
        "CommandFailed" => EventKind::CommandFailed(payload(tag, value)?),
        "IgnoredHeadInitializing" => EventKind::IgnoredHeadInitializing(payload(tag, value)?),
        "DecommitInvalid" => EventKind::DecommitInvalid(payload(tag, value)?),
        "DecommitRequested" => EventKind::DecommitRequested(payload(tag, value)?),
        "DecommitApproved" => EventKind::DecommitApproved(payload(tag, value)?),
        "DecommitFinalized" => EventKind::DecommitFinalized(payload(tag, value)?),
        other => return Err(DecodeError::UnknownTag(other.to_string())),
    };
    Ok(kind)
}

fn payload<T: DeserializeOwned>(tag: &str, value: &Value) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|source| DecodeError::Payload {
        tag: tag.to_string(),
        source,
    })
}
