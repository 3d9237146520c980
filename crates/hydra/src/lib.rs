//! Hydra head client: follows a hydra node's event stream and drives the head lifecycle.
//!
//! - **Event decoding** ([event]): tagged frames become [HydraEvent]s; unknown or
//!   malformed frames degrade to [EventKind::Unrecognized] instead of failing.
//! - **Status projection** ([status]): each event maps to at most one [HeadStatus];
//!   events that imply nothing leave the previous status in place.
//! - **Connection** ([connection]): one WebSocket per client, ordered dispatch to
//!   subscribers, terminal `Disconnected` event on transport loss, no auto-reconnect.
//! - **Client** ([client]): status-gated commands (Init, NewTx, Close, Fanout, ...),
//!   HTTP commit / snapshot queries, and `submit_tx`.
//! - **Datums** ([datum]): CBOR Plutus data to JSON, big integers kept exact.

pub mod client;
pub mod config;
pub mod connection;
pub mod datum;
pub mod event;
pub mod http;
pub mod status;
pub mod types;

pub use client::{ClientError, HeadClient, ProtocolViolation, Submitter};
pub use config::ClientConfig;
pub use connection::{Connection, Subscription};
pub use datum::{normalize, CborDatumParser, DatumError, DatumParser, JsonInteger};
pub use event::{decode, DecodeError, EventKind, HydraEvent, RemoteHeadStatus};
pub use http::{parse_http_error, HttpFailure, HydraHttp};
pub use status::{project, ConnectionState, HeadStatus};
pub use types::{Asset, HydraSnapshot, HydraTransaction, HydraUTxO, HydraUTxOs, TxType, UtxoRef};
