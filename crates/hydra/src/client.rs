//! Head client: commands, queries and event subscription for one hydra node.
//!
//! Commands only queue a message. Their effect is observed later on the event
//! stream, since any participant of the head may drive a transition.

use crate::config::ClientConfig;
use crate::connection::{Connection, Subscription};
use crate::event::{EventKind, HydraEvent, TxValid};
use crate::http::{HttpFailure, HydraHttp};
use crate::status::{ConnectionState, HeadStatus};
use crate::types::{filter_by_address, HydraTransaction, HydraUTxOs, TxType};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::timeout;

/// Command rejected locally because of the current head status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("head is not open (status {status})")]
    HeadNotOpen { status: HeadStatus },
    #[error("{command} requires status {required}, head is {status}")]
    WrongStatus {
        command: &'static str,
        required: HeadStatus,
        status: HeadStatus,
    },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to a hydra node")]
    NotConnected,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    ProtocolViolation(#[from] ProtocolViolation),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http error: {0}")]
    Http(#[from] HttpFailure),
    #[error("submitter failed: {0}")]
    Submit(String),
    #[error("failed to encode command: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("transaction invalid: {0}")]
    TxInvalid(String),
    #[error("timed out waiting for the node")]
    Timeout,
}

/// Layer-one collaborator that signs and submits a drafted transaction.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Returns the layer-one transaction hash.
    async fn submit_tx(&self, cbor_hex: &str) -> anyhow::Result<String>;
}

fn carries(tx: &Option<HydraTransaction>, cbor: &str) -> bool {
    tx.as_ref()
        .is_some_and(|t| t.cbor_hex.eq_ignore_ascii_case(cbor))
}

/// Nodes that report only `transactionId` give nothing to match on, so the
/// first such TxValid after our NewTx is taken as ours.
fn accepts(valid: &TxValid, cbor: &str, queued: bool) -> bool {
    match valid.transaction {
        Some(_) => carries(&valid.transaction, cbor),
        None => queued && valid.transaction_id.is_some(),
    }
}

/// Client for a single hydra head.
pub struct HeadClient {
    config: ClientConfig,
    connection: Connection,
    http: HydraHttp,
}

impl HeadClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let connection = Connection::new(&config);
        let http = HydraHttp::new(&config.http_url)?;
        Ok(Self {
            config,
            connection,
            http,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    fn require(&self, command: &'static str, required: HeadStatus) -> Result<(), ClientError> {
        let status = self.connection.status();
        if status == required {
            return Ok(());
        }
        tracing::debug!(command, %status, "command rejected by head status");
        if required == HeadStatus::Open {
            return Err(ProtocolViolation::HeadNotOpen { status }.into());
        }
        Err(ProtocolViolation::WrongStatus {
            command,
            required,
            status,
        }
        .into())
    }

    fn send(&self, command: Value) -> Result<(), ClientError> {
        self.connection.send(&command)
    }

    fn transaction_value(tx: &HydraTransaction) -> Result<Value, ClientError> {
        serde_json::to_value(tx).map_err(ClientError::Serialize)
    }

    /// Ask the node to initialize a head.
    pub fn init(&self) -> Result<(), ClientError> {
        self.send(json!({ "tag": "Init" }))
    }

    /// Abort a head that is still collecting commits.
    pub fn abort(&self) -> Result<(), ClientError> {
        self.require("Abort", HeadStatus::Initializing)?;
        self.send(json!({ "tag": "Abort" }))
    }

    /// Submit a transaction into the open head.
    pub fn new_tx(&self, tx: &HydraTransaction) -> Result<(), ClientError> {
        self.require("NewTx", HeadStatus::Open)?;
        let transaction = Self::transaction_value(tx)?;
        self.send(json!({ "tag": "NewTx", "transaction": transaction }))
    }

    pub fn close(&self) -> Result<(), ClientError> {
        self.require("Close", HeadStatus::Open)?;
        self.send(json!({ "tag": "Close" }))
    }

    /// Contest a closed head with our latest snapshot.
    pub fn contest(&self) -> Result<(), ClientError> {
        self.require("Contest", HeadStatus::Closed)?;
        self.send(json!({ "tag": "Contest" }))
    }

    /// Distribute the closed head's UTxO back to layer one.
    pub fn fanout(&self) -> Result<(), ClientError> {
        self.require("Fanout", HeadStatus::FanoutPossible)?;
        self.send(json!({ "tag": "Fanout" }))
    }

    /// Request a decommit of the outputs spent by `tx`.
    pub fn decommit(&self, tx: &HydraTransaction) -> Result<(), ClientError> {
        self.require("Decommit", HeadStatus::Open)?;
        let decommit_tx = Self::transaction_value(tx)?;
        self.send(json!({ "tag": "Decommit", "decommitTx": decommit_tx }))
    }

    /// Recover a pending deposit by its layer-one transaction id.
    pub fn recover(&self, tx_id: &str) -> Result<(), ClientError> {
        if tx_id.is_empty() {
            return Err(ClientError::InvalidArgument("recover needs a deposit tx id".into()));
        }
        self.send(json!({ "tag": "Recover", "recoverTxId": tx_id }))
    }

    /// Draft a commit transaction for `utxos`. The set must not be empty; see [HeadClient::commit_empty].
    pub async fn commit(&self, utxos: &HydraUTxOs) -> Result<HydraTransaction, ClientError> {
        if utxos.is_empty() {
            return Err(ClientError::InvalidArgument(
                "commit needs at least one UTxO".into(),
            ));
        }
        Ok(self.http.build_commit(utxos).await?)
    }

    /// Draft a commit that adds nothing to the head.
    pub async fn commit_empty(&self) -> Result<HydraTransaction, ClientError> {
        Ok(self.http.build_commit(&HydraUTxOs::new()).await?)
    }

    /// Draft a commit and hand it to `submitter`; returns the layer-one tx hash.
    pub async fn commit_with(
        &self,
        utxos: &HydraUTxOs,
        submitter: &dyn Submitter,
    ) -> Result<String, ClientError> {
        let drafted = self.commit(utxos).await?;
        let hash = submitter
            .submit_tx(&drafted.cbor_hex)
            .await
            .map_err(|e| ClientError::Submit(format!("{:#}", e)))?;
        tracing::info!(tx_hash = %hash, "commit submitted");
        Ok(hash)
    }

    /// Send `cbor_hex` as NewTx and wait for the node's verdict.
    ///
    /// A TxValid or TxInvalid that carries the transaction matches on its CBOR.
    /// A TxValid with only a `transactionId` matches once the NewTx is queued.
    /// Resolves with the reported id (empty if the node reported none).
    pub async fn submit_tx(&self, cbor_hex: &str) -> Result<String, ClientError> {
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let mut verdict_tx = Some(verdict_tx);
        let queued = Arc::new(AtomicBool::new(false));
        let armed = Arc::clone(&queued);
        let cbor = cbor_hex.to_string();
        let _verdict = self.on_event(move |event| {
            let verdict = match &event.kind {
                EventKind::TxValid(v) if accepts(v, &cbor, armed.load(Ordering::Acquire)) => {
                    Ok(v.tx_id().unwrap_or_default().to_string())
                }
                EventKind::TxInvalid(i) if carries(&i.transaction, &cbor) => {
                    Err(ClientError::TxInvalid(i.validation_error.to_string()))
                }
                EventKind::Disconnected(d) => Err(ClientError::Transport(d.reason.clone())),
                _ => return,
            };
            if let Some(tx) = verdict_tx.take() {
                let _ = tx.send(verdict);
            }
        });
        queued.store(true, Ordering::Release);
        self.new_tx(&HydraTransaction::new(TxType::Tx, cbor_hex))?;
        match timeout(self.config.submit_timeout, verdict_rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Snapshot UTxO set straight from the node.
    pub async fn fetch_utxos(&self) -> Result<HydraUTxOs, ClientError> {
        Ok(self.http.snapshot_utxo().await?)
    }

    pub async fn fetch_address_utxos(&self, address: &str) -> Result<HydraUTxOs, ClientError> {
        let utxos = self.fetch_utxos().await?;
        Ok(filter_by_address(&utxos, address))
    }

    pub async fn protocol_parameters(&self) -> Result<Value, ClientError> {
        Ok(self.http.protocol_parameters().await?)
    }

    pub async fn publish_decommit(&self, tx: &HydraTransaction) -> Result<(), ClientError> {
        Ok(self.http.publish_decommit(tx).await?)
    }

    /// Last projected head status. Never touches the network.
    pub fn get_status(&self) -> HeadStatus {
        self.connection.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Last snapshot UTxO set seen on the event stream.
    pub fn snapshot_utxo(&self) -> Option<Arc<HydraUTxOs>> {
        self.connection.snapshot_utxo()
    }

    pub fn head_id(&self) -> Option<String> {
        self.connection.head_id()
    }

    pub fn status_changes(&self) -> watch::Receiver<HeadStatus> {
        self.connection.status_changes()
    }

    /// Register `callback` for every event, in arrival order.
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&HydraEvent) + Send + 'static,
    {
        self.connection.on_event(callback)
    }

    /// Channel alternative to [HeadClient::on_event]; lagging receivers lose events.
    pub fn subscribe(&self) -> broadcast::Receiver<HydraEvent> {
        self.connection.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HydraUTxO, UtxoRef};
    use httpmock::{Method::POST, MockServer};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    const HASH: &str = "f0a39560ea80ccc68e8dffb6a4a077c8927811f06c5d9058d0fa2d1a8d047d20";

    fn client() -> HeadClient {
        HeadClient::new(ClientConfig::new("http://127.0.0.1:4001")).unwrap()
    }

    fn sent(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("a queued frame") {
            Message::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    fn one_utxo() -> HydraUTxOs {
        let mut utxos = HydraUTxOs::new();
        utxos.insert(
            UtxoRef::new(HASH, 0),
            HydraUTxO {
                address: "addr_test1".into(),
                ..Default::default()
            },
        );
        utxos
    }

    #[test]
    fn new_tx_while_initializing_is_rejected_without_sending() {
        let c = client();
        let mut rx = c.connection.attach_outbox();
        c.connection.inject(r#"{"tag":"HeadIsInitializing","headId":"h"}"#);
        let err = c
            .new_tx(&HydraTransaction::new(TxType::Tx, "84a4"))
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::ProtocolViolation(ProtocolViolation::HeadNotOpen {
                status: HeadStatus::Initializing
            })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn status_checked_before_connection() {
        let c = client();
        assert!(matches!(c.close(), Err(ClientError::ProtocolViolation(_))));
        assert!(matches!(c.init(), Err(ClientError::NotConnected)));
        assert!(matches!(c.recover("abcd"), Err(ClientError::NotConnected)));
        assert!(matches!(c.recover(""), Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn commands_have_node_wire_shape() {
        let c = client();
        let mut rx = c.connection.attach_outbox();
        c.init().unwrap();
        assert_eq!(sent(&mut rx), json!({"tag": "Init"}));

        c.connection.inject(r#"{"tag":"HeadIsInitializing","headId":"h"}"#);
        c.abort().unwrap();
        assert_eq!(sent(&mut rx), json!({"tag": "Abort"}));

        c.connection.inject(r#"{"tag":"HeadIsOpen","headId":"h","utxo":{}}"#);
        let tx = HydraTransaction::new(TxType::Witnessed, "84a4").with_description("Ledger Cddl Format");
        c.new_tx(&tx).unwrap();
        assert_eq!(
            sent(&mut rx),
            json!({"tag": "NewTx", "transaction": {
                "type": "Witnessed Tx ConwayEra",
                "description": "Ledger Cddl Format",
                "cborHex": "84a4"
            }})
        );
        c.decommit(&tx).unwrap();
        assert_eq!(sent(&mut rx)["decommitTx"]["cborHex"], "84a4");
        c.close().unwrap();
        assert_eq!(sent(&mut rx), json!({"tag": "Close"}));

        c.connection.inject(r#"{"tag":"HeadIsClosed","headId":"h"}"#);
        c.contest().unwrap();
        assert_eq!(sent(&mut rx), json!({"tag": "Contest"}));

        c.connection.inject(r#"{"tag":"ReadyToFanout","headId":"h"}"#);
        c.fanout().unwrap();
        assert_eq!(sent(&mut rx), json!({"tag": "Fanout"}));

        c.recover("deadbeef").unwrap();
        assert_eq!(sent(&mut rx), json!({"tag": "Recover", "recoverTxId": "deadbeef"}));
    }

    #[test]
    fn gated_commands_report_required_status() {
        let c = client();
        let _rx = c.connection.attach_outbox();
        c.connection.inject(r#"{"tag":"HeadIsOpen"}"#);
        match c.fanout() {
            Err(ClientError::ProtocolViolation(ProtocolViolation::WrongStatus {
                command,
                required,
                status,
            })) => {
                assert_eq!(command, "Fanout");
                assert_eq!(required, HeadStatus::FanoutPossible);
                assert_eq!(status, HeadStatus::Open);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(c.abort(), Err(ClientError::ProtocolViolation(_))));
        assert!(matches!(c.contest(), Err(ClientError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn commit_rejects_empty_set() {
        let c = client();
        let err = c.commit(&HydraUTxOs::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    struct FixedSubmitter;

    #[async_trait]
    impl Submitter for FixedSubmitter {
        async fn submit_tx(&self, cbor_hex: &str) -> anyhow::Result<String> {
            assert_eq!(cbor_hex, "84a5");
            Ok("l1hash".to_string())
        }
    }

    #[tokio::test]
    async fn commit_with_hands_draft_to_submitter() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/commit");
                then.status(200).json_body(json!({
                    "type": "Tx ConwayEra",
                    "description": "",
                    "cborHex": "84a5"
                }));
            })
            .await;
        let c = HeadClient::new(ClientConfig::new(server.base_url())).unwrap();
        let hash = c.commit_with(&one_utxo(), &FixedSubmitter).await.unwrap();
        assert_eq!(hash, "l1hash");
    }

    struct RejectingSubmitter;

    #[async_trait]
    impl Submitter for RejectingSubmitter {
        async fn submit_tx(&self, _cbor_hex: &str) -> anyhow::Result<String> {
            anyhow::bail!("wallet refused to sign")
        }
    }

    #[tokio::test]
    async fn submitter_failure_is_not_a_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/commit");
                then.status(200).json_body(json!({
                    "type": "Tx ConwayEra",
                    "description": "",
                    "cborHex": "84a5"
                }));
            })
            .await;
        let c = HeadClient::new(ClientConfig::new(server.base_url())).unwrap();
        match c.commit_with(&one_utxo(), &RejectingSubmitter).await {
            Err(ClientError::Submit(reason)) => assert!(reason.contains("wallet refused")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_tx_resolves_on_tx_valid() {
        let c = client();
        let mut rx = c.connection.attach_outbox();
        c.connection.inject(r#"{"tag":"HeadIsOpen","headId":"h","utxo":{}}"#);
        let node = async {
            let frame = rx.recv().await.expect("NewTx frame");
            let Message::Text(text) = frame else {
                panic!("expected text frame");
            };
            let cmd: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(cmd["tag"], "NewTx");
            assert_eq!(cmd["transaction"]["type"], "Tx ConwayEra");
            c.connection.inject(
                r#"{"tag":"TxValid","headId":"h","transactionId":"t1","transaction":{"type":"Tx ConwayEra","description":"","cborHex":"84AB"}}"#,
            );
        };
        let (res, ()) = tokio::join!(c.submit_tx("84ab"), node);
        assert_eq!(res.unwrap(), "t1");
        assert_eq!(c.connection.subscriber_count(), 0);
    }

    #[test]
    fn id_only_tx_valid_matches_only_after_queueing() {
        let valid = TxValid {
            head_id: "h".into(),
            transaction_id: Some("t1".into()),
            transaction: None,
            seq: 1,
            timestamp: String::new(),
        };
        assert!(!accepts(&valid, "84ab", false));
        assert!(accepts(&valid, "84ab", true));

        let carrying = TxValid {
            transaction: Some(HydraTransaction::new(TxType::Tx, "84FF")),
            ..valid
        };
        assert!(accepts(&carrying, "84ff", false));
        assert!(!accepts(&carrying, "84ab", true));
    }

    #[tokio::test]
    async fn submit_tx_resolves_on_id_only_tx_valid() {
        let mut config = ClientConfig::new("http://127.0.0.1:4001");
        config.submit_timeout = Duration::from_secs(2);
        let c = HeadClient::new(config).unwrap();
        let mut rx = c.connection.attach_outbox();
        c.connection.inject(r#"{"tag":"HeadIsOpen","headId":"h","utxo":{}}"#);
        let node = async {
            rx.recv().await.expect("NewTx frame");
            c.connection.inject(
                r#"{"tag":"TxValid","headId":"h","transactionId":"other","transaction":{"type":"Tx ConwayEra","description":"","cborHex":"84ff"},"seq":5}"#,
            );
            c.connection.inject(r#"{"tag":"TxValid","headId":"h","transactionId":"t1","seq":6}"#);
        };
        let (res, ()) = tokio::join!(c.submit_tx("84ab"), node);
        assert_eq!(res.unwrap(), "t1");
    }

    #[tokio::test]
    async fn submit_tx_fails_on_tx_invalid() {
        let c = client();
        let mut rx = c.connection.attach_outbox();
        c.connection.inject(r#"{"tag":"HeadIsOpen","headId":"h","utxo":{}}"#);
        let node = async {
            rx.recv().await.expect("NewTx frame");
            c.connection.inject(
                r#"{"tag":"TxInvalid","headId":"h","transaction":{"type":"Tx ConwayEra","description":"","cborHex":"84cd"},"validationError":{"reason":"missing input"}}"#,
            );
        };
        let (res, ()) = tokio::join!(c.submit_tx("84cd"), node);
        match res {
            Err(ClientError::TxInvalid(reason)) => assert!(reason.contains("missing input")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_tx_times_out() {
        let mut config = ClientConfig::new("http://127.0.0.1:4001");
        config.submit_timeout = Duration::from_millis(50);
        let c = HeadClient::new(config).unwrap();
        let _rx = c.connection.attach_outbox();
        c.connection.inject(r#"{"tag":"HeadIsOpen"}"#);
        assert!(matches!(c.submit_tx("84ef").await, Err(ClientError::Timeout)));
    }
}
