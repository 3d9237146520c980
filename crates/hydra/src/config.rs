//! Client configuration.

use std::time::Duration;

/// Head client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL of the hydra node API (commit, decommit, snapshot/utxo, protocol-parameters).
    pub http_url: String,
    /// WebSocket URL for the event stream. Derived from `http_url` when `None`.
    pub ws_url: Option<String>,
    /// Ask the node to replay past events on connect.
    pub history: bool,
    /// Ask the node to include the snapshot UTxO set in Greetings.
    pub snapshot_utxo: bool,
    /// Only receive events touching this address.
    pub address: Option<String>,
    /// Max time for the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Max time to wait for the close handshake on disconnect.
    pub disconnect_timeout: Duration,
    /// Max time `submit_tx` waits for TxValid / TxInvalid.
    pub submit_timeout: Duration,
}

impl ClientConfig {
    pub fn new(http_url: impl Into<String>) -> Self {
        Self {
            http_url: http_url.into(),
            ws_url: None,
            history: false,
            snapshot_utxo: true,
            address: None,
            handshake_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(60),
        }
    }

    /// Full WebSocket endpoint including the node's query parameters.
    pub fn ws_endpoint(&self) -> String {
        let base = match &self.ws_url {
            Some(url) => url.clone(),
            None => self
                .http_url
                .replace("http://", "ws://")
                .replace("https://", "wss://"),
        };
        let base = base.trim_end_matches('/');
        let mut url = format!(
            "{}/?history={}&snapshot-utxo={}",
            base,
            yes_no(self.history),
            yes_no(self.snapshot_utxo),
        );
        if let Some(address) = &self.address {
            url.push_str("&address=");
            url.push_str(address);
        }
        url
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}
