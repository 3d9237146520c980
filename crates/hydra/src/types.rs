//! Head data types: transactions, UTxO references and the snapshot UTxO set.
//!
//! Shapes follow the hydra node JSON API. Quantities and datums stay as
//! [serde_json::Value] so large integers survive decoding unchanged.

use crate::datum::{normalize, DatumError, DatumParser};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Snapshot UTxO set keyed by `txHash#index`. Replaced wholesale on every snapshot.
pub type HydraUTxOs = BTreeMap<UtxoRef, HydraUTxO>;

/// Transaction era / witness tag as understood by the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TxType {
    Tx,
    Unwitnessed,
    Witnessed,
    /// Any other text-envelope type reported by the node.
    Other(String),
}

impl TxType {
    pub fn as_str(&self) -> &str {
        match self {
            TxType::Tx => "Tx ConwayEra",
            TxType::Unwitnessed => "Unwitnessed Tx ConwayEra",
            TxType::Witnessed => "Witnessed Tx ConwayEra",
            TxType::Other(s) => s,
        }
    }
}

impl From<String> for TxType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Tx ConwayEra" => TxType::Tx,
            "Unwitnessed Tx ConwayEra" => TxType::Unwitnessed,
            "Witnessed Tx ConwayEra" => TxType::Witnessed,
            _ => TxType::Other(s),
        }
    }
}

impl From<TxType> for String {
    fn from(t: TxType) -> Self {
        match t {
            TxType::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

/// CBOR-encoded transaction in the node's text-envelope shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydraTransaction {
    #[serde(rename = "type")]
    pub tx_type: TxType,
    #[serde(default)]
    pub description: String,
    pub cbor_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

impl HydraTransaction {
    pub fn new(tx_type: TxType, cbor_hex: impl Into<String>) -> Self {
        Self {
            tx_type,
            description: String::new(),
            cbor_hex: cbor_hex.into(),
            tx_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UtxoRefError {
    #[error("missing '#' separator in utxo reference '{0}'")]
    MissingSeparator(String),
    #[error("invalid tx hash in utxo reference '{0}'")]
    InvalidTxHash(String),
    #[error("invalid output index in utxo reference '{0}'")]
    InvalidIndex(String),
}

/// UTxO reference: transaction id plus output index, serialized as `txHash#index`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UtxoRef {
    pub tx_hash: String,
    pub output_index: u32,
}

impl UtxoRef {
    pub fn new(tx_hash: impl Into<String>, output_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            output_index,
        }
    }
}

impl fmt::Display for UtxoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.output_index)
    }
}

impl FromStr for UtxoRef {
    type Err = UtxoRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, index) = s
            .split_once('#')
            .ok_or_else(|| UtxoRefError::MissingSeparator(s.to_string()))?;
        if hash.is_empty() || hex::decode(hash).is_err() {
            return Err(UtxoRefError::InvalidTxHash(s.to_string()));
        }
        let output_index = index
            .parse()
            .map_err(|_| UtxoRefError::InvalidIndex(s.to_string()))?;
        Ok(Self {
            tx_hash: hash.to_string(),
            output_index,
        })
    }
}

impl TryFrom<String> for UtxoRef {
    type Error = UtxoRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<UtxoRef> for String {
    fn from(r: UtxoRef) -> Self {
        r.to_string()
    }
}

/// One output of the head's UTxO set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydraUTxO {
    pub address: String,
    /// `{"lovelace": n, "<policy id>": {"<asset name>": n}}`.
    #[serde(default)]
    pub value: BTreeMap<String, Value>,
    #[serde(default)]
    pub datum: Option<Value>,
    #[serde(default)]
    pub datumhash: Option<String>,
    #[serde(default)]
    pub inline_datum: Option<Value>,
    #[serde(default)]
    pub inline_datum_raw: Option<String>,
    #[serde(default)]
    pub inline_datumhash: Option<String>,
    #[serde(default)]
    pub reference_script: Option<Value>,
}

/// Flattened asset amount; `unit` is policy id + asset name (hex), or `lovelace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub unit: String,
    /// Exact decimal quantity.
    pub quantity: String,
}

impl HydraUTxO {
    /// Flatten the nested value map into `(unit, quantity)` pairs.
    pub fn assets(&self) -> Vec<Asset> {
        let mut out = Vec::new();
        for (policy, amount) in &self.value {
            match amount {
                Value::Object(names) => {
                    for (name, quantity) in names {
                        if let Some(quantity) = quantity_string(quantity) {
                            out.push(Asset {
                                unit: format!("{}{}", policy, name),
                                quantity,
                            });
                        }
                    }
                }
                other => {
                    if let Some(quantity) = quantity_string(other) {
                        out.push(Asset {
                            unit: policy.clone(),
                            quantity,
                        });
                    }
                }
            }
        }
        out
    }

    /// Inline datum as JSON-safe Plutus data. Prefers the raw CBOR when present.
    pub fn inline_datum_json(&self, parser: &dyn DatumParser) -> Result<Option<Value>, DatumError> {
        if let Some(raw) = &self.inline_datum_raw {
            return Ok(Some(normalize(&parser.parse_datum_cbor(raw)?)));
        }
        Ok(self.inline_datum.as_ref().map(normalize))
    }
}

fn quantity_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// UTxOs of `utxos` locked at `address`.
pub fn filter_by_address(utxos: &HydraUTxOs, address: &str) -> HydraUTxOs {
    utxos
        .iter()
        .filter(|(_, o)| o.address == address)
        .map(|(r, o)| (r.clone(), o.clone()))
        .collect()
}

/// Head participant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HydraParty {
    pub vkey: String,
}

/// Signed, agreed-upon UTxO state of an open head.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HydraSnapshot {
    pub head_id: String,
    pub version: u64,
    pub number: u64,
    /// Confirmed transactions (ids or full transactions, depending on node version).
    pub confirmed: Vec<Value>,
    pub utxo: HydraUTxOs,
    pub utxo_to_commit: Option<HydraUTxOs>,
    pub utxo_to_decommit: Option<HydraUTxOs>,
}
