//! HTTP side of the hydra node API: commit drafting, decommit, snapshot and
//! protocol-parameter queries.

use crate::datum::normalize;
use crate::types::{HydraTransaction, HydraUTxOs};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Failed HTTP exchange with the node.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HttpFailure {
    /// The node answered with a status other than 200 / 202.
    #[error("{}", parse_http_error(self))]
    Status {
        status: u16,
        headers: BTreeMap<String, String>,
        body: Value,
    },
    /// No usable response: connect failure, timeout, undecodable body.
    #[error("{}", parse_http_error(self))]
    Request { code: String, message: String },
}

/// Uniform one-line summary of an HTTP failure.
///
/// With a response: `{"data":..,"headers":..,"status":..}`.
/// Without one: `{"code":..,"message":..}`.
pub fn parse_http_error(failure: &HttpFailure) -> String {
    let summary = match failure {
        HttpFailure::Status {
            status,
            headers,
            body,
        } => json!({ "data": body, "headers": headers, "status": status }),
        HttpFailure::Request { code, message } => json!({ "code": code, "message": message }),
    };
    summary.to_string()
}

impl From<reqwest::Error> for HttpFailure {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connect"
        } else if e.is_builder() {
            "builder"
        } else if e.is_body() || e.is_decode() {
            "body"
        } else {
            "request"
        };
        HttpFailure::Request {
            code: code.to_string(),
            message: e.to_string(),
        }
    }
}

fn is_success(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::OK || status == reqwest::StatusCode::ACCEPTED
}

/// Empty body reads as null, non-JSON as a JSON string.
fn body_value(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn typed<T: DeserializeOwned>(value: Value) -> Result<T, HttpFailure> {
    serde_json::from_value(value).map_err(|e| HttpFailure::Request {
        code: "decode".to_string(),
        message: e.to_string(),
    })
}

/// HTTP client bound to one node.
#[derive(Debug, Clone)]
pub struct HydraHttp {
    client: reqwest::Client,
    base_url: String,
}

impl HydraHttp {
    pub fn new(base_url: &str) -> Result<Self, HttpFailure> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn finish(&self, resp: reqwest::Response) -> Result<Value, HttpFailure> {
        let status = resp.status();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = body_value(&resp.text().await?);
        if is_success(status) {
            return Ok(body);
        }
        tracing::debug!(status = status.as_u16(), "hydra http request rejected");
        Err(HttpFailure::Status {
            status: status.as_u16(),
            headers,
            body,
        })
    }

    pub async fn get(&self, path: &str) -> Result<Value, HttpFailure> {
        tracing::debug!(path, "GET");
        let resp = self.client.get(self.url(path)).send().await?;
        self.finish(resp).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, HttpFailure> {
        tracing::debug!(path, "POST");
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        self.finish(resp).await
    }

    /// Current snapshot UTxO set (`GET snapshot/utxo`).
    pub async fn snapshot_utxo(&self) -> Result<HydraUTxOs, HttpFailure> {
        typed(self.get("snapshot/utxo").await?)
    }

    /// Ledger protocol parameters of the head, with large integers made JSON-safe.
    pub async fn protocol_parameters(&self) -> Result<Value, HttpFailure> {
        Ok(normalize(&self.get("protocol-parameters").await?))
    }

    /// Draft a commit transaction for `utxos` (`POST /commit`). An empty map drafts an empty commit.
    pub async fn build_commit(&self, utxos: &HydraUTxOs) -> Result<HydraTransaction, HttpFailure> {
        let body = serde_json::to_value(utxos).map_err(|e| HttpFailure::Request {
            code: "encode".to_string(),
            message: e.to_string(),
        })?;
        typed(self.post("/commit", &body).await?)
    }

    /// Hand a decommit transaction to the node (`POST /decommit`).
    pub async fn publish_decommit(&self, tx: &HydraTransaction) -> Result<(), HttpFailure> {
        let body = serde_json::to_value(tx).map_err(|e| HttpFailure::Request {
            code: "encode".to_string(),
            message: e.to_string(),
        })?;
        self.post("/decommit", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxType, UtxoRef};
    use httpmock::{Method::GET, Method::POST, MockServer};

    const HASH: &str = "f0a39560ea80ccc68e8dffb6a4a077c8927811f06c5d9058d0fa2d1a8d047d20";

    #[tokio::test]
    async fn snapshot_utxo_decodes_map() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/snapshot/utxo");
                then.status(200).body(format!(
                    r#"{{"{}#0":{{"address":"addr_test1","value":{{"lovelace":10}}}}}}"#,
                    HASH
                ));
            })
            .await;
        let http = HydraHttp::new(&server.base_url()).unwrap();
        let utxos = http.snapshot_utxo().await.unwrap();
        mock.assert_async().await;
        assert_eq!(utxos[&UtxoRef::new(HASH, 0)].address, "addr_test1");
    }

    #[tokio::test]
    async fn accepted_status_is_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/decommit");
                then.status(202);
            })
            .await;
        let http = HydraHttp::new(&format!("{}/", server.base_url())).unwrap();
        let tx = HydraTransaction::new(TxType::Witnessed, "84a4");
        http.publish_decommit(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn build_commit_posts_utxo_map() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/commit")
                    .body_contains(format!("\"{}#1\"", HASH))
                    .body_contains("addr_test1");
                then.status(200).json_body(json!({
                    "type": "Tx ConwayEra",
                    "description": "Hydra commit",
                    "cborHex": "84a5",
                    "txId": "abcd"
                }));
            })
            .await;
        let mut utxos = HydraUTxOs::new();
        let mut value = BTreeMap::new();
        value.insert("lovelace".to_string(), json!(5));
        utxos.insert(
            UtxoRef::new(HASH, 1),
            crate::types::HydraUTxO {
                address: "addr_test1".into(),
                value,
                ..Default::default()
            },
        );
        let http = HydraHttp::new(&server.base_url()).unwrap();
        let tx = http.build_commit(&utxos).await.unwrap();
        mock.assert_async().await;
        assert_eq!(tx.cbor_hex, "84a5");
        assert_eq!(tx.tx_id.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn error_status_carries_status_headers_and_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/protocol-parameters");
                then.status(400).header("x-node", "hydra").body("bad request");
            })
            .await;
        let http = HydraHttp::new(&server.base_url()).unwrap();
        let err = http.protocol_parameters().await.unwrap_err();
        match &err {
            HttpFailure::Status {
                status,
                headers,
                body,
            } => {
                assert_eq!(*status, 400);
                assert_eq!(headers.get("x-node").map(String::as_str), Some("hydra"));
                assert_eq!(body, &Value::String("bad request".into()));
            }
            other => panic!("expected status failure, got {:?}", other),
        }
        let summary: Value = serde_json::from_str(&parse_http_error(&err)).unwrap();
        assert_eq!(summary["status"], 400);
        assert_eq!(summary["data"], "bad request");
        assert_eq!(err.to_string(), parse_http_error(&err));
    }

    #[tokio::test]
    async fn unreachable_node_has_no_response() {
        let http = HydraHttp::new("http://127.0.0.1:1").unwrap();
        let err = http.get("snapshot/utxo").await.unwrap_err();
        assert!(matches!(err, HttpFailure::Request { .. }));
        let summary: Value = serde_json::from_str(&parse_http_error(&err)).unwrap();
        assert!(summary.get("message").is_some());
        assert!(summary.get("status").is_none());
        let boxed: Box<dyn std::error::Error> = Box::new(err.clone());
        assert_eq!(boxed.to_string(), parse_http_error(&err));
    }

    #[tokio::test]
    async fn protocol_parameters_are_normalized() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/protocol-parameters");
                then.status(200)
                    .body(r#"{"txFeeFixed":155381,"maxTxSize":16384,"huge":18446744073709551616}"#);
            })
            .await;
        let http = HydraHttp::new(&server.base_url()).unwrap();
        let params = http.protocol_parameters().await.unwrap();
        assert_eq!(params["txFeeFixed"], 155381);
        assert_eq!(params["huge"], "18446744073709551616");
    }
}
