//! Entry indexer client.
//!
//! Endpoints:
//! - GET /api/v1/viewing/memos/list
//! - GET /api/v1/viewing/nullifier/list_by_block
//!
//! Every response arrives in the `{code, message?, data: {data, total,
//! ready?}}` envelope; a non-zero `code` is a SYNC error carrying the
//! server's message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use veil_types::{Error, ErrorDetail, Hex, Result};

use crate::ChainConfig;

/// One memo row as the indexer serves it. `cid` can be null (row not yet
/// assigned a dense index) and is validated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMemo {
    pub commitment: Hex,
    pub memo: Hex,
    pub cid: Option<i64>,
    #[serde(default)]
    pub tx_hash: Option<Hex>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// One nullifier row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryNullifier {
    pub nullifier: Hex,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MemoPage {
    pub items: Vec<EntryMemo>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct NullifierPage {
    pub items: Vec<EntryNullifier>,
    pub total: u64,
    pub ready: bool,
}

/// The indexer capability the engine drives. The HTTP client below is the
/// production implementation; tests script their own. `address` is the
/// wallet's viewing address.
#[async_trait]
pub trait EntrySource: Send + Sync {
    async fn list_memos(
        &self,
        chain: &ChainConfig,
        address: &str,
        offset: u64,
        limit: u64,
    ) -> Result<MemoPage>;
    async fn list_nullifiers(
        &self,
        chain: &ChainConfig,
        address: &str,
        offset: u64,
        limit: u64,
    ) -> Result<NullifierPage>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: Option<i64>,
    message: Option<String>,
    data: EnvelopeData<T>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData<T> {
    data: Vec<T>,
    total: u64,
    #[serde(default)]
    ready: Option<bool>,
}

/// HTTP entry client.
pub struct EntryClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl EntryClient {
    pub fn new(timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            timeout,
        }
    }

    fn base_url<'a>(&self, chain: &'a ChainConfig) -> Result<&'a str> {
        let entry_url = chain
            .entry_url
            .as_deref()
            .ok_or_else(|| Error::config(format!("chain {} has no entry url", chain.chain_id)))?;
        Ok(entry_url.trim_end_matches('/'))
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Envelope<T>> {
        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                Error::sync(format!("entry request failed: {}", e))
                    .with_detail(ErrorDetail::http(e.status().map(|s| s.as_u16()), url, None))
                    .with_source(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(
                Error::sync(format!("entry service returned status {}", status)).with_detail(
                    ErrorDetail::http(Some(status.as_u16()), url, Some(&body)),
                ),
            );
        }

        let envelope: Envelope<T> = resp.json().await.map_err(|e| {
            Error::sync(format!("bad entry response: {}", e))
                .with_detail(ErrorDetail::http(Some(status.as_u16()), url, None))
                .with_source(e)
        })?;

        if envelope.code.unwrap_or(0) != 0 {
            let message = envelope
                .message
                .clone()
                .unwrap_or_else(|| "entry service error".to_string());
            return Err(Error::sync(message)
                .with_detail(ErrorDetail::http(Some(status.as_u16()), url, None)));
        }

        Ok(envelope)
    }
}

#[async_trait]
impl EntrySource for EntryClient {
    async fn list_memos(
        &self,
        chain: &ChainConfig,
        address: &str,
        offset: u64,
        limit: u64,
    ) -> Result<MemoPage> {
        let base = self.base_url(chain)?;
        let url = format!(
            "{}/api/v1/viewing/memos/list?chain_id={}&address={}&offset={}&limit={}&order=asc",
            base, chain.chain_id, address, offset, limit
        );
        let envelope: Envelope<EntryMemo> = self.fetch(&url).await?;
        Ok(MemoPage {
            items: envelope.data.data,
            total: envelope.data.total,
        })
    }

    async fn list_nullifiers(
        &self,
        chain: &ChainConfig,
        address: &str,
        offset: u64,
        limit: u64,
    ) -> Result<NullifierPage> {
        let base = self.base_url(chain)?;
        let url = format!(
            "{}/api/v1/viewing/nullifier/list_by_block?chain_id={}&address={}&offset={}&limit={}&order=asc",
            base, chain.chain_id, address, offset, limit
        );
        let envelope: Envelope<EntryNullifier> = self.fetch(&url).await?;
        Ok(NullifierPage {
            items: envelope.data.data,
            total: envelope.data.total,
            ready: envelope.data.ready.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_with_and_without_ready() {
        let body = serde_json::json!({
            "code": 0,
            "data": {
                "data": [
                    { "commitment": "0x01", "memo": "0xaa", "cid": 5 },
                    { "commitment": "0x02", "memo": "0xbb", "cid": null, "created_at": 1700000000 }
                ],
                "total": 2
            }
        });
        let envelope: Envelope<EntryMemo> = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.data.data.len(), 2);
        assert_eq!(envelope.data.data[0].cid, Some(5));
        assert_eq!(envelope.data.data[1].cid, None);
        assert!(envelope.data.ready.is_none());

        let body = serde_json::json!({
            "code": 0,
            "data": {
                "data": [ { "nullifier": "0x0f" } ],
                "total": 10,
                "ready": false
            }
        });
        let envelope: Envelope<EntryNullifier> = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.data.ready, Some(false));
    }

    #[test]
    fn nonzero_code_message_is_preserved() {
        let body = serde_json::json!({
            "code": 1203,
            "message": "address not registered",
            "data": { "data": [], "total": 0 }
        });
        let envelope: Envelope<EntryMemo> = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.code, Some(1203));
        assert_eq!(envelope.message.as_deref(), Some("address not registered"));
    }
}
