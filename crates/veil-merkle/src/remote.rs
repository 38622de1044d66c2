//! Remote Merkle proof service client.
//!
//! `GET {merkle_proof_url}?cid=c1&cid=c2...` returns proofs for leaves the
//! contract has already merged, plus the root they verify against and the
//! newest merged cid.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use ark_bn254::Fr;
use veil_types::{amount_to_field, Error, ErrorDetail, Result};

use crate::{MerkleProof, TREE_DEPTH};

/// Remote proof response, already parsed into field elements.
#[derive(Debug, Clone)]
pub struct RemoteProofBundle {
    pub proofs: Vec<MerkleProof>,
    pub root: Fr,
    pub latest_cid: u64,
}

/// Capability the accumulator falls back to in remote / hybrid modes.
#[async_trait]
pub trait ProofService: Send + Sync {
    async fn fetch_proofs(&self, chain_id: u64, cids: &[u64]) -> Result<RemoteProofBundle>;
}

#[derive(Debug, Deserialize)]
struct WireProof {
    path: Vec<serde_json::Value>,
    leaf_index: u64,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    proof: Vec<WireProof>,
    merkle_root: serde_json::Value,
    latest_cid: u64,
}

/// Parse a field element that may arrive as 0x-hex, a decimal string, or a
/// bare JSON number.
fn parse_field(value: &serde_json::Value) -> Result<Fr> {
    match value {
        serde_json::Value::String(s) => {
            if s.starts_with("0x") || s.starts_with("0X") {
                veil_types::hex_to_field(s)
            } else {
                let amount = veil_types::amount_from_decimal(s)
                    .map_err(|e| Error::merkle(format!("bad proof element {:?}: {}", s, e)))?;
                amount_to_field(&amount)
            }
        }
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(Fr::from)
            .ok_or_else(|| Error::merkle(format!("bad proof element: {}", n))),
        other => Err(Error::merkle(format!("bad proof element: {}", other))),
    }
}

/// HTTP implementation of [`ProofService`].
pub struct HttpProofService {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProofService {
    pub fn new(base_url: &str, timeout_ms: Option<u64>) -> Self {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(20_000));
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            timeout,
        }
    }
}

#[async_trait]
impl ProofService for HttpProofService {
    async fn fetch_proofs(&self, chain_id: u64, cids: &[u64]) -> Result<RemoteProofBundle> {
        if cids.is_empty() {
            return Err(Error::config("proof request requires at least one cid"));
        }

        let query: Vec<String> = cids.iter().map(|cid| format!("cid={}", cid)).collect();
        let url = format!(
            "{}?chain_id={}&{}",
            self.base_url,
            chain_id,
            query.join("&")
        );

        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                Error::merkle(format!("proof service request failed: {}", e))
                    .with_detail(ErrorDetail::http(e.status().map(|s| s.as_u16()), url.as_str(), None))
                    .with_source(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::merkle(format!(
                "proof service returned status {}",
                status
            ))
            .with_detail(ErrorDetail::http(Some(status.as_u16()), url.as_str(), Some(&body))));
        }

        let wire: WireResponse = resp
            .json()
            .await
            .map_err(|e| Error::merkle(format!("bad proof service response: {}", e)).with_source(e))?;

        let mut proofs = Vec::with_capacity(wire.proof.len());
        for p in &wire.proof {
            if p.path.len() != TREE_DEPTH + 1 {
                return Err(Error::merkle(format!(
                    "proof path for cid {} has length {}, expected {}",
                    p.leaf_index,
                    p.path.len(),
                    TREE_DEPTH + 1
                )));
            }
            let path: Result<Vec<Fr>> = p.path.iter().map(parse_field).collect();
            proofs.push(MerkleProof {
                leaf_index: p.leaf_index,
                path: path?,
            });
        }

        Ok(RemoteProofBundle {
            proofs,
            root: parse_field(&wire.merkle_root)?,
            latest_cid: wire.latest_cid,
        })
    }
}
