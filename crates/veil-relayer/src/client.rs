//! Relayer HTTP client.
//!
//! Endpoints:
//! - POST /api/v1/transfer, POST /api/v1/burn — submit a proved operation,
//!   yields a relayer tx hash
//! - GET /api/v1/txhash?txhash=... — poll until the on-chain hash appears
//! - GET /api/v1/relayer_config — fee schedule, cached for five minutes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use veil_types::{Error, ErrorDetail, Hex, Result};

/// Submit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayerAction {
    Transfer,
    Burn,
}

impl RelayerAction {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Transfer => "/api/v1/transfer",
            Self::Burn => "/api/v1/burn",
        }
    }
}

/// Protocol-defined submit body: proof bytes, public inputs, extra data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerRequest {
    pub chain_id: u64,
    pub action: RelayerAction,
    pub proof: Hex,
    pub public_inputs: Vec<Hex>,
    pub extra_data: Hex,
}

/// Per-token fee row from the relayer config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFees {
    pub transfer_fee: String,
    pub withdraw_fee: String,
}

/// Relayer fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerFeeConfig {
    pub valid_time: u64,
    #[serde(default)]
    pub fees: HashMap<String, TokenFees>,
}

/// The relayer capability the operation manager drives.
#[async_trait]
pub trait RelayerApi: Send + Sync {
    /// Submit; returns the relayer tx hash.
    async fn submit(&self, request: &RelayerRequest) -> Result<Hex>;
    /// Poll for the on-chain tx hash; `None` until the relayer lands it.
    async fn tx_hash(&self, relayer_tx_hash: &str) -> Result<Option<Hex>>;
    async fn fee_config(&self) -> Result<RelayerFeeConfig>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: Option<i64>,
    message: Option<String>,
    data: T,
}

pub struct HttpRelayerClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRelayerClient {
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

    fn check_code<T>(url: &str, envelope: &Envelope<T>) -> Result<()> {
        if envelope.code.unwrap_or(0) != 0 {
            let message = envelope
                .message
                .clone()
                .unwrap_or_else(|| "relayer error".to_string());
            return Err(Error::relayer(message).with_detail(ErrorDetail::http(None, url, None)));
        }
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        url: &str,
        resp: reqwest::Response,
    ) -> Result<Envelope<T>> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(
                Error::relayer(format!("relayer returned status {}", status)).with_detail(
                    ErrorDetail::http(Some(status.as_u16()), url, Some(&body)),
                ),
            );
        }
        resp.json().await.map_err(|e| {
            Error::relayer(format!("bad relayer response: {}", e))
                .with_detail(ErrorDetail::http(Some(status.as_u16()), url, None))
                .with_source(e)
        })
    }
}

#[async_trait]
impl RelayerApi for HttpRelayerClient {
    async fn submit(&self, request: &RelayerRequest) -> Result<Hex> {
        let url = format!("{}{}", self.base_url, request.action.endpoint());
        let resp = self
            .client
            .post(&url)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                Error::relayer(format!("relayer request failed: {}", e))
                    .with_detail(ErrorDetail::http(e.status().map(|s| s.as_u16()), url.as_str(), None))
                    .with_source(e)
            })?;

        let envelope: Envelope<Hex> = Self::read_json(&url, resp).await?;
        Self::check_code(&url, &envelope)?;
        Ok(envelope.data)
    }

    async fn tx_hash(&self, relayer_tx_hash: &str) -> Result<Option<Hex>> {
        let url = format!("{}/api/v1/txhash?txhash={}", self.base_url, relayer_tx_hash);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                Error::relayer(format!("relayer request failed: {}", e))
                    .with_detail(ErrorDetail::http(e.status().map(|s| s.as_u16()), url.as_str(), None))
                    .with_source(e)
            })?;

        let envelope: Envelope<Option<Hex>> = Self::read_json(&url, resp).await?;
        Self::check_code(&url, &envelope)?;
        Ok(envelope.data.filter(|h| !h.is_empty()))
    }

    async fn fee_config(&self) -> Result<RelayerFeeConfig> {
        let url = format!("{}/api/v1/relayer_config", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                Error::relayer(format!("relayer request failed: {}", e))
                    .with_detail(ErrorDetail::http(e.status().map(|s| s.as_u16()), url.as_str(), None))
                    .with_source(e)
            })?;

        let envelope: Envelope<RelayerFeeConfig> = Self::read_json(&url, resp).await?;
        Self::check_code(&url, &envelope)?;
        Ok(envelope.data)
    }
}

const FEE_CONFIG_TTL: Duration = Duration::from_secs(300);

/// Five-minute cache in front of any [`RelayerApi`]'s fee config.
pub struct FeeConfigCache {
    api: std::sync::Arc<dyn RelayerApi>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, RelayerFeeConfig)>>,
}

impl FeeConfigCache {
    pub fn new(api: std::sync::Arc<dyn RelayerApi>) -> Self {
        Self::with_ttl(api, FEE_CONFIG_TTL)
    }

    pub fn with_ttl(api: std::sync::Arc<dyn RelayerApi>, ttl: Duration) -> Self {
        Self {
            api,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<RelayerFeeConfig> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some((fetched_at, config)) = cached.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(config.clone());
                }
            }
        }

        let config = self.api.fee_config().await?;
        *self.cached.lock().unwrap() = Some((Instant::now(), config.clone()));
        Ok(config)
    }

    pub fn invalidate(&self) {
        *self.cached.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingApi {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RelayerApi for CountingApi {
        async fn submit(&self, _request: &RelayerRequest) -> Result<Hex> {
            Ok("0xrelayer".into())
        }

        async fn tx_hash(&self, _relayer_tx_hash: &str) -> Result<Option<Hex>> {
            Ok(None)
        }

        async fn fee_config(&self) -> Result<RelayerFeeConfig> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RelayerFeeConfig {
                valid_time: 600,
                fees: HashMap::new(),
            })
        }
    }

    #[tokio::test]
    async fn fee_config_is_cached_within_ttl() {
        let api = Arc::new(CountingApi {
            calls: AtomicU32::new(0),
        });
        let cache = FeeConfigCache::new(api.clone());

        cache.get().await.unwrap();
        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        cache.get().await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fee_config_refetches_after_ttl() {
        let api = Arc::new(CountingApi {
            calls: AtomicU32::new(0),
        });
        let cache = FeeConfigCache::with_ttl(api.clone(), Duration::from_millis(20));

        cache.get().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get().await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn envelope_with_null_txhash_parses() {
        let body = serde_json::json!({ "code": 0, "data": null });
        let envelope: Envelope<Option<Hex>> = serde_json::from_value(body).unwrap();
        assert!(envelope.data.is_none());
    }

    #[test]
    fn fee_config_shape_parses() {
        let body = serde_json::json!({
            "valid_time": 300,
            "fees": {
                "0xtoken": { "transfer_fee": "1000000", "withdraw_fee": "2000000" }
            }
        });
        let config: RelayerFeeConfig = serde_json::from_value(body).unwrap();
        assert_eq!(config.fees["0xtoken"].transfer_fee, "1000000");
    }
}
