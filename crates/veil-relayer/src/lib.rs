//! Operation lifecycle manager.
//!
//! Drives created → submitted → confirmed with failed as the terminal sink
//! from any non-terminal state. Every transition is persisted through the
//! storage adapter before the call returns; failed transitions are
//! recorded before the error propagates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use veil_store::{OperationQuery, OperationRecord, OperationStatus, Page, StorageAdapter};
use veil_types::{now_ms, Error, ErrorCode, Hex, Result};

pub mod client;

pub use client::{
    FeeConfigCache, HttpRelayerClient, RelayerAction, RelayerApi, RelayerFeeConfig,
    RelayerRequest, TokenFees,
};

/// Receipt-wait parameters, passed through to the chain client.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptOptions {
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub confirmations: u32,
}

impl Default for ReceiptOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4_000,
            timeout_ms: 180_000,
            confirmations: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: Hex,
    pub block_number: u64,
    pub success: bool,
}

/// Chain-client capability: receipt waiting is delegated, not implemented
/// here.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn wait_for_receipt(
        &self,
        chain_id: u64,
        tx_hash: &str,
        opts: &ReceiptOptions,
    ) -> Result<TxReceipt>;
}

#[derive(Debug, Clone)]
pub struct OperationManagerConfig {
    /// Oldest operations beyond this cap are pruned on create.
    pub max_operations: usize,
}

impl Default for OperationManagerConfig {
    fn default() -> Self {
        Self { max_operations: 256 }
    }
}

pub struct OperationManager {
    store: Arc<dyn StorageAdapter>,
    relayer: Arc<dyn RelayerApi>,
    chain_client: Arc<dyn ChainClient>,
    config: OperationManagerConfig,
}

impl OperationManager {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        relayer: Arc<dyn RelayerApi>,
        chain_client: Arc<dyn ChainClient>,
        config: OperationManagerConfig,
    ) -> Self {
        Self {
            store,
            relayer,
            chain_client,
            config,
        }
    }

    /// Create a new operation record in `created` state and prune the
    /// history to the configured cap, oldest first.
    pub async fn create_operation(
        &self,
        op_type: &str,
        chain_id: Option<u64>,
        token_id: Option<String>,
        detail: Option<serde_json::Value>,
    ) -> Result<OperationRecord> {
        let op = OperationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            op_type: op_type.to_string(),
            status: OperationStatus::Created,
            created_at: now_ms(),
            chain_id,
            token_id,
            request_url: None,
            relayer_tx_hash: None,
            tx_hash: None,
            detail,
            error: None,
        };
        self.store.put_operation(&op).await?;

        let pruned = self
            .store
            .prune_operations(self.config.max_operations)
            .await?;
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned old operations");
        }

        Ok(op)
    }

    pub async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        self.store.get_operation(id).await
    }

    pub async fn list_operations(&self, query: &OperationQuery) -> Result<Page<OperationRecord>> {
        self.store.list_operations(query).await
    }

    async fn load(&self, id: &str) -> Result<OperationRecord> {
        self.store
            .get_operation(id)
            .await?
            .ok_or_else(|| Error::relayer(format!("unknown operation {}", id)))
    }

    async fn record_failure(
        &self,
        mut op: OperationRecord,
        err: &Error,
        request_url: Option<&str>,
    ) {
        op.status = OperationStatus::Failed;
        op.error = Some(err.to_string());
        if let Some(url) = request_url {
            op.request_url = Some(url.to_string());
        }
        // Best effort: the original error matters more than this write.
        if let Err(store_err) = self.store.put_operation(&op).await {
            tracing::warn!(op_id = %op.id, error = %store_err, "failed to record operation failure");
        }
    }

    /// Submit to the relayer. Success moves the operation to `submitted`
    /// and records the relayer tx hash; failure is recorded and re-raised.
    pub async fn submit_relayer_request(
        &self,
        op_id: &str,
        request: &RelayerRequest,
        request_url: &str,
    ) -> Result<Hex> {
        let mut op = self.load(op_id).await?;

        match self.relayer.submit(request).await {
            Ok(relayer_tx_hash) => {
                op.status = OperationStatus::Submitted;
                op.request_url = Some(request_url.to_string());
                op.relayer_tx_hash = Some(relayer_tx_hash.clone());
                self.store.put_operation(&op).await?;
                Ok(relayer_tx_hash)
            }
            Err(err) => {
                self.record_failure(op, &err, Some(request_url)).await;
                Err(err)
            }
        }
    }

    /// Poll the relayer until the on-chain tx hash appears. The operation
    /// stays `submitted` on success (receipt confirmation is a separate
    /// step); timeout, abort and transport errors all fail it.
    pub async fn wait_relayer_tx_hash(
        &self,
        op_id: &str,
        interval_ms: u64,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Hex> {
        let mut op = self.load(op_id).await?;
        let relayer_tx_hash = op
            .relayer_tx_hash
            .clone()
            .ok_or_else(|| Error::relayer(format!("operation {} was never submitted", op_id)))?;

        let started = tokio::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                let err = Error::aborted(ErrorCode::Relayer);
                self.record_failure(op, &err, None).await;
                return Err(err);
            }
            if started.elapsed() >= Duration::from_millis(timeout_ms) {
                let err = Error::relayer(format!(
                    "relayer tx hash not available within {} ms",
                    timeout_ms
                ));
                self.record_failure(op, &err, None).await;
                return Err(err);
            }

            match self.relayer.tx_hash(&relayer_tx_hash).await {
                Ok(Some(tx_hash)) => {
                    op.tx_hash = Some(tx_hash.clone());
                    self.store.put_operation(&op).await?;
                    return Ok(tx_hash);
                }
                Ok(None) => {
                    let sleep = Duration::from_millis(interval_ms);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let err = Error::aborted(ErrorCode::Relayer);
                            self.record_failure(op, &err, None).await;
                            return Err(err);
                        }
                        _ = tokio::time::sleep(sleep) => {}
                    }
                }
                Err(err) => {
                    self.record_failure(op, &err, None).await;
                    return Err(err);
                }
            }
        }
    }

    /// Wait for the on-chain receipt via the chain client. Success confirms
    /// the operation; anything else fails it.
    pub async fn wait_for_transaction_receipt(
        &self,
        op_id: &str,
        opts: &ReceiptOptions,
    ) -> Result<TxReceipt> {
        let mut op = self.load(op_id).await?;
        let chain_id = op
            .chain_id
            .ok_or_else(|| Error::relayer(format!("operation {} has no chain", op_id)))?;
        let tx_hash = op
            .tx_hash
            .clone()
            .ok_or_else(|| Error::relayer(format!("operation {} has no tx hash", op_id)))?;

        match self.chain_client.wait_for_receipt(chain_id, &tx_hash, opts).await {
            Ok(receipt) if receipt.success => {
                op.status = OperationStatus::Confirmed;
                self.store.put_operation(&op).await?;
                Ok(receipt)
            }
            Ok(receipt) => {
                let err = Error::relayer(format!("transaction {} reverted", receipt.tx_hash));
                self.record_failure(op, &err, None).await;
                Err(err)
            }
            Err(err) => {
                self.record_failure(op, &err, None).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use veil_store::memory::MemoryStore;

    struct ScriptedRelayer {
        submit_result: Mutex<Option<Result<Hex>>>,
        tx_hashes: Mutex<VecDeque<Result<Option<Hex>>>>,
    }

    impl ScriptedRelayer {
        fn new() -> Self {
            Self {
                submit_result: Mutex::new(Some(Ok("0xrelayerhash".into()))),
                tx_hashes: Mutex::new(VecDeque::new()),
            }
        }

        fn push_tx_hash(&self, result: Result<Option<Hex>>) {
            self.tx_hashes.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl RelayerApi for ScriptedRelayer {
        async fn submit(&self, _request: &RelayerRequest) -> Result<Hex> {
            self.submit_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok("0xrelayerhash".into()))
        }

        async fn tx_hash(&self, _relayer_tx_hash: &str) -> Result<Option<Hex>> {
            self.tx_hashes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }

        async fn fee_config(&self) -> Result<RelayerFeeConfig> {
            Ok(RelayerFeeConfig {
                valid_time: 300,
                fees: Default::default(),
            })
        }
    }

    struct FakeChain {
        receipts: Mutex<VecDeque<Result<TxReceipt>>>,
        calls: AtomicU32,
    }

    impl FakeChain {
        fn new() -> Self {
            Self {
                receipts: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn wait_for_receipt(
            &self,
            _chain_id: u64,
            tx_hash: &str,
            _opts: &ReceiptOptions,
        ) -> Result<TxReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.receipts.lock().unwrap().pop_front().unwrap_or(Ok(TxReceipt {
                tx_hash: tx_hash.to_string(),
                block_number: 1,
                success: true,
            }))
        }
    }

    fn request() -> RelayerRequest {
        RelayerRequest {
            chain_id: 1,
            action: RelayerAction::Transfer,
            proof: "0xproof".into(),
            public_inputs: vec!["0x01".into()],
            extra_data: "0x".into(),
        }
    }

    async fn manager() -> (OperationManager, Arc<ScriptedRelayer>, Arc<FakeChain>) {
        let store = Arc::new(MemoryStore::new());
        store.init(Some("w")).await.unwrap();
        let relayer = Arc::new(ScriptedRelayer::new());
        let chain = Arc::new(FakeChain::new());
        let manager = OperationManager::new(
            store,
            relayer.clone(),
            chain.clone(),
            OperationManagerConfig::default(),
        );
        (manager, relayer, chain)
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_confirmed() {
        let (manager, relayer, _) = manager().await;

        let op = manager
            .create_operation("transfer", Some(1), None, None)
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Created);

        let relayer_hash = manager
            .submit_relayer_request(&op.id, &request(), "https://relayer/api/v1/transfer")
            .await
            .unwrap();
        assert_eq!(relayer_hash, "0xrelayerhash");
        let stored = manager.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Submitted);
        assert_eq!(stored.relayer_tx_hash.as_deref(), Some("0xrelayerhash"));

        relayer.push_tx_hash(Ok(None));
        relayer.push_tx_hash(Ok(Some("0xchainhash".into())));
        let tx_hash = manager
            .wait_relayer_tx_hash(&op.id, 5, 5_000, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tx_hash, "0xchainhash");
        let stored = manager.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Submitted);
        assert_eq!(stored.tx_hash.as_deref(), Some("0xchainhash"));

        manager
            .wait_for_transaction_receipt(&op.id, &ReceiptOptions::default())
            .await
            .unwrap();
        let stored = manager.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Confirmed);
    }

    #[tokio::test]
    async fn submit_failure_records_failed_with_url() {
        let (manager, relayer, _) = manager().await;
        *relayer.submit_result.lock().unwrap() =
            Some(Err(Error::relayer("relayer returned status 502")));

        let op = manager
            .create_operation("withdraw", Some(1), None, None)
            .await
            .unwrap();
        let err = manager
            .submit_relayer_request(&op.id, &request(), "https://relayer/api/v1/burn")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Relayer);

        let stored = manager.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(
            stored.request_url.as_deref(),
            Some("https://relayer/api/v1/burn")
        );
        assert!(stored.error.as_ref().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn tx_hash_timeout_fails_operation() {
        let (manager, _, _) = manager().await;

        let op = manager
            .create_operation("transfer", Some(1), None, None)
            .await
            .unwrap();
        manager
            .submit_relayer_request(&op.id, &request(), "https://relayer/api/v1/transfer")
            .await
            .unwrap();

        // The scripted relayer keeps answering None.
        let err = manager
            .wait_relayer_tx_hash(&op.id, 5, 30, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Relayer);

        let stored = manager.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        // The submit url survives the failed wait.
        assert!(stored.request_url.is_some());
    }

    #[tokio::test]
    async fn abort_fails_with_aborted_message() {
        let (manager, _, _) = manager().await;
        let op = manager
            .create_operation("transfer", Some(1), None, None)
            .await
            .unwrap();
        manager
            .submit_relayer_request(&op.id, &request(), "https://relayer/api/v1/transfer")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager
            .wait_relayer_tx_hash(&op.id, 5, 5_000, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_aborted());

        let stored = manager.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert!(stored.error.as_ref().unwrap().contains("Aborted"));
    }

    #[tokio::test]
    async fn reverted_receipt_fails_operation() {
        let (manager, relayer, chain) = manager().await;
        let op = manager
            .create_operation("transfer", Some(1), None, None)
            .await
            .unwrap();
        manager
            .submit_relayer_request(&op.id, &request(), "https://relayer/api/v1/transfer")
            .await
            .unwrap();
        relayer.push_tx_hash(Ok(Some("0xchainhash".into())));
        manager
            .wait_relayer_tx_hash(&op.id, 5, 5_000, &CancellationToken::new())
            .await
            .unwrap();

        chain.receipts.lock().unwrap().push_back(Ok(TxReceipt {
            tx_hash: "0xchainhash".into(),
            block_number: 9,
            success: false,
        }));
        let err = manager
            .wait_for_transaction_receipt(&op.id, &ReceiptOptions::default())
            .await
            .unwrap_err();
        assert!(err.message.contains("reverted"));

        let stored = manager.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn create_prunes_oldest_beyond_cap() {
        let store = Arc::new(MemoryStore::new());
        store.init(Some("w")).await.unwrap();
        let manager = OperationManager::new(
            store.clone(),
            Arc::new(ScriptedRelayer::new()),
            Arc::new(FakeChain::new()),
            OperationManagerConfig { max_operations: 3 },
        );

        let mut ids = Vec::new();
        for _ in 0..5 {
            // Distinct timestamps so oldest-first is deterministic.
            tokio::time::sleep(Duration::from_millis(2)).await;
            ids.push(
                manager
                    .create_operation("transfer", Some(1), None, None)
                    .await
                    .unwrap()
                    .id,
            );
        }

        let page = manager
            .list_operations(&OperationQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert!(manager.get_operation(&ids[0]).await.unwrap().is_none());
        assert!(manager.get_operation(&ids[4]).await.unwrap().is_some());
    }
}
