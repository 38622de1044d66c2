//! Multi-resource sync engine.
//!
//! Pages memos and nullifiers from the entry indexer per chain, enforces
//! cid contiguity, feeds the merkle accumulator and the wallet view, and
//! keeps the per-(wallet, chain) cursor moving. Chains sync in parallel;
//! one chain never syncs twice at once (extra callers observe a `Skipped`
//! event). Transient indexer failures retry with capped exponential
//! backoff; everything observes the caller's cancellation token.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use veil_merkle::{LeafInsert, MerkleAccumulator};
use veil_store::{EntryMemoRecord, EntryNullifierRecord, StorageAdapter};
use veil_types::{hex_to_field, Error, ErrorCode, Hex, Result};

pub mod entry;
pub mod retry;

pub use entry::{EntryClient, EntryMemo, EntryNullifier, EntrySource, MemoPage, NullifierPage};
pub use retry::RetryPolicy;

/// Engine configuration. Out-of-range values are clamped by
/// [`SyncConfig::normalized`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_size: u64,
    pub poll_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 512,
            poll_ms: 15_000,
            request_timeout_ms: 20_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.max(1);
        self.poll_ms = self.poll_ms.max(250);
        self.request_timeout_ms = self.request_timeout_ms.max(1_000);
        self.retry = self.retry.normalized();
        self
    }
}

/// Per-chain connection settings.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub entry_url: Option<String>,
    pub contract_address: Option<String>,
    pub merkle_proof_url: Option<String>,
}

/// The resources a sync pass can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncResource {
    Memo,
    Nullifier,
    Merkle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
}

/// Live state of one resource on one chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceState {
    pub status: ResourceStatus,
    pub cursor: u64,
    pub total: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSyncStatus {
    pub chain_id: u64,
    pub memo: ResourceState,
    pub nullifier: ResourceState,
    pub merkle: ResourceState,
}

/// A validated memo handed to the wallet view (cid is known and dense).
#[derive(Debug, Clone)]
pub struct MemoEntry {
    pub cid: u64,
    pub commitment: Hex,
    pub memo: Hex,
    pub tx_hash: Option<Hex>,
    pub created_at: Option<u64>,
}

/// What the engine needs from the wallet layer.
#[async_trait::async_trait]
pub trait WalletSink: Send + Sync {
    /// Compressed viewing address of the open wallet.
    async fn viewing_address(&self) -> Result<Hex>;
    /// Decrypt-and-apply memos; returns how many UTXOs were derived.
    async fn apply_memos(&self, chain_id: u64, entries: &[MemoEntry]) -> Result<u64>;
    /// Flip matching UTXOs to spent; returns how many flipped.
    async fn mark_spent(&self, chain_id: u64, nullifiers: &[Hex]) -> Result<u64>;
}

/// Progress / error events, in observable-transition order per chain.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started {
        chain_id: u64,
    },
    /// The chain was already syncing; this call did nothing.
    Skipped {
        chain_id: u64,
    },
    Progress {
        chain_id: u64,
        resource: SyncResource,
        cursor: u64,
        total: u64,
    },
    ResourceError {
        chain_id: u64,
        resource: SyncResource,
        message: String,
    },
    Done {
        chain_id: u64,
    },
}

pub type SyncEventHandler = Box<dyn Fn(SyncEvent) + Send + Sync>;

/// Options for one sync pass.
#[derive(Clone)]
pub struct SyncOptions {
    pub resources: Vec<SyncResource>,
    pub continue_on_error: bool,
    pub cancel: CancellationToken,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            resources: vec![SyncResource::Memo, SyncResource::Nullifier, SyncResource::Merkle],
            continue_on_error: true,
            cancel: CancellationToken::new(),
        }
    }
}

/// Merkle cursor derived from memo progress.
fn derived_merkle_cursor(memo: u64) -> u64 {
    if memo > 32 {
        (memo - 1) / 32
    } else {
        0
    }
}

/// Render an error with its transport detail for status surfaces.
fn describe(err: &Error) -> String {
    let mut out = err.to_string();
    if let Some(detail) = &err.detail {
        let mut parts = Vec::new();
        if let Some(status) = detail.status {
            parts.push(format!("status {}", status));
        }
        if let Some(url) = &detail.url {
            parts.push(url.clone());
        }
        if let Some(body) = &detail.body {
            parts.push(body.clone());
        }
        if !parts.is_empty() {
            out.push_str(&format!(" ({})", parts.join(", ")));
        }
    }
    out
}

pub struct SyncEngine {
    config: SyncConfig,
    chains: Vec<ChainConfig>,
    store: Arc<dyn StorageAdapter>,
    accumulator: Arc<MerkleAccumulator>,
    wallet: Arc<dyn WalletSink>,
    entry: Arc<dyn EntrySource>,
    in_progress: Mutex<HashSet<u64>>,
    status: Mutex<HashMap<u64, ChainSyncStatus>>,
    on_event: Option<SyncEventHandler>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        chains: Vec<ChainConfig>,
        store: Arc<dyn StorageAdapter>,
        accumulator: Arc<MerkleAccumulator>,
        wallet: Arc<dyn WalletSink>,
        entry: Arc<dyn EntrySource>,
        on_event: Option<SyncEventHandler>,
    ) -> Self {
        Self {
            config: config.normalized(),
            chains,
            store,
            accumulator,
            wallet,
            entry,
            in_progress: Mutex::new(HashSet::new()),
            status: Mutex::new(HashMap::new()),
            on_event,
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(handler) = &self.on_event {
            handler(event);
        }
    }

    fn update_resource(
        &self,
        chain_id: u64,
        resource: SyncResource,
        f: impl FnOnce(&mut ResourceState),
    ) {
        let mut status = self.status.lock().unwrap();
        let chain = status.entry(chain_id).or_insert_with(|| ChainSyncStatus {
            chain_id,
            ..Default::default()
        });
        let state = match resource {
            SyncResource::Memo => &mut chain.memo,
            SyncResource::Nullifier => &mut chain.nullifier,
            SyncResource::Merkle => &mut chain.merkle,
        };
        f(state);
    }

    fn fail_resource(&self, chain_id: u64, resource: SyncResource, err: &Error) {
        let message = describe(err);
        self.update_resource(chain_id, resource, |r| {
            r.status = ResourceStatus::Error;
            r.error_message = Some(message.clone());
        });
        self.emit(SyncEvent::ResourceError {
            chain_id,
            resource,
            message,
        });
    }

    /// Snapshot of every configured chain's per-resource state.
    pub fn status(&self) -> Vec<ChainSyncStatus> {
        let status = self.status.lock().unwrap();
        self.chains
            .iter()
            .map(|chain| {
                status.get(&chain.chain_id).cloned().unwrap_or(ChainSyncStatus {
                    chain_id: chain.chain_id,
                    ..Default::default()
                })
            })
            .collect()
    }

    /// One pass over all chains, in parallel. With `continue_on_error` the
    /// call never fails; problems surface through status and events.
    pub async fn sync_once(&self, opts: &SyncOptions) -> Result<()> {
        let results = join_all(self.chains.iter().map(|chain| self.sync_chain(chain, opts))).await;

        if !opts.continue_on_error {
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    /// Repeated passes every `poll_ms` until cancelled.
    pub async fn run(&self, opts: SyncOptions) -> Result<()> {
        loop {
            self.sync_once(&opts).await?;
            if retry::sleep_cancellable(
                Duration::from_millis(self.config.poll_ms),
                &opts.cancel,
                ErrorCode::Sync,
            )
            .await
            .is_err()
            {
                return Ok(());
            }
        }
    }

    async fn sync_chain(&self, chain: &ChainConfig, opts: &SyncOptions) -> Result<()> {
        let chain_id = chain.chain_id;

        {
            let mut in_progress = self.in_progress.lock().unwrap();
            if !in_progress.insert(chain_id) {
                self.emit(SyncEvent::Skipped { chain_id });
                return Ok(());
            }
        }

        self.emit(SyncEvent::Started { chain_id });
        let result = self.sync_chain_inner(chain, opts).await;
        self.in_progress.lock().unwrap().remove(&chain_id);
        self.emit(SyncEvent::Done { chain_id });
        result
    }

    async fn sync_chain_inner(&self, chain: &ChainConfig, opts: &SyncOptions) -> Result<()> {
        let chain_id = chain.chain_id;
        let mut resources: Vec<SyncResource> = opts.resources.clone();
        let mut first_error: Option<Error> = None;

        // The merkle cursor is derived from memo progress; it cannot sync
        // alone.
        if resources.contains(&SyncResource::Merkle) && !resources.contains(&SyncResource::Memo) {
            let err = Error::config("merkle sync is derived from memo sync");
            self.fail_resource(chain_id, SyncResource::Merkle, &err);
            resources.retain(|r| *r != SyncResource::Merkle);
            first_error.get_or_insert(err);
        }
        if resources.is_empty() {
            return match first_error {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        if chain.entry_url.is_none() || chain.contract_address.is_none() {
            let err = Error::config(format!(
                "chain {} is missing entry url or contract address",
                chain_id
            ));
            for resource in &resources {
                self.fail_resource(chain_id, *resource, &err);
            }
            return Err(err);
        }

        let address = match self.wallet.viewing_address().await {
            Ok(address) => address,
            Err(err) => {
                for resource in &resources {
                    self.fail_resource(chain_id, *resource, &err);
                }
                return Err(err);
            }
        };

        if resources.contains(&SyncResource::Memo) {
            let include_merkle = resources.contains(&SyncResource::Merkle);
            if let Err(err) = self.sync_memos(chain, &address, include_merkle, opts).await {
                self.fail_resource(chain_id, SyncResource::Memo, &err);
                if include_merkle {
                    self.fail_resource(chain_id, SyncResource::Merkle, &err);
                }
                first_error.get_or_insert(err);
            }
        }

        if resources.contains(&SyncResource::Nullifier) {
            if let Err(err) = self.sync_nullifiers(chain, &address, opts).await {
                self.fail_resource(chain_id, SyncResource::Nullifier, &err);
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch_memo_page(
        &self,
        chain: &ChainConfig,
        address: &str,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<MemoPage> {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::aborted(ErrorCode::Sync)),
            result = tokio::time::timeout(
                timeout,
                self.entry.list_memos(chain, address, offset, self.config.page_size),
            ) => match result {
                Ok(page) => page,
                Err(_) => Err(Error::sync("entry request timed out")),
            },
        }
    }

    async fn fetch_nullifier_page(
        &self,
        chain: &ChainConfig,
        address: &str,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<NullifierPage> {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::aborted(ErrorCode::Sync)),
            result = tokio::time::timeout(
                timeout,
                self.entry.list_nullifiers(chain, address, offset, self.config.page_size),
            ) => match result {
                Ok(page) => page,
                Err(_) => Err(Error::sync("entry request timed out")),
            },
        }
    }

    async fn sync_memos(
        &self,
        chain: &ChainConfig,
        address: &str,
        include_merkle: bool,
        opts: &SyncOptions,
    ) -> Result<()> {
        let chain_id = chain.chain_id;
        let mut cursor = self
            .store
            .get_sync_cursor(chain_id)
            .await?
            .unwrap_or_default();

        if include_merkle {
            let derived = derived_merkle_cursor(cursor.memo);
            if cursor.merkle != derived {
                cursor.merkle = derived;
                self.store.set_sync_cursor(chain_id, &cursor).await?;
            }
            self.update_resource(chain_id, SyncResource::Merkle, |r| {
                r.status = ResourceStatus::Syncing;
                r.cursor = derived;
                r.error_message = None;
            });
        }
        self.update_resource(chain_id, SyncResource::Memo, |r| {
            r.status = ResourceStatus::Syncing;
            r.cursor = cursor.memo;
            r.error_message = None;
        });

        loop {
            let offset = cursor.memo;
            let page = retry::with_retry(&self.config.retry, &opts.cancel, || {
                self.fetch_memo_page(chain, address, offset, &opts.cancel)
            })
            .await?;

            self.update_resource(chain_id, SyncResource::Memo, |r| {
                r.total = Some(page.total);
            });

            if page.items.is_empty() {
                break;
            }

            // Validate indexing: rows with no dense index cannot be walked.
            let mut kept: Vec<(u64, EntryMemo)> = page
                .items
                .iter()
                .filter_map(|m| match m.cid {
                    Some(cid) if cid >= 0 => Some((cid as u64, m.clone())),
                    _ => None,
                })
                .collect();
            kept.sort_by_key(|(cid, _)| *cid);
            kept.retain(|(cid, _)| *cid >= offset);

            if kept.is_empty() {
                // Everything was below the cursor: idempotent re-delivery.
                break;
            }

            let mut prefix: Vec<(u64, EntryMemo)> = Vec::new();
            for (i, (cid, memo)) in kept.iter().enumerate() {
                if *cid == offset + i as u64 {
                    prefix.push((*cid, memo.clone()));
                } else {
                    break;
                }
            }

            if prefix.is_empty() {
                return Err(Error::sync(format!(
                    "memo page not contiguous: expected cid {}, got {}",
                    offset, kept[0].0
                )));
            }

            // Mirror is best-effort: the cursor is the source of truth.
            let mirror: Vec<EntryMemoRecord> = prefix
                .iter()
                .map(|(cid, m)| EntryMemoRecord {
                    chain_id,
                    cid: *cid,
                    commitment: m.commitment.clone(),
                    memo: m.memo.clone(),
                    tx_hash: m.tx_hash.clone(),
                    created_at: m.created_at.and_then(|t| u64::try_from(t).ok()),
                })
                .collect();
            if let Err(err) = self.store.upsert_entry_memos(chain_id, &mirror).await {
                warn!(chain_id, error = %err, "entry memo mirror write failed");
            }

            let mut inserts = Vec::with_capacity(prefix.len());
            for (cid, m) in &prefix {
                inserts.push(LeafInsert {
                    cid: *cid,
                    commitment: hex_to_field(&m.commitment)?,
                });
            }
            self.accumulator.ingest_leaves(chain_id, &inserts).await?;

            let entries: Vec<MemoEntry> = prefix
                .iter()
                .map(|(cid, m)| MemoEntry {
                    cid: *cid,
                    commitment: m.commitment.clone(),
                    memo: m.memo.clone(),
                    tx_hash: m.tx_hash.clone(),
                    created_at: m.created_at.and_then(|t| u64::try_from(t).ok()),
                })
                .collect();
            let applied = self.wallet.apply_memos(chain_id, &entries).await?;
            debug!(chain_id, applied, "applied memo page");

            let last_cid = prefix.last().map(|(cid, _)| *cid).unwrap_or(offset);
            cursor.memo = last_cid + 1;
            if include_merkle {
                cursor.merkle = derived_merkle_cursor(cursor.memo);
            }
            self.store.set_sync_cursor(chain_id, &cursor).await?;
            self.update_resource(chain_id, SyncResource::Memo, |r| r.cursor = cursor.memo);
            if include_merkle {
                self.update_resource(chain_id, SyncResource::Merkle, |r| {
                    r.cursor = cursor.merkle
                });
            }
            self.emit(SyncEvent::Progress {
                chain_id,
                resource: SyncResource::Memo,
                cursor: cursor.memo,
                total: page.total,
            });

            // Advance-then-raise: the cursor stays past the contiguous
            // prefix so the next run resumes after the gap is filled.
            if prefix.len() < kept.len() {
                return Err(Error::sync(format!(
                    "memo page not contiguous: gap after cid {}",
                    last_cid
                )));
            }

            if (page.items.len() as u64) < self.config.page_size {
                break;
            }
        }

        self.update_resource(chain_id, SyncResource::Memo, |r| {
            r.status = ResourceStatus::Synced;
        });
        if include_merkle {
            self.update_resource(chain_id, SyncResource::Merkle, |r| {
                r.status = ResourceStatus::Synced;
            });
        }
        Ok(())
    }

    async fn sync_nullifiers(
        &self,
        chain: &ChainConfig,
        address: &str,
        opts: &SyncOptions,
    ) -> Result<()> {
        let chain_id = chain.chain_id;
        let mut cursor = self
            .store
            .get_sync_cursor(chain_id)
            .await?
            .unwrap_or_default();

        self.update_resource(chain_id, SyncResource::Nullifier, |r| {
            r.status = ResourceStatus::Syncing;
            r.cursor = cursor.nullifier;
            r.error_message = None;
        });

        loop {
            let offset = cursor.nullifier;
            let page = retry::with_retry(&self.config.retry, &opts.cancel, || {
                self.fetch_nullifier_page(chain, address, offset, &opts.cancel)
            })
            .await?;

            self.update_resource(chain_id, SyncResource::Nullifier, |r| {
                r.total = Some(page.total);
            });

            if page.items.is_empty() {
                if page.total > offset {
                    if !page.ready {
                        // Index is still catching up; try again next pass.
                        break;
                    }
                    return Err(Error::sync(format!(
                        "nullifier list empty before total: offset {} < total {}",
                        offset, page.total
                    )));
                }
                break;
            }

            let mut seen = HashSet::new();
            for item in &page.items {
                if !seen.insert(item.nullifier.to_lowercase()) {
                    return Err(Error::sync(format!(
                        "duplicate nullifier in page: {}",
                        item.nullifier
                    )));
                }
            }

            let mirror: Vec<EntryNullifierRecord> = page
                .items
                .iter()
                .enumerate()
                .map(|(i, n)| EntryNullifierRecord {
                    chain_id,
                    nid: offset + i as u64,
                    nullifier: n.nullifier.clone(),
                    created_at: n.created_at.and_then(|t| u64::try_from(t).ok()),
                })
                .collect();
            if let Err(err) = self.store.upsert_entry_nullifiers(chain_id, &mirror).await {
                warn!(chain_id, error = %err, "entry nullifier mirror write failed");
            }

            let hexes: Vec<Hex> = page.items.iter().map(|n| n.nullifier.clone()).collect();
            let spent = self.wallet.mark_spent(chain_id, &hexes).await?;
            debug!(chain_id, spent, "marked nullifier page");

            cursor.nullifier += page.items.len() as u64;
            self.store.set_sync_cursor(chain_id, &cursor).await?;
            self.update_resource(chain_id, SyncResource::Nullifier, |r| {
                r.cursor = cursor.nullifier
            });
            self.emit(SyncEvent::Progress {
                chain_id,
                resource: SyncResource::Nullifier,
                cursor: cursor.nullifier,
                total: page.total,
            });

            if (page.items.len() as u64) < self.config.page_size {
                break;
            }
        }

        self.update_resource(chain_id, SyncResource::Nullifier, |r| {
            r.status = ResourceStatus::Synced;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use veil_merkle::ProofMode;
    use veil_store::memory::MemoryStore;
    use veil_store::SyncCursor;
    use veil_types::ErrorDetail;

    struct FakeWallet {
        applied: AtomicU64,
        spent: AtomicU64,
    }

    impl FakeWallet {
        fn new() -> Self {
            Self {
                applied: AtomicU64::new(0),
                spent: AtomicU64::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl WalletSink for FakeWallet {
        async fn viewing_address(&self) -> Result<Hex> {
            Ok("0xfeedface".to_string())
        }

        async fn apply_memos(&self, _chain_id: u64, entries: &[MemoEntry]) -> Result<u64> {
            self.applied.fetch_add(entries.len() as u64, Ordering::SeqCst);
            Ok(entries.len() as u64)
        }

        async fn mark_spent(&self, _chain_id: u64, nullifiers: &[Hex]) -> Result<u64> {
            self.spent.fetch_add(nullifiers.len() as u64, Ordering::SeqCst);
            Ok(nullifiers.len() as u64)
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        memo_pages: Mutex<VecDeque<Result<MemoPage>>>,
        nullifier_pages: Mutex<VecDeque<Result<NullifierPage>>>,
        memo_calls: AtomicU64,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl ScriptedSource {
        fn push_memo(&self, page: Result<MemoPage>) {
            self.memo_pages.lock().unwrap().push_back(page);
        }

        fn push_nullifiers(&self, page: Result<NullifierPage>) {
            self.nullifier_pages.lock().unwrap().push_back(page);
        }
    }

    fn memo_item(cid: i64) -> EntryMemo {
        EntryMemo {
            commitment: format!("0x{:064x}", cid + 1),
            memo: format!("0x{:02x}", cid),
            cid: Some(cid),
            tx_hash: None,
            created_at: None,
        }
    }

    fn memo_page(cids: std::ops::RangeInclusive<i64>, total: u64) -> MemoPage {
        MemoPage {
            items: cids.map(memo_item).collect(),
            total,
        }
    }

    fn http_503() -> Error {
        Error::sync("entry service returned status 503")
            .with_detail(ErrorDetail::http(Some(503), "http://indexer", None))
    }

    #[async_trait::async_trait]
    impl EntrySource for ScriptedSource {
        async fn list_memos(
            &self,
            _chain: &ChainConfig,
            _address: &str,
            _offset: u64,
            _limit: u64,
        ) -> Result<MemoPage> {
            self.memo_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.memo_pages.lock().unwrap().pop_front() {
                Some(page) => page,
                None => Ok(MemoPage {
                    items: Vec::new(),
                    total: 0,
                }),
            }
        }

        async fn list_nullifiers(
            &self,
            _chain: &ChainConfig,
            _address: &str,
            _offset: u64,
            _limit: u64,
        ) -> Result<NullifierPage> {
            match self.nullifier_pages.lock().unwrap().pop_front() {
                Some(page) => page,
                None => Ok(NullifierPage {
                    items: Vec::new(),
                    total: 0,
                    ready: true,
                }),
            }
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        store: Arc<MemoryStore>,
        wallet: Arc<FakeWallet>,
        source: Arc<ScriptedSource>,
        events: Arc<Mutex<Vec<SyncEvent>>>,
    }

    async fn harness_with(config: SyncConfig, source: ScriptedSource) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.init(Some("w")).await.unwrap();
        let accumulator = Arc::new(MerkleAccumulator::new(
            store.clone(),
            ProofMode::Hybrid,
            None,
        ));
        let wallet = Arc::new(FakeWallet::new());
        let source = Arc::new(source);
        let events: Arc<Mutex<Vec<SyncEvent>>> = Arc::new(Mutex::new(Vec::new()));

        let events_for_handler = events.clone();
        let engine = Arc::new(SyncEngine::new(
            config,
            vec![ChainConfig {
                chain_id: 1,
                entry_url: Some("http://indexer".into()),
                contract_address: Some("0xpool".into()),
                merkle_proof_url: None,
            }],
            store.clone(),
            accumulator,
            wallet.clone(),
            source.clone(),
            Some(Box::new(move |event| {
                events_for_handler.lock().unwrap().push(event);
            })),
        ));

        Harness {
            engine,
            store,
            wallet,
            source,
            events,
        }
    }

    async fn harness() -> Harness {
        harness_with(SyncConfig::default(), ScriptedSource::default()).await
    }

    #[tokio::test]
    async fn idempotent_resync_applies_only_new_cids() {
        let h = harness().await;

        // Cursor already at 10; the indexer re-serves cids 5..=14.
        h.store
            .set_sync_cursor(
                1,
                &SyncCursor {
                    memo: 10,
                    nullifier: 0,
                    merkle: 0,
                },
            )
            .await
            .unwrap();
        h.source.push_memo(Ok(memo_page(5..=14, 15)));

        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        let cursor = h.store.get_sync_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.memo, 15);
        assert_eq!(h.wallet.applied.load(Ordering::SeqCst), 5);

        // Same page again: everything below the cursor, nothing applied.
        h.source.push_memo(Ok(memo_page(5..=14, 15)));
        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        let cursor = h.store.get_sync_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.memo, 15);
        assert_eq!(h.wallet.applied.load(Ordering::SeqCst), 5);

        let status = h.engine.status();
        assert_eq!(status[0].memo.status, ResourceStatus::Synced);
    }

    #[tokio::test]
    async fn cursor_derivation_law_holds() {
        let h = harness().await;

        // 40 memos in one page (page_size > 40 closes the loop).
        h.source.push_memo(Ok(memo_page(0..=39, 40)));
        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        let cursor = h.store.get_sync_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.memo, 40);
        assert_eq!(cursor.merkle, (cursor.memo - 1) / 32);

        // At or below 32 the derived cursor pins to zero.
        h.store
            .set_sync_cursor(
                1,
                &SyncCursor {
                    memo: 32,
                    nullifier: 0,
                    merkle: 7,
                },
            )
            .await
            .unwrap();
        h.engine.sync_once(&SyncOptions::default()).await.unwrap();
        let cursor = h.store.get_sync_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.merkle, 0);
    }

    #[tokio::test]
    async fn partial_prefix_advances_then_errors() {
        let h = harness().await;

        // cids 0, 1, 3: the prefix 0..=1 lands, then the gap raises.
        let page = MemoPage {
            items: vec![memo_item(0), memo_item(1), memo_item(3)],
            total: 4,
        };
        h.source.push_memo(Ok(page));

        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        let cursor = h.store.get_sync_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.memo, 2, "cursor advances past the prefix first");
        assert_eq!(h.wallet.applied.load(Ordering::SeqCst), 2);

        let status = h.engine.status();
        assert_eq!(status[0].memo.status, ResourceStatus::Error);
        assert!(status[0].memo.error_message.as_ref().unwrap().contains("not contiguous"));
    }

    #[tokio::test]
    async fn retry_then_succeed_applies_page() {
        let config = SyncConfig {
            retry: RetryPolicy {
                attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 80,
            },
            ..Default::default()
        };
        let source = ScriptedSource::default();
        source.push_memo(Err(http_503()));
        source.push_memo(Err(http_503()));
        source.push_memo(Ok(memo_page(0..=4, 5)));
        let h = harness_with(config, source).await;

        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        assert_eq!(h.wallet.applied.load(Ordering::SeqCst), 5);
        assert_eq!(h.store.get_sync_cursor(1).await.unwrap().unwrap().memo, 5);
        assert_eq!(h.engine.status()[0].memo.status, ResourceStatus::Synced);
    }

    #[tokio::test]
    async fn retries_exhausted_marks_error_without_advance() {
        let config = SyncConfig {
            retry: RetryPolicy {
                attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 80,
            },
            ..Default::default()
        };
        let source = ScriptedSource::default();
        for _ in 0..3 {
            source.push_memo(Err(http_503()));
        }
        let h = harness_with(config, source).await;

        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        assert_eq!(h.source.memo_calls.load(Ordering::SeqCst), 3);
        assert!(h.store.get_sync_cursor(1).await.unwrap().is_none());
        let status = h.engine.status();
        assert_eq!(status[0].memo.status, ResourceStatus::Error);
        assert!(status[0]
            .memo
            .error_message
            .as_ref()
            .unwrap()
            .contains("503"));
    }

    #[tokio::test]
    async fn concurrent_sync_same_chain_skips() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let source = ScriptedSource {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        source.push_memo(Ok(MemoPage {
            items: Vec::new(),
            total: 0,
        }));
        let h = harness_with(SyncConfig::default(), source).await;

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.sync_once(&SyncOptions::default()).await });

        // Let the first call reach the gated fetch, then race a second one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        gate.notify_waiters();
        first.await.unwrap().unwrap();

        let events = h.events.lock().unwrap();
        let skipped = events
            .iter()
            .filter(|e| matches!(e, SyncEvent::Skipped { .. }))
            .count();
        assert_eq!(skipped, 1);
        assert_eq!(h.source.memo_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nullifiers_flow_to_wallet_and_mirror() {
        let h = harness().await;
        h.source.push_nullifiers(Ok(NullifierPage {
            items: vec![
                EntryNullifier {
                    nullifier: "0xaa".into(),
                    created_at: None,
                },
                EntryNullifier {
                    nullifier: "0xbb".into(),
                    created_at: Some(5),
                },
            ],
            total: 2,
            ready: true,
        }));

        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        assert_eq!(h.wallet.spent.load(Ordering::SeqCst), 2);
        let cursor = h.store.get_sync_cursor(1).await.unwrap().unwrap();
        assert_eq!(cursor.nullifier, 2);

        let mirror = h
            .store
            .list_entry_nullifiers(&veil_store::EntryNullifierQuery::chain(1))
            .await
            .unwrap();
        assert_eq!(mirror.total, 2);
        assert_eq!(mirror.rows[1].nid, 1);
    }

    #[tokio::test]
    async fn duplicate_nullifier_in_page_is_an_error() {
        let h = harness().await;
        h.source.push_nullifiers(Ok(NullifierPage {
            items: vec![
                EntryNullifier {
                    nullifier: "0xAA".into(),
                    created_at: None,
                },
                EntryNullifier {
                    nullifier: "0xaa".into(),
                    created_at: None,
                },
            ],
            total: 2,
            ready: true,
        }));

        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        let status = h.engine.status();
        assert_eq!(status[0].nullifier.status, ResourceStatus::Error);
        assert!(status[0]
            .nullifier
            .error_message
            .as_ref()
            .unwrap()
            .contains("duplicate"));
        assert_eq!(h.wallet.spent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn not_ready_index_breaks_quietly() {
        let h = harness().await;
        h.source.push_nullifiers(Ok(NullifierPage {
            items: Vec::new(),
            total: 9,
            ready: false,
        }));

        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        let status = h.engine.status();
        assert_eq!(status[0].nullifier.status, ResourceStatus::Synced);

        // The same shape with ready=true violates the contract.
        h.source.push_nullifiers(Ok(NullifierPage {
            items: Vec::new(),
            total: 9,
            ready: true,
        }));
        h.engine.sync_once(&SyncOptions::default()).await.unwrap();
        let status = h.engine.status();
        assert_eq!(status[0].nullifier.status, ResourceStatus::Error);
        assert!(status[0]
            .nullifier
            .error_message
            .as_ref()
            .unwrap()
            .contains("empty before total"));
    }

    #[tokio::test]
    async fn merkle_without_memo_is_rejected() {
        let h = harness().await;
        let opts = SyncOptions {
            resources: vec![SyncResource::Merkle],
            ..Default::default()
        };
        h.engine.sync_once(&opts).await.unwrap();

        let status = h.engine.status();
        assert_eq!(status[0].merkle.status, ResourceStatus::Error);
        assert_eq!(h.source.memo_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abort_surfaces_as_aborted_without_advance() {
        let h = harness().await;
        h.source.push_memo(Ok(memo_page(0..=4, 5)));

        let opts = SyncOptions::default();
        opts.cancel.cancel();
        h.engine.sync_once(&opts).await.unwrap();

        assert!(h.store.get_sync_cursor(1).await.unwrap().is_none());
        let status = h.engine.status();
        assert_eq!(status[0].memo.status, ResourceStatus::Error);
        assert!(status[0]
            .memo
            .error_message
            .as_ref()
            .unwrap()
            .contains("Aborted"));

        // The chain still finished with a done event.
        let events = h.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, SyncEvent::Done { .. })));
    }

    #[tokio::test]
    async fn memo_pages_feed_the_accumulator() {
        let h = harness().await;
        // 33 contiguous memos: one full subtree plus one pending leaf.
        h.source.push_memo(Ok(memo_page(0..=32, 33)));
        h.engine.sync_once(&SyncOptions::default()).await.unwrap();

        let leaves = h.store.get_merkle_leaves(1).await.unwrap();
        assert_eq!(leaves.len(), 33);
        let tree = h.store.get_merkle_tree(1).await.unwrap().unwrap();
        assert_eq!(tree.total_elements, 32);
    }

    #[tokio::test]
    async fn missing_entry_config_fails_resources() {
        let store = Arc::new(MemoryStore::new());
        store.init(Some("w")).await.unwrap();
        let accumulator = Arc::new(MerkleAccumulator::new(
            store.clone(),
            ProofMode::Hybrid,
            None,
        ));
        let engine = SyncEngine::new(
            SyncConfig::default(),
            vec![ChainConfig {
                chain_id: 7,
                entry_url: None,
                contract_address: None,
                merkle_proof_url: None,
            }],
            store,
            accumulator,
            Arc::new(FakeWallet::new()),
            Arc::new(ScriptedSource::default()),
            None,
        );

        engine.sync_once(&SyncOptions::default()).await.unwrap();
        let status = engine.status();
        assert_eq!(status[0].memo.status, ResourceStatus::Error);
        assert_eq!(status[0].nullifier.status, ResourceStatus::Error);

        // Without continue_on_error the config error bubbles.
        let opts = SyncOptions {
            continue_on_error: false,
            ..Default::default()
        };
        let err = engine.sync_once(&opts).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Config);
    }
}
