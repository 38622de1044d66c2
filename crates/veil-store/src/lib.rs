//! Storage layer for the Veil SDK.
//!
//! `StorageAdapter` is the capability every backend implements: in-memory,
//! file, key-value and embedded SQL live here; a browser-indexed backend
//! plugs in through [`kv::KeyValueBackend`]. All adapters preserve the same
//! invariants: wallet-scoped isolation, spent-flag preservation on upsert,
//! contiguous merkle leaf appends, and shared chain caches across wallets.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use veil_types::{Amount, Hex, Result};

pub mod file;
pub mod kv;
pub mod memory;
pub mod query;
pub mod sqlite;

pub use query::{
    EntryMemoQuery, EntryNullifierQuery, OperationQuery, OrderBy, Page, SortOrder, UtxoQuery,
};

/// Per-(wallet, chain) sync progress.
///
/// `merkle` is derived from `memo`: ⌊(memo − 1) / 32⌋ once memo > 32,
/// otherwise 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncCursor {
    pub memo: u64,
    pub nullifier: u64,
    pub merkle: u64,
}

/// A shielded UTXO owned by the current wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoRecord {
    pub chain_id: u64,
    pub commitment: Hex,
    pub asset_id: String,
    pub token_id: Option<String>,
    #[serde(with = "veil_types::amount_serde")]
    pub amount: Amount,
    pub nullifier: Hex,
    pub mk_index: u64,
    pub is_frozen: bool,
    pub is_spent: bool,
    pub memo: Option<Hex>,
    pub created_at: Option<u64>,
}

/// Operation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Created,
    Submitted,
    Confirmed,
    Failed,
}

/// A tracked user operation (deposit / transfer / withdraw / ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub op_type: String,
    pub status: OperationStatus,
    pub created_at: u64,
    pub chain_id: Option<u64>,
    pub token_id: Option<String>,
    pub request_url: Option<String>,
    pub relayer_tx_hash: Option<Hex>,
    pub tx_hash: Option<Hex>,
    pub detail: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// One leaf of the chain-scoped commitment tree. Cids per chain form a
/// contiguous 0..N sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleLeafRecord {
    pub chain_id: u64,
    pub cid: u64,
    pub commitment: Hex,
}

/// An interior or frontier node, keyed `"{level}-{position}"` or
/// `"frontier-{level}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleNodeRecord {
    pub chain_id: u64,
    pub id: String,
    pub level: u32,
    pub position: u64,
    pub hash: Hex,
}

/// Tree metadata per chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleTreeState {
    pub chain_id: u64,
    pub root: Hex,
    pub total_elements: u64,
    pub last_updated: u64,
}

/// Mirror of one entry-indexer memo row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMemoRecord {
    pub chain_id: u64,
    pub cid: u64,
    pub commitment: Hex,
    pub memo: Hex,
    pub tx_hash: Option<Hex>,
    pub created_at: Option<u64>,
}

/// Mirror of one entry-indexer nullifier row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryNullifierRecord {
    pub chain_id: u64,
    pub nid: u64,
    pub nullifier: Hex,
    pub created_at: Option<u64>,
}

/// The storage capability.
///
/// Wallet-scoped data (cursors, UTXOs, operations) is partitioned by the
/// wallet selected in [`StorageAdapter::init`]; chain-scoped caches
/// (merkle, entry mirrors) are shared by every wallet on the same backing
/// store. Backends that cannot host the merkle cache keep the default
/// no-op implementations and report `supports_local_merkle() == false`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Select the active wallet. Switching wallets drops any wallet-scoped
    /// state held in memory so wallets sharing a backing store never leak
    /// into each other.
    async fn init(&self, wallet_id: Option<&str>) -> Result<()>;
    async fn close(&self) -> Result<()>;

    // --- Sync cursors ---
    async fn get_sync_cursor(&self, chain_id: u64) -> Result<Option<SyncCursor>>;
    async fn set_sync_cursor(&self, chain_id: u64, cursor: &SyncCursor) -> Result<()>;

    // --- UTXOs ---
    /// Upsert by (chain, commitment). A stored `is_spent = true` survives
    /// any later upsert of the same commitment.
    async fn upsert_utxos(&self, utxos: &[UtxoRecord]) -> Result<()>;
    async fn list_utxos(&self, query: &UtxoQuery) -> Result<Page<UtxoRecord>>;
    /// Case-insensitive nullifier match; idempotent. Returns the number of
    /// rows newly flipped to spent.
    async fn mark_spent(&self, chain_id: u64, nullifiers: &[Hex]) -> Result<u64>;

    // --- Operations ---
    async fn put_operation(&self, op: &OperationRecord) -> Result<()>;
    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>>;
    async fn list_operations(&self, query: &OperationQuery) -> Result<Page<OperationRecord>>;
    async fn delete_operations(&self, ids: &[String]) -> Result<()>;
    /// Drop oldest operations (by created_at) until at most `max` remain.
    /// Returns the deleted ids.
    async fn prune_operations(&self, max: usize) -> Result<Vec<String>>;

    // --- Merkle cache (optional) ---
    fn supports_local_merkle(&self) -> bool {
        false
    }
    /// Append leaves that must extend the persisted tail contiguously.
    async fn append_merkle_leaves(&self, _chain_id: u64, _leaves: &[MerkleLeafRecord]) -> Result<()> {
        Ok(())
    }
    async fn get_merkle_leaves(&self, _chain_id: u64) -> Result<Vec<MerkleLeafRecord>> {
        Ok(Vec::new())
    }
    async fn get_merkle_leaf(&self, _chain_id: u64, _cid: u64) -> Result<Option<MerkleLeafRecord>> {
        Ok(None)
    }
    async fn get_merkle_node(&self, _chain_id: u64, _id: &str) -> Result<Option<MerkleNodeRecord>> {
        Ok(None)
    }
    async fn upsert_merkle_nodes(&self, _chain_id: u64, _nodes: &[MerkleNodeRecord]) -> Result<()> {
        Ok(())
    }
    async fn get_merkle_tree(&self, _chain_id: u64) -> Result<Option<MerkleTreeState>> {
        Ok(None)
    }
    async fn set_merkle_tree(&self, _chain_id: u64, _state: &MerkleTreeState) -> Result<()> {
        Ok(())
    }
    async fn clear_merkle_tree(&self, _chain_id: u64) -> Result<()> {
        Ok(())
    }
    /// One subtree flush: nodes plus the tree state land together. Backends
    /// with transactions override this to make the batch atomic.
    async fn apply_merkle_batch(
        &self,
        chain_id: u64,
        nodes: &[MerkleNodeRecord],
        state: &MerkleTreeState,
    ) -> Result<()> {
        self.upsert_merkle_nodes(chain_id, nodes).await?;
        self.set_merkle_tree(chain_id, state).await
    }

    // --- Entry mirrors (optional) ---
    async fn upsert_entry_memos(&self, _chain_id: u64, _memos: &[EntryMemoRecord]) -> Result<()> {
        Ok(())
    }
    async fn list_entry_memos(&self, _query: &EntryMemoQuery) -> Result<Page<EntryMemoRecord>> {
        Ok(Page::empty())
    }
    async fn clear_entry_memos(&self, _chain_id: u64) -> Result<()> {
        Ok(())
    }
    async fn upsert_entry_nullifiers(
        &self,
        _chain_id: u64,
        _nullifiers: &[EntryNullifierRecord],
    ) -> Result<()> {
        Ok(())
    }
    async fn list_entry_nullifiers(
        &self,
        _query: &EntryNullifierQuery,
    ) -> Result<Page<EntryNullifierRecord>> {
        Ok(Page::empty())
    }
    async fn clear_entry_nullifiers(&self, _chain_id: u64) -> Result<()> {
        Ok(())
    }
}

pub(crate) const DEFAULT_WALLET: &str = "default";
