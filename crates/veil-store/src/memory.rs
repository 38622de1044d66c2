//! In-memory storage adapter. No persistence; cleared with the process.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use veil_types::{Error, Hex, Result};

use crate::query::{self, EntryMemoQuery, EntryNullifierQuery, OperationQuery, Page, UtxoQuery};
use crate::{
    EntryMemoRecord, EntryNullifierRecord, MerkleLeafRecord, MerkleNodeRecord, MerkleTreeState,
    OperationRecord, StorageAdapter, SyncCursor, UtxoRecord, DEFAULT_WALLET,
};

#[derive(Default)]
pub(crate) struct WalletData {
    pub cursors: HashMap<u64, SyncCursor>,
    /// Keyed by (chain_id, lowercase commitment).
    pub utxos: BTreeMap<(u64, String), UtxoRecord>,
    pub operations: HashMap<String, OperationRecord>,
}

#[derive(Default)]
pub(crate) struct ChainData {
    pub leaves: Vec<MerkleLeafRecord>,
    pub nodes: HashMap<String, MerkleNodeRecord>,
    pub tree: Option<MerkleTreeState>,
    pub entry_memos: BTreeMap<u64, EntryMemoRecord>,
    pub entry_nullifiers: BTreeMap<u64, EntryNullifierRecord>,
}

#[derive(Default)]
struct Inner {
    wallet_id: Option<String>,
    wallets: HashMap<String, WalletData>,
    chains: HashMap<u64, ChainData>,
}

/// In-memory adapter; the reference implementation the other backends are
/// tested against.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_wallet<R>(&self, f: impl FnOnce(&mut WalletData) -> R) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        let wallet_id = inner
            .wallet_id
            .clone()
            .ok_or_else(|| Error::storage("storage not initialized: call init first"))?;
        Ok(f(inner.wallets.entry(wallet_id).or_default()))
    }

    fn with_chain<R>(&self, chain_id: u64, f: impl FnOnce(&mut ChainData) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(inner.chains.entry(chain_id).or_default())
    }
}

/// Shared upsert rule: a stored spent flag can never be cleared.
pub(crate) fn merge_utxo(existing: Option<&UtxoRecord>, incoming: &UtxoRecord) -> UtxoRecord {
    let mut merged = incoming.clone();
    if let Some(existing) = existing {
        if existing.is_spent {
            merged.is_spent = true;
        }
    }
    merged
}

pub(crate) fn utxo_key(chain_id: u64, commitment: &str) -> (u64, String) {
    (chain_id, commitment.to_lowercase())
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn init(&self, wallet_id: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.wallet_id = Some(wallet_id.unwrap_or(DEFAULT_WALLET).to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.wallet_id = None;
        Ok(())
    }

    async fn get_sync_cursor(&self, chain_id: u64) -> Result<Option<SyncCursor>> {
        self.with_wallet(|w| w.cursors.get(&chain_id).cloned())
    }

    async fn set_sync_cursor(&self, chain_id: u64, cursor: &SyncCursor) -> Result<()> {
        self.with_wallet(|w| {
            w.cursors.insert(chain_id, cursor.clone());
        })
    }

    async fn upsert_utxos(&self, utxos: &[UtxoRecord]) -> Result<()> {
        self.with_wallet(|w| {
            for utxo in utxos {
                let key = utxo_key(utxo.chain_id, &utxo.commitment);
                let merged = merge_utxo(w.utxos.get(&key), utxo);
                w.utxos.insert(key, merged);
            }
        })
    }

    async fn list_utxos(&self, q: &UtxoQuery) -> Result<Page<UtxoRecord>> {
        let rows = self.with_wallet(|w| w.utxos.values().cloned().collect::<Vec<_>>())?;
        Ok(query::page_utxos(rows, q))
    }

    async fn mark_spent(&self, chain_id: u64, nullifiers: &[Hex]) -> Result<u64> {
        let targets: Vec<String> = nullifiers.iter().map(|n| n.to_lowercase()).collect();
        self.with_wallet(|w| {
            let mut count = 0u64;
            for utxo in w.utxos.values_mut() {
                if utxo.chain_id == chain_id
                    && !utxo.is_spent
                    && targets.contains(&utxo.nullifier.to_lowercase())
                {
                    utxo.is_spent = true;
                    count += 1;
                }
            }
            count
        })
    }

    async fn put_operation(&self, op: &OperationRecord) -> Result<()> {
        self.with_wallet(|w| {
            w.operations.insert(op.id.clone(), op.clone());
        })
    }

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        self.with_wallet(|w| w.operations.get(id).cloned())
    }

    async fn list_operations(&self, q: &OperationQuery) -> Result<Page<OperationRecord>> {
        let rows = self.with_wallet(|w| w.operations.values().cloned().collect::<Vec<_>>())?;
        Ok(query::page_operations(rows, q))
    }

    async fn delete_operations(&self, ids: &[String]) -> Result<()> {
        self.with_wallet(|w| {
            for id in ids {
                w.operations.remove(id);
            }
        })
    }

    async fn prune_operations(&self, max: usize) -> Result<Vec<String>> {
        self.with_wallet(|w| {
            if w.operations.len() <= max {
                return Vec::new();
            }
            let mut ops: Vec<(u64, String)> = w
                .operations
                .values()
                .map(|op| (op.created_at, op.id.clone()))
                .collect();
            // Oldest first.
            ops.sort();
            let drop_count = w.operations.len() - max;
            let dropped: Vec<String> = ops.into_iter().take(drop_count).map(|(_, id)| id).collect();
            for id in &dropped {
                w.operations.remove(id);
            }
            dropped
        })
    }

    fn supports_local_merkle(&self) -> bool {
        true
    }

    async fn append_merkle_leaves(&self, chain_id: u64, leaves: &[MerkleLeafRecord]) -> Result<()> {
        self.with_chain(chain_id, |c| {
            let mut expected = c.leaves.len() as u64;
            for leaf in leaves {
                if leaf.cid != expected {
                    return Err(Error::merkle(format!(
                        "merkle leaves not contiguous: expected cid {}, got {}",
                        expected, leaf.cid
                    )));
                }
                expected += 1;
            }
            c.leaves.extend(leaves.iter().cloned());
            Ok(())
        })
    }

    async fn get_merkle_leaves(&self, chain_id: u64) -> Result<Vec<MerkleLeafRecord>> {
        Ok(self.with_chain(chain_id, |c| c.leaves.clone()))
    }

    async fn get_merkle_leaf(&self, chain_id: u64, cid: u64) -> Result<Option<MerkleLeafRecord>> {
        Ok(self.with_chain(chain_id, |c| c.leaves.get(cid as usize).cloned()))
    }

    async fn get_merkle_node(&self, chain_id: u64, id: &str) -> Result<Option<MerkleNodeRecord>> {
        Ok(self.with_chain(chain_id, |c| c.nodes.get(id).cloned()))
    }

    async fn upsert_merkle_nodes(&self, chain_id: u64, nodes: &[MerkleNodeRecord]) -> Result<()> {
        self.with_chain(chain_id, |c| {
            for node in nodes {
                c.nodes.insert(node.id.clone(), node.clone());
            }
        });
        Ok(())
    }

    async fn get_merkle_tree(&self, chain_id: u64) -> Result<Option<MerkleTreeState>> {
        Ok(self.with_chain(chain_id, |c| c.tree.clone()))
    }

    async fn set_merkle_tree(&self, chain_id: u64, state: &MerkleTreeState) -> Result<()> {
        self.with_chain(chain_id, |c| c.tree = Some(state.clone()));
        Ok(())
    }

    async fn clear_merkle_tree(&self, chain_id: u64) -> Result<()> {
        self.with_chain(chain_id, |c| {
            c.leaves.clear();
            c.nodes.clear();
            c.tree = None;
        });
        Ok(())
    }

    async fn upsert_entry_memos(&self, chain_id: u64, memos: &[EntryMemoRecord]) -> Result<()> {
        self.with_chain(chain_id, |c| {
            for memo in memos {
                c.entry_memos.insert(memo.cid, memo.clone());
            }
        });
        Ok(())
    }

    async fn list_entry_memos(&self, q: &EntryMemoQuery) -> Result<Page<EntryMemoRecord>> {
        let rows = self.with_chain(q.chain_id, |c| {
            c.entry_memos.values().cloned().collect::<Vec<_>>()
        });
        Ok(query::page_entry_memos(rows, q))
    }

    async fn clear_entry_memos(&self, chain_id: u64) -> Result<()> {
        self.with_chain(chain_id, |c| c.entry_memos.clear());
        Ok(())
    }

    async fn upsert_entry_nullifiers(
        &self,
        chain_id: u64,
        nullifiers: &[EntryNullifierRecord],
    ) -> Result<()> {
        self.with_chain(chain_id, |c| {
            for n in nullifiers {
                c.entry_nullifiers.insert(n.nid, n.clone());
            }
        });
        Ok(())
    }

    async fn list_entry_nullifiers(
        &self,
        q: &EntryNullifierQuery,
    ) -> Result<Page<EntryNullifierRecord>> {
        let rows = self.with_chain(q.chain_id, |c| {
            c.entry_nullifiers.values().cloned().collect::<Vec<_>>()
        });
        Ok(query::page_entry_nullifiers(rows, q))
    }

    async fn clear_entry_nullifiers(&self, chain_id: u64) -> Result<()> {
        self.with_chain(chain_id, |c| c.entry_nullifiers.clear());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    fn utxo(chain_id: u64, commitment: &str, nullifier: &str, spent: bool) -> UtxoRecord {
        UtxoRecord {
            chain_id,
            commitment: commitment.to_string(),
            asset_id: "0x01".into(),
            token_id: None,
            amount: BigUint::from(1000u32),
            nullifier: nullifier.to_string(),
            mk_index: 0,
            is_frozen: false,
            is_spent: spent,
            memo: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn spent_flag_survives_upsert() {
        let store = MemoryStore::new();
        store.init(Some("w")).await.unwrap();

        store
            .upsert_utxos(&[utxo(1, "0x01", "0xAA", false)])
            .await
            .unwrap();
        let n = store.mark_spent(1, &["0xaa".to_string()]).await.unwrap();
        assert_eq!(n, 1);

        // Re-upsert with is_spent = false; the stored flag must hold.
        store
            .upsert_utxos(&[utxo(1, "0x01", "0xAA", false)])
            .await
            .unwrap();
        let page = store
            .list_utxos(&UtxoQuery {
                include_spent: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(page.rows[0].is_spent);
    }

    #[tokio::test]
    async fn mark_spent_is_case_insensitive_and_idempotent() {
        let store = MemoryStore::new();
        store.init(Some("w")).await.unwrap();

        store
            .upsert_utxos(&[utxo(1, "0x01", "0xAbCd", false)])
            .await
            .unwrap();
        assert_eq!(store.mark_spent(1, &["0xABCD".into()]).await.unwrap(), 1);
        assert_eq!(store.mark_spent(1, &["0xabcd".into()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wallets_are_isolated_but_share_chain_caches() {
        let store = MemoryStore::new();
        store.init(Some("wallet-a")).await.unwrap();
        store
            .set_sync_cursor(
                5,
                &SyncCursor {
                    memo: 7,
                    nullifier: 3,
                    merkle: 0,
                },
            )
            .await
            .unwrap();
        store
            .append_merkle_leaves(
                5,
                &[MerkleLeafRecord {
                    chain_id: 5,
                    cid: 0,
                    commitment: "0x01".into(),
                }],
            )
            .await
            .unwrap();
        store.close().await.unwrap();

        store.init(Some("wallet-b")).await.unwrap();
        assert!(store.get_sync_cursor(5).await.unwrap().is_none());
        assert_eq!(
            store
                .list_utxos(&UtxoQuery::default())
                .await
                .unwrap()
                .total,
            0
        );
        // Chain-scoped caches are shared.
        assert_eq!(store.get_merkle_leaves(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_contiguous_leaf_append_is_rejected() {
        let store = MemoryStore::new();
        store.init(None).await.unwrap();

        let leaf = |cid| MerkleLeafRecord {
            chain_id: 1,
            cid,
            commitment: format!("0x{:02x}", cid),
        };
        store.append_merkle_leaves(1, &[leaf(0), leaf(1)]).await.unwrap();
        let err = store.append_merkle_leaves(1, &[leaf(3)]).await.unwrap_err();
        assert_eq!(err.code, veil_types::ErrorCode::Merkle);
        // Tail unchanged.
        assert_eq!(store.get_merkle_leaves(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prune_drops_oldest_operations() {
        let store = MemoryStore::new();
        store.init(None).await.unwrap();

        for i in 0..5u64 {
            store
                .put_operation(&OperationRecord {
                    id: format!("op-{}", i),
                    op_type: "transfer".into(),
                    status: crate::OperationStatus::Created,
                    created_at: 1000 + i,
                    chain_id: Some(1),
                    token_id: None,
                    request_url: None,
                    relayer_tx_hash: None,
                    tx_hash: None,
                    detail: None,
                    error: None,
                })
                .await
                .unwrap();
        }

        let dropped = store.prune_operations(3).await.unwrap();
        assert_eq!(dropped, vec!["op-0".to_string(), "op-1".to_string()]);
        assert!(store.get_operation("op-0").await.unwrap().is_none());
        assert!(store.get_operation("op-4").await.unwrap().is_some());
        // Idempotent.
        assert!(store.prune_operations(3).await.unwrap().is_empty());
    }
}
