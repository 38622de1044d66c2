//! Key-value storage adapter.
//!
//! The adapter logic is written against [`KeyValueBackend`], a minimal
//! get/put/delete/scan surface. [`SledBackend`] covers native targets; a
//! browser-indexed (IndexedDB) backend implements the same trait under
//! wasm without changing the adapter.
//!
//! Wallet state is coarse-grained (one JSON document per wallet id); the
//! chain caches are incremental with one key per record plus a maintained
//! leaf-count index. Every write goes through the adapter mutex, so writes
//! to the backend are serialized.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use veil_types::{Error, Hex, Result};

use crate::memory::{merge_utxo, utxo_key};
use crate::query::{self, EntryMemoQuery, EntryNullifierQuery, OperationQuery, Page, UtxoQuery};
use crate::{
    EntryMemoRecord, EntryNullifierRecord, MerkleLeafRecord, MerkleNodeRecord, MerkleTreeState,
    OperationRecord, StorageAdapter, SyncCursor, UtxoRecord, DEFAULT_WALLET,
};

/// Minimal synchronous key-value surface the adapter is generic over.
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Key-ordered scan of every entry under `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Sled-backed implementation for native targets.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| Error::storage(format!("open sled db: {}", e)).with_source(e))?;
        Ok(Self { db })
    }
}

fn sled_err(e: sled::Error) -> Error {
    Error::storage(format!("sled: {}", e)).with_source(e)
}

impl KeyValueBackend for SledBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key).map_err(sled_err)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.insert(key, value).map_err(sled_err)?;
        self.db.flush().map_err(sled_err)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key).map_err(sled_err)?;
        self.db.flush().map_err(sled_err)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(sled_err)?;
            let key = String::from_utf8_lossy(&k).to_string();
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WalletDoc {
    cursors: HashMap<String, SyncCursor>,
    utxos: Vec<UtxoRecord>,
    operations: Vec<OperationRecord>,
}

struct Inner {
    wallet_id: Option<String>,
    wallet: WalletDoc,
}

/// Storage adapter over any [`KeyValueBackend`].
pub struct KvStore {
    backend: Box<dyn KeyValueBackend>,
    inner: Mutex<Inner>,
}

fn wallet_key(id: &str) -> String {
    format!("wallet/{}", id)
}

fn leaf_key(chain_id: u64, cid: u64) -> String {
    format!("chain/{}/leaf/{:020}", chain_id, cid)
}

fn leaf_count_key(chain_id: u64) -> String {
    format!("chain/{}/leaf_count", chain_id)
}

fn node_key(chain_id: u64, id: &str) -> String {
    format!("chain/{}/node/{}", chain_id, id)
}

fn tree_key(chain_id: u64) -> String {
    format!("chain/{}/tree", chain_id)
}

fn memo_key(chain_id: u64, cid: u64) -> String {
    format!("chain/{}/memo/{:020}", chain_id, cid)
}

fn nullifier_key(chain_id: u64, nid: u64) -> String {
    format!("chain/{}/nullifier/{:020}", chain_id, nid)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::storage(format!("serialize record: {}", e)))
}

fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::storage(format!("corrupt record: {}", e)))
}

impl KvStore {
    pub fn new(backend: Box<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(Inner {
                wallet_id: None,
                wallet: WalletDoc::default(),
            }),
        }
    }

    fn persist_wallet(&self, inner: &Inner) -> Result<()> {
        let id = inner
            .wallet_id
            .as_deref()
            .ok_or_else(|| Error::storage("storage not initialized: call init first"))?;
        self.backend.put(&wallet_key(id), &to_json(&inner.wallet)?)
    }

    fn with_wallet<R>(&self, f: impl FnOnce(&mut WalletDoc) -> Result<(R, bool)>) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        if inner.wallet_id.is_none() {
            return Err(Error::storage("storage not initialized: call init first"));
        }
        let (result, dirty) = f(&mut inner.wallet)?;
        if dirty {
            self.persist_wallet(&inner)?;
        }
        Ok(result)
    }

    fn stored_leaf_count(&self, chain_id: u64) -> Result<u64> {
        match self.backend.get(&leaf_count_key(chain_id))? {
            Some(bytes) => from_json(&bytes),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl StorageAdapter for KvStore {
    async fn init(&self, wallet_id: Option<&str>) -> Result<()> {
        let wallet_id = wallet_id.unwrap_or(DEFAULT_WALLET).to_string();
        let wallet = match self.backend.get(&wallet_key(&wallet_id))? {
            Some(bytes) => from_json(&bytes)?,
            None => WalletDoc::default(),
        };

        let mut inner = self.inner.lock().unwrap();
        inner.wallet = wallet;
        inner.wallet_id = Some(wallet_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.wallet_id.is_some() {
            self.persist_wallet(&inner)?;
        }
        inner.wallet_id = None;
        inner.wallet = WalletDoc::default();
        Ok(())
    }

    async fn get_sync_cursor(&self, chain_id: u64) -> Result<Option<SyncCursor>> {
        self.with_wallet(|w| Ok((w.cursors.get(&chain_id.to_string()).cloned(), false)))
    }

    async fn set_sync_cursor(&self, chain_id: u64, cursor: &SyncCursor) -> Result<()> {
        self.with_wallet(|w| {
            w.cursors.insert(chain_id.to_string(), cursor.clone());
            Ok(((), true))
        })
    }

    async fn upsert_utxos(&self, utxos: &[UtxoRecord]) -> Result<()> {
        self.with_wallet(|w| {
            for utxo in utxos {
                let key = utxo_key(utxo.chain_id, &utxo.commitment);
                match w
                    .utxos
                    .iter_mut()
                    .find(|u| utxo_key(u.chain_id, &u.commitment) == key)
                {
                    Some(existing) => *existing = merge_utxo(Some(existing), utxo),
                    None => w.utxos.push(utxo.clone()),
                }
            }
            Ok(((), true))
        })
    }

    async fn list_utxos(&self, q: &UtxoQuery) -> Result<Page<UtxoRecord>> {
        let rows = self.with_wallet(|w| Ok((w.utxos.clone(), false)))?;
        Ok(query::page_utxos(rows, q))
    }

    async fn mark_spent(&self, chain_id: u64, nullifiers: &[Hex]) -> Result<u64> {
        let targets: Vec<String> = nullifiers.iter().map(|n| n.to_lowercase()).collect();
        self.with_wallet(|w| {
            let mut count = 0u64;
            for utxo in w.utxos.iter_mut() {
                if utxo.chain_id == chain_id
                    && !utxo.is_spent
                    && targets.contains(&utxo.nullifier.to_lowercase())
                {
                    utxo.is_spent = true;
                    count += 1;
                }
            }
            Ok((count, count > 0))
        })
    }

    async fn put_operation(&self, op: &OperationRecord) -> Result<()> {
        self.with_wallet(|w| {
            match w.operations.iter_mut().find(|o| o.id == op.id) {
                Some(existing) => *existing = op.clone(),
                None => w.operations.push(op.clone()),
            }
            Ok(((), true))
        })
    }

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        self.with_wallet(|w| Ok((w.operations.iter().find(|o| o.id == id).cloned(), false)))
    }

    async fn list_operations(&self, q: &OperationQuery) -> Result<Page<OperationRecord>> {
        let rows = self.with_wallet(|w| Ok((w.operations.clone(), false)))?;
        Ok(query::page_operations(rows, q))
    }

    async fn delete_operations(&self, ids: &[String]) -> Result<()> {
        self.with_wallet(|w| {
            w.operations.retain(|o| !ids.contains(&o.id));
            Ok(((), true))
        })
    }

    async fn prune_operations(&self, max: usize) -> Result<Vec<String>> {
        self.with_wallet(|w| {
            if w.operations.len() <= max {
                return Ok((Vec::new(), false));
            }
            let mut ops: Vec<(u64, String)> = w
                .operations
                .iter()
                .map(|op| (op.created_at, op.id.clone()))
                .collect();
            ops.sort();
            let drop_count = w.operations.len() - max;
            let dropped: Vec<String> = ops.into_iter().take(drop_count).map(|(_, id)| id).collect();
            w.operations.retain(|o| !dropped.contains(&o.id));
            Ok((dropped, true))
        })
    }

    fn supports_local_merkle(&self) -> bool {
        true
    }

    async fn append_merkle_leaves(&self, chain_id: u64, leaves: &[MerkleLeafRecord]) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        let mut expected = self.stored_leaf_count(chain_id)?;
        for leaf in leaves {
            if leaf.cid != expected {
                return Err(Error::merkle(format!(
                    "merkle leaves not contiguous: expected cid {}, got {}",
                    expected, leaf.cid
                )));
            }
            expected += 1;
        }
        for leaf in leaves {
            self.backend.put(&leaf_key(chain_id, leaf.cid), &to_json(leaf)?)?;
        }
        self.backend
            .put(&leaf_count_key(chain_id), &to_json(&expected)?)
    }

    async fn get_merkle_leaves(&self, chain_id: u64) -> Result<Vec<MerkleLeafRecord>> {
        let entries = self
            .backend
            .scan_prefix(&format!("chain/{}/leaf/", chain_id))?;
        entries.iter().map(|(_, v)| from_json(v)).collect()
    }

    async fn get_merkle_leaf(&self, chain_id: u64, cid: u64) -> Result<Option<MerkleLeafRecord>> {
        match self.backend.get(&leaf_key(chain_id, cid))? {
            Some(bytes) => Ok(Some(from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_merkle_node(&self, chain_id: u64, id: &str) -> Result<Option<MerkleNodeRecord>> {
        match self.backend.get(&node_key(chain_id, id))? {
            Some(bytes) => Ok(Some(from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn upsert_merkle_nodes(&self, chain_id: u64, nodes: &[MerkleNodeRecord]) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        for node in nodes {
            self.backend.put(&node_key(chain_id, &node.id), &to_json(node)?)?;
        }
        Ok(())
    }

    async fn get_merkle_tree(&self, chain_id: u64) -> Result<Option<MerkleTreeState>> {
        match self.backend.get(&tree_key(chain_id))? {
            Some(bytes) => Ok(Some(from_json(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_merkle_tree(&self, chain_id: u64, state: &MerkleTreeState) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        self.backend.put(&tree_key(chain_id), &to_json(state)?)
    }

    async fn clear_merkle_tree(&self, chain_id: u64) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        for prefix in ["leaf", "node"] {
            for (key, _) in self
                .backend
                .scan_prefix(&format!("chain/{}/{}/", chain_id, prefix))?
            {
                self.backend.delete(&key)?;
            }
        }
        self.backend.delete(&leaf_count_key(chain_id))?;
        self.backend.delete(&tree_key(chain_id))
    }

    async fn upsert_entry_memos(&self, chain_id: u64, memos: &[EntryMemoRecord]) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        for memo in memos {
            self.backend.put(&memo_key(chain_id, memo.cid), &to_json(memo)?)?;
        }
        Ok(())
    }

    async fn list_entry_memos(&self, q: &EntryMemoQuery) -> Result<Page<EntryMemoRecord>> {
        let entries = self
            .backend
            .scan_prefix(&format!("chain/{}/memo/", q.chain_id))?;
        let rows: Result<Vec<EntryMemoRecord>> =
            entries.iter().map(|(_, v)| from_json(v)).collect();
        Ok(query::page_entry_memos(rows?, q))
    }

    async fn clear_entry_memos(&self, chain_id: u64) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        for (key, _) in self
            .backend
            .scan_prefix(&format!("chain/{}/memo/", chain_id))?
        {
            self.backend.delete(&key)?;
        }
        Ok(())
    }

    async fn upsert_entry_nullifiers(
        &self,
        chain_id: u64,
        nullifiers: &[EntryNullifierRecord],
    ) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        for n in nullifiers {
            self.backend.put(&nullifier_key(chain_id, n.nid), &to_json(n)?)?;
        }
        Ok(())
    }

    async fn list_entry_nullifiers(
        &self,
        q: &EntryNullifierQuery,
    ) -> Result<Page<EntryNullifierRecord>> {
        let entries = self
            .backend
            .scan_prefix(&format!("chain/{}/nullifier/", q.chain_id))?;
        let rows: Result<Vec<EntryNullifierRecord>> =
            entries.iter().map(|(_, v)| from_json(v)).collect();
        Ok(query::page_entry_nullifiers(rows?, q))
    }

    async fn clear_entry_nullifiers(&self, chain_id: u64) -> Result<()> {
        let _guard = self.inner.lock().unwrap();
        for (key, _) in self
            .backend
            .scan_prefix(&format!("chain/{}/nullifier/", chain_id))?
        {
            self.backend.delete(&key)?;
        }
        Ok(())
    }
}
