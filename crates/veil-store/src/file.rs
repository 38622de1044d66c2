//! File-backed storage adapter.
//!
//! Layout inside the chosen directory:
//! - `wallet-{id}.store.json` — cursors, UTXOs and operations for one wallet
//! - `shared.store.json` — chain-scoped caches shared by every wallet
//! - `merkle-leaves-{chain}.jsonl` — append-only leaf log per chain
//!
//! JSON files are replaced via temp-file + atomic rename; the leaf log is
//! append-only. All writes go through one mutex, so they are serialized.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use veil_types::{Error, Hex, Result};

use crate::memory::{merge_utxo, utxo_key};
use crate::query::{self, EntryMemoQuery, EntryNullifierQuery, OperationQuery, Page, UtxoQuery};
use crate::{
    EntryMemoRecord, EntryNullifierRecord, MerkleLeafRecord, MerkleNodeRecord, MerkleTreeState,
    OperationRecord, StorageAdapter, SyncCursor, UtxoRecord, DEFAULT_WALLET,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WalletFile {
    cursors: HashMap<String, SyncCursor>,
    utxos: Vec<UtxoRecord>,
    operations: Vec<OperationRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SharedChain {
    nodes: HashMap<String, MerkleNodeRecord>,
    tree: Option<MerkleTreeState>,
    entry_memos: Vec<EntryMemoRecord>,
    entry_nullifiers: Vec<EntryNullifierRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SharedFile {
    chains: HashMap<String, SharedChain>,
}

#[derive(Default)]
struct Inner {
    wallet_id: Option<String>,
    wallet: WalletFile,
    shared: SharedFile,
    /// Leaf-log lengths, filled lazily per chain.
    leaf_counts: HashMap<u64, u64>,
}

/// Durable single-directory store for native targets.
pub struct FileStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

fn io_err(context: &str, e: std::io::Error) -> Error {
    Error::storage(format!("{}: {}", context, e)).with_source(e)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp).map_err(|e| io_err("create temp file", e))?;
        f.write_all(bytes).map_err(|e| io_err("write temp file", e))?;
        f.sync_all().map_err(|e| io_err("sync temp file", e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err("rename temp file", e))
}

fn sanitize_wallet_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl FileStore {
    /// Open (creating the directory if needed). The shared store is loaded
    /// eagerly; wallet state loads on `init`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_err("create store directory", e))?;

        let store = Self {
            dir,
            inner: Mutex::new(Inner::default()),
        };
        {
            let mut inner = store.inner.lock().unwrap();
            inner.shared = store.load_json(&store.shared_path())?.unwrap_or_default();
        }
        Ok(store)
    }

    fn wallet_path(&self, wallet_id: &str) -> PathBuf {
        self.dir
            .join(format!("wallet-{}.store.json", sanitize_wallet_id(wallet_id)))
    }

    fn shared_path(&self) -> PathBuf {
        self.dir.join("shared.store.json")
    }

    fn leaves_path(&self, chain_id: u64) -> PathBuf {
        self.dir.join(format!("merkle-leaves-{}.jsonl", chain_id))
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::storage(format!("corrupt store file {:?}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read store file", e)),
        }
    }

    fn persist_wallet(&self, inner: &Inner) -> Result<()> {
        let wallet_id = inner
            .wallet_id
            .as_deref()
            .ok_or_else(|| Error::storage("storage not initialized: call init first"))?;
        let bytes = serde_json::to_vec_pretty(&inner.wallet)
            .map_err(|e| Error::storage(format!("serialize wallet state: {}", e)))?;
        write_atomic(&self.wallet_path(wallet_id), &bytes)
    }

    fn persist_shared(&self, inner: &Inner) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&inner.shared)
            .map_err(|e| Error::storage(format!("serialize shared state: {}", e)))?;
        write_atomic(&self.shared_path(), &bytes)
    }

    fn with_wallet<R>(
        &self,
        f: impl FnOnce(&mut WalletFile) -> Result<(R, bool)>,
    ) -> Result<R> {
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

    fn with_shared<R>(
        &self,
        chain_id: u64,
        f: impl FnOnce(&mut SharedChain) -> Result<(R, bool)>,
    ) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        let chain = inner
            .shared
            .chains
            .entry(chain_id.to_string())
            .or_default();
        let (result, dirty) = f(chain)?;
        if dirty {
            self.persist_shared(&inner)?;
        }
        Ok(result)
    }

    fn leaf_count(&self, inner: &mut Inner, chain_id: u64) -> Result<u64> {
        if let Some(count) = inner.leaf_counts.get(&chain_id) {
            return Ok(*count);
        }
        let count = self.read_leaves(chain_id)?.len() as u64;
        inner.leaf_counts.insert(chain_id, count);
        Ok(count)
    }

    fn read_leaves(&self, chain_id: u64) -> Result<Vec<MerkleLeafRecord>> {
        let path = self.leaves_path(chain_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("read leaf log", e)),
        };
        let mut leaves = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let leaf: MerkleLeafRecord = serde_json::from_str(line)
                .map_err(|e| Error::storage(format!("corrupt leaf log {:?}: {}", path, e)))?;
            leaves.push(leaf);
        }
        Ok(leaves)
    }
}

#[async_trait]
impl StorageAdapter for FileStore {
    async fn init(&self, wallet_id: Option<&str>) -> Result<()> {
        let wallet_id = wallet_id.unwrap_or(DEFAULT_WALLET).to_string();
        let loaded = self
            .load_json::<WalletFile>(&self.wallet_path(&wallet_id))?
            .unwrap_or_default();

        let mut inner = self.inner.lock().unwrap();
        // Replace, never merge: the previous wallet's state must not leak.
        inner.wallet = loaded;
        inner.wallet_id = Some(wallet_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.wallet_id.is_some() {
            self.persist_wallet(&inner)?;
        }
        inner.wallet_id = None;
        inner.wallet = WalletFile::default();
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
        let mut inner = self.inner.lock().unwrap();
        let mut expected = self.leaf_count(&mut inner, chain_id)?;
        for leaf in leaves {
            if leaf.cid != expected {
                return Err(Error::merkle(format!(
                    "merkle leaves not contiguous: expected cid {}, got {}",
                    expected, leaf.cid
                )));
            }
            expected += 1;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.leaves_path(chain_id))
            .map_err(|e| io_err("open leaf log", e))?;
        for leaf in leaves {
            let line = serde_json::to_string(leaf)
                .map_err(|e| Error::storage(format!("serialize leaf: {}", e)))?;
            writeln!(file, "{}", line).map_err(|e| io_err("append leaf log", e))?;
        }
        file.sync_all().map_err(|e| io_err("sync leaf log", e))?;

        inner.leaf_counts.insert(chain_id, expected);
        Ok(())
    }

    async fn get_merkle_leaves(&self, chain_id: u64) -> Result<Vec<MerkleLeafRecord>> {
        // Hold the lock so reads serialize with appends.
        let _inner = self.inner.lock().unwrap();
        self.read_leaves(chain_id)
    }

    async fn get_merkle_leaf(&self, chain_id: u64, cid: u64) -> Result<Option<MerkleLeafRecord>> {
        let _inner = self.inner.lock().unwrap();
        Ok(self.read_leaves(chain_id)?.into_iter().nth(cid as usize))
    }

    async fn get_merkle_node(&self, chain_id: u64, id: &str) -> Result<Option<MerkleNodeRecord>> {
        self.with_shared(chain_id, |c| Ok((c.nodes.get(id).cloned(), false)))
    }

    async fn upsert_merkle_nodes(&self, chain_id: u64, nodes: &[MerkleNodeRecord]) -> Result<()> {
        self.with_shared(chain_id, |c| {
            for node in nodes {
                c.nodes.insert(node.id.clone(), node.clone());
            }
            Ok(((), true))
        })
    }

    async fn get_merkle_tree(&self, chain_id: u64) -> Result<Option<MerkleTreeState>> {
        self.with_shared(chain_id, |c| Ok((c.tree.clone(), false)))
    }

    async fn set_merkle_tree(&self, chain_id: u64, state: &MerkleTreeState) -> Result<()> {
        self.with_shared(chain_id, |c| {
            c.tree = Some(state.clone());
            Ok(((), true))
        })
    }

    async fn clear_merkle_tree(&self, chain_id: u64) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(chain) = inner.shared.chains.get_mut(&chain_id.to_string()) {
                chain.nodes.clear();
                chain.tree = None;
            }
            self.persist_shared(&inner)?;
            inner.leaf_counts.insert(chain_id, 0);
        }
        match fs::remove_file(self.leaves_path(chain_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove leaf log", e)),
        }
    }

    async fn upsert_entry_memos(&self, chain_id: u64, memos: &[EntryMemoRecord]) -> Result<()> {
        self.with_shared(chain_id, |c| {
            for memo in memos {
                match c.entry_memos.iter_mut().find(|m| m.cid == memo.cid) {
                    Some(existing) => *existing = memo.clone(),
                    None => c.entry_memos.push(memo.clone()),
                }
            }
            Ok(((), true))
        })
    }

    async fn list_entry_memos(&self, q: &EntryMemoQuery) -> Result<Page<EntryMemoRecord>> {
        let rows = self.with_shared(q.chain_id, |c| Ok((c.entry_memos.clone(), false)))?;
        Ok(query::page_entry_memos(rows, q))
    }

    async fn clear_entry_memos(&self, chain_id: u64) -> Result<()> {
        self.with_shared(chain_id, |c| {
            c.entry_memos.clear();
            Ok(((), true))
        })
    }

    async fn upsert_entry_nullifiers(
        &self,
        chain_id: u64,
        nullifiers: &[EntryNullifierRecord],
    ) -> Result<()> {
        self.with_shared(chain_id, |c| {
            for n in nullifiers {
                match c.entry_nullifiers.iter_mut().find(|x| x.nid == n.nid) {
                    Some(existing) => *existing = n.clone(),
                    None => c.entry_nullifiers.push(n.clone()),
                }
            }
            Ok(((), true))
        })
    }

    async fn list_entry_nullifiers(
        &self,
        q: &EntryNullifierQuery,
    ) -> Result<Page<EntryNullifierRecord>> {
        let rows = self.with_shared(q.chain_id, |c| Ok((c.entry_nullifiers.clone(), false)))?;
        Ok(query::page_entry_nullifiers(rows, q))
    }

    async fn clear_entry_nullifiers(&self, chain_id: u64) -> Result<()> {
        self.with_shared(chain_id, |c| {
            c.entry_nullifiers.clear();
            Ok(((), true))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    fn cursor(memo: u64) -> SyncCursor {
        SyncCursor {
            memo,
            nullifier: 0,
            merkle: 0,
        }
    }

    #[tokio::test]
    async fn wallet_isolation_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.init(Some("wallet_seed")).await.unwrap();
        store.set_sync_cursor(1, &cursor(42)).await.unwrap();
        store.close().await.unwrap();

        store.init(Some("wallet_other")).await.unwrap();
        assert!(store.get_sync_cursor(1).await.unwrap().is_none());
        assert_eq!(
            store.list_utxos(&UtxoQuery::default()).await.unwrap().total,
            0
        );
        store.close().await.unwrap();

        // The first wallet's state survived untouched.
        store.init(Some("wallet_seed")).await.unwrap();
        assert_eq!(store.get_sync_cursor(1).await.unwrap(), Some(cursor(42)));
    }

    #[tokio::test]
    async fn state_survives_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.init(Some("w")).await.unwrap();
            store.set_sync_cursor(7, &cursor(99)).await.unwrap();
            store
                .upsert_utxos(&[UtxoRecord {
                    chain_id: 7,
                    commitment: "0x0a".into(),
                    asset_id: "0x01".into(),
                    token_id: None,
                    amount: BigUint::from(12345678901234567890u64) * 100u32,
                    nullifier: "0xbb".into(),
                    mk_index: 0,
                    is_frozen: false,
                    is_spent: false,
                    memo: None,
                    created_at: Some(1),
                }])
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        store.init(Some("w")).await.unwrap();
        assert_eq!(store.get_sync_cursor(7).await.unwrap(), Some(cursor(99)));
        let page = store.list_utxos(&UtxoQuery::default()).await.unwrap();
        assert_eq!(page.total, 1);
        // Amount is preserved past 64 bits.
        assert_eq!(
            page.rows[0].amount,
            BigUint::from(12345678901234567890u64) * 100u32
        );
    }

    #[tokio::test]
    async fn leaf_log_appends_and_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.init(None).await.unwrap();

        let leaf = |cid| MerkleLeafRecord {
            chain_id: 3,
            cid,
            commitment: format!("0x{:02x}", cid),
        };
        store
            .append_merkle_leaves(3, &[leaf(0), leaf(1), leaf(2)])
            .await
            .unwrap();
        assert!(store.append_merkle_leaves(3, &[leaf(4)]).await.is_err());
        store.append_merkle_leaves(3, &[leaf(3)]).await.unwrap();

        // Reopen and confirm the log replays.
        let store2 = FileStore::open(dir.path()).unwrap();
        let leaves = store2.get_merkle_leaves(3).await.unwrap();
        assert_eq!(leaves.len(), 4);
        assert_eq!(leaves[3].cid, 3);
    }

    #[tokio::test]
    async fn shared_chain_caches_are_wallet_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.init(Some("a")).await.unwrap();
        store
            .upsert_entry_memos(
                1,
                &[EntryMemoRecord {
                    chain_id: 1,
                    cid: 0,
                    commitment: "0x01".into(),
                    memo: "0x02".into(),
                    tx_hash: None,
                    created_at: None,
                }],
            )
            .await
            .unwrap();
        store.close().await.unwrap();

        store.init(Some("b")).await.unwrap();
        let page = store
            .list_entry_memos(&EntryMemoQuery::chain(1))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }
}
