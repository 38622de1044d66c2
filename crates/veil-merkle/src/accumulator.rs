//! Chain-scoped incremental accumulator over the persisted leaf/node
//! tables.
//!
//! In-memory state per chain is tiny: the merged-element count (always a
//! multiple of 32), the current root, and a FIFO of leaves waiting for the
//! next full subtree. Everything else lives in the storage adapter under
//! arena-style keys: `"{level}-{position}"` for tree nodes and
//! `"frontier-{level}"` for the right-edge state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use ark_bn254::Fr;
use tracing::debug;

use veil_store::{MerkleLeafRecord, MerkleNodeRecord, MerkleTreeState, StorageAdapter};
use veil_types::{field_to_hex, hex_to_field, now_ms, Error, Result};

use crate::remote::ProofService;
use crate::{hash_pair, zero_hash, MerkleProof, ProofBundle, SUBTREE_BITS, SUBTREE_SIZE, TREE_DEPTH};

/// Where proofs come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofMode {
    /// Never touch local state; every proof comes from the proof service.
    Remote,
    /// Local state only; being behind the contract is an error.
    Local,
    /// Prefer local, fall back to the proof service.
    Hybrid,
}

/// One leaf to ingest.
#[derive(Debug, Clone, Copy)]
pub struct LeafInsert {
    pub cid: u64,
    pub commitment: Fr,
}

#[derive(Debug, Clone)]
struct ChainState {
    merged: u64,
    root: Fr,
    pending: VecDeque<Fr>,
    /// False when hydration failed in hybrid mode; local paths then refuse
    /// and the proof path falls back to remote.
    local_ok: bool,
}

impl ChainState {
    fn unavailable() -> Self {
        Self {
            merged: 0,
            root: zero_hash(TREE_DEPTH),
            pending: VecDeque::new(),
            local_ok: false,
        }
    }
}

/// The per-process accumulator over all configured chains.
pub struct MerkleAccumulator {
    store: Arc<dyn StorageAdapter>,
    mode: ProofMode,
    remote: Option<Arc<dyn ProofService>>,
    chains: Mutex<HashMap<u64, ChainState>>,
}

fn node_id(level: u32, position: u64) -> String {
    format!("{}-{}", level, position)
}

fn frontier_id(level: u32) -> String {
    format!("frontier-{}", level)
}

fn node_record(chain_id: u64, id: String, level: u32, position: u64, hash: Fr) -> MerkleNodeRecord {
    MerkleNodeRecord {
        chain_id,
        id,
        level,
        position,
        hash: field_to_hex(&hash),
    }
}

impl MerkleAccumulator {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        mode: ProofMode,
        remote: Option<Arc<dyn ProofService>>,
    ) -> Self {
        Self {
            store,
            mode,
            remote,
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> ProofMode {
        self.mode
    }

    fn state_of(&self, chain_id: u64) -> Option<ChainState> {
        self.chains.lock().unwrap().get(&chain_id).cloned()
    }

    fn store_state(&self, chain_id: u64, state: ChainState) {
        self.chains.lock().unwrap().insert(chain_id, state);
    }

    /// Count of leaves committed to the main tree. Always a multiple of 32.
    pub async fn merged_elements(&self, chain_id: u64) -> Result<u64> {
        Ok(self.ensure_chain(chain_id).await?.merged)
    }

    /// Leaves buffered for the next subtree flush.
    pub async fn pending_count(&self, chain_id: u64) -> Result<usize> {
        Ok(self.ensure_chain(chain_id).await?.pending.len())
    }

    /// Current local root (Z[depth] for an empty chain).
    pub async fn local_root(&self, chain_id: u64) -> Result<Fr> {
        Ok(self.ensure_chain(chain_id).await?.root)
    }

    /// Load (or return) the in-memory state for a chain. In remote mode no
    /// local state is consulted. Hydration failures are raised in local
    /// mode and recorded (so proofs fall back) in hybrid mode.
    async fn ensure_chain(&self, chain_id: u64) -> Result<ChainState> {
        if let Some(state) = self.state_of(chain_id) {
            return Ok(state);
        }

        if self.mode == ProofMode::Remote {
            let state = ChainState::unavailable();
            self.store_state(chain_id, state.clone());
            return Ok(state);
        }

        let state = match self.hydrate(chain_id).await {
            Ok(state) => state,
            Err(e) if self.mode == ProofMode::Hybrid => {
                debug!(chain_id, error = %e, "merkle hydration failed, remote fallback");
                ChainState::unavailable()
            }
            Err(e) => return Err(e),
        };

        self.store_state(chain_id, state.clone());
        Ok(state)
    }

    async fn hydrate(&self, chain_id: u64) -> Result<ChainState> {
        let leaves = self.store.get_merkle_leaves(chain_id).await?;

        let mut parsed = Vec::with_capacity(leaves.len());
        for (i, leaf) in leaves.iter().enumerate() {
            if leaf.cid != i as u64 {
                return Err(Error::merkle(format!(
                    "merkle leaf cache has gaps: expected cid {}, found {}",
                    i, leaf.cid
                )));
            }
            parsed.push(hex_to_field(&leaf.commitment)?);
        }
        let n = parsed.len() as u64;

        // Anchor on the persisted tree state: `merged` is whatever actually
        // flushed. Leaves past it (including whole subtrees that appended
        // but never flushed) re-enter the pending queue and flush below.
        let persisted = self.store.get_merkle_tree(chain_id).await?;
        let merged = persisted.as_ref().map(|s| s.total_elements).unwrap_or(0);
        if merged % SUBTREE_SIZE != 0 {
            return Err(Error::merkle(format!(
                "persisted tree state is not subtree aligned: {}",
                merged
            )));
        }
        if merged > n {
            return Err(Error::merkle(format!(
                "persisted tree claims {} elements but only {} leaves exist",
                merged, n
            )));
        }

        let root = match persisted {
            Some(state) => hex_to_field(&state.root)?,
            None => match self
                .store
                .get_merkle_node(chain_id, &node_id(TREE_DEPTH as u32, 0))
                .await?
            {
                Some(node) => hex_to_field(&node.hash)?,
                None => zero_hash(TREE_DEPTH),
            },
        };

        let mut state = ChainState {
            merged,
            root,
            pending: parsed[merged as usize..].iter().copied().collect(),
            local_ok: true,
        };

        while state.pending.len() as u64 >= SUBTREE_SIZE {
            self.flush_subtree(chain_id, &mut state).await?;
        }

        Ok(state)
    }

    /// Ingest leaves for a chain. Leaves below the expected cid are skipped
    /// (idempotent re-ingest); a gap fails with MERKLE in local mode and
    /// truncates silently in hybrid mode. Full 32-leaf subtrees flush into
    /// the main tree as they accumulate.
    pub async fn ingest_leaves(&self, chain_id: u64, leaves: &[LeafInsert]) -> Result<()> {
        if self.mode == ProofMode::Remote || leaves.is_empty() {
            return Ok(());
        }

        let mut state = self.ensure_chain(chain_id).await?;
        if !state.local_ok {
            return Ok(());
        }

        let mut sorted: Vec<LeafInsert> = leaves.to_vec();
        sorted.sort_by_key(|leaf| leaf.cid);

        let mut accepted = Vec::new();
        for leaf in &sorted {
            let expected = state.merged + state.pending.len() as u64 + accepted.len() as u64;
            if leaf.cid < expected {
                continue;
            }
            if leaf.cid > expected {
                if self.mode == ProofMode::Local {
                    return Err(Error::merkle(format!(
                        "merkle leaves not contiguous: expected cid {}, got {}",
                        expected, leaf.cid
                    )));
                }
                // Hybrid: keep the contiguous prefix, drop the rest.
                break;
            }
            accepted.push(*leaf);
        }

        if accepted.is_empty() {
            return Ok(());
        }

        let records: Vec<MerkleLeafRecord> = accepted
            .iter()
            .map(|leaf| MerkleLeafRecord {
                chain_id,
                cid: leaf.cid,
                commitment: field_to_hex(&leaf.commitment),
            })
            .collect();
        self.store.append_merkle_leaves(chain_id, &records).await?;

        state
            .pending
            .extend(accepted.iter().map(|leaf| leaf.commitment));
        self.store_state(chain_id, state.clone());

        while state.pending.len() as u64 >= SUBTREE_SIZE {
            self.flush_subtree(chain_id, &mut state).await?;
            self.store_state(chain_id, state.clone());
        }

        Ok(())
    }

    /// Promote the first 32 pending leaves into the main tree: hash the
    /// subtree, merge it along the frontier, persist nodes + state as one
    /// batch, then advance.
    async fn flush_subtree(&self, chain_id: u64, state: &mut ChainState) -> Result<()> {
        let base = state.merged;
        debug_assert!(base % SUBTREE_SIZE == 0, "subtree base must be aligned");
        debug_assert!(state.pending.len() as u64 >= SUBTREE_SIZE);

        let subtree: Vec<Fr> = state
            .pending
            .iter()
            .take(SUBTREE_SIZE as usize)
            .copied()
            .collect();

        let mut nodes: Vec<MerkleNodeRecord> = Vec::new();

        // Internal subtree levels 1..=s.
        let mut level_vals = subtree;
        for level in 1..=SUBTREE_BITS as u32 {
            let mut next = Vec::with_capacity(level_vals.len() / 2);
            for pair in level_vals.chunks(2) {
                next.push(hash_pair(pair[0], pair[1]));
            }
            for (i, value) in next.iter().enumerate() {
                let position = (base >> level) + i as u64;
                nodes.push(node_record(
                    chain_id,
                    node_id(level, position),
                    level,
                    position,
                    *value,
                ));
            }
            level_vals = next;
        }
        let mut current = level_vals[0];

        // Frontier merge: climb from the subtree root to the tree root.
        // Only the first left-child level in the climb snapshots the
        // frontier; everything above carries zero padding.
        let mut frontier_written = false;
        for level in SUBTREE_BITS..TREE_DEPTH {
            let node_index = (base + SUBTREE_SIZE - 1) >> level;
            if node_index % 2 == 0 {
                if !frontier_written {
                    nodes.push(node_record(
                        chain_id,
                        frontier_id(level as u32),
                        level as u32,
                        node_index,
                        current,
                    ));
                    frontier_written = true;
                }
                current = hash_pair(current, zero_hash(level));
            } else {
                let left = match self
                    .store
                    .get_merkle_node(chain_id, &frontier_id(level as u32))
                    .await?
                {
                    Some(node) => hex_to_field(&node.hash)?,
                    None => zero_hash(level),
                };
                current = hash_pair(left, current);
            }
            let parent_level = level as u32 + 1;
            let parent_position = node_index >> 1;
            nodes.push(node_record(
                chain_id,
                node_id(parent_level, parent_position),
                parent_level,
                parent_position,
                current,
            ));
        }

        let new_merged = base + SUBTREE_SIZE;
        let tree = MerkleTreeState {
            chain_id,
            root: field_to_hex(&current),
            total_elements: new_merged,
            last_updated: now_ms(),
        };
        self.store.apply_merkle_batch(chain_id, &nodes, &tree).await?;

        state.merged = new_merged;
        state.root = current;
        state.pending.drain(..SUBTREE_SIZE as usize);
        Ok(())
    }

    /// Build proofs for `cids` against a tree of `total_elements` on-chain
    /// leaves. Leaves beyond the last merged subtree get zero-path stubs.
    pub async fn proof_by_cids(
        &self,
        chain_id: u64,
        cids: &[u64],
        total_elements: u64,
    ) -> Result<ProofBundle> {
        if cids.is_empty() {
            return Err(Error::config("proof request requires at least one cid"));
        }

        let contract_tree = (total_elements / SUBTREE_SIZE) * SUBTREE_SIZE;

        match self.mode {
            ProofMode::Remote => self.remote_proofs(chain_id, cids, contract_tree).await,
            ProofMode::Local => self.local_proofs(chain_id, cids, contract_tree).await,
            ProofMode::Hybrid => match self.local_proofs(chain_id, cids, contract_tree).await {
                Ok(bundle) => Ok(bundle),
                Err(e) => {
                    debug!(chain_id, error = %e, "local proof failed, falling back to remote");
                    self.remote_proofs(chain_id, cids, contract_tree).await
                }
            },
        }
    }

    async fn local_proofs(
        &self,
        chain_id: u64,
        cids: &[u64],
        contract_tree: u64,
    ) -> Result<ProofBundle> {
        let state = self.ensure_chain(chain_id).await?;
        if !state.local_ok {
            return Err(Error::merkle("local merkle state unavailable"));
        }
        if state.merged < contract_tree {
            return Err(Error::merkle(format!(
                "local tree is behind the contract: {} < {}",
                state.merged, contract_tree
            )));
        }

        let mut proofs = Vec::with_capacity(cids.len());
        for &cid in cids {
            if cid >= contract_tree {
                proofs.push(MerkleProof::stub(cid, TREE_DEPTH));
                continue;
            }
            proofs.push(self.local_proof(chain_id, cid).await?);
        }

        Ok(ProofBundle {
            proofs,
            root: state.root,
        })
    }

    async fn local_proof(&self, chain_id: u64, cid: u64) -> Result<MerkleProof> {
        let mut path = Vec::with_capacity(TREE_DEPTH + 1);

        let leaf = self
            .store
            .get_merkle_leaf(chain_id, cid)
            .await?
            .ok_or_else(|| Error::merkle(format!("missing merkle leaf for cid {}", cid)))?;
        path.push(hex_to_field(&leaf.commitment)?);

        // Level-0 sibling comes from the leaves table.
        let sibling_cid = cid ^ 1;
        let sibling = match self.store.get_merkle_leaf(chain_id, sibling_cid).await? {
            Some(leaf) => hex_to_field(&leaf.commitment)?,
            None => zero_hash(0),
        };
        path.push(sibling);

        // Higher siblings come from the node table, defaulting to the zero
        // hash of their level.
        for level in 1..TREE_DEPTH as u32 {
            let position = (cid >> level) ^ 1;
            let value = match self
                .store
                .get_merkle_node(chain_id, &node_id(level, position))
                .await?
            {
                Some(node) => hex_to_field(&node.hash)?,
                None => zero_hash(level as usize),
            };
            path.push(value);
        }

        Ok(MerkleProof {
            leaf_index: cid,
            path,
        })
    }

    async fn remote_proofs(
        &self,
        chain_id: u64,
        cids: &[u64],
        contract_tree: u64,
    ) -> Result<ProofBundle> {
        let service = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::config("no remote proof service configured"))?;

        let in_range: Vec<u64> = cids.iter().copied().filter(|&c| c < contract_tree).collect();

        let (by_index, root) = if in_range.is_empty() {
            if contract_tree == 0 {
                (HashMap::new(), zero_hash(TREE_DEPTH))
            } else {
                // Throw-away proof call just to learn the root.
                let bundle = service.fetch_proofs(chain_id, &[0]).await?;
                (HashMap::new(), bundle.root)
            }
        } else {
            let bundle = service.fetch_proofs(chain_id, &in_range).await?;
            let map: HashMap<u64, MerkleProof> = bundle
                .proofs
                .into_iter()
                .map(|p| (p.leaf_index, p))
                .collect();
            (map, bundle.root)
        };

        let mut proofs = Vec::with_capacity(cids.len());
        for &cid in cids {
            if cid >= contract_tree {
                proofs.push(MerkleProof::stub(cid, TREE_DEPTH));
            } else {
                let proof = by_index.get(&cid).cloned().ok_or_else(|| {
                    Error::merkle(format!("proof service omitted cid {}", cid))
                })?;
                proofs.push(proof);
            }
        }

        Ok(ProofBundle { proofs, root })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceTree;
    use crate::verify_proof;
    use veil_crypto::poseidon::{self, HashDomain};
    use veil_store::memory::MemoryStore;

    async fn open_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.init(None).await.unwrap();
        store
    }

    fn record_leaf(i: u64) -> Fr {
        poseidon::hash_pair(Fr::from(i + 1), Fr::from(i * 100 + 42), HashDomain::Record)
    }

    fn inserts(range: std::ops::Range<u64>) -> Vec<LeafInsert> {
        range
            .map(|cid| LeafInsert {
                cid,
                commitment: record_leaf(cid),
            })
            .collect()
    }

    #[tokio::test]
    async fn subtree_flush_scenario() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);

        acc.ingest_leaves(1, &inserts(0..32)).await.unwrap();

        assert_eq!(acc.merged_elements(1).await.unwrap(), 32);
        assert_eq!(acc.pending_count(1).await.unwrap(), 0);

        let persisted = store.get_merkle_tree(1).await.unwrap().unwrap();
        assert_eq!(persisted.total_elements, 32);

        let bundle = acc.proof_by_cids(1, &[0], 32).await.unwrap();
        assert_eq!(bundle.proofs[0].path.len(), TREE_DEPTH + 1);
        assert_eq!(bundle.proofs[0].path[0], record_leaf(0));

        // The incremental root matches a dense recomputation.
        let leaves: Vec<Fr> = (0..32).map(record_leaf).collect();
        let reference = ReferenceTree::from_leaves(None, &leaves);
        assert_eq!(bundle.root, reference.root());
        assert!(verify_proof(&bundle.proofs[0], bundle.root, TREE_DEPTH));
    }

    #[tokio::test]
    async fn gap_rejection_leaves_state_unchanged() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);

        let leaves = [
            LeafInsert {
                cid: 0,
                commitment: Fr::from(11u64),
            },
            LeafInsert {
                cid: 2,
                commitment: Fr::from(33u64),
            },
        ];
        let err = acc.ingest_leaves(1, &leaves).await.unwrap_err();
        assert_eq!(err.code, veil_types::ErrorCode::Merkle);
        assert!(err.message.contains("not contiguous"));

        assert_eq!(acc.merged_elements(1).await.unwrap(), 0);
        assert_eq!(acc.pending_count(1).await.unwrap(), 0);
        assert!(store.get_merkle_leaves(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hybrid_gap_keeps_contiguous_prefix() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Hybrid, None);

        let mut leaves = inserts(0..3);
        leaves.push(LeafInsert {
            cid: 7,
            commitment: Fr::from(7u64),
        });
        acc.ingest_leaves(1, &leaves).await.unwrap();

        assert_eq!(acc.pending_count(1).await.unwrap(), 3);
        assert_eq!(store.get_merkle_leaves(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);

        acc.ingest_leaves(1, &inserts(0..40)).await.unwrap();
        assert_eq!(acc.merged_elements(1).await.unwrap(), 32);
        assert_eq!(acc.pending_count(1).await.unwrap(), 8);
        let root_before = acc.local_root(1).await.unwrap();

        acc.ingest_leaves(1, &inserts(0..40)).await.unwrap();
        assert_eq!(acc.merged_elements(1).await.unwrap(), 32);
        assert_eq!(acc.pending_count(1).await.unwrap(), 8);
        assert_eq!(acc.local_root(1).await.unwrap(), root_before);
    }

    #[tokio::test]
    async fn multi_subtree_root_matches_reference() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);

        acc.ingest_leaves(1, &inserts(0..100)).await.unwrap();
        assert_eq!(acc.merged_elements(1).await.unwrap(), 96);
        assert_eq!(acc.pending_count(1).await.unwrap(), 4);

        // Root covers only merged leaves.
        let merged: Vec<Fr> = (0..96).map(record_leaf).collect();
        let reference = ReferenceTree::from_leaves(None, &merged);
        assert_eq!(acc.local_root(1).await.unwrap(), reference.root());

        // Proofs across the merged region verify against the root.
        let bundle = acc.proof_by_cids(1, &[0, 31, 32, 63, 95], 100).await.unwrap();
        for proof in &bundle.proofs {
            assert!(
                verify_proof(proof, bundle.root, TREE_DEPTH),
                "cid {}",
                proof.leaf_index
            );
        }

        // A cid beyond the merged region stubs out.
        let bundle = acc.proof_by_cids(1, &[97], 100).await.unwrap();
        assert!(bundle.proofs[0].is_stub());
    }

    #[tokio::test]
    async fn top_node_equals_persisted_root() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);
        acc.ingest_leaves(1, &inserts(0..64)).await.unwrap();

        let state = store.get_merkle_tree(1).await.unwrap().unwrap();
        let top = store
            .get_merkle_node(1, &node_id(TREE_DEPTH as u32, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(top.hash, state.root);
        assert_eq!(state.total_elements % 32, 0);
    }

    #[tokio::test]
    async fn hydration_restores_merged_and_pending() {
        let store = open_store().await;
        {
            let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);
            acc.ingest_leaves(1, &inserts(0..70)).await.unwrap();
        }

        // Fresh accumulator over the same store.
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);
        assert_eq!(acc.merged_elements(1).await.unwrap(), 64);
        assert_eq!(acc.pending_count(1).await.unwrap(), 6);

        // Ingest continues exactly where it left off.
        acc.ingest_leaves(1, &inserts(70..96)).await.unwrap();
        assert_eq!(acc.merged_elements(1).await.unwrap(), 96);

        let merged: Vec<Fr> = (0..96).map(record_leaf).collect();
        let reference = ReferenceTree::from_leaves(None, &merged);
        assert_eq!(acc.local_root(1).await.unwrap(), reference.root());
    }

    #[tokio::test]
    async fn empty_tree_edge_cases() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);

        // totalElements = 0: root is the empty-tree hash, every proof stubs.
        let bundle = acc.proof_by_cids(1, &[0], 0).await.unwrap();
        assert_eq!(bundle.root, zero_hash(TREE_DEPTH));
        assert!(bundle.proofs[0].is_stub());

        // No cids at all is a config error.
        let err = acc.proof_by_cids(1, &[], 0).await.unwrap_err();
        assert_eq!(err.code, veil_types::ErrorCode::Config);
    }

    #[tokio::test]
    async fn local_mode_behind_contract_fails() {
        let store = open_store().await;
        let acc = MerkleAccumulator::new(store.clone(), ProofMode::Local, None);
        acc.ingest_leaves(1, &inserts(0..32)).await.unwrap();

        let err = acc.proof_by_cids(1, &[0], 128).await.unwrap_err();
        assert_eq!(err.code, veil_types::ErrorCode::Merkle);
        assert!(err.message.contains("behind"));
    }
}
