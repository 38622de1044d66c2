//! Wallet view: the decrypted, queryable projection of the chain state.
//!
//! Opening a wallet derives the viewing keypair from a seed, publishes the
//! compressed viewing address, and registers each configured shielded pool
//! so decrypted notes can be attributed to the right asset. Incoming memos
//! become UTXO rows; incoming nullifiers flip them to spent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ark_bn254::Fr;
use tracing::{debug, warn};

use veil_crypto::edwards::Point;
use veil_crypto::keys::{self, KeyPair};
use veil_crypto::{memo, note};
use veil_store::{StorageAdapter, UtxoRecord};
use veil_sync::{MemoEntry, WalletSink};
use veil_types::{
    amount_from_field, bytes_to_hex, field_to_hex, hex_to_field, Error, Hex, Result,
};

/// One shielded pool a wallet watches: a token plus the pool's viewer and
/// freezer keys. The pool id is Poseidon(Asset) over all three.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub chain_id: u64,
    pub token_address: Hex,
    pub viewer_pk: Point,
    pub freezer_pk: Point,
}

#[derive(Clone)]
struct PoolEntry {
    token_address: Hex,
    freezer_pk: Point,
}

struct OpenWallet {
    keys: KeyPair,
    address: Hex,
    /// (chain_id, asset_id hex) → pool.
    pools: HashMap<(u64, Hex), PoolEntry>,
}

/// Wallet lifecycle / update events.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    Opened { address: Hex },
    Updated { chain_id: u64, applied: u64, spent: u64 },
}

pub type WalletEventHandler = Box<dyn Fn(WalletEvent) + Send + Sync>;

pub struct WalletView {
    store: Arc<dyn StorageAdapter>,
    inner: Mutex<Option<OpenWallet>>,
    on_event: Option<WalletEventHandler>,
}

impl WalletView {
    pub fn new(store: Arc<dyn StorageAdapter>, on_event: Option<WalletEventHandler>) -> Self {
        Self {
            store,
            inner: Mutex::new(None),
            on_event,
        }
    }

    fn emit(&self, event: WalletEvent) {
        if let Some(handler) = &self.on_event {
            handler(event);
        }
    }

    /// Derive the viewing keypair, compute the viewing address, register
    /// the pools, and scope the storage adapter to this wallet.
    pub async fn open(
        &self,
        seed: &str,
        account_nonce: Option<&str>,
        pools: &[PoolConfig],
    ) -> Result<Hex> {
        let keys = keys::derive_key_pair(seed, account_nonce)?;
        let address = bytes_to_hex(&keys.public.compress()?);

        let mut pool_map = HashMap::new();
        for pool in pools {
            let token = hex_to_field(&pool.token_address)?;
            let asset_id = note::pool_asset_id(token, &pool.viewer_pk, &pool.freezer_pk);
            pool_map.insert(
                (pool.chain_id, field_to_hex(&asset_id)),
                PoolEntry {
                    token_address: pool.token_address.clone(),
                    freezer_pk: pool.freezer_pk,
                },
            );
        }

        self.store.init(Some(&address)).await?;

        *self.inner.lock().unwrap() = Some(OpenWallet {
            keys,
            address: address.clone(),
            pools: pool_map,
        });

        self.emit(WalletEvent::Opened {
            address: address.clone(),
        });
        Ok(address)
    }

    /// Drop the in-memory key material and release the storage scope.
    pub async fn close(&self) -> Result<()> {
        *self.inner.lock().unwrap() = None;
        self.store.close().await
    }

    fn open_wallet(&self) -> Result<(KeyPair, Hex, HashMap<(u64, Hex), PoolEntry>)> {
        let inner = self.inner.lock().unwrap();
        let wallet = inner
            .as_ref()
            .ok_or_else(|| Error::config("wallet is not open"))?;
        Ok((wallet.keys, wallet.address.clone(), wallet.pools.clone()))
    }

    pub fn address(&self) -> Result<Hex> {
        Ok(self.open_wallet()?.1)
    }

    /// Decrypt a batch of memos and upsert the notes addressed to this
    /// wallet. Returns the number of UTXOs applied.
    pub async fn apply_memo_entries(&self, chain_id: u64, entries: &[MemoEntry]) -> Result<u64> {
        let (keys, _, pools) = self.open_wallet()?;

        let mut utxos = Vec::new();
        for entry in entries {
            let opened = match memo::open(&keys.secret, &entry.memo) {
                Ok(Some(note_plain)) => note_plain,
                Ok(None) => continue,
                Err(err) => {
                    debug!(chain_id, cid = entry.cid, error = %err, "undecodable memo skipped");
                    continue;
                }
            };

            // Addressed to someone else.
            if opened.owner_pk != keys.public {
                continue;
            }

            let asset_id_hex = field_to_hex(&opened.asset_id);
            let pool = match pools.get(&(chain_id, asset_id_hex.clone())) {
                Some(pool) => pool,
                None => {
                    debug!(chain_id, cid = entry.cid, "memo for unregistered pool skipped");
                    continue;
                }
            };

            let commitment = note::commitment(&opened);
            let expected: Fr = hex_to_field(&entry.commitment)?;
            if commitment != expected {
                warn!(
                    chain_id,
                    cid = entry.cid,
                    "memo decrypts but commitment does not match, rejected"
                );
                continue;
            }

            let nullifier = note::nullifier(&keys.secret, &commitment, Some(pool.freezer_pk));

            utxos.push(UtxoRecord {
                chain_id,
                commitment: field_to_hex(&commitment),
                asset_id: asset_id_hex,
                token_id: Some(pool.token_address.clone()),
                amount: amount_from_field(&opened.amount),
                nullifier: field_to_hex(&nullifier),
                mk_index: entry.cid,
                is_frozen: opened.is_frozen,
                is_spent: false,
                memo: Some(entry.memo.clone()),
                created_at: entry.created_at,
            });
        }

        if !utxos.is_empty() {
            self.store.upsert_utxos(&utxos).await?;
        }

        let applied = utxos.len() as u64;
        if applied > 0 {
            self.emit(WalletEvent::Updated {
                chain_id,
                applied,
                spent: 0,
            });
        }
        Ok(applied)
    }

    /// Forward nullifiers to the adapter; emits an update event with the
    /// flip count.
    pub async fn mark_spent_nullifiers(&self, chain_id: u64, nullifiers: &[Hex]) -> Result<u64> {
        self.open_wallet()?;
        let spent = self.store.mark_spent(chain_id, nullifiers).await?;
        if spent > 0 {
            self.emit(WalletEvent::Updated {
                chain_id,
                applied: 0,
                spent,
            });
        }
        Ok(spent)
    }
}

#[async_trait::async_trait]
impl WalletSink for WalletView {
    async fn viewing_address(&self) -> Result<Hex> {
        self.address()
    }

    async fn apply_memos(&self, chain_id: u64, entries: &[MemoEntry]) -> Result<u64> {
        self.apply_memo_entries(chain_id, entries).await
    }

    async fn mark_spent(&self, chain_id: u64, nullifiers: &[Hex]) -> Result<u64> {
        self.mark_spent_nullifiers(chain_id, nullifiers).await
    }
}
