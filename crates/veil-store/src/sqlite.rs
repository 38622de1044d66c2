//! Embedded-SQL storage adapter (rusqlite).
//!
//! One database file holds every wallet: wallet-scoped tables carry a
//! `wallet_id` column, chain caches are global. Batch writes run inside
//! `BEGIN IMMEDIATE` transactions; the connection is opened with WAL
//! journaling, NORMAL synchronous and foreign keys on.

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::sync::Mutex;

use veil_types::{amount_from_decimal, amount_to_decimal, Error, Hex, Result};

use crate::query::{EntryMemoQuery, EntryNullifierQuery, OperationQuery, Page, UtxoQuery};
use crate::{
    EntryMemoRecord, EntryNullifierRecord, MerkleLeafRecord, MerkleNodeRecord, MerkleTreeState,
    OperationRecord, OperationStatus, OrderBy, SortOrder, StorageAdapter, SyncCursor, UtxoRecord,
    DEFAULT_WALLET,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_cursors (
    wallet_id  TEXT NOT NULL,
    chain_id   INTEGER NOT NULL,
    memo       INTEGER NOT NULL,
    nullifier  INTEGER NOT NULL,
    merkle     INTEGER NOT NULL,
    PRIMARY KEY (wallet_id, chain_id)
);
CREATE TABLE IF NOT EXISTS utxos (
    wallet_id   TEXT NOT NULL,
    chain_id    INTEGER NOT NULL,
    commitment  TEXT NOT NULL,
    asset_id    TEXT NOT NULL,
    token_id    TEXT,
    amount      TEXT NOT NULL,
    nullifier   TEXT NOT NULL,
    mk_index    INTEGER NOT NULL,
    is_frozen   INTEGER NOT NULL,
    is_spent    INTEGER NOT NULL,
    memo        TEXT,
    created_at  INTEGER,
    PRIMARY KEY (wallet_id, chain_id, commitment)
);
CREATE INDEX IF NOT EXISTS idx_utxos_nullifier ON utxos (wallet_id, chain_id, nullifier);
CREATE TABLE IF NOT EXISTS operations (
    wallet_id        TEXT NOT NULL,
    id               TEXT NOT NULL,
    op_type          TEXT NOT NULL,
    status           TEXT NOT NULL,
    created_at       INTEGER NOT NULL,
    chain_id         INTEGER,
    token_id         TEXT,
    request_url      TEXT,
    relayer_tx_hash  TEXT,
    tx_hash          TEXT,
    detail           TEXT,
    error            TEXT,
    PRIMARY KEY (wallet_id, id)
);
CREATE TABLE IF NOT EXISTS merkle_leaves (
    chain_id    INTEGER NOT NULL,
    cid         INTEGER NOT NULL,
    commitment  TEXT NOT NULL,
    PRIMARY KEY (chain_id, cid)
);
CREATE TABLE IF NOT EXISTS merkle_nodes (
    chain_id  INTEGER NOT NULL,
    id        TEXT NOT NULL,
    level     INTEGER NOT NULL,
    position  INTEGER NOT NULL,
    hash      TEXT NOT NULL,
    PRIMARY KEY (chain_id, id)
);
CREATE TABLE IF NOT EXISTS merkle_trees (
    chain_id        INTEGER PRIMARY KEY,
    root            TEXT NOT NULL,
    total_elements  INTEGER NOT NULL,
    last_updated    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS entry_memos (
    chain_id    INTEGER NOT NULL,
    cid         INTEGER NOT NULL,
    commitment  TEXT NOT NULL,
    memo        TEXT NOT NULL,
    tx_hash     TEXT,
    created_at  INTEGER,
    PRIMARY KEY (chain_id, cid)
);
CREATE TABLE IF NOT EXISTS entry_nullifiers (
    chain_id    INTEGER NOT NULL,
    nid         INTEGER NOT NULL,
    nullifier   TEXT NOT NULL,
    created_at  INTEGER,
    PRIMARY KEY (chain_id, nid)
);
";

fn sql_err(e: rusqlite::Error) -> Error {
    Error::storage(format!("sqlite: {}", e)).with_source(e)
}

fn status_to_str(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Created => "created",
        OperationStatus::Submitted => "submitted",
        OperationStatus::Confirmed => "confirmed",
        OperationStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> Result<OperationStatus> {
    match s {
        "created" => Ok(OperationStatus::Created),
        "submitted" => Ok(OperationStatus::Submitted),
        "confirmed" => Ok(OperationStatus::Confirmed),
        "failed" => Ok(OperationStatus::Failed),
        other => Err(Error::storage(format!("unknown operation status {:?}", other))),
    }
}

struct State {
    conn: Connection,
    wallet_id: Option<String>,
}

/// SQLite-backed storage adapter.
pub struct SqliteStore {
    state: Mutex<State>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::setup(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::setup(conn)
    }

    fn setup(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            state: Mutex::new(State {
                conn,
                wallet_id: None,
            }),
        })
    }

    fn wallet_of(state: &State) -> Result<String> {
        state
            .wallet_id
            .clone()
            .ok_or_else(|| Error::storage("storage not initialized: call init first"))
    }
}

fn read_utxo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(UtxoRecord, String)> {
    let amount_text: String = row.get("amount")?;
    Ok((
        UtxoRecord {
            chain_id: row.get("chain_id")?,
            commitment: row.get("commitment")?,
            asset_id: row.get("asset_id")?,
            token_id: row.get("token_id")?,
            amount: Default::default(),
            nullifier: row.get("nullifier")?,
            mk_index: row.get("mk_index")?,
            is_frozen: row.get::<_, i64>("is_frozen")? != 0,
            is_spent: row.get::<_, i64>("is_spent")? != 0,
            memo: row.get("memo")?,
            created_at: row.get("created_at")?,
        },
        amount_text,
    ))
}

#[async_trait]
impl StorageAdapter for SqliteStore {
    async fn init(&self, wallet_id: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.wallet_id = Some(wallet_id.unwrap_or(DEFAULT_WALLET).to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.wallet_id = None;
        Ok(())
    }

    async fn get_sync_cursor(&self, chain_id: u64) -> Result<Option<SyncCursor>> {
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;
        state
            .conn
            .query_row(
                "SELECT memo, nullifier, merkle FROM sync_cursors
                 WHERE wallet_id = ?1 AND chain_id = ?2",
                params![wallet, chain_id],
                |row| {
                    Ok(SyncCursor {
                        memo: row.get(0)?,
                        nullifier: row.get(1)?,
                        merkle: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    async fn set_sync_cursor(&self, chain_id: u64, cursor: &SyncCursor) -> Result<()> {
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;
        state
            .conn
            .execute(
                "INSERT INTO sync_cursors (wallet_id, chain_id, memo, nullifier, merkle)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (wallet_id, chain_id) DO UPDATE SET
                    memo = excluded.memo,
                    nullifier = excluded.nullifier,
                    merkle = excluded.merkle",
                params![wallet, chain_id, cursor.memo, cursor.nullifier, cursor.merkle],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    async fn upsert_utxos(&self, utxos: &[UtxoRecord]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        for utxo in utxos {
            // is_spent = MAX(old, new): a stored spent flag never clears.
            tx.execute(
                "INSERT INTO utxos (wallet_id, chain_id, commitment, asset_id, token_id,
                                    amount, nullifier, mk_index, is_frozen, is_spent,
                                    memo, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (wallet_id, chain_id, commitment) DO UPDATE SET
                    asset_id = excluded.asset_id,
                    token_id = excluded.token_id,
                    amount = excluded.amount,
                    nullifier = excluded.nullifier,
                    mk_index = excluded.mk_index,
                    is_frozen = excluded.is_frozen,
                    is_spent = MAX(utxos.is_spent, excluded.is_spent),
                    memo = excluded.memo,
                    created_at = excluded.created_at",
                params![
                    wallet,
                    utxo.chain_id,
                    utxo.commitment,
                    utxo.asset_id,
                    utxo.token_id,
                    amount_to_decimal(&utxo.amount),
                    utxo.nullifier,
                    utxo.mk_index,
                    utxo.is_frozen as i64,
                    utxo.is_spent as i64,
                    utxo.memo,
                    utxo.created_at,
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    async fn list_utxos(&self, q: &UtxoQuery) -> Result<Page<UtxoRecord>> {
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;

        let mut where_sql = String::from("wallet_id = ?1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(wallet)];

        fn push(
            clause: &str,
            value: Box<dyn rusqlite::types::ToSql>,
            where_sql: &mut String,
            args: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
        ) {
            args.push(value);
            where_sql.push_str(&format!(" AND {} ?{}", clause, args.len()));
        }

        if let Some(chain) = q.chain_id {
            push("chain_id =", Box::new(chain), &mut where_sql, &mut args);
        }
        if let Some(ref asset) = q.asset_id {
            push("asset_id =", Box::new(asset.clone()), &mut where_sql, &mut args);
        }
        if let Some(ref token) = q.token_id {
            push("token_id =", Box::new(token.clone()), &mut where_sql, &mut args);
        }
        match q.spent {
            Some(spent) => push("is_spent =", Box::new(spent as i64), &mut where_sql, &mut args),
            None if !q.include_spent => where_sql.push_str(" AND is_spent = 0"),
            None => {}
        }
        match q.frozen {
            Some(frozen) => push("is_frozen =", Box::new(frozen as i64), &mut where_sql, &mut args),
            None if !q.include_frozen => where_sql.push_str(" AND is_frozen = 0"),
            None => {}
        }
        if let Some(from) = q.cid_from {
            push("mk_index >=", Box::new(from), &mut where_sql, &mut args);
        }
        if let Some(to) = q.cid_to {
            push("mk_index <=", Box::new(to), &mut where_sql, &mut args);
        }
        if let Some(from) = q.created_from {
            push("COALESCE(created_at, 0) >=", Box::new(from), &mut where_sql, &mut args);
        }
        if let Some(to) = q.created_to {
            push(
                "COALESCE(created_at, 9223372036854775807) <=",
                Box::new(to),
                &mut where_sql,
                &mut args,
            );
        }

        let total: u64 = state
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM utxos WHERE {}", where_sql),
                params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        let dir = match q.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        // Rows with created_at always sort before rows without one.
        let order_sql = match q.order_by {
            OrderBy::CreatedAt => format!(
                "(created_at IS NULL) ASC, created_at {}, mk_index ASC, commitment ASC",
                dir
            ),
            _ => format!("mk_index {}, commitment ASC", dir),
        };
        let limit = q.limit.map(|l| l as i64).unwrap_or(-1);

        let sql = format!(
            "SELECT * FROM utxos WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
            where_sql, order_sql, limit, q.offset
        );

        let mut stmt = state.conn.prepare(&sql).map_err(sql_err)?;
        let mapped = stmt
            .query_map(params_from_iter(args.iter().map(|a| a.as_ref())), read_utxo_row)
            .map_err(sql_err)?;

        let mut rows = Vec::new();
        for item in mapped {
            let (mut utxo, amount_text) = item.map_err(sql_err)?;
            utxo.amount = amount_from_decimal(&amount_text)?;
            rows.push(utxo);
        }

        Ok(Page { total, rows })
    }

    async fn mark_spent(&self, chain_id: u64, nullifiers: &[Hex]) -> Result<u64> {
        if nullifiers.is_empty() {
            return Ok(0);
        }
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;

        let placeholders: Vec<String> = (0..nullifiers.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        let sql = format!(
            "UPDATE utxos SET is_spent = 1
             WHERE wallet_id = ?1 AND chain_id = ?2 AND is_spent = 0
               AND LOWER(nullifier) IN ({})",
            placeholders.join(", ")
        );

        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(wallet), Box::new(chain_id)];
        for n in nullifiers {
            args.push(Box::new(n.to_lowercase()));
        }

        let updated = state
            .conn
            .execute(&sql, params_from_iter(args.iter().map(|a| a.as_ref())))
            .map_err(sql_err)?;
        Ok(updated as u64)
    }

    async fn put_operation(&self, op: &OperationRecord) -> Result<()> {
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;
        let detail = op
            .detail
            .as_ref()
            .map(|d| serde_json::to_string(d))
            .transpose()
            .map_err(|e| Error::storage(format!("serialize operation detail: {}", e)))?;
        state
            .conn
            .execute(
                "INSERT INTO operations (wallet_id, id, op_type, status, created_at, chain_id,
                                         token_id, request_url, relayer_tx_hash, tx_hash,
                                         detail, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT (wallet_id, id) DO UPDATE SET
                    op_type = excluded.op_type,
                    status = excluded.status,
                    created_at = excluded.created_at,
                    chain_id = excluded.chain_id,
                    token_id = excluded.token_id,
                    request_url = excluded.request_url,
                    relayer_tx_hash = excluded.relayer_tx_hash,
                    tx_hash = excluded.tx_hash,
                    detail = excluded.detail,
                    error = excluded.error",
                params![
                    wallet,
                    op.id,
                    op.op_type,
                    status_to_str(op.status),
                    op.created_at,
                    op.chain_id,
                    op.token_id,
                    op.request_url,
                    op.relayer_tx_hash,
                    op.tx_hash,
                    detail,
                    op.error,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    async fn get_operation(&self, id: &str) -> Result<Option<OperationRecord>> {
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;
        let row = state
            .conn
            .query_row(
                "SELECT id, op_type, status, created_at, chain_id, token_id, request_url,
                        relayer_tx_hash, tx_hash, detail, error
                 FROM operations WHERE wallet_id = ?1 AND id = ?2",
                params![wallet, id],
                |row| {
                    Ok((
                        OperationRecord {
                            id: row.get(0)?,
                            op_type: row.get(1)?,
                            status: OperationStatus::Created,
                            created_at: row.get(3)?,
                            chain_id: row.get(4)?,
                            token_id: row.get(5)?,
                            request_url: row.get(6)?,
                            relayer_tx_hash: row.get(7)?,
                            tx_hash: row.get(8)?,
                            detail: None,
                            error: row.get(10)?,
                        },
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;

        match row {
            None => Ok(None),
            Some((mut op, status_text, detail_text)) => {
                op.status = status_from_str(&status_text)?;
                op.detail = detail_text
                    .map(|d| serde_json::from_str(&d))
                    .transpose()
                    .map_err(|e| Error::storage(format!("corrupt operation detail: {}", e)))?;
                Ok(Some(op))
            }
        }
    }

    async fn list_operations(&self, q: &OperationQuery) -> Result<Page<OperationRecord>> {
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;

        // Candidate rows by wallet/chain; the shared query engine applies
        // the remaining semantics.
        let mut stmt = state
            .conn
            .prepare(
                "SELECT id, op_type, status, created_at, chain_id, token_id, request_url,
                        relayer_tx_hash, tx_hash, detail, error
                 FROM operations WHERE wallet_id = ?1",
            )
            .map_err(sql_err)?;
        let mapped = stmt
            .query_map(params![wallet], |row| {
                Ok((
                    OperationRecord {
                        id: row.get(0)?,
                        op_type: row.get(1)?,
                        status: OperationStatus::Created,
                        created_at: row.get(3)?,
                        chain_id: row.get(4)?,
                        token_id: row.get(5)?,
                        request_url: row.get(6)?,
                        relayer_tx_hash: row.get(7)?,
                        tx_hash: row.get(8)?,
                        detail: None,
                        error: row.get(10)?,
                    },
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })
            .map_err(sql_err)?;

        let mut rows = Vec::new();
        for item in mapped {
            let (mut op, status_text, detail_text) = item.map_err(sql_err)?;
            op.status = status_from_str(&status_text)?;
            op.detail = detail_text
                .map(|d| serde_json::from_str(&d))
                .transpose()
                .map_err(|e| Error::storage(format!("corrupt operation detail: {}", e)))?;
            rows.push(op);
        }

        Ok(crate::query::page_operations(rows, q))
    }

    async fn delete_operations(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "DELETE FROM operations WHERE wallet_id = ?1 AND id IN ({})",
            placeholders.join(", ")
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(wallet)];
        for id in ids {
            args.push(Box::new(id.clone()));
        }
        state
            .conn
            .execute(&sql, params_from_iter(args.iter().map(|a| a.as_ref())))
            .map_err(sql_err)?;
        Ok(())
    }

    async fn prune_operations(&self, max: usize) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let wallet = Self::wallet_of(&state)?;

        let mut stmt = state
            .conn
            .prepare(
                "SELECT id FROM operations WHERE wallet_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )
            .map_err(sql_err)?;
        let ids: Vec<String> = stmt
            .query_map(params![wallet], |row| row.get(0))
            .map_err(sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(sql_err)?;

        if ids.len() <= max {
            return Ok(Vec::new());
        }
        let dropped: Vec<String> = ids[..ids.len() - max].to_vec();

        let placeholders: Vec<String> =
            (0..dropped.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "DELETE FROM operations WHERE wallet_id = ?1 AND id IN ({})",
            placeholders.join(", ")
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(wallet)];
        for id in &dropped {
            args.push(Box::new(id.clone()));
        }
        state
            .conn
            .execute(&sql, params_from_iter(args.iter().map(|a| a.as_ref())))
            .map_err(sql_err)?;

        Ok(dropped)
    }

    fn supports_local_merkle(&self) -> bool {
        true
    }

    async fn append_merkle_leaves(&self, chain_id: u64, leaves: &[MerkleLeafRecord]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let mut expected: u64 = tx
            .query_row(
                "SELECT COUNT(*) FROM merkle_leaves WHERE chain_id = ?1",
                params![chain_id],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
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
            tx.execute(
                "INSERT INTO merkle_leaves (chain_id, cid, commitment) VALUES (?1, ?2, ?3)",
                params![chain_id, leaf.cid, leaf.commitment],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    async fn get_merkle_leaves(&self, chain_id: u64) -> Result<Vec<MerkleLeafRecord>> {
        let state = self.state.lock().unwrap();
        let mut stmt = state
            .conn
            .prepare("SELECT cid, commitment FROM merkle_leaves WHERE chain_id = ?1 ORDER BY cid")
            .map_err(sql_err)?;
        let result = stmt
            .query_map(params![chain_id], |row| {
                Ok(MerkleLeafRecord {
                    chain_id,
                    cid: row.get(0)?,
                    commitment: row.get(1)?,
                })
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(sql_err);
        result
    }

    async fn get_merkle_leaf(&self, chain_id: u64, cid: u64) -> Result<Option<MerkleLeafRecord>> {
        let state = self.state.lock().unwrap();
        state
            .conn
            .query_row(
                "SELECT commitment FROM merkle_leaves WHERE chain_id = ?1 AND cid = ?2",
                params![chain_id, cid],
                |row| {
                    Ok(MerkleLeafRecord {
                        chain_id,
                        cid,
                        commitment: row.get(0)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    async fn get_merkle_node(&self, chain_id: u64, id: &str) -> Result<Option<MerkleNodeRecord>> {
        let state = self.state.lock().unwrap();
        state
            .conn
            .query_row(
                "SELECT level, position, hash FROM merkle_nodes
                 WHERE chain_id = ?1 AND id = ?2",
                params![chain_id, id],
                |row| {
                    Ok(MerkleNodeRecord {
                        chain_id,
                        id: id.to_string(),
                        level: row.get(0)?,
                        position: row.get(1)?,
                        hash: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    async fn upsert_merkle_nodes(&self, chain_id: u64, nodes: &[MerkleNodeRecord]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        for node in nodes {
            tx.execute(
                "INSERT INTO merkle_nodes (chain_id, id, level, position, hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (chain_id, id) DO UPDATE SET
                    level = excluded.level,
                    position = excluded.position,
                    hash = excluded.hash",
                params![chain_id, node.id, node.level, node.position, node.hash],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    async fn get_merkle_tree(&self, chain_id: u64) -> Result<Option<MerkleTreeState>> {
        let state = self.state.lock().unwrap();
        state
            .conn
            .query_row(
                "SELECT root, total_elements, last_updated FROM merkle_trees
                 WHERE chain_id = ?1",
                params![chain_id],
                |row| {
                    Ok(MerkleTreeState {
                        chain_id,
                        root: row.get(0)?,
                        total_elements: row.get(1)?,
                        last_updated: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    async fn set_merkle_tree(&self, chain_id: u64, tree: &MerkleTreeState) -> Result<()> {
        let state = self.state.lock().unwrap();
        state
            .conn
            .execute(
                "INSERT INTO merkle_trees (chain_id, root, total_elements, last_updated)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (chain_id) DO UPDATE SET
                    root = excluded.root,
                    total_elements = excluded.total_elements,
                    last_updated = excluded.last_updated",
                params![chain_id, tree.root, tree.total_elements, tree.last_updated],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    async fn clear_merkle_tree(&self, chain_id: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        tx.execute("DELETE FROM merkle_leaves WHERE chain_id = ?1", params![chain_id])
            .map_err(sql_err)?;
        tx.execute("DELETE FROM merkle_nodes WHERE chain_id = ?1", params![chain_id])
            .map_err(sql_err)?;
        tx.execute("DELETE FROM merkle_trees WHERE chain_id = ?1", params![chain_id])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)
    }

    async fn apply_merkle_batch(
        &self,
        chain_id: u64,
        nodes: &[MerkleNodeRecord],
        tree: &MerkleTreeState,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        for node in nodes {
            tx.execute(
                "INSERT INTO merkle_nodes (chain_id, id, level, position, hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (chain_id, id) DO UPDATE SET
                    level = excluded.level,
                    position = excluded.position,
                    hash = excluded.hash",
                params![chain_id, node.id, node.level, node.position, node.hash],
            )
            .map_err(sql_err)?;
        }
        tx.execute(
            "INSERT INTO merkle_trees (chain_id, root, total_elements, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (chain_id) DO UPDATE SET
                root = excluded.root,
                total_elements = excluded.total_elements,
                last_updated = excluded.last_updated",
            params![chain_id, tree.root, tree.total_elements, tree.last_updated],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)
    }

    async fn upsert_entry_memos(&self, chain_id: u64, memos: &[EntryMemoRecord]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        for memo in memos {
            tx.execute(
                "INSERT INTO entry_memos (chain_id, cid, commitment, memo, tx_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (chain_id, cid) DO UPDATE SET
                    commitment = excluded.commitment,
                    memo = excluded.memo,
                    tx_hash = excluded.tx_hash,
                    created_at = excluded.created_at",
                params![chain_id, memo.cid, memo.commitment, memo.memo, memo.tx_hash, memo.created_at],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    async fn list_entry_memos(&self, q: &EntryMemoQuery) -> Result<Page<EntryMemoRecord>> {
        let state = self.state.lock().unwrap();

        let from = q.cid_from.unwrap_or(0);
        let to = q.cid_to.unwrap_or(u64::MAX);
        let total: u64 = state
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entry_memos
                 WHERE chain_id = ?1 AND cid >= ?2 AND cid <= ?3",
                params![q.chain_id, from, to],
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        let dir = match q.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let limit = q.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT cid, commitment, memo, tx_hash, created_at FROM entry_memos
             WHERE chain_id = ?1 AND cid >= ?2 AND cid <= ?3
             ORDER BY cid {} LIMIT {} OFFSET {}",
            dir, limit, q.offset
        );
        let mut stmt = state.conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![q.chain_id, from, to], |row| {
                Ok(EntryMemoRecord {
                    chain_id: q.chain_id,
                    cid: row.get(0)?,
                    commitment: row.get(1)?,
                    memo: row.get(2)?,
                    tx_hash: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;

        Ok(Page { total, rows })
    }

    async fn clear_entry_memos(&self, chain_id: u64) -> Result<()> {
        let state = self.state.lock().unwrap();
        state
            .conn
            .execute("DELETE FROM entry_memos WHERE chain_id = ?1", params![chain_id])
            .map_err(sql_err)?;
        Ok(())
    }

    async fn upsert_entry_nullifiers(
        &self,
        chain_id: u64,
        nullifiers: &[EntryNullifierRecord],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tx = state
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        for n in nullifiers {
            tx.execute(
                "INSERT INTO entry_nullifiers (chain_id, nid, nullifier, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (chain_id, nid) DO UPDATE SET
                    nullifier = excluded.nullifier,
                    created_at = excluded.created_at",
                params![chain_id, n.nid, n.nullifier, n.created_at],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    async fn list_entry_nullifiers(
        &self,
        q: &EntryNullifierQuery,
    ) -> Result<Page<EntryNullifierRecord>> {
        let state = self.state.lock().unwrap();

        let from = q.nid_from.unwrap_or(0);
        let to = q.nid_to.unwrap_or(u64::MAX);
        let total: u64 = state
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entry_nullifiers
                 WHERE chain_id = ?1 AND nid >= ?2 AND nid <= ?3",
                params![q.chain_id, from, to],
                |row| row.get(0),
            )
            .map_err(sql_err)?;

        let dir = match q.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let limit = q.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT nid, nullifier, created_at FROM entry_nullifiers
             WHERE chain_id = ?1 AND nid >= ?2 AND nid <= ?3
             ORDER BY nid {} LIMIT {} OFFSET {}",
            dir, limit, q.offset
        );
        let mut stmt = state.conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![q.chain_id, from, to], |row| {
                Ok(EntryNullifierRecord {
                    chain_id: q.chain_id,
                    nid: row.get(0)?,
                    nullifier: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;

        Ok(Page { total, rows })
    }

    async fn clear_entry_nullifiers(&self, chain_id: u64) -> Result<()> {
        let state = self.state.lock().unwrap();
        state
            .conn
            .execute(
                "DELETE FROM entry_nullifiers WHERE chain_id = ?1",
                params![chain_id],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}
