//! Uniform filter / sort / page semantics shared by every adapter.
//!
//! Text-backed adapters load candidate rows and run these functions
//! in-memory; the SQL adapter translates the same semantics into
//! WHERE / ORDER BY / LIMIT.

use serde::{Deserialize, Serialize};

use crate::{EntryMemoRecord, EntryNullifierRecord, OperationRecord, OperationStatus, UtxoRecord};

/// One page of query results plus the pre-pagination total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub total: u64,
    pub rows: Vec<T>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            total: 0,
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Primary sort key. Which variants apply depends on the entity: UTXOs sort
/// by mk_index or created_at, entry memos by cid, entry nullifiers by nid,
/// operations by created_at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderBy {
    MkIndex,
    Cid,
    Nid,
    CreatedAt,
}

#[derive(Debug, Clone)]
pub struct UtxoQuery {
    pub chain_id: Option<u64>,
    pub asset_id: Option<String>,
    pub token_id: Option<String>,
    /// Keep spent rows in the result set. Ignored when `spent` pins an
    /// exact value.
    pub include_spent: bool,
    pub include_frozen: bool,
    pub spent: Option<bool>,
    pub frozen: Option<bool>,
    pub cid_from: Option<u64>,
    pub cid_to: Option<u64>,
    pub created_from: Option<u64>,
    pub created_to: Option<u64>,
    pub order: SortOrder,
    pub order_by: OrderBy,
    pub offset: u64,
    /// `None` means "the rest".
    pub limit: Option<u64>,
}

impl Default for UtxoQuery {
    fn default() -> Self {
        Self {
            chain_id: None,
            asset_id: None,
            token_id: None,
            include_spent: false,
            include_frozen: true,
            spent: None,
            frozen: None,
            cid_from: None,
            cid_to: None,
            created_from: None,
            created_to: None,
            order: SortOrder::Asc,
            order_by: OrderBy::MkIndex,
            offset: 0,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationQuery {
    pub chain_id: Option<u64>,
    pub token_id: Option<String>,
    pub op_types: Option<Vec<String>>,
    pub statuses: Option<Vec<OperationStatus>>,
    pub created_from: Option<u64>,
    pub created_to: Option<u64>,
    pub order: SortOrder,
    pub offset: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EntryMemoQuery {
    pub chain_id: u64,
    pub cid_from: Option<u64>,
    pub cid_to: Option<u64>,
    pub order: SortOrder,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl EntryMemoQuery {
    pub fn chain(chain_id: u64) -> Self {
        Self {
            chain_id,
            cid_from: None,
            cid_to: None,
            order: SortOrder::Asc,
            offset: 0,
            limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntryNullifierQuery {
    pub chain_id: u64,
    pub nid_from: Option<u64>,
    pub nid_to: Option<u64>,
    pub order: SortOrder,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl EntryNullifierQuery {
    pub fn chain(chain_id: u64) -> Self {
        Self {
            chain_id,
            nid_from: None,
            nid_to: None,
            order: SortOrder::Asc,
            offset: 0,
            limit: None,
        }
    }
}

/// Compare optional timestamps: rows carrying a value sort before rows
/// without one; `order` only flips the value comparison.
fn cmp_created_at(a: Option<u64>, b: Option<u64>, order: SortOrder) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
        (Some(x), Some(y)) => match order {
            SortOrder::Asc => x.cmp(&y),
            SortOrder::Desc => y.cmp(&x),
        },
    }
}

fn cmp_u64(a: u64, b: u64, order: SortOrder) -> std::cmp::Ordering {
    match order {
        SortOrder::Asc => a.cmp(&b),
        SortOrder::Desc => b.cmp(&a),
    }
}

fn paginate<T>(mut rows: Vec<T>, offset: u64, limit: Option<u64>) -> Page<T> {
    let total = rows.len() as u64;
    let start = offset.min(total) as usize;
    rows.drain(..start);
    if let Some(limit) = limit {
        rows.truncate(limit as usize);
    }
    Page { total, rows }
}

pub fn page_utxos(rows: Vec<UtxoRecord>, q: &UtxoQuery) -> Page<UtxoRecord> {
    let mut filtered: Vec<UtxoRecord> = rows
        .into_iter()
        .filter(|u| {
            if let Some(chain) = q.chain_id {
                if u.chain_id != chain {
                    return false;
                }
            }
            if let Some(ref asset) = q.asset_id {
                if &u.asset_id != asset {
                    return false;
                }
            }
            if let Some(ref token) = q.token_id {
                if u.token_id.as_deref() != Some(token.as_str()) {
                    return false;
                }
            }
            match q.spent {
                Some(spent) => {
                    if u.is_spent != spent {
                        return false;
                    }
                }
                None => {
                    if !q.include_spent && u.is_spent {
                        return false;
                    }
                }
            }
            match q.frozen {
                Some(frozen) => {
                    if u.is_frozen != frozen {
                        return false;
                    }
                }
                None => {
                    if !q.include_frozen && u.is_frozen {
                        return false;
                    }
                }
            }
            if let Some(from) = q.cid_from {
                if u.mk_index < from {
                    return false;
                }
            }
            if let Some(to) = q.cid_to {
                if u.mk_index > to {
                    return false;
                }
            }
            if let Some(from) = q.created_from {
                if u.created_at.unwrap_or(0) < from {
                    return false;
                }
            }
            if let Some(to) = q.created_to {
                if u.created_at.unwrap_or(u64::MAX) > to {
                    return false;
                }
            }
            true
        })
        .collect();

    filtered.sort_by(|a, b| {
        let primary = match q.order_by {
            OrderBy::CreatedAt => cmp_created_at(a.created_at, b.created_at, q.order),
            _ => cmp_u64(a.mk_index, b.mk_index, q.order),
        };
        primary
            .then_with(|| a.mk_index.cmp(&b.mk_index))
            .then_with(|| a.commitment.cmp(&b.commitment))
    });

    paginate(filtered, q.offset, q.limit)
}

pub fn page_operations(rows: Vec<OperationRecord>, q: &OperationQuery) -> Page<OperationRecord> {
    let mut filtered: Vec<OperationRecord> = rows
        .into_iter()
        .filter(|op| {
            if let Some(chain) = q.chain_id {
                if op.chain_id != Some(chain) {
                    return false;
                }
            }
            if let Some(ref token) = q.token_id {
                if op.token_id.as_deref() != Some(token.as_str()) {
                    return false;
                }
            }
            if let Some(ref types) = q.op_types {
                if !types.iter().any(|t| t == &op.op_type) {
                    return false;
                }
            }
            if let Some(ref statuses) = q.statuses {
                if !statuses.contains(&op.status) {
                    return false;
                }
            }
            if let Some(from) = q.created_from {
                if op.created_at < from {
                    return false;
                }
            }
            if let Some(to) = q.created_to {
                if op.created_at > to {
                    return false;
                }
            }
            true
        })
        .collect();

    filtered.sort_by(|a, b| {
        cmp_u64(a.created_at, b.created_at, q.order).then_with(|| a.id.cmp(&b.id))
    });

    paginate(filtered, q.offset, q.limit)
}

pub fn page_entry_memos(rows: Vec<EntryMemoRecord>, q: &EntryMemoQuery) -> Page<EntryMemoRecord> {
    let mut filtered: Vec<EntryMemoRecord> = rows
        .into_iter()
        .filter(|m| {
            m.chain_id == q.chain_id
                && q.cid_from.map_or(true, |from| m.cid >= from)
                && q.cid_to.map_or(true, |to| m.cid <= to)
        })
        .collect();

    filtered.sort_by(|a, b| cmp_u64(a.cid, b.cid, q.order));

    paginate(filtered, q.offset, q.limit)
}

pub fn page_entry_nullifiers(
    rows: Vec<EntryNullifierRecord>,
    q: &EntryNullifierQuery,
) -> Page<EntryNullifierRecord> {
    let mut filtered: Vec<EntryNullifierRecord> = rows
        .into_iter()
        .filter(|n| {
            n.chain_id == q.chain_id
                && q.nid_from.map_or(true, |from| n.nid >= from)
                && q.nid_to.map_or(true, |to| n.nid <= to)
        })
        .collect();

    filtered.sort_by(|a, b| cmp_u64(a.nid, b.nid, q.order));

    paginate(filtered, q.offset, q.limit)
}
