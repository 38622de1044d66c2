//! Coin selection and fee math for transfer / withdraw planning.
//!
//! Transfers spend up to 3 inputs and produce recipient + change outputs;
//! withdrawals burn a single input. Selection is greedy over descending
//! amounts. All arithmetic is arbitrary precision.

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use veil_store::UtxoRecord;
use veil_types::{Amount, Error, Result};

/// Protocol cap on transfer inputs.
pub const MAX_TRANSFER_INPUTS: usize = 3;

/// Fee breakdown attached to a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSummary {
    #[serde(with = "veil_types::amount_serde")]
    pub relayer_fee: Amount,
    #[serde(with = "veil_types::amount_serde")]
    pub protocol_fee: Amount,
    #[serde(with = "veil_types::amount_serde")]
    pub total_fee: Amount,
}

impl FeeSummary {
    pub fn new(relayer_fee: Amount, protocol_fee: Amount) -> Self {
        let total_fee = &relayer_fee + &protocol_fee;
        Self {
            relayer_fee,
            protocol_fee,
            total_fee,
        }
    }
}

/// Selected inputs plus their sum.
#[derive(Debug, Clone)]
pub struct CoinSelection {
    pub selected: Vec<UtxoRecord>,
    pub total: Amount,
}

/// A transfer ready for witness construction.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub chain_id: u64,
    pub asset_id: String,
    pub send_amount: Amount,
    pub change_amount: Amount,
    pub inputs: Vec<UtxoRecord>,
    pub fees: FeeSummary,
}

/// A withdrawal ready for witness construction.
#[derive(Debug, Clone)]
pub struct WithdrawPlan {
    pub chain_id: u64,
    pub asset_id: String,
    pub burn_amount: Amount,
    pub change_amount: Amount,
    pub input: UtxoRecord,
    pub fees: FeeSummary,
}

fn spendable(utxos: &[UtxoRecord], asset_id: &str) -> Vec<UtxoRecord> {
    let mut candidates: Vec<UtxoRecord> = utxos
        .iter()
        .filter(|u| u.asset_id == asset_id && !u.is_spent && !u.is_frozen)
        .cloned()
        .collect();
    // Largest first.
    candidates.sort_by(|a, b| b.amount.cmp(&a.amount));
    candidates
}

/// Greedy selection of up to `max_inputs` UTXOs covering `required`.
pub fn select_transfer_inputs(
    utxos: &[UtxoRecord],
    asset_id: &str,
    required: &Amount,
    max_inputs: usize,
) -> Option<CoinSelection> {
    let candidates = spendable(utxos, asset_id);

    let mut selected = Vec::new();
    let mut total = BigUint::zero();
    for utxo in candidates.into_iter().take(max_inputs) {
        total += &utxo.amount;
        selected.push(utxo);
        if total >= *required {
            return Some(CoinSelection { selected, total });
        }
    }
    None
}

/// Pick one UTXO covering `required` (withdrawals burn a single note).
pub fn select_withdraw_input(
    utxos: &[UtxoRecord],
    asset_id: &str,
    required: &Amount,
) -> Option<UtxoRecord> {
    spendable(utxos, asset_id)
        .into_iter()
        .find(|u| u.amount >= *required)
}

/// Plan a transfer of `amount` with the given relayer fee.
pub fn plan_transfer(
    chain_id: u64,
    asset_id: &str,
    utxos: &[UtxoRecord],
    amount: &Amount,
    relayer_fee: &Amount,
) -> Result<TransferPlan> {
    if amount.is_zero() {
        return Err(Error::config("transfer amount must be positive"));
    }
    let required = amount + relayer_fee;
    let selection = select_transfer_inputs(utxos, asset_id, &required, MAX_TRANSFER_INPUTS)
        .ok_or_else(|| {
            Error::config(format!(
                "insufficient balance: need {} of asset {}",
                required, asset_id
            ))
        })?;

    let change_amount = &selection.total - &required;
    Ok(TransferPlan {
        chain_id,
        asset_id: asset_id.to_string(),
        send_amount: amount.clone(),
        change_amount,
        inputs: selection.selected,
        fees: FeeSummary::new(relayer_fee.clone(), BigUint::zero()),
    })
}

/// Plan a withdrawal of `amount` with relayer and protocol fees.
pub fn plan_withdraw(
    chain_id: u64,
    asset_id: &str,
    utxos: &[UtxoRecord],
    amount: &Amount,
    relayer_fee: &Amount,
    protocol_fee: &Amount,
) -> Result<WithdrawPlan> {
    if amount.is_zero() {
        return Err(Error::config("withdraw amount must be positive"));
    }
    let burn_amount = amount + relayer_fee + protocol_fee;
    let input = select_withdraw_input(utxos, asset_id, &burn_amount).ok_or_else(|| {
        Error::config(format!(
            "no single note covers {} of asset {}",
            burn_amount, asset_id
        ))
    })?;

    let change_amount = &input.amount - &burn_amount;
    Ok(WithdrawPlan {
        chain_id,
        asset_id: asset_id.to_string(),
        burn_amount,
        change_amount,
        input,
        fees: FeeSummary::new(relayer_fee.clone(), protocol_fee.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(amount: u64, spent: bool, frozen: bool) -> UtxoRecord {
        UtxoRecord {
            chain_id: 1,
            commitment: format!("0x{:x}", amount),
            asset_id: "0x01".into(),
            token_id: None,
            amount: BigUint::from(amount),
            nullifier: format!("0xn{:x}", amount),
            mk_index: 0,
            is_frozen: frozen,
            is_spent: spent,
            memo: None,
            created_at: None,
        }
    }

    #[test]
    fn greedy_selection_prefers_large_notes() {
        let utxos = vec![utxo(10, false, false), utxo(500, false, false), utxo(90, false, false)];
        let selection =
            select_transfer_inputs(&utxos, "0x01", &BigUint::from(100u32), MAX_TRANSFER_INPUTS)
                .unwrap();
        assert_eq!(selection.selected.len(), 1);
        assert_eq!(selection.total, BigUint::from(500u32));
    }

    #[test]
    fn selection_skips_spent_and_frozen() {
        let utxos = vec![utxo(500, true, false), utxo(400, false, true), utxo(90, false, false)];
        let selection =
            select_transfer_inputs(&utxos, "0x01", &BigUint::from(100u32), MAX_TRANSFER_INPUTS);
        assert!(selection.is_none());
    }

    #[test]
    fn input_cap_is_enforced() {
        let utxos: Vec<UtxoRecord> = (1..=5).map(|i| utxo(i * 10, false, false)).collect();
        // 50+40+30 = 120 < 130: not coverable in three inputs.
        let selection =
            select_transfer_inputs(&utxos, "0x01", &BigUint::from(130u32), MAX_TRANSFER_INPUTS);
        assert!(selection.is_none());
    }

    #[test]
    fn transfer_plan_computes_change() {
        let utxos = vec![utxo(1000, false, false)];
        let plan = plan_transfer(
            1,
            "0x01",
            &utxos,
            &BigUint::from(700u32),
            &BigUint::from(25u32),
        )
        .unwrap();
        assert_eq!(plan.change_amount, BigUint::from(275u32));
        assert_eq!(plan.fees.total_fee, BigUint::from(25u32));
    }

    #[test]
    fn withdraw_needs_one_covering_note() {
        let utxos = vec![utxo(60, false, false), utxo(50, false, false)];
        // 60 + 50 would cover it, but withdraw burns one note only.
        let plan = plan_withdraw(
            1,
            "0x01",
            &utxos,
            &BigUint::from(100u32),
            &BigUint::from(5u32),
            &BigUint::from(5u32),
        );
        assert!(plan.is_err());

        let utxos = vec![utxo(200u64, false, false)];
        let plan = plan_withdraw(
            1,
            "0x01",
            &utxos,
            &BigUint::from(100u32),
            &BigUint::from(5u32),
            &BigUint::from(5u32),
        )
        .unwrap();
        assert_eq!(plan.burn_amount, BigUint::from(110u32));
        assert_eq!(plan.change_amount, BigUint::from(90u32));
    }

    #[test]
    fn zero_amount_is_rejected() {
        let utxos = vec![utxo(10, false, false)];
        assert!(plan_transfer(1, "0x01", &utxos, &BigUint::zero(), &BigUint::zero()).is_err());
    }
}
