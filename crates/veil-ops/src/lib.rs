//! Operation preparation: deposits, transfers and withdrawals.
//!
//! Coordinates the planner, the merkle accumulator, the crypto stack and
//! the relayer request shape. Proof generation itself stays behind the
//! [`ProofBridge`] capability.

use std::sync::Arc;

use ark_bn254::Fr;
use async_trait::async_trait;

use veil_crypto::edwards::Point;
use veil_crypto::keys::KeyPair;
use veil_crypto::note::{self, NotePlaintext};
use veil_crypto::memo;
use veil_merkle::{verify_proof, MerkleAccumulator, TREE_DEPTH};
use veil_planner::{plan_transfer, plan_withdraw, FeeSummary, TransferPlan, WithdrawPlan};
use veil_relayer::{RelayerAction, RelayerRequest};
use veil_store::{StorageAdapter, UtxoQuery, UtxoRecord};
use veil_types::{
    amount_from_field, amount_to_field, field_to_hex, Amount, Error, Hex, Result,
};

/// A deposit ready for on-chain submission by the caller.
#[derive(Debug, Clone)]
pub struct PreparedDeposit {
    pub chain_id: u64,
    pub note: NotePlaintext,
    pub commitment: Fr,
    pub memo: Hex,
}

/// Everything the circuit needs to know about one spent input.
#[derive(Debug, Clone)]
pub struct InputSecret {
    pub owner: KeyPair,
    pub note: NotePlaintext,
    pub merkle_root: Fr,
    pub merkle_path: Vec<Fr>,
    pub mk_index: u64,
}

/// Witness for the transfer circuit.
#[derive(Debug, Clone)]
pub struct TransferWitness {
    pub chain_id: u64,
    pub inputs: Vec<InputSecret>,
    pub outputs: Vec<NotePlaintext>,
    pub merkle_root: Fr,
    pub relayer_fee: Amount,
}

/// Witness for the burn (withdraw) circuit.
#[derive(Debug, Clone)]
pub struct BurnWitness {
    pub chain_id: u64,
    pub input: InputSecret,
    pub change: NotePlaintext,
    pub recipient: Hex,
    pub merkle_root: Fr,
    pub fees: FeeSummary,
}

/// Output of the proof system, ready to relay.
#[derive(Debug, Clone)]
pub struct ProofArtifacts {
    pub proof: Hex,
    pub public_inputs: Vec<Hex>,
    pub extra_data: Hex,
}

/// Zero-knowledge proof capability. Circuit and witness formats live with
/// the implementer.
#[async_trait]
pub trait ProofBridge: Send + Sync {
    async fn prove_transfer(&self, witness: &TransferWitness) -> Result<ProofArtifacts>;
    async fn prove_burn(&self, witness: &BurnWitness) -> Result<ProofArtifacts>;
}

#[derive(Debug, Clone)]
pub struct PreparedTransfer {
    pub plan: TransferPlan,
    pub outputs: Vec<NotePlaintext>,
    pub output_memos: Vec<Hex>,
    pub request: RelayerRequest,
}

#[derive(Debug, Clone)]
pub struct PreparedWithdraw {
    pub plan: WithdrawPlan,
    pub change: NotePlaintext,
    pub change_memo: Hex,
    pub request: RelayerRequest,
}

pub struct OpsEngine {
    store: Arc<dyn StorageAdapter>,
    accumulator: Arc<MerkleAccumulator>,
    bridge: Arc<dyn ProofBridge>,
}

impl OpsEngine {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        accumulator: Arc<MerkleAccumulator>,
        bridge: Arc<dyn ProofBridge>,
    ) -> Self {
        Self {
            store,
            accumulator,
            bridge,
        }
    }

    /// Mint a fresh note and its sealed memo. The caller submits the
    /// on-chain deposit transaction.
    pub fn prepare_deposit(
        &self,
        chain_id: u64,
        asset_id: Fr,
        amount: &Amount,
        owner_pk: Point,
    ) -> Result<PreparedDeposit> {
        let note_plain = NotePlaintext {
            asset_id,
            amount: amount_to_field(amount)?,
            owner_pk,
            blinding: note::random_blinding(),
            is_frozen: false,
        };

        let commitment = note::commitment(&note_plain);
        let sealed = memo::seal(&note_plain)?;

        Ok(PreparedDeposit {
            chain_id,
            note: note_plain,
            commitment,
            memo: sealed,
        })
    }

    /// Decrypt each input's memo and attach a verified inclusion proof.
    pub async fn build_input_secrets(
        &self,
        chain_id: u64,
        utxos: &[UtxoRecord],
        owner: &KeyPair,
        total_elements: u64,
    ) -> Result<Vec<InputSecret>> {
        let cids: Vec<u64> = utxos.iter().map(|u| u.mk_index).collect();
        let bundle = self.accumulator.proof_by_cids(chain_id, &cids, total_elements).await?;

        let mut secrets = Vec::with_capacity(utxos.len());
        for (utxo, proof) in utxos.iter().zip(bundle.proofs.iter()) {
            let sealed = utxo
                .memo
                .as_deref()
                .ok_or_else(|| Error::crypto(format!("utxo {} has no memo", utxo.commitment)))?;
            let note_plain = memo::open(&owner.secret, sealed)?.ok_or_else(|| {
                Error::crypto(format!("utxo {} memo does not decrypt", utxo.commitment))
            })?;

            if proof.is_stub() {
                return Err(Error::merkle(format!(
                    "utxo {} is not yet in the main tree",
                    utxo.commitment
                )));
            }
            if !verify_proof(proof, bundle.root, TREE_DEPTH) {
                return Err(Error::merkle(format!(
                    "inclusion proof for cid {} does not verify",
                    utxo.mk_index
                )));
            }

            secrets.push(InputSecret {
                owner: *owner,
                note: note_plain,
                merkle_root: bundle.root,
                merkle_path: proof.path.clone(),
                mk_index: utxo.mk_index,
            });
        }

        Ok(secrets)
    }

    /// Plan, prove and package a shielded transfer.
    #[allow(clippy::too_many_arguments)]
    pub async fn prepare_transfer(
        &self,
        chain_id: u64,
        asset_id: Fr,
        owner: &KeyPair,
        recipient_pk: Point,
        amount: &Amount,
        relayer_fee: &Amount,
        total_elements: u64,
    ) -> Result<PreparedTransfer> {
        let asset_hex = field_to_hex(&asset_id);
        let page = self
            .store
            .list_utxos(&UtxoQuery {
                chain_id: Some(chain_id),
                asset_id: Some(asset_hex.clone()),
                include_frozen: false,
                ..Default::default()
            })
            .await?;

        let plan = plan_transfer(chain_id, &asset_hex, &page.rows, amount, relayer_fee)?;
        let inputs = self
            .build_input_secrets(chain_id, &plan.inputs, owner, total_elements)
            .await?;
        let merkle_root = inputs
            .first()
            .map(|i| i.merkle_root)
            .ok_or_else(|| Error::config("transfer needs at least one input"))?;

        // Recipient, change, and a zero-value filler output.
        let outputs = vec![
            NotePlaintext {
                asset_id,
                amount: amount_to_field(&plan.send_amount)?,
                owner_pk: recipient_pk,
                blinding: note::random_blinding(),
                is_frozen: false,
            },
            NotePlaintext {
                asset_id,
                amount: amount_to_field(&plan.change_amount)?,
                owner_pk: owner.public,
                blinding: note::random_blinding(),
                is_frozen: false,
            },
            NotePlaintext {
                asset_id,
                amount: Fr::from(0u64),
                owner_pk: owner.public,
                blinding: note::random_blinding(),
                is_frozen: false,
            },
        ];
        let output_memos: Vec<Hex> = outputs
            .iter()
            .map(memo::seal)
            .collect::<Result<Vec<_>>>()?;

        let witness = TransferWitness {
            chain_id,
            inputs,
            outputs: outputs.clone(),
            merkle_root,
            relayer_fee: relayer_fee.clone(),
        };
        let artifacts = self.bridge.prove_transfer(&witness).await?;

        Ok(PreparedTransfer {
            plan,
            outputs,
            output_memos,
            request: RelayerRequest {
                chain_id,
                action: RelayerAction::Transfer,
                proof: artifacts.proof,
                public_inputs: artifacts.public_inputs,
                extra_data: artifacts.extra_data,
            },
        })
    }

    /// Plan, prove and package a withdrawal to a transparent address.
    pub async fn prepare_withdraw(
        &self,
        chain_id: u64,
        asset_id: Fr,
        owner: &KeyPair,
        recipient: &str,
        amount: &Amount,
        relayer_fee: &Amount,
        protocol_fee: &Amount,
        total_elements: u64,
    ) -> Result<PreparedWithdraw> {
        let asset_hex = field_to_hex(&asset_id);
        let page = self
            .store
            .list_utxos(&UtxoQuery {
                chain_id: Some(chain_id),
                asset_id: Some(asset_hex.clone()),
                include_frozen: false,
                ..Default::default()
            })
            .await?;

        let plan = plan_withdraw(
            chain_id,
            &asset_hex,
            &page.rows,
            amount,
            relayer_fee,
            protocol_fee,
        )?;
        let inputs = self
            .build_input_secrets(
                chain_id,
                std::slice::from_ref(&plan.input),
                owner,
                total_elements,
            )
            .await?;
        let input = inputs.into_iter().next().expect("one input was requested");

        let change = NotePlaintext {
            asset_id,
            amount: amount_to_field(&plan.change_amount)?,
            owner_pk: owner.public,
            blinding: note::random_blinding(),
            is_frozen: false,
        };
        let change_memo = memo::seal(&change)?;

        let merkle_root = input.merkle_root;
        let witness = BurnWitness {
            chain_id,
            input,
            change: change.clone(),
            recipient: recipient.to_string(),
            merkle_root,
            fees: plan.fees.clone(),
        };
        let artifacts = self.bridge.prove_burn(&witness).await?;

        Ok(PreparedWithdraw {
            plan,
            change,
            change_memo,
            request: RelayerRequest {
                chain_id,
                action: RelayerAction::Burn,
                proof: artifacts.proof,
                public_inputs: artifacts.public_inputs,
                extra_data: artifacts.extra_data,
            },
        })
    }

    pub fn store(&self) -> &Arc<dyn StorageAdapter> {
        &self.store
    }

    /// Turn a decrypted note into its wallet UTXO row.
    pub fn utxo_from_note(
        &self,
        chain_id: u64,
        note_plain: &NotePlaintext,
        owner: &KeyPair,
        freezer_pk: Option<Point>,
        mk_index: u64,
        sealed_memo: Option<&str>,
        token_id: Option<String>,
    ) -> UtxoRecord {
        let commitment = note::commitment(note_plain);
        let nullifier = note::nullifier(&owner.secret, &commitment, freezer_pk);

        UtxoRecord {
            chain_id,
            commitment: field_to_hex(&commitment),
            asset_id: field_to_hex(&note_plain.asset_id),
            token_id,
            amount: amount_from_field(&note_plain.amount),
            nullifier: field_to_hex(&nullifier),
            mk_index,
            is_frozen: note_plain.is_frozen,
            is_spent: false,
            memo: sealed_memo.map(|s| s.to_string()),
            created_at: None,
        }
    }
}
