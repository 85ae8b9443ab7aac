//! BTC Payout Engine (spec §2 component H, §4.5): coin selection, nonce-
//! encoded locktime/sequence, PSBT construction, signing, fee-change
//! policing, broadcast, and confirmation tracking for `ToBtc` payouts.
//!
//! Every payout flows through the single [`crate::locks::PayoutQueue`]
//! (spec §5 "Global bitcoin-payout queue") -- this module only builds and
//! broadcasts one payout at a time per caller; serializing concurrent
//! callers against UTXO reuse is the queue's job, not this module's.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::btc_rpc::{BitcoinRpcError, BitcoinWallet};
use crate::payout::coinselect::{self, CoinSelectError, CoinSelection};
use crate::payout::nonce::{self, NonceError};
use crate::types::{PaymentHash, Sequence as SwapSequence};

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error(transparent)]
    CoinSelect(#[from] CoinSelectError),
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error(transparent)]
    Rpc(#[from] BitcoinRpcError),
    #[error(
        "realized fee rate {actual} sat/vB exceeds the swap's stored ceiling {max} sat/vB"
    )]
    FeeRateExceeded { actual: u64, max: u64 },
    #[error("realized fee {actual} sats exceeds the dust-adjusted maximum {max} sats")]
    FeeAmountExceeded { actual: u64, max: u64 },
    #[error("psbt is missing the signature for input {0}")]
    Unsigned(usize),
}

/// Everything the payout engine needs to build one `ToBtc` payout (spec
/// §4.5 "Build the payout PSBT").
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub output_script: ScriptBuf,
    pub amount_sats: u64,
    /// The swap's `escrowNonce`, encoded into every input's locktime/sequence.
    pub escrow_nonce: u64,
    /// Ceiling the swap's stored `sats-per-vbyte` enforces (spec §3
    /// invariant: "actual broadcast must be <= this").
    pub max_sats_per_vbyte: u64,
    pub fee_rate_target_blocks: u32,
}

/// A built, signed, and broadcast payout (spec §4.5: "persist txId and
/// realized fee, then broadcast").
#[derive(Debug, Clone)]
pub struct PayoutResult {
    pub txid: Txid,
    pub fee_sats: u64,
    pub realized_sats_per_vbyte: u64,
}

/// Builds, signs, and broadcasts a `ToBtc` payout transaction against a
/// [`BitcoinWallet`] (spec §4.5).
pub struct PayoutEngine<W> {
    wallet: Arc<W>,
}

impl<W: BitcoinWallet> PayoutEngine<W> {
    pub fn new(wallet: Arc<W>) -> Self {
        Self { wallet }
    }

    /// Runs the full build -> sign -> fee-police -> broadcast pipeline
    /// (spec §4.5 post-commit step 2). Callers must hold the swap's
    /// [`crate::locks::PayoutQueue`] permit for the whole call.
    pub async fn build_and_broadcast(&self, req: PayoutRequest) -> Result<PayoutResult, PayoutError> {
        let utxos = self.wallet.list_unspent(1).await?;
        let raw_fee_rate = self.wallet.estimate_fee_rate(req.fee_rate_target_blocks).await?;

        if raw_fee_rate > req.max_sats_per_vbyte {
            return Err(PayoutError::FeeRateExceeded {
                actual: raw_fee_rate,
                max: req.max_sats_per_vbyte,
            });
        }

        let selection = coinselect::select_utxos(&utxos, req.amount_sats, raw_fee_rate, 0)?;

        let encoded = nonce::encode(req.escrow_nonce)?;
        let psbt = self.build_psbt(&req, &selection, encoded.locktime, encoded.sequence).await?;
        let signed = self.wallet.sign_psbt(&psbt).await?;
        let tx = extract_tx(&signed)?;

        self.police_fee(&req, &selection, raw_fee_rate)?;

        let txid = self.wallet.broadcast(&tx).await?;
        Ok(PayoutResult {
            txid,
            fee_sats: selection.fee_sats,
            realized_sats_per_vbyte: selection.fee_sats / selection.estimated_vsize.max(1),
        })
    }

    async fn build_psbt(
        &self,
        req: &PayoutRequest,
        selection: &CoinSelection,
        locktime: u32,
        sequence: u32,
    ) -> Result<Psbt, PayoutError> {
        let inputs: Vec<TxIn> = selection
            .inputs
            .iter()
            .map(|u| TxIn {
                previous_output: OutPoint {
                    txid: u.txid,
                    vout: u.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence(sequence),
                witness: Witness::new(),
            })
            .collect();

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(req.amount_sats),
            script_pubkey: req.output_script.clone(),
        }];

        if let Some(change_sats) = selection.change_sats {
            let change_script = self.wallet.change_script_pubkey().await?;
            outputs.push(TxOut {
                value: Amount::from_sat(change_sats),
                script_pubkey: change_script,
            });
        }

        let unsigned_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(locktime),
            input: inputs,
            output: outputs,
        };

        Psbt::from_unsigned_tx(unsigned_tx).map_err(|_| PayoutError::Unsigned(0))
    }

    /// Re-checks the realized fee against both the per-vbyte ceiling and
    /// the dust-adjusted absolute ceiling (spec §4.5: "re-check fee bounds
    /// (including change-output-dropped-to-dust edge case)").
    fn police_fee(
        &self,
        req: &PayoutRequest,
        selection: &CoinSelection,
        fee_rate: u64,
    ) -> Result<(), PayoutError> {
        if fee_rate > req.max_sats_per_vbyte {
            return Err(PayoutError::FeeRateExceeded {
                actual: fee_rate,
                max: req.max_sats_per_vbyte,
            });
        }

        // maxAllowedFee = virtualSize * maxSatsPerVbyte + outputBytes(changeType) + dust(changeType)
        let max_allowed_fee = selection.estimated_vsize * req.max_sats_per_vbyte
            + coinselect::P2WPKH_OUTPUT_VBYTES
            + coinselect::P2WPKH_DUST_SATS;

        if selection.fee_sats > max_allowed_fee {
            return Err(PayoutError::FeeAmountExceeded {
                actual: selection.fee_sats,
                max: max_allowed_fee,
            });
        }

        Ok(())
    }
}

fn extract_tx(psbt: &Psbt) -> Result<Transaction, PayoutError> {
    for (i, input) in psbt.inputs.iter().enumerate() {
        if input.final_script_witness.is_none() && input.final_script_sig.is_none() {
            return Err(PayoutError::Unsigned(i));
        }
    }
    psbt.clone()
        .extract_tx()
        .map_err(|_| PayoutError::Unsigned(0))
}

/// Arena + index for the active payout-confirmation subscription map (spec
/// §9 "arena + index for the active-subscription map"): `txid -> swapRef`.
/// The confirmation watchdog (`processBtcTxs`, spec §4.5) polls each
/// subscribed txid and removes it by key once claimed or expired -- no
/// cyclic ownership needed.
#[derive(Default)]
pub struct PendingPayouts {
    by_txid: Mutex<HashMap<Txid, (PaymentHash, SwapSequence)>>,
}

impl PendingPayouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, txid: Txid, payment_hash: PaymentHash, sequence: SwapSequence) {
        self.by_txid.lock().await.insert(txid, (payment_hash, sequence));
    }

    pub async fn unsubscribe(&self, txid: &Txid) {
        self.by_txid.lock().await.remove(txid);
    }

    pub async fn subscribed(&self) -> Vec<(Txid, PaymentHash, SwapSequence)> {
        self.by_txid
            .lock()
            .await
            .iter()
            .map(|(txid, (ph, seq))| (*txid, *ph, *seq))
            .collect()
    }
}
