//! UTXO coin selection for the BTC payout engine (spec §2 component H,
//! §4.5 step 5): picks inputs to cover a `ToBtc` payout plus fees while
//! leaving enough economical value behind for Lightning anchor-output fee
//! bumps (spec §4.5 step 5 "reserve for LN anchor bumps").
//!
//! Largest-first selection, grounded on the teacher-adjacent
//! `Carbon-Twelve-C12-supernova` wallet's `TransactionBuilder::
//! largest_first_selection` strategy shape (`select_coins` -> target ->
//! greedy accumulate), simplified to the one strategy this engine needs:
//! the payout queue (spec §5) already serializes all selection, so there is
//! no privacy-motivated reason to randomize here.

use thiserror::Error;

use crate::btc_rpc::Utxo;

/// Estimated virtual size of a single P2WPKH input, including its witness
/// (spec-adjacent: the payout engine only ever spends the intermediary's
/// own managed P2WPKH UTXOs per §4.5 "Sign via the Lightning node's PSBT
/// signer").
pub const P2WPKH_INPUT_VBYTES: u64 = 68;
/// Virtual size of a P2WPKH output.
pub const P2WPKH_OUTPUT_VBYTES: u64 = 31;
/// Fixed transaction overhead (version, locktime, segwit marker, in/out counts).
pub const TX_OVERHEAD_VBYTES: u64 = 11;
/// Dust threshold for a P2WPKH output (spec §4.5 "change-output-dropped-to-
/// dust edge case").
pub const P2WPKH_DUST_SATS: u64 = 294;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoinSelectError {
    #[error("insufficient UTXOs: need {needed} sats, have {available} sats available")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("selection would leave only {remaining} sats reserved, need {required}")]
    ReserveViolated { remaining: u64, required: u64 },
}

/// A funded payout ready for PSBT construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub inputs: Vec<Utxo>,
    /// `None` if the leftover after `payout_amount` + fee is below dust
    /// (spec §4.5: "optional change output").
    pub change_sats: Option<u64>,
    /// Virtual size of the resulting transaction, used to derive the
    /// realized fee rate for fee-policing (spec §4.5 "Fee police").
    pub estimated_vsize: u64,
    pub fee_sats: u64,
}

/// Estimates the virtual size of a transaction with `input_count` P2WPKH
/// inputs and `output_count` P2WPKH outputs.
pub fn estimate_vsize(input_count: usize, output_count: usize) -> u64 {
    TX_OVERHEAD_VBYTES
        + input_count as u64 * P2WPKH_INPUT_VBYTES
        + output_count as u64 * P2WPKH_OUTPUT_VBYTES
}

/// Selects UTXOs to cover `payout_amount` at `fee_rate_sat_per_vbyte`,
/// leaving at least `reserve_sats` of value behind across the *unselected*
/// remainder of the wallet (spec §4.5 step 5: "leave less than
/// `onchainReservedPerChannel x activeChannels` economical value after the
/// spend").
///
/// Largest-first: sorts available UTXOs descending by value and
/// accumulates until the running total covers `payout_amount` plus the
/// fee for the transaction built so far (re-estimated each time a new
/// input is added, since adding an input changes the fee).
pub fn select_utxos(
    available: &[Utxo],
    payout_amount: u64,
    fee_rate_sat_per_vbyte: u64,
    reserve_sats: u64,
) -> Result<CoinSelection, CoinSelectError> {
    let total_available: u64 = available.iter().map(|u| u.value_sats).sum();

    let mut sorted: Vec<Utxo> = available.to_vec();
    sorted.sort_by(|a, b| b.value_sats.cmp(&a.value_sats));

    let mut selected: Vec<Utxo> = Vec::new();
    let mut selected_total: u64 = 0;

    // Two outputs assumed (payout + change) until we know there's no
    // change; re-estimate the fee on that assumption first; shrink to one
    // output if the final leftover turns out to be dust.
    for utxo in sorted {
        selected.push(utxo);
        selected_total += utxo.value_sats;

        let vsize_with_change = estimate_vsize(selected.len(), 2);
        let fee_with_change = fee_rate_sat_per_vbyte * vsize_with_change;

        if selected_total >= payout_amount + fee_with_change {
            let leftover = selected_total - payout_amount - fee_with_change;
            if leftover >= P2WPKH_DUST_SATS {
                return finish(selected, payout_amount, fee_rate_sat_per_vbyte, Some(leftover), reserve_sats, total_available);
            }

            // Change would be dust: drop it and fold the dust into the fee
            // by re-estimating with a single output.
            let vsize_no_change = estimate_vsize(selected.len(), 1);
            let fee_no_change = fee_rate_sat_per_vbyte * vsize_no_change;
            if selected_total >= payout_amount + fee_no_change {
                return finish(selected, payout_amount, fee_rate_sat_per_vbyte, None, reserve_sats, total_available);
            }
            // Otherwise keep accumulating; the dropped change wasn't
            // enough to also cover the larger (2-output) fee estimate.
        }
    }

    Err(CoinSelectError::InsufficientFunds {
        needed: payout_amount,
        available: total_available,
    })
}

fn finish(
    selected: Vec<Utxo>,
    payout_amount: u64,
    fee_rate_sat_per_vbyte: u64,
    change_sats: Option<u64>,
    reserve_sats: u64,
    total_available: u64,
) -> Result<CoinSelection, CoinSelectError> {
    let selected_total: u64 = selected.iter().map(|u| u.value_sats).sum();
    let output_count = if change_sats.is_some() { 2 } else { 1 };
    let estimated_vsize = estimate_vsize(selected.len(), output_count);
    let fee_sats = selected_total - payout_amount - change_sats.unwrap_or(0);

    let remaining_after_spend = total_available - selected_total + change_sats.unwrap_or(0);
    if remaining_after_spend < reserve_sats {
        return Err(CoinSelectError::ReserveViolated {
            remaining: remaining_after_spend,
            required: reserve_sats,
        });
    }

    let _ = fee_rate_sat_per_vbyte; // retained for signature symmetry / future fee-bump reuse

    Ok(CoinSelection {
        inputs: selected,
        change_sats,
        estimated_vsize,
        fee_sats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;
    use std::str::FromStr;

    fn utxo(value: u64) -> Utxo {
        Utxo {
            txid: Txid::from_str(&"11".repeat(32)).unwrap(),
            vout: 0,
            value_sats: value,
            confirmations: 6,
        }
    }

    #[test]
    fn selects_largest_first_and_produces_change() {
        let utxos = vec![utxo(50_000), utxo(200_000), utxo(10_000)];
        let selection = select_utxos(&utxos, 100_000, 10, 0).unwrap();
        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value_sats, 200_000);
        assert!(selection.change_sats.unwrap() > 0);
    }

    #[test]
    fn insufficient_funds_reported() {
        let utxos = vec![utxo(1_000), utxo(2_000)];
        let err = select_utxos(&utxos, 100_000, 10, 0).unwrap_err();
        assert!(matches!(err, CoinSelectError::InsufficientFunds { .. }));
    }

    #[test]
    fn reserve_violation_reported_when_spend_drains_wallet() {
        let utxos = vec![utxo(105_000)];
        // Spending nearly everything leaves too little behind for the
        // anchor-bump reserve.
        let err = select_utxos(&utxos, 100_000, 1, 50_000).unwrap_err();
        assert!(matches!(err, CoinSelectError::ReserveViolated { .. }));
    }

    #[test]
    fn dust_change_is_dropped() {
        // Craft a case where the 2-output leftover is below dust but a
        // single-output transaction's smaller fee makes the spend exact.
        let utxos = vec![utxo(100_000 + TX_OVERHEAD_VBYTES + P2WPKH_INPUT_VBYTES + 100)];
        let selection = select_utxos(&utxos, 100_000, 1, 0).unwrap();
        assert!(selection.change_sats.is_none());
    }
}
