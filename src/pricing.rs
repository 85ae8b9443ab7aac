//! Pricing / Fee Arithmetic (spec §2 component J, §4.5 step 4): quote
//! arithmetic with a base-plus-PPM fee schedule, exact-in vs exact-out
//! inversion, and bounds re-expression in the input token's units.
//!
//! Token-denominated amounts use [`Decimal`] rather than a float, matching
//! the teacher's `client.rs`/`api/types.rs` convention of carrying swap
//! amounts as `rust_decimal::Decimal` end to end.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::collaborators::FeeSchedule;

/// Fixed-point denominator for "parts per million" fee rates (spec
/// `feePPM`, `networkFeeMultiplierPPM`, `APY_ppm`, etc. throughout §4).
pub const PPM_DENOMINATOR: Decimal = dec!(1_000_000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("fee schedule implies a non-positive net rate (feePPM >= 1_000_000)")]
    DegenerateFeeRate,
    #[error("requested amount {amount} is outside the quotable bounds [{min}, {max}]")]
    OutOfBounds {
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },
}

/// Whether the caller specified the amount they pay in, or the amount they
/// want to receive out (spec §4.5 step 4: "compute `amountBD` either
/// directly (exact-out) or by inverting ... (exact-in)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountSpec {
    /// `amount` is what the counterparty pays into the swap.
    ExactIn(Decimal),
    /// `amount` is what the counterparty wants to receive out.
    ExactOut(Decimal),
}

/// Resolved quote: both legs of the swap plus the fee breakdown, all in the
/// token's own units except `network_fee_sats` / `swap_fee_sats` (spec §3
/// `Fees`, which keeps the BTC-denominated fee alongside its token
/// re-expression).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedQuote {
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub swap_fee_token: Decimal,
}

/// `amount * (1 - feePPM/1e6) - baseFee` i.e. what a payer of `amount`
/// (token units) nets after the swap fee, before the network fee is
/// subtracted (spec §4.5 step 4).
fn net_of_swap_fee(amount: Decimal, schedule: FeeSchedule, base_fee_token: Decimal) -> Decimal {
    let rate = Decimal::from(schedule.fee_ppm) / PPM_DENOMINATOR;
    amount * (Decimal::ONE - rate) - base_fee_token
}

/// Resolves exact-in/exact-out quote arithmetic for a single swap leg
/// (spec §4.5 step 4): given what the counterparty specified, compute both
/// the paid-in and received-out token amounts after applying the base+PPM
/// swap fee and a network fee already expressed in token units.
///
/// `amount*(1-feePPM) - baseFee - networkFee = amountOut` is the exact-in
/// direction; exact-out solves the same equation for `amount` given a
/// target `amountOut`.
pub fn resolve_quote(
    spec: AmountSpec,
    schedule: FeeSchedule,
    base_fee_token: Decimal,
    network_fee_token: Decimal,
) -> Result<ResolvedQuote, PricingError> {
    if schedule.fee_ppm as u64 >= 1_000_000 {
        return Err(PricingError::DegenerateFeeRate);
    }
    let rate = Decimal::from(schedule.fee_ppm) / PPM_DENOMINATOR;

    match spec {
        AmountSpec::ExactIn(amount_in) => {
            if amount_in <= Decimal::ZERO {
                return Err(PricingError::NonPositiveAmount);
            }
            let amount_out = net_of_swap_fee(amount_in, schedule, base_fee_token) - network_fee_token;
            if amount_out <= Decimal::ZERO {
                return Err(PricingError::NonPositiveAmount);
            }
            let swap_fee_token = amount_in - amount_out - network_fee_token;
            Ok(ResolvedQuote {
                amount_in,
                amount_out,
                swap_fee_token,
            })
        }
        AmountSpec::ExactOut(amount_out) => {
            if amount_out <= Decimal::ZERO {
                return Err(PricingError::NonPositiveAmount);
            }
            // Invert: amount_in*(1-rate) - baseFee - networkFee = amount_out
            //      => amount_in = (amount_out + baseFee + networkFee) / (1-rate)
            let amount_in = (amount_out + base_fee_token + network_fee_token) / (Decimal::ONE - rate);
            let swap_fee_token = amount_in - amount_out - network_fee_token;
            Ok(ResolvedQuote {
                amount_in,
                amount_out,
                swap_fee_token,
            })
        }
    }
}

/// Checks a requested `amount` (token units) against `[min, max]` widened
/// by `tolerance_ppm` on both sides (spec §4.5 step 4: "reject outside
/// 95%-105% of min/max"). `tolerance_ppm` of `50_000` reproduces the
/// spec's literal "5% either way" example.
pub fn check_bounds(
    amount: Decimal,
    min: Decimal,
    max: Decimal,
    tolerance_ppm: u32,
) -> Result<(), PricingError> {
    let tolerance = Decimal::from(tolerance_ppm) / PPM_DENOMINATOR;
    let widened_min = min * (Decimal::ONE - tolerance);
    let widened_max = max * (Decimal::ONE + tolerance);
    if amount < widened_min || amount > widened_max {
        return Err(PricingError::OutOfBounds {
            amount,
            min: widened_min,
            max: widened_max,
        });
    }
    Ok(())
}

/// Converts a BTC-satoshi amount into token units at the oracle's quoted
/// rate, re-expressing min/max bounds for the error payload callers send
/// back to the client (spec §4.5 step 4: "{min,max} in input-token units").
pub fn sats_to_token(sats: u64, sats_per_token_unit: f64) -> Decimal {
    let rate = Decimal::try_from(sats_per_token_unit).unwrap_or(Decimal::ONE);
    if rate.is_zero() {
        return Decimal::ZERO;
    }
    Decimal::from(sats) / rate
}

/// Converts a token-denominated [`Decimal`] amount into its satoshi
/// equivalent at the oracle's quoted rate -- the inverse of
/// [`sats_to_token`]. Both legs of a quote (spec §4.5 step 4's "amount" vs
/// "amountBD") are resolved in this common satoshi domain before being
/// re-expressed in token units for bounds checks and client-facing totals.
pub fn token_to_sats(token_amount: Decimal, sats_per_token_unit: f64) -> Decimal {
    let rate = Decimal::try_from(sats_per_token_unit).unwrap_or(Decimal::ONE);
    token_amount * rate
}

/// Rounds a [`Decimal`] down to its nearest non-negative `u64`, saturating
/// at zero/`u64::MAX` rather than panicking -- used once quote arithmetic
/// has settled on a final satoshi or smallest-denomination token amount.
pub fn decimal_to_u64(value: Decimal) -> u64 {
    value.max(Decimal::ZERO).trunc().to_u64().unwrap_or(u64::MAX)
}

/// Converts a whole-token [`Decimal`] amount into the token's smallest
/// denomination (spec §4.5 step 4: quote totals re-expressed "in the input
/// token"), using the oracle-reported `decimals` (spec [`crate::collaborators::PriceQuote`]).
pub fn decimal_to_token_units(amount: Decimal, decimals: u32) -> u64 {
    let scale = Decimal::from(10u64.pow(decimals.min(18)));
    decimal_to_u64(amount * scale)
}
