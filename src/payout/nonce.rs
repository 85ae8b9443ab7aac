//! Nonce-encoded locktime/sequence for the BTC payout engine (spec §4.5,
//! §6 "Nonce encoding for PTLC payout"): binds a payout transaction's
//! `nLockTime`/input `nSequence` fields to the swap's on-chain escrow
//! nonce, so the txid is bound to the commitment without a separate proof.

use thiserror::Error;

/// Bitcoin's replace-by-fee-disabled, locktime-respecting sequence floor
/// (spec §6: "last 24 bits -> sequence low bits (or'd with `0xFE000000`)").
/// Staying below `0xFFFFFFFE` keeps `nLockTime` enforced per BIP 65/68.
const SEQUENCE_PREFIX: u32 = 0xFE00_0000;
const SEQUENCE_LOW_MASK: u32 = 0x00FF_FFFF;

/// Added to the nonce's top 40 bits to form `nLockTime` (spec §6). Always
/// time-based (bit 31 of `nLockTime` set would mean block-height locked;
/// this constant keeps every encoded locktime above it).
pub const LOCKTIME_BASE: u64 = 500_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NonceError {
    #[error("nonce's high 40 bits ({0}) overflow a 32-bit locktime once offset by {LOCKTIME_BASE}")]
    LocktimeOverflow(u64),
    #[error("sequence {0:#010x} does not carry the 0xFE000000 payout prefix")]
    NotPayoutSequence(u32),
}

/// The locktime/sequence pair a payout transaction's inputs must carry for
/// a given escrow nonce (spec §6, §8 testable property).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedNonce {
    pub locktime: u32,
    pub sequence: u32,
}

/// Encodes a 64-bit escrow nonce into its locktime/sequence pair (spec
/// §4.5 "Build the payout PSBT with nonce-encoded locktime and sequence").
///
/// `nonce`'s 8-byte big-endian representation splits as: the top 5 bytes
/// (40 bits) become `nLockTime - LOCKTIME_BASE`; the bottom 3 bytes (24
/// bits) become the low bits of every input's `nSequence`, OR'd with
/// [`SEQUENCE_PREFIX`].
pub fn encode(nonce: u64) -> Result<EncodedNonce, NonceError> {
    let high40 = nonce >> 24;
    let low24 = (nonce & SEQUENCE_LOW_MASK as u64) as u32;

    let locktime_u64 = high40 + LOCKTIME_BASE;
    let locktime = u32::try_from(locktime_u64).map_err(|_| NonceError::LocktimeOverflow(high40))?;

    Ok(EncodedNonce {
        locktime,
        sequence: SEQUENCE_PREFIX | low24,
    })
}

/// Recovers the original 64-bit nonce from a locktime/sequence pair (spec
/// §8: "`nonceEncode(nonce).{locktime,sequence}` round-trips through
/// `nonceDecode` to the original 8-byte nonce").
pub fn decode(locktime: u32, sequence: u32) -> Result<u64, NonceError> {
    if sequence & 0xFF00_0000 != SEQUENCE_PREFIX {
        return Err(NonceError::NotPayoutSequence(sequence));
    }
    let high40 = (locktime as u64).checked_sub(LOCKTIME_BASE).unwrap_or(0);
    let low24 = (sequence & SEQUENCE_LOW_MASK) as u64;
    Ok((high40 << 24) | low24)
}

/// Upper bound on a nonce's high-40-bit component for which
/// `encode`/`decode` round-trips exactly (spec §8): beyond this the
/// locktime offset by [`LOCKTIME_BASE`] would overflow `u32`.
pub fn max_roundtrippable_nonce() -> u64 {
    let max_high40 = (u32::MAX as u64) - LOCKTIME_BASE;
    (max_high40 << 24) | SEQUENCE_LOW_MASK as u64
}
