//! Tunables shared by every swap handler and the watchdogs (spec §5, §9).
//!
//! Spec §1 puts "configuration loading" out of scope -- this module only
//! specifies the typed tunables themselves, matching the teacher's
//! `types.rs` convention of one plain struct with a hand-written `Default`
//! impl rather than pulling in `config`/`clap`. Loading the values from
//! TOML/env and constructing this struct is the embedder's job.

use std::time::Duration;

/// Runtime tunables for the swap-intermediary engine.
///
/// Every field here is referenced by name somewhere in `spec.md`; field
/// docs cite the section.
#[derive(Debug, Clone)]
pub struct IntermediaryConfig {
    /// Extra safety margin added on top of every computed swap expiry, so
    /// the counterparty has roughly an hour to commit after receiving a
    /// quote (spec §4.5 step 7: "one extra grace period").
    pub grace_period: Duration,

    /// Assumed average time between Bitcoin blocks, used to convert a
    /// confirmation/CLTV count into a wall-clock duration (spec §4.5,
    /// §4.7).
    pub bitcoin_blocktime: Duration,

    /// Multiplies the blocktime-derived timeout to account for block-time
    /// variance (spec §4.5 step 7, §4.7 step 2).
    pub safety_factor: f64,

    /// Multiplies the (confirmations + confirmation target) component
    /// specifically for the BTC-payout send side (spec §4.5 step 7
    /// `sendSafetyFactor`).
    pub send_safety_factor: f64,

    /// Minimum CLTV delta the intermediary requires on an inbound Lightning
    /// HTLC before it will forward the swap on-chain (spec §4.7 step 2,
    /// §8 scenario 4).
    pub min_chain_cltv: u32,

    /// PPM multiplier applied to the coin-selection fee estimator's raw
    /// sat/vB when computing the `ToBtc` network fee (spec §4.5 step 5
    /// `networkFeeMultiplierPPM`).
    pub network_fee_multiplier_ppm: u32,

    /// Sats reserved per active Lightning channel after a `ToBtc` payout,
    /// so there is still economical value left over for an anchor-output
    /// fee bump (spec §4.5 step 5 `onchainReservedPerChannel`).
    pub onchain_reserved_per_channel: u64,

    /// Annualized cost-of-capital rate (parts per million) used to price
    /// the security deposit an intermediary posts while funds are locked
    /// (spec §4.7 step 1 `APY_ppm`).
    pub apy_ppm: u64,

    /// Accepted deviation band around the pricing oracle's quoted min/max
    /// before a quote is rejected outright (spec §4.5 step 4: "95%-105%").
    pub quote_bounds_tolerance_ppm: u32,

    /// Interval between `processPastSwaps` watchdog ticks (spec §5).
    pub past_swaps_poll_interval: Duration,

    /// Interval between `processBtcTxs` confirmation-watchdog ticks (spec §5).
    pub btc_tx_poll_interval: Duration,

    /// Max in-flight permits for the global BTC payout queue (spec §5
    /// "Global bitcoin-payout queue").
    pub payout_queue_depth: usize,

    /// TTL for the UTXO set cache held by the coin-selector (spec §9: "UTXO
    /// 5s").
    pub utxo_cache_ttl: Duration,

    /// TTL for the active-channel-count cache used by `FromBtcLn`'s
    /// liquidity check (spec §9: "channel count 30s").
    pub channel_count_cache_ttl: Duration,

    /// Upper bound on how many headers a single relay-submit transaction
    /// may carry (spec §4.2 `maxHeadersPerTx`).
    pub max_headers_per_tx: usize,

    /// Upper bound on how many fork headers a single relay-submit
    /// transaction may carry (spec §4.2 `maxForkHeadersPerTx`).
    pub max_fork_headers_per_tx: usize,

    /// How long a freshly signed pre-commit authorization remains valid
    /// for the counterparty to submit (spec §3 `authorization.timeout`,
    /// §4.5 step 8).
    pub quote_authorization_window: Duration,

    /// TTL for the per-swap reentrancy lock held across a payout build,
    /// a tx-data claim, or a refund critical section (spec §5 "Per-swap
    /// locking").
    pub swap_lock_ttl: Duration,
}

impl Default for IntermediaryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(3600),
            bitcoin_blocktime: Duration::from_secs(600),
            safety_factor: 2.0,
            send_safety_factor: 2.0,
            min_chain_cltv: 72,
            network_fee_multiplier_ppm: 1_250_000,
            onchain_reserved_per_channel: 50_000,
            apy_ppm: 50_000,
            quote_bounds_tolerance_ppm: 50_000,
            past_swaps_poll_interval: Duration::from_secs(30),
            btc_tx_poll_interval: Duration::from_secs(15),
            payout_queue_depth: 16,
            utxo_cache_ttl: Duration::from_secs(5),
            channel_count_cache_ttl: Duration::from_secs(30),
            max_headers_per_tx: 100,
            max_fork_headers_per_tx: 100,
            quote_authorization_window: Duration::from_secs(120),
            swap_lock_ttl: Duration::from_secs(90),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = IntermediaryConfig::default();
        assert!(cfg.safety_factor >= 1.0);
        assert!(cfg.min_chain_cltv > 0);
        assert!(cfg.payout_queue_depth > 0);
    }
}
