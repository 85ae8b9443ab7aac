//! External collaborators consumed via typed interfaces (spec §1: "pricing
//! oracle ... plugin manager" are out of scope to implement concretely).
//!
//! Mirrors the shape of [`crate::btc_rpc`]: each trait here is the seam an
//! embedder points at a concrete backend (a price-feed aggregator, a
//! Lightning node's channel list, an operator-supplied plugin chain).

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("pricing backend unreachable: {0}")]
    PricingUnreachable(String),
    #[error("no price available for token {0}")]
    NoPrice(String),
    #[error("plugin hook rejected the swap: {0}")]
    PluginRejected(String),
    #[error("{0}")]
    Other(String),
}

impl From<CollaboratorError> for crate::error::EngineError {
    fn from(err: CollaboratorError) -> Self {
        crate::error::EngineError::Collaborator(err.to_string())
    }
}

/// A price quote for converting between a token amount and BTC satoshis
/// (spec §2 component J, §4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    /// How many satoshis one whole unit of the token is worth.
    pub sats_per_token_unit: f64,
    /// Smallest-denomination decimals for the token (for fixed-point math).
    pub token_decimals: u32,
}

/// Out-of-scope pricing backend (spec §1): supplies the BTC-denominated
/// price of a smart-chain token so the fee-arithmetic layer (`pricing`) can
/// convert between sat and token units.
#[async_trait]
pub trait PricingOracle: Send + Sync {
    async fn price_of(&self, chain_id: &str, token: &str) -> Result<PriceQuote, CollaboratorError>;
}

/// Base + proportional fee schedule the pricing oracle or an operator
/// plugin hands back for a specific quote request (spec §4.5 step 4: "base/
/// PPM fees"), plus the quotable `{min,max}` swap size the plugin will
/// still accept for this token (spec §4.5 step 4: "reject outside
/// 95%-105% of min/max").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub base_fee_sats: u64,
    pub fee_ppm: u32,
    /// Smallest swap this token/chain pair is quotable for, in BTC satoshis.
    pub min_amount_sats: u64,
    /// Largest swap this token/chain pair is quotable for, in BTC satoshis.
    pub max_amount_sats: u64,
}

/// Operator-supplied extension points consulted before a quote is accepted
/// (spec §1 "plugin manager", §9 "global mutable state ... plugin
/// registry"). Out of scope to implement; the default no-op plugin accepts
/// everything with the intermediary's own base fee schedule.
#[async_trait]
pub trait QuotePlugin: Send + Sync {
    /// Returns the fee schedule to apply, or rejects the swap outright
    /// (e.g. a blacklisted counterparty or token).
    async fn fee_schedule(
        &self,
        chain_id: &str,
        token: &str,
    ) -> Result<FeeSchedule, CollaboratorError>;
}

/// A no-op plugin with a fixed fee schedule, used by tests and as a
/// reference default.
pub struct FixedFeeSchedule(pub FeeSchedule);

#[async_trait]
impl QuotePlugin for FixedFeeSchedule {
    async fn fee_schedule(
        &self,
        _chain_id: &str,
        _token: &str,
    ) -> Result<FeeSchedule, CollaboratorError> {
        Ok(self.0)
    }
}

/// Per-channel liquidity the `FromBtcLn` handler needs to decide whether it
/// can accept an inbound HTLC (spec §4.7 step 1: "inbound-liquidity check").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBalance {
    pub remote_balance_sats: u64,
}

/// Out-of-scope Lightning node RPC surface (spec §1) used only for the
/// channel-liquidity snapshot; the HOLD-invoice half of the Lightning node
/// API lives in [`crate::lightning::node::LightningNode`] since it has
/// different lifetime/consistency requirements.
#[async_trait]
pub trait ChannelView: Send + Sync {
    async fn active_channels(&self) -> Result<Vec<ChannelBalance>, CollaboratorError>;

    async fn total_remote_balance(&self) -> Result<u64, CollaboratorError> {
        Ok(self
            .active_channels()
            .await?
            .iter()
            .map(|c| c.remote_balance_sats)
            .sum())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;

    pub struct FixedPrice(pub PriceQuote);

    #[async_trait]
    impl PricingOracle for FixedPrice {
        async fn price_of(
            &self,
            _chain_id: &str,
            _token: &str,
        ) -> Result<PriceQuote, CollaboratorError> {
            Ok(self.0)
        }
    }

    pub struct FixedChannels(pub Vec<ChannelBalance>);

    #[async_trait]
    impl ChannelView for FixedChannels {
        async fn active_channels(&self) -> Result<Vec<ChannelBalance>, CollaboratorError> {
            Ok(self.0.clone())
        }
    }
}
