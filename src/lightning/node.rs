//! Lightning node RPC collaborator (spec §1 Non-goals: "Lightning node
//! RPC" stays out of scope). Mirrors [`crate::btc_rpc`]'s split of read vs
//! write surfaces: this trait is the typed seam a concrete LND/CLN/Core
//! Lightning binding implements; [`crate::lightning::hold_invoice`] is the
//! business logic layered on top of it (spec §4.7 component I).

use async_trait::async_trait;
use thiserror::Error;

use crate::types::PaymentHash;

#[derive(Debug, Error)]
pub enum LightningError {
    #[error("lightning node unreachable: {0}")]
    Unreachable(String),
    #[error("no invoice found for payment hash {0}")]
    InvoiceNotFound(PaymentHash),
    #[error("invoice already settled or canceled")]
    AlreadyResolved,
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("rpc error: {0}")]
    Other(String),
}

/// Parameters for issuing a HODL invoice (spec §4.7 step 1).
#[derive(Debug, Clone)]
pub struct CreateHoldInvoiceParams {
    pub payment_hash: PaymentHash,
    pub amount_sats: u64,
    pub cltv_delta: u32,
    /// Human-readable description; spec §4.7 step 1 stashes the on-chain
    /// recipient address here so `htlcReceived` can read `claimer` back out
    /// without a separate side-channel.
    pub description: String,
}

/// A freshly issued HODL invoice.
#[derive(Debug, Clone)]
pub struct HoldInvoice {
    pub bolt11: String,
    pub payment_hash: PaymentHash,
    pub expiry_unix: u64,
}

/// Status of an inbound HTLC sitting in the `held` state against one of our
/// HODL invoices (spec §4.7 step 2 `htlcReceived`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldHtlc {
    pub amount_sats: u64,
    /// Absolute block height at which the HTLC times out.
    pub expiry_height: u32,
}

/// Result of a forward Lightning payment (spec §4.6 `ToBtcLn`: "the
/// bitcoin payout step is a Lightning payment").
#[derive(Debug, Clone, Copy)]
pub struct PaymentResult {
    pub preimage: [u8; 32],
    pub fee_sats: u64,
}

/// Out-of-scope Lightning node RPC surface (spec §1, §4.6, §4.7).
#[async_trait]
pub trait LightningNode: Send + Sync {
    async fn current_block_height(&self) -> Result<u32, LightningError>;

    /// Issues a HODL invoice whose HTLC is accepted but not settled until
    /// [`LightningNode::settle_hold_invoice`] is called (spec §4.7 step 1).
    async fn create_hold_invoice(
        &self,
        params: CreateHoldInvoiceParams,
    ) -> Result<HoldInvoice, LightningError>;

    /// Polled by the `FromBtcLn` watchdog; `None` until the payer's HTLC
    /// has arrived and is sitting `held` (spec §4.7 step 2).
    async fn held_htlc(&self, payment_hash: PaymentHash) -> Result<Option<HeldHtlc>, LightningError>;

    /// Settles the held HTLC, releasing payment to the payer's upstream
    /// peers. Must be safe to call more than once for the same preimage
    /// (spec §5 "idempotent and must be retried on transient failure").
    async fn settle_hold_invoice(&self, preimage: [u8; 32]) -> Result<(), LightningError>;

    /// Cancels a HODL invoice that never reached settlement (spec §4.7
    /// step 5, §8 scenario 4).
    async fn cancel_hold_invoice(&self, payment_hash: PaymentHash) -> Result<(), LightningError>;

    /// Pays a BOLT11 invoice as part of a `ToBtcLn` payout (spec §4.6).
    async fn pay_invoice(
        &self,
        bolt11: &str,
        max_fee_sats: u64,
    ) -> Result<PaymentResult, LightningError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use dashmap::DashMap;
    use tokio::sync::Mutex;

    /// In-memory stand-in used by handler unit tests and the scenario
    /// suite, grounded on the teacher's in-memory-storage test pattern
    /// (`storage::memory::MemoryWalletStorage` in the original `core`
    /// crate).
    #[derive(Default)]
    pub struct MockLightningNode {
        pub block_height: Mutex<u32>,
        pub held: DashMap<PaymentHash, HeldHtlc>,
        pub settled: DashMap<[u8; 32], ()>,
        pub canceled: DashMap<PaymentHash, ()>,
        pub pay_result: Mutex<Option<Result<PaymentResult, String>>>,
    }

    impl MockLightningNode {
        pub fn new(block_height: u32) -> Self {
            Self {
                block_height: Mutex::new(block_height),
                ..Default::default()
            }
        }

        pub async fn arrive_htlc(&self, payment_hash: PaymentHash, htlc: HeldHtlc) {
            self.held.insert(payment_hash, htlc);
        }
    }

    #[async_trait]
    impl LightningNode for MockLightningNode {
        async fn current_block_height(&self) -> Result<u32, LightningError> {
            Ok(*self.block_height.lock().await)
        }

        async fn create_hold_invoice(
            &self,
            params: CreateHoldInvoiceParams,
        ) -> Result<HoldInvoice, LightningError> {
            Ok(HoldInvoice {
                bolt11: format!("lnbc-mock-{}", params.payment_hash),
                payment_hash: params.payment_hash,
                expiry_unix: 9_999_999_999,
            })
        }

        async fn held_htlc(
            &self,
            payment_hash: PaymentHash,
        ) -> Result<Option<HeldHtlc>, LightningError> {
            Ok(self.held.get(&payment_hash).map(|r| *r))
        }

        async fn settle_hold_invoice(&self, preimage: [u8; 32]) -> Result<(), LightningError> {
            self.settled.insert(preimage, ());
            Ok(())
        }

        async fn cancel_hold_invoice(&self, payment_hash: PaymentHash) -> Result<(), LightningError> {
            self.canceled.insert(payment_hash, ());
            self.held.remove(&payment_hash);
            Ok(())
        }

        async fn pay_invoice(
            &self,
            _bolt11: &str,
            _max_fee_sats: u64,
        ) -> Result<PaymentResult, LightningError> {
            match self.pay_result.lock().await.clone() {
                Some(Ok(result)) => Ok(result),
                Some(Err(msg)) => Err(LightningError::PaymentFailed(msg)),
                None => Err(LightningError::PaymentFailed("no mock result configured".into())),
            }
        }
    }
}
