//! HOLD-Invoice Handler (spec §2 component I, §4.7): held-HTLC acceptance,
//! CLTV sufficiency check, and preimage settle/cancel on state
//! transitions. Layered over [`crate::lightning::node::LightningNode`]
//! exactly as the BTC Payout Engine is layered over
//! [`crate::btc_rpc::BitcoinWallet`] -- the business rules live here, the
//! wire protocol lives behind the trait.

use thiserror::Error;

use crate::lightning::node::{
    CreateHoldInvoiceParams, HeldHtlc, HoldInvoice, LightningError, LightningNode,
};
use crate::types::PaymentHash;

#[derive(Debug, Error)]
pub enum HoldInvoiceError {
    #[error(transparent)]
    Node(#[from] LightningError),
    #[error(
        "HTLC expires too soon: {remaining} blocks remaining, minimum {required} (spec error 20002)"
    )]
    ExpiresTooSoon { remaining: u32, required: u32 },
    #[error("no HTLC has arrived yet for this invoice")]
    NotYetHeld,
}

/// Accepts, validates, and resolves HODL invoices for `FromBtcLn` swaps
/// (spec §4.7).
pub struct HoldInvoiceHandler<N> {
    node: N,
}

impl<N: LightningNode> HoldInvoiceHandler<N> {
    pub fn new(node: N) -> Self {
        Self { node }
    }

    /// Access to the underlying node, for callers (tests, watchdogs) that
    /// need capabilities beyond this handler's own business-rule surface.
    pub fn node(&self) -> &N {
        &self.node
    }

    /// `/createInvoice` (spec §4.7 step 1): issues the HODL invoice with
    /// `cltv_delta = minCltv + 5` and a description carrying the on-chain
    /// recipient address, so `htlc_received` can recover `claimer` without
    /// a side channel.
    pub async fn create_invoice(
        &self,
        payment_hash: PaymentHash,
        amount_sats: u64,
        min_cltv: u32,
        recipient_description: String,
    ) -> Result<HoldInvoice, HoldInvoiceError> {
        let invoice = self
            .node
            .create_hold_invoice(CreateHoldInvoiceParams {
                payment_hash,
                amount_sats,
                cltv_delta: min_cltv + 5,
                description: recipient_description,
            })
            .await?;
        Ok(invoice)
    }

    /// `htlcReceived` (spec §4.7 step 2): checks whether the payer's HTLC
    /// has arrived and, if so, whether its remaining CLTV still clears
    /// `min_cltv`. Returns `Ok(None)` while still waiting so the caller's
    /// watchdog can simply retry next tick.
    pub async fn poll_htlc(
        &self,
        payment_hash: PaymentHash,
        min_cltv: u32,
    ) -> Result<Option<HeldHtlc>, HoldInvoiceError> {
        let Some(htlc) = self.node.held_htlc(payment_hash).await? else {
            return Ok(None);
        };

        let current_height = self.node.current_block_height().await?;
        let remaining = htlc.expiry_height.saturating_sub(current_height);
        if remaining < min_cltv {
            return Err(HoldInvoiceError::ExpiresTooSoon {
                remaining,
                required: min_cltv,
            });
        }
        Ok(Some(htlc))
    }

    /// Settles the held HTLC once the counterparty has revealed the
    /// preimage on the smart chain (spec §4.7 step 4). Safe to call more
    /// than once (spec §5, §8: idempotence).
    pub async fn settle(&self, preimage: [u8; 32]) -> Result<(), HoldInvoiceError> {
        self.node.settle_hold_invoice(preimage).await?;
        Ok(())
    }

    /// Cancels a HODL invoice that expired pre-commit or whose swap was
    /// refunded (spec §4.7 step 5).
    pub async fn cancel(&self, payment_hash: PaymentHash) -> Result<(), HoldInvoiceError> {
        self.node.cancel_hold_invoice(payment_hash).await?;
        Ok(())
    }
}
