//! FromBtcLn Handler (spec §4.7): Lightning in, smart-chain token out, via
//! a held HODL invoice. The payer's HTLC is accepted but not settled until
//! the intermediary has claimed the matching smart-chain commitment by
//! revealing the preimage.
//!
//! States: `Created -> Received -> Committed -> Claimed -> Settled`;
//! failure `Canceled -> Refunded`.

use std::sync::Arc;

use thiserror::Error;

use crate::chain::adapter::{AdapterError, ChainAdapter, CommitmentQuery};
use crate::chain::events::{ChainEvent, SwapEventSink};
use crate::collaborators::{ChannelView, CollaboratorError, PricingOracle, QuotePlugin};
use crate::config::IntermediaryConfig;
use crate::handlers::common::now_secs;
use crate::lightning::hold_invoice::{HoldInvoiceError, HoldInvoiceHandler};
use crate::lightning::node::{HoldInvoice, LightningNode};
use crate::pricing::{self, AmountSpec, PricingError};
use crate::store::{StoreError, SwapStore};
use crate::types::{
    Authorization, ChainId, ContractData, Direction, Fees, Metadata, PaymentHash, Sequence,
    SwapKind, SwapRecord, TxIds,
};

/// Seconds in a Julian year, used for the security-deposit APY calculation
/// (spec §4.7 step 1).
const SECONDS_PER_YEAR: u64 = 31_557_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FromBtcLnState {
    Created,
    Received,
    Committed,
    Claimed,
    Settled,
    Canceled,
    Refunded,
}

#[derive(Debug, Error)]
pub enum FromBtcLnError {
    #[error("insufficient inbound Lightning liquidity: need {needed} sats, have {available} (spec error 20301)")]
    InsufficientInboundLiquidity { needed: u64, available: u64 },
    #[error("no vault initialized for token {0} on this chain (spec error 20201)")]
    VaultNotInitialized(String),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    HoldInvoice(#[from] HoldInvoiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("swap ({0}, {1:?}) not found")]
    NotFound(PaymentHash, Sequence),
    #[error("swap lock busy, skip this tick")]
    LockBusy,
}

/// `/createInvoice` request (spec §4.7 step 1).
#[derive(Debug, Clone)]
pub struct CreateInvoiceRequest {
    pub chain_id: ChainId,
    pub token: String,
    /// The on-chain address that will receive the claimed tokens; stashed
    /// in the HODL invoice's description so `htlcReceived` can read it back
    /// without a side channel (spec §4.7 step 1).
    pub address: String,
    pub offerer_vault: String,
    pub payment_hash: PaymentHash,
    pub amount: AmountSpec,
    pub min_cltv: u32,
    /// Native-currency value of the locked amount, for the security-deposit
    /// APY calculation (spec §4.7 step 1).
    pub value_in_native_currency: rust_decimal::Decimal,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceResponse {
    pub invoice: HoldInvoice,
    pub amount_out_token: u64,
    pub swap_fee_sats: u64,
    pub security_deposit_sats: u64,
}

pub struct FromBtcLnHandler<A, St, P, Q, Ch, N> {
    adapter: Arc<A>,
    store: Arc<St>,
    pricing: Arc<P>,
    plugin: Arc<Q>,
    channels: Arc<Ch>,
    hold_invoice: HoldInvoiceHandler<N>,
    config: Arc<IntermediaryConfig>,
}

impl<A, St, P, Q, Ch, N> FromBtcLnHandler<A, St, P, Q, Ch, N>
where
    A: ChainAdapter,
    St: SwapStore<FromBtcLnState>,
    P: PricingOracle,
    Q: QuotePlugin,
    Ch: ChannelView,
    N: LightningNode,
{
    pub fn new(
        adapter: Arc<A>,
        store: Arc<St>,
        pricing: Arc<P>,
        plugin: Arc<Q>,
        channels: Arc<Ch>,
        node: N,
        config: Arc<IntermediaryConfig>,
    ) -> Self {
        Self {
            adapter,
            store,
            pricing,
            plugin,
            channels,
            hold_invoice: HoldInvoiceHandler::new(node),
            config,
        }
    }

    /// Access to the underlying Lightning node, for callers (tests,
    /// watchdogs) driving HTLC arrival directly rather than through a real
    /// node's event stream.
    pub fn lightning_node(&self) -> &N {
        self.hold_invoice.node()
    }

    /// `/createInvoice` (spec §4.7 step 1).
    pub async fn create_invoice(
        &self,
        req: CreateInvoiceRequest,
    ) -> Result<CreateInvoiceResponse, FromBtcLnError> {
        if !self
            .adapter
            .is_vault_initialized(&req.token)
            .await
            .map_err(FromBtcLnError::Adapter)?
        {
            return Err(FromBtcLnError::VaultNotInitialized(req.token.clone()));
        }

        let price = self
            .pricing
            .price_of(&req.chain_id.0, &req.token)
            .await
            .map_err(FromBtcLnError::Collaborator)?;
        let schedule = self
            .plugin
            .fee_schedule(&req.chain_id.0, &req.token)
            .await
            .map_err(FromBtcLnError::Collaborator)?;

        let spec_vu = match req.amount {
            AmountSpec::ExactIn(sats_in) => AmountSpec::ExactIn(pricing::sats_to_token(
                pricing::decimal_to_u64(sats_in),
                price.sats_per_token_unit,
            )),
            AmountSpec::ExactOut(amount_out_token) => AmountSpec::ExactOut(amount_out_token),
        };
        let base_fee_vu = pricing::sats_to_token(schedule.base_fee_sats, price.sats_per_token_unit);
        let resolved = pricing::resolve_quote(spec_vu, schedule, base_fee_vu, rust_decimal::Decimal::ZERO)?;
        let amount_in_sats =
            pricing::decimal_to_u64(pricing::token_to_sats(resolved.amount_in, price.sats_per_token_unit));
        let swap_fee_sats =
            pricing::decimal_to_u64(pricing::token_to_sats(resolved.swap_fee_token, price.sats_per_token_unit));
        let amount_out_token = pricing::decimal_to_token_units(resolved.amount_out, price.token_decimals);

        // Reject outside 95%-105% of the plugin's quotable min/max. The input
        // leg here is BTC itself, so the bounds need no re-expression (spec
        // §4.5 step 4).
        pricing::check_bounds(
            rust_decimal::Decimal::from(amount_in_sats),
            rust_decimal::Decimal::from(schedule.min_amount_sats),
            rust_decimal::Decimal::from(schedule.max_amount_sats),
            self.config.quote_bounds_tolerance_ppm,
        )?;

        let available = self
            .channels
            .total_remote_balance()
            .await
            .map_err(FromBtcLnError::Collaborator)?;
        if available < amount_in_sats {
            return Err(FromBtcLnError::InsufficientInboundLiquidity {
                needed: amount_in_sats,
                available,
            });
        }

        let expiry_timeout = self.config.bitcoin_blocktime.as_secs() * req.min_cltv as u64;
        let base_refund_fee = schedule.base_fee_sats;
        let security_deposit_sats = base_refund_fee * 2
            + pricing::decimal_to_u64(
                req.value_in_native_currency * rust_decimal::Decimal::from(self.config.apy_ppm)
                    / pricing::PPM_DENOMINATOR
                    * rust_decimal::Decimal::from(expiry_timeout)
                    / rust_decimal::Decimal::from(SECONDS_PER_YEAR),
            );

        let invoice = self
            .hold_invoice
            .create_invoice(req.payment_hash, amount_in_sats, req.min_cltv, req.address.clone())
            .await?;

        let record = SwapRecord {
            chain_id: req.chain_id.clone(),
            payment_hash: req.payment_hash,
            sequence: Sequence::HTLC,
            direction: Direction::FromBtcLn,
            state: FromBtcLnState::Created,
            contract_data: None,
            fees: Fees {
                swap_fee_sats,
                swap_fee_token: pricing::decimal_to_token_units(resolved.swap_fee_token, price.token_decimals),
                network_fee_sats: 0,
                network_fee_token: 0,
                max_sats_per_vbyte: 0,
            },
            authorization: None,
            tx_ids: TxIds::default(),
            metadata: Metadata {
                created_at: Some(now_secs() as i64),
                ..Default::default()
            },
            preimage: None,
        };
        self.store.insert(record).await?;

        Ok(CreateInvoiceResponse {
            invoice,
            amount_out_token,
            swap_fee_sats,
            security_deposit_sats,
        })
    }

    /// `htlcReceived` (spec §4.7 step 2): called by the watchdog once the
    /// payer's HTLC is sitting `held`; builds the smart-chain commitment
    /// and advances `Created -> Received`.
    pub async fn on_htlc_received(
        &self,
        payment_hash: PaymentHash,
        offerer_vault: &str,
        claimer_address: &str,
        token: &str,
        chain_id: &ChainId,
    ) -> Result<(), FromBtcLnError> {
        let sequence = Sequence::HTLC;
        let lock = self.store.lock_for(payment_hash, sequence);
        let Some(_guard) = lock.try_acquire(self.config.swap_lock_ttl) else {
            return Err(FromBtcLnError::LockBusy);
        };

        let mut record = self
            .store
            .get(payment_hash, sequence)
            .await?
            .ok_or(FromBtcLnError::NotFound(payment_hash, sequence))?;
        if record.state != FromBtcLnState::Created {
            return Ok(());
        }

        let htlc = match self.hold_invoice.poll_htlc(payment_hash, self.config.min_chain_cltv).await {
            Ok(Some(htlc)) => htlc,
            Ok(None) => return Ok(()),
            Err(HoldInvoiceError::ExpiresTooSoon { .. }) => {
                self.hold_invoice.cancel(payment_hash).await.ok();
                record.state = FromBtcLnState::Canceled;
                self.store.update(record).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let now = now_secs();
        let expiry = now
            + (self.config.min_chain_cltv as u64 * self.config.bitcoin_blocktime.as_secs()) / self.config.safety_factor.max(1.0) as u64
            - self.config.grace_period.as_secs().min(now);

        let contract_data = ContractData {
            offerer: offerer_vault.to_string(),
            claimer: claimer_address.to_string(),
            token: token.to_string(),
            amount: htlc.amount_sats,
            expiry,
            confirmations: 0,
            pay_in: false,
            pay_out: true,
            security_deposit: record.fees.swap_fee_sats,
            claimer_bounty: 0,
            kind: SwapKind::Htlc,
            escrow_nonce: 0,
            output_script: None,
        };

        let authorization = self
            .adapter
            .sign_authorization(&contract_data, now + self.config.quote_authorization_window.as_secs())
            .await?;

        record.contract_data = Some(contract_data);
        record.authorization = Some(authorization);
        record.state = FromBtcLnState::Received;
        let _ = chain_id;
        self.store.update(record).await?;
        Ok(())
    }

    /// `Initialize` event handler (spec §4.7 step 3): `Received -> Committed`.
    pub async fn on_initialize(&self, payment_hash: PaymentHash) -> Result<(), FromBtcLnError> {
        let sequence = Sequence::HTLC;
        let mut record = self
            .store
            .get(payment_hash, sequence)
            .await?
            .ok_or(FromBtcLnError::NotFound(payment_hash, sequence))?;
        if record.state == FromBtcLnState::Received {
            record.state = FromBtcLnState::Committed;
            self.store.update(record).await?;
        }
        Ok(())
    }

    /// `Claim` event handler (spec §4.7 step 4): the counterparty revealed
    /// the preimage on-chain; settle the HODL invoice and mark `Settled`.
    pub async fn on_claim(&self, payment_hash: PaymentHash, preimage: [u8; 32]) -> Result<(), FromBtcLnError> {
        let sequence = Sequence::HTLC;
        let mut record = self
            .store
            .get(payment_hash, sequence)
            .await?
            .ok_or(FromBtcLnError::NotFound(payment_hash, sequence))?;

        record.state = FromBtcLnState::Claimed;
        record.preimage = Some(preimage);
        self.store.update(record.clone()).await?;

        match self.hold_invoice.settle(preimage).await {
            Ok(()) => {
                record.state = FromBtcLnState::Settled;
                self.store.remove(payment_hash, sequence).await?;
                Ok(())
            }
            Err(e) => {
                // The on-chain preimage is already published; funds are
                // recoverable by anyone even if settle keeps failing.
                log::error!("hold invoice settle failed after on-chain claim, retrying: {e}");
                Ok(())
            }
        }
    }

    /// `processPastSwaps` watchdog (spec §4.7 step 5, §5): cancels
    /// pre-commit swaps past their authorization window and retries
    /// still-held settle attempts for already-claimed swaps.
    pub async fn process_past_swaps(&self) {
        let active = match self.store.list_active().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("failed to list active FromBtcLn swaps: {e}");
                return;
            }
        };
        let now = now_secs();

        for record in active {
            match record.state {
                FromBtcLnState::Received => {
                    let timed_out = record
                        .authorization
                        .as_ref()
                        .map(|a| a.timeout < now)
                        .unwrap_or(false);
                    if timed_out {
                        self.hold_invoice.cancel(record.payment_hash).await.ok();
                        let mut record = record;
                        record.state = FromBtcLnState::Canceled;
                        if let Err(e) = self.store.update(record).await {
                            log::warn!("failed to persist Canceled state: {e}");
                        }
                    }
                }
                FromBtcLnState::Committed => {
                    if let Some(contract_data) = &record.contract_data {
                        if contract_data.expiry < now {
                            let query = CommitmentQuery {
                                payment_hash: record.payment_hash,
                                sequence: record.sequence,
                            };
                            match self.adapter.refund(query).await {
                                Ok(tx) => {
                                    let mut record = record;
                                    record.state = FromBtcLnState::Refunded;
                                    record.tx_ids.refund = Some(tx);
                                    self.hold_invoice.cancel(record.payment_hash).await.ok();
                                    if let Err(e) = self.store.update(record).await {
                                        log::warn!("failed to persist Refunded state: {e}");
                                    }
                                }
                                Err(AdapterError::CommitmentNotFound(_, _)) => {}
                                Err(e) => log::warn!("refund attempt failed, will retry: {e}"),
                            }
                        }
                    }
                }
                FromBtcLnState::Claimed => match record.preimage {
                    Some(preimage) => {
                        if let Err(e) = self.on_claim(record.payment_hash, preimage).await {
                            log::warn!("retry settle failed: {e}");
                        }
                    }
                    None => {
                        // Should be unreachable: `on_claim` persists the preimage
                        // before ever reaching `Claimed`. Without it there is no
                        // secret to retry `settle_hold_invoice` with.
                        log::error!(
                            "swap {} stuck in Claimed with no persisted preimage, cannot retry settle",
                            record.payment_hash
                        );
                    }
                },
                _ => {}
            }
        }
    }

    pub fn spawn_watchdog(self: &Arc<Self>) -> tokio::task::JoinHandle<()>
    where
        A: 'static,
        St: 'static,
        P: 'static,
        Q: 'static,
        Ch: 'static,
        N: 'static,
    {
        let this = Arc::clone(self);
        let interval = this.config.past_swaps_poll_interval;
        tokio::spawn(async move {
            loop {
                this.process_past_swaps().await;
                tokio::time::sleep(interval).await;
            }
        })
    }
}

impl<A, St, P, Q, Ch, N> SwapEventSink for Arc<FromBtcLnHandler<A, St, P, Q, Ch, N>>
where
    A: ChainAdapter + Send + Sync + 'static,
    St: SwapStore<FromBtcLnState> + 'static,
    P: PricingOracle + 'static,
    Q: QuotePlugin + 'static,
    Ch: ChannelView + 'static,
    N: LightningNode + 'static,
{
    fn on_chain_event(&self, event: ChainEvent) {
        let this = Arc::clone(self);
        match event {
            ChainEvent::Initialize { payment_hash, .. } => {
                tokio::spawn(async move {
                    if let Err(e) = this.on_initialize(payment_hash).await {
                        log::warn!("on_initialize failed for {payment_hash}: {e}");
                    }
                });
            }
            ChainEvent::Claim {
                payment_hash,
                witness,
                ..
            } => {
                if let Ok(preimage) = <[u8; 32]>::try_from(witness.as_slice()) {
                    tokio::spawn(async move {
                        if let Err(e) = this.on_claim(payment_hash, preimage).await {
                            log::warn!("on_claim failed for {payment_hash}: {e}");
                        }
                    });
                }
            }
            ChainEvent::Refund { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::adapter::test_support::MockAdapter;
    use crate::collaborators::test_support::{FixedChannels, FixedPrice};
    use crate::collaborators::{ChannelBalance, FeeSchedule, FixedFeeSchedule, PriceQuote};
    use crate::lightning::node::test_support::MockLightningNode;
    use crate::lightning::node::HeldHtlc;
    use crate::store::InMemorySwapStore;
    use rust_decimal::Decimal;

    fn handler() -> FromBtcLnHandler<
        MockAdapter,
        InMemorySwapStore<FromBtcLnState>,
        FixedPrice,
        FixedFeeSchedule,
        FixedChannels,
        MockLightningNode,
    > {
        FromBtcLnHandler::new(
            Arc::new(MockAdapter::new("evm:1")),
            Arc::new(InMemorySwapStore::new()),
            Arc::new(FixedPrice(PriceQuote {
                sats_per_token_unit: 1_500.0,
                token_decimals: 6,
            })),
            Arc::new(FixedFeeSchedule(FeeSchedule {
                base_fee_sats: 50,
                fee_ppm: 3_000,
                min_amount_sats: 1,
                max_amount_sats: 1_000_000_000_000,
            })),
            Arc::new(FixedChannels(vec![ChannelBalance {
                remote_balance_sats: 10_000_000,
            }])),
            MockLightningNode::new(1_000),
            Arc::new(IntermediaryConfig::default()),
        )
    }

    fn create_req(ph: PaymentHash) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            chain_id: ChainId("evm:1".into()),
            token: "USDC".into(),
            address: "0xrecipient".into(),
            offerer_vault: "0xvault".into(),
            payment_hash: ph,
            amount: AmountSpec::ExactIn(Decimal::new(100_000, 0)),
            min_cltv: 72,
            value_in_native_currency: Decimal::new(100_000, 0),
        }
    }

    #[tokio::test]
    async fn create_invoice_rejects_insufficient_liquidity() {
        let handler = FromBtcLnHandler::new(
            Arc::new(MockAdapter::new("evm:1")),
            Arc::new(InMemorySwapStore::new()),
            Arc::new(FixedPrice(PriceQuote {
                sats_per_token_unit: 1_500.0,
                token_decimals: 6,
            })),
            Arc::new(FixedFeeSchedule(FeeSchedule {
                base_fee_sats: 50,
                fee_ppm: 3_000,
                min_amount_sats: 1,
                max_amount_sats: 1_000_000_000_000,
            })),
            Arc::new(FixedChannels(vec![ChannelBalance {
                remote_balance_sats: 10,
            }])),
            MockLightningNode::new(1_000),
            Arc::new(IntermediaryConfig::default()),
        );

        let err = handler
            .create_invoice(create_req(PaymentHash([1u8; 32])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FromBtcLnError::InsufficientInboundLiquidity { .. }
        ));
    }

    #[tokio::test]
    async fn create_invoice_persists_created_record() {
        let handler = handler();
        let ph = PaymentHash([2u8; 32]);
        handler.create_invoice(create_req(ph)).await.unwrap();

        let record = handler.store.get(ph, Sequence::HTLC).await.unwrap().unwrap();
        assert_eq!(record.state, FromBtcLnState::Created);
    }

    #[tokio::test]
    async fn htlc_received_advances_to_received_state() {
        let handler = handler();
        let ph = PaymentHash([3u8; 32]);
        handler.create_invoice(create_req(ph)).await.unwrap();

        handler
            .hold_invoice
            .node()
            .arrive_htlc(
                ph,
                HeldHtlc {
                    amount_sats: 100,
                    expiry_height: 1_000 + 72 + 10,
                },
            )
            .await;

        handler
            .on_htlc_received(ph, "0xvault", "0xrecipient", "USDC", &ChainId("evm:1".into()))
            .await
            .unwrap();

        let record = handler.store.get(ph, Sequence::HTLC).await.unwrap().unwrap();
        assert_eq!(record.state, FromBtcLnState::Received);
        assert!(record.contract_data.is_some());
    }

    #[tokio::test]
    async fn claim_settles_and_removes_record() {
        let handler = handler();
        let ph = PaymentHash([4u8; 32]);
        handler.create_invoice(create_req(ph)).await.unwrap();
        handler.on_claim(ph, [9u8; 32]).await.unwrap();

        assert!(handler.store.get(ph, Sequence::HTLC).await.unwrap().is_none());
    }
}
