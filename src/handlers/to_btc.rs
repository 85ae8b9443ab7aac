//! ToBtc Handler (spec §2 component G, §4.5): smart-chain token in, BTC
//! on-chain payout out, a PTLC keyed by `hashForOnchain(outputScript,
//! amount, nonce)`.
//!
//! States: `Saved -> Committed -> BtcSending -> BtcSent -> Claimed`, with
//! failure branches `NonPayable`, `Canceled`, `Refunded`.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::btc_rpc::{BitcoinChainReader, BitcoinRpcError, BitcoinWallet};
use crate::chain::adapter::{AdapterError, ChainAdapter, CommitmentQuery};
use crate::chain::events::{ChainEvent, SwapEventSink};
use crate::collaborators::{ChannelView, CollaboratorError, PricingOracle, QuotePlugin};
use crate::config::IntermediaryConfig;
use crate::handlers::common::now_secs;
use crate::payout::coinselect::{self, CoinSelectError};
use crate::payout::engine::{PayoutEngine, PayoutError, PayoutRequest, PendingPayouts};
use crate::payout::nonce::{self, NonceError};
use crate::pricing::{self, AmountSpec, PricingError};
use crate::store::{StoreError, SwapStore};
use crate::types::{
    Authorization, ChainId, ContractData, Direction, Fees, Metadata, PaymentHash, Sequence,
    SwapKind, SwapRecord, TxIds,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ToBtcState {
    Saved,
    Committed,
    BtcSending,
    BtcSent,
    Claimed,
    NonPayable,
    Canceled,
    Refunded,
}

#[derive(Debug, Error)]
pub enum ToBtcError {
    #[error(
        "nonce high bits ({high40}) exceed the monotonicity guard: now - 500000000 = {bound} (spec error 20101)"
    )]
    NonceNotMonotonic { high40: u64, bound: u64 },
    #[error("destination output script length {0} is out of bounds (spec error 20102)")]
    BadOutputScriptLength(usize),
    #[error("confirmations/confirmationTarget out of bounds (spec error 20103)")]
    BadConfirmations,
    #[error("no vault initialized for token {0} on this chain (spec error 20201)")]
    VaultNotInitialized(String),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    CoinSelect(#[from] CoinSelectError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Payout(#[from] PayoutError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error(transparent)]
    Rpc(#[from] BitcoinRpcError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("swap ({0}, {1:?}) not found")]
    NotFound(PaymentHash, Sequence),
    #[error("swap lock busy, skip this tick")]
    LockBusy,
}

/// `/payInvoice` request for the `ToBtc` direction (spec §4.5 quote path).
#[derive(Debug, Clone)]
pub struct ToBtcQuoteRequest {
    pub chain_id: ChainId,
    pub token: String,
    /// The counterparty's smart-chain address; they lock the token leg.
    pub offerer: String,
    /// The intermediary's own smart-chain address; claims the locked token
    /// once it has proven the BTC payout.
    pub claimer: String,
    pub output_script: Vec<u8>,
    pub amount: AmountSpec,
    pub nonce: u64,
    pub confirmation_target: u32,
    pub confirmations: u32,
}

/// Resolved quote handed back to the counterparty (spec §4.5 step 8).
#[derive(Debug, Clone)]
pub struct ToBtcQuote {
    pub amount_out_sats: u64,
    pub network_fee_sats: u64,
    pub swap_fee_sats: u64,
    pub max_sats_per_vbyte: u64,
    pub min_required_expiry: u64,
    pub contract_data: ContractData,
    pub authorization: Authorization,
}

/// Generic over every collaborator seam the direction touches (spec §4.5):
/// the chain binding, persistence, pricing/plugin/channel collaborators,
/// and the Bitcoin wallet/chain-reader the payout engine drives.
pub struct ToBtcHandler<A, St, P, Q, Ch, W, R> {
    adapter: Arc<A>,
    store: Arc<St>,
    pricing: Arc<P>,
    plugin: Arc<Q>,
    channels: Arc<Ch>,
    wallet: Arc<W>,
    btc_chain: Arc<R>,
    payout_engine: PayoutEngine<W>,
    payout_queue: Arc<crate::locks::PayoutQueue>,
    pending: Arc<PendingPayouts>,
    config: Arc<IntermediaryConfig>,
}

impl<A, St, P, Q, Ch, W, R> ToBtcHandler<A, St, P, Q, Ch, W, R>
where
    A: ChainAdapter,
    St: SwapStore<ToBtcState>,
    P: PricingOracle,
    Q: QuotePlugin,
    Ch: ChannelView,
    W: BitcoinWallet,
    R: BitcoinChainReader,
{
    pub fn new(
        adapter: Arc<A>,
        store: Arc<St>,
        pricing: Arc<P>,
        plugin: Arc<Q>,
        channels: Arc<Ch>,
        wallet: Arc<W>,
        btc_chain: Arc<R>,
        payout_queue: Arc<crate::locks::PayoutQueue>,
        config: Arc<IntermediaryConfig>,
    ) -> Self {
        Self {
            payout_engine: PayoutEngine::new(wallet.clone()),
            pending: Arc::new(PendingPayouts::new()),
            adapter,
            store,
            pricing,
            plugin,
            channels,
            wallet,
            btc_chain,
            payout_queue,
            config,
        }
    }

    /// `/payInvoice` (spec §4.5 quote path, steps 1-8).
    pub async fn quote(&self, req: ToBtcQuoteRequest) -> Result<ToBtcQuote, ToBtcError> {
        let high40 = req.nonce >> 24;
        let now = now_secs();
        let bound = now.saturating_sub(nonce::LOCKTIME_BASE);
        if high40 > bound {
            return Err(ToBtcError::NonceNotMonotonic { high40, bound });
        }

        if req.output_script.is_empty() || req.output_script.len() > 42 {
            return Err(ToBtcError::BadOutputScriptLength(req.output_script.len()));
        }
        if req.confirmations == 0 || req.confirmation_target == 0 {
            return Err(ToBtcError::BadConfirmations);
        }

        if !self
            .adapter
            .is_vault_initialized(&req.token)
            .await
            .map_err(ToBtcError::Adapter)?
        {
            return Err(ToBtcError::VaultNotInitialized(req.token.clone()));
        }

        let price = self
            .pricing
            .price_of(&req.chain_id.0, &req.token)
            .await
            .map_err(ToBtcError::Collaborator)?;
        let schedule = self
            .plugin
            .fee_schedule(&req.chain_id.0, &req.token)
            .await
            .map_err(ToBtcError::Collaborator)?;

        let raw_fee_rate = self
            .wallet
            .estimate_fee_rate(req.confirmation_target)
            .await?;
        let adjusted_fee_rate =
            raw_fee_rate * self.config.network_fee_multiplier_ppm as u64 / 1_000_000;
        let estimated_vsize = coinselect::estimate_vsize(1, 2);
        let network_fee_sats_estimate = adjusted_fee_rate * estimated_vsize;

        let base_fee_vu = pricing::sats_to_token(schedule.base_fee_sats, price.sats_per_token_unit);
        let network_fee_vu =
            pricing::sats_to_token(network_fee_sats_estimate, price.sats_per_token_unit);

        let spec_vu = match req.amount {
            AmountSpec::ExactIn(amount_in_token) => AmountSpec::ExactIn(amount_in_token),
            AmountSpec::ExactOut(amount_out_sats) => AmountSpec::ExactOut(pricing::sats_to_token(
                pricing::decimal_to_u64(amount_out_sats),
                price.sats_per_token_unit,
            )),
        };

        let resolved = pricing::resolve_quote(spec_vu, schedule, base_fee_vu, network_fee_vu)?;
        let amount_out_sats =
            pricing::decimal_to_u64(pricing::token_to_sats(resolved.amount_out, price.sats_per_token_unit));
        let swap_fee_sats =
            pricing::decimal_to_u64(pricing::token_to_sats(resolved.swap_fee_token, price.sats_per_token_unit));

        // Reject outside 95%-105% of the plugin's quotable min/max, re-expressed
        // in the input (smart-chain token) leg (spec §4.5 step 4).
        let min_vu = pricing::sats_to_token(schedule.min_amount_sats, price.sats_per_token_unit);
        let max_vu = pricing::sats_to_token(schedule.max_amount_sats, price.sats_per_token_unit);
        pricing::check_bounds(
            resolved.amount_in,
            min_vu,
            max_vu,
            self.config.quote_bounds_tolerance_ppm,
        )?;

        let utxos = self.wallet.list_unspent(1).await?;
        let active_channels = self.channels.active_channels().await.map_err(ToBtcError::Collaborator)?.len() as u64;
        let reserve_sats = self.config.onchain_reserved_per_channel * active_channels;
        let selection = coinselect::select_utxos(&utxos, amount_out_sats, adjusted_fee_rate, reserve_sats)?;

        let payment_hash_bytes =
            self.adapter
                .hash_for_onchain(&req.output_script, amount_out_sats, req.nonce);
        let payment_hash = PaymentHash(payment_hash_bytes);
        let sequence = Sequence::random();

        let cltv_wait = self.config.bitcoin_blocktime.as_secs()
            * (self.config.min_chain_cltv as u64
                + ((req.confirmations + req.confirmation_target) as f64
                    * self.config.send_safety_factor) as u64);
        let min_required_expiry = now
            + self.config.grace_period.as_secs()
            + (cltv_wait as f64 * self.config.safety_factor) as u64
            + self.config.grace_period.as_secs();

        let contract_data = ContractData {
            offerer: req.offerer.clone(),
            claimer: req.claimer.clone(),
            token: req.token.clone(),
            amount: amount_out_sats,
            expiry: min_required_expiry,
            confirmations: req.confirmations,
            pay_in: true,
            pay_out: false,
            security_deposit: 0,
            claimer_bounty: 0,
            kind: SwapKind::ChainNonced,
            escrow_nonce: req.nonce,
            output_script: Some(req.output_script.clone()),
        };

        let authorization = self
            .adapter
            .sign_authorization(
                &contract_data,
                now + self.config.quote_authorization_window.as_secs(),
            )
            .await?;

        let record = SwapRecord {
            chain_id: req.chain_id.clone(),
            payment_hash,
            sequence,
            direction: Direction::ToBtc,
            state: ToBtcState::Saved,
            contract_data: Some(contract_data.clone()),
            fees: Fees {
                swap_fee_sats,
                swap_fee_token: pricing::decimal_to_token_units(resolved.swap_fee_token, price.token_decimals),
                network_fee_sats: network_fee_sats_estimate,
                network_fee_token: pricing::decimal_to_token_units(network_fee_vu, price.token_decimals),
                max_sats_per_vbyte: adjusted_fee_rate,
            },
            authorization: Some(authorization.clone()),
            tx_ids: TxIds::default(),
            metadata: Metadata {
                created_at: Some(now as i64),
                ..Default::default()
            },
            preimage: None,
        };
        self.store.insert(record).await?;
        let _ = selection; // dry-run only; the real selection happens post-commit

        Ok(ToBtcQuote {
            amount_out_sats,
            network_fee_sats: network_fee_sats_estimate,
            swap_fee_sats,
            max_sats_per_vbyte: adjusted_fee_rate,
            min_required_expiry,
            contract_data,
            authorization,
        })
    }

    /// Post-commit processing (spec §4.5): transitions `Saved -> Committed`
    /// and, under the payout queue, builds and broadcasts the BTC payout.
    pub async fn on_initialize(
        &self,
        payment_hash: PaymentHash,
        sequence: Sequence,
    ) -> Result<(), ToBtcError> {
        let lock = self.store.lock_for(payment_hash, sequence);
        let Some(_guard) = lock.try_acquire(self.config.swap_lock_ttl) else {
            return Err(ToBtcError::LockBusy);
        };

        let mut record = self
            .store
            .get(payment_hash, sequence)
            .await?
            .ok_or(ToBtcError::NotFound(payment_hash, sequence))?;
        if record.state != ToBtcState::Saved {
            return Ok(());
        }
        record.state = ToBtcState::Committed;
        self.store.update(record.clone()).await?;

        let _permit = self.payout_queue.acquire().await;

        let contract_data = record
            .contract_data
            .clone()
            .ok_or(ToBtcError::NotFound(payment_hash, sequence))?;

        let now = now_secs();
        let min_remaining = self.config.bitcoin_blocktime.as_secs() * self.config.min_chain_cltv as u64;
        if contract_data.expiry < now + min_remaining {
            record.state = ToBtcState::NonPayable;
            self.store.update(record).await?;
            return Ok(());
        }

        let output_script = contract_data.output_script.clone().unwrap_or_default();
        let payout_req = PayoutRequest {
            output_script: bitcoin::ScriptBuf::from_bytes(output_script),
            amount_sats: contract_data.amount,
            escrow_nonce: contract_data.escrow_nonce,
            max_sats_per_vbyte: record.fees.max_sats_per_vbyte,
            fee_rate_target_blocks: 6,
        };

        record.state = ToBtcState::BtcSending;
        self.store.update(record.clone()).await?;

        match self.payout_engine.build_and_broadcast(payout_req).await {
            Ok(result) => {
                record.state = ToBtcState::BtcSent;
                record.tx_ids.btc_payout = Some(result.txid.to_string());
                self.store.update(record).await?;
                self.pending.subscribe(result.txid, payment_hash, sequence).await;
                Ok(())
            }
            Err(PayoutError::CoinSelect(_) | PayoutError::FeeRateExceeded { .. } | PayoutError::FeeAmountExceeded { .. }) => {
                record.state = ToBtcState::NonPayable;
                self.store.update(record).await?;
                Ok(())
            }
            Err(other) => {
                // Transient RPC/signing trouble: leave BtcSending, retry next tick.
                log::warn!("ToBtc payout build failed, will retry: {other}");
                Ok(())
            }
        }
    }

    /// `processBtcTxs` watchdog (spec §4.5): polls every subscribed payout
    /// txid and claims the smart-chain side once confirmed.
    pub async fn process_btc_txs(&self) {
        for (txid, payment_hash, sequence) in self.pending.subscribed().await {
            let confirmations = match self.btc_chain.confirmations(txid).await {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("confirmations lookup failed for {txid}: {e}");
                    continue;
                }
            };

            let record = match self.store.get(payment_hash, sequence).await {
                Ok(Some(r)) => r,
                Ok(None) => {
                    self.pending.unsubscribe(&txid).await;
                    continue;
                }
                Err(e) => {
                    log::warn!("store lookup failed for {payment_hash}: {e}");
                    continue;
                }
            };
            let Some(contract_data) = &record.contract_data else {
                continue;
            };
            if confirmations < contract_data.confirmations {
                continue;
            }

            let query = CommitmentQuery {
                payment_hash,
                sequence,
            };
            match self.adapter.claim(query, txid.to_string().as_bytes()).await {
                Ok(claim_tx) => {
                    let mut record = record;
                    record.state = ToBtcState::Claimed;
                    record.tx_ids.claim = Some(claim_tx);
                    if let Err(e) = self.store.update(record).await {
                        log::warn!("failed to persist Claimed state for {payment_hash}: {e}");
                    }
                    self.pending.unsubscribe(&txid).await;
                }
                Err(AdapterError::NonPayable | AdapterError::Reverted(_)) => {
                    let mut record = record;
                    record.state = ToBtcState::NonPayable;
                    if let Err(e) = self.store.update(record).await {
                        log::warn!("failed to persist NonPayable state for {payment_hash}: {e}");
                    }
                    self.pending.unsubscribe(&txid).await;
                }
                Err(e) => {
                    log::warn!("claim failed for {payment_hash}, will retry: {e}");
                }
            }
        }
    }

    /// `processPastSwaps` watchdog (spec §4.5, §5): cancels swaps whose
    /// pre-commit authorization window elapsed with nothing on-chain, and
    /// reconciles any commitment that arrived without a matching chain
    /// event (defensive poll against dropped events).
    pub async fn process_past_swaps(&self) {
        let active = match self.store.list_active().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("failed to list active ToBtc swaps: {e}");
                return;
            }
        };
        let now = now_secs();

        for record in active {
            match record.state {
                ToBtcState::Saved => {
                    let timed_out = record
                        .authorization
                        .as_ref()
                        .map(|a| a.timeout < now)
                        .unwrap_or(true);
                    if !timed_out {
                        continue;
                    }
                    let query = CommitmentQuery {
                        payment_hash: record.payment_hash,
                        sequence: record.sequence,
                    };
                    match self.adapter.get_commitment(query).await {
                        Ok(Some(_)) => {
                            if let Err(e) = self.on_initialize(record.payment_hash, record.sequence).await {
                                log::warn!("reconciled on_initialize failed: {e}");
                            }
                        }
                        Ok(None) => {
                            if let Err(e) = self.store.remove(record.payment_hash, record.sequence).await {
                                log::warn!("failed to delete canceled swap {}: {e}", record.payment_hash);
                            }
                        }
                        Err(e) => log::warn!("get_commitment failed: {e}"),
                    }
                }
                ToBtcState::Committed => {
                    if let Err(e) = self.on_initialize(record.payment_hash, record.sequence).await {
                        log::warn!("retry on_initialize failed: {e}");
                    }
                }
                ToBtcState::NonPayable => {
                    let Some(contract_data) = &record.contract_data else {
                        continue;
                    };
                    if contract_data.expiry >= now {
                        continue;
                    }
                    let query = CommitmentQuery {
                        payment_hash: record.payment_hash,
                        sequence: record.sequence,
                    };
                    match self.adapter.refund(query).await {
                        Ok(tx) => {
                            let mut record = record;
                            record.state = ToBtcState::Refunded;
                            record.tx_ids.refund = Some(tx);
                            if let Err(e) = self.store.update(record).await {
                                log::warn!("failed to persist Refunded state: {e}");
                            }
                        }
                        Err(AdapterError::CommitmentNotFound(_, _)) => {}
                        Err(e) => log::warn!("refund attempt failed, will retry: {e}"),
                    }
                }
                _ => {}
            }
        }
    }

    /// Spawns the two watchdog loops (spec §5): sequential tick-then-sleep,
    /// so neither loop ever overlaps with itself.
    pub fn spawn_watchdogs(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>>
    where
        A: 'static,
        St: 'static,
        P: 'static,
        Q: 'static,
        Ch: 'static,
        W: 'static,
        R: 'static,
    {
        let past_swaps = {
            let this = Arc::clone(self);
            let interval = this.config.past_swaps_poll_interval;
            tokio::spawn(async move {
                loop {
                    this.process_past_swaps().await;
                    tokio::time::sleep(interval).await;
                }
            })
        };
        let btc_txs = {
            let this = Arc::clone(self);
            let interval = this.config.btc_tx_poll_interval;
            tokio::spawn(async move {
                loop {
                    this.process_btc_txs().await;
                    tokio::time::sleep(interval).await;
                }
            })
        };
        vec![past_swaps, btc_txs]
    }
}

impl<A, St, P, Q, Ch, W, R> SwapEventSink for Arc<ToBtcHandler<A, St, P, Q, Ch, W, R>>
where
    A: ChainAdapter + 'static,
    St: SwapStore<ToBtcState> + 'static,
    P: PricingOracle + 'static,
    Q: QuotePlugin + 'static,
    Ch: ChannelView + 'static,
    W: BitcoinWallet + 'static,
    R: BitcoinChainReader + 'static,
{
    fn on_chain_event(&self, event: ChainEvent) {
        if let ChainEvent::Initialize {
            payment_hash,
            sequence,
            ..
        } = event
        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.on_initialize(payment_hash, sequence).await {
                    log::warn!("on_initialize failed for {payment_hash}: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btc_rpc::test_support::{MockBitcoinChainReader, MockBitcoinWallet};
    use crate::btc_rpc::Utxo;
    use crate::chain::adapter::test_support::MockAdapter;
    use crate::collaborators::test_support::{FixedChannels, FixedPrice};
    use crate::collaborators::{ChannelBalance, FeeSchedule, FixedFeeSchedule, PriceQuote};
    use crate::locks::PayoutQueue;
    use crate::store::InMemorySwapStore;
    use bitcoin::Txid;
    use std::str::FromStr;

    fn sample_utxo(value: u64) -> Utxo {
        Utxo {
            txid: Txid::from_str(&"22".repeat(32)).unwrap(),
            vout: 0,
            value_sats: value,
            confirmations: 6,
        }
    }

    fn handler() -> ToBtcHandler<
        MockAdapter,
        InMemorySwapStore<ToBtcState>,
        FixedPrice,
        FixedFeeSchedule,
        FixedChannels,
        MockBitcoinWallet,
        MockBitcoinChainReader,
    > {
        let wallet = Arc::new(MockBitcoinWallet::new(vec![sample_utxo(5_000_000)], 5));
        ToBtcHandler::new(
            Arc::new(MockAdapter::new("evm:1")),
            Arc::new(InMemorySwapStore::new()),
            Arc::new(FixedPrice(PriceQuote {
                sats_per_token_unit: 1_500.0,
                token_decimals: 6,
            })),
            Arc::new(FixedFeeSchedule(FeeSchedule {
                base_fee_sats: 100,
                fee_ppm: 5_000,
                min_amount_sats: 1,
                max_amount_sats: 1_000_000_000_000,
            })),
            Arc::new(FixedChannels(vec![ChannelBalance {
                remote_balance_sats: 1_000_000,
            }])),
            wallet,
            Arc::new(MockBitcoinChainReader::new()),
            Arc::new(PayoutQueue::new(4)),
            Arc::new(IntermediaryConfig::default()),
        )
    }

    fn quote_request() -> ToBtcQuoteRequest {
        ToBtcQuoteRequest {
            chain_id: ChainId("evm:1".into()),
            token: "USDC".into(),
            offerer: "0xoffer".into(),
            claimer: "0xintermediary".into(),
            output_script: vec![0u8; 22],
            amount: AmountSpec::ExactIn(Decimal::new(1000, 0)),
            nonce: 0xABCDEF,
            confirmation_target: 3,
            confirmations: 3,
        }
    }

    #[tokio::test]
    async fn quote_rejects_nonce_failing_monotonicity_guard() {
        let handler = handler();
        let mut req = quote_request();
        req.nonce = u64::MAX;
        let err = handler.quote(req).await.unwrap_err();
        assert!(matches!(err, ToBtcError::NonceNotMonotonic { .. }));
    }

    #[tokio::test]
    async fn quote_rejects_empty_output_script() {
        let handler = handler();
        let mut req = quote_request();
        req.output_script = vec![];
        let err = handler.quote(req).await.unwrap_err();
        assert!(matches!(err, ToBtcError::BadOutputScriptLength(0)));
    }

    #[tokio::test]
    async fn quote_rejects_uninitialized_vault() {
        let handler = handler();
        handler
            .adapter
            .uninitialized_vaults
            .insert("USDC".into(), ());
        let err = handler.quote(quote_request()).await.unwrap_err();
        assert!(matches!(err, ToBtcError::VaultNotInitialized(_)));
    }

    #[tokio::test]
    async fn quote_persists_a_saved_record() {
        let handler = handler();
        let _quote = handler.quote(quote_request()).await.unwrap();
        let active = handler.store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, ToBtcState::Saved);
    }

    #[tokio::test]
    async fn on_initialize_builds_and_broadcasts_payout() {
        let handler = handler();
        let quote = handler.quote(quote_request()).await.unwrap();
        let active = handler.store.list_active().await.unwrap();
        let record = &active[0];

        handler
            .on_initialize(record.payment_hash, record.sequence)
            .await
            .unwrap();

        let updated = handler
            .store
            .get(record.payment_hash, record.sequence)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, ToBtcState::BtcSent);
        assert!(updated.tx_ids.btc_payout.is_some());
        let _ = quote;
    }

    #[tokio::test]
    async fn lock_busy_is_reported_on_concurrent_initialize() {
        let handler = handler();
        handler.quote(quote_request()).await.unwrap();
        let active = handler.store.list_active().await.unwrap();
        let record = &active[0];
        let lock = handler.store.lock_for(record.payment_hash, record.sequence);
        let _guard = lock.try_acquire(std::time::Duration::from_secs(30)).unwrap();

        let err = handler
            .on_initialize(record.payment_hash, record.sequence)
            .await
            .unwrap_err();
        assert!(matches!(err, ToBtcError::LockBusy));
    }

    #[tokio::test]
    async fn nonpayable_swap_is_refunded_once_expired() {
        // spec §8 scenario 2: a fee spike pushes the payout past the
        // counterparty's max fee rate, leaving the swap NonPayable; once
        // the contract's expiry passes the watchdog refunds it.
        let handler = handler();
        let quote = handler.quote(quote_request()).await.unwrap();
        let active = handler.store.list_active().await.unwrap();
        let mut record = active[0].clone();
        record.state = ToBtcState::NonPayable;
        record.contract_data = Some({
            let mut cd = quote.contract_data.clone();
            cd.expiry = 1; // already expired
            cd
        });
        handler.store.update(record.clone()).await.unwrap();
        handler
            .adapter
            .commit(record.payment_hash, record.sequence, quote.contract_data.clone());

        handler.process_past_swaps().await;

        let updated = handler
            .store
            .get(record.payment_hash, record.sequence)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, ToBtcState::Refunded);
        assert!(updated.tx_ids.refund.is_some());
    }
}
