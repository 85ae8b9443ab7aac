//! FromBtc Handler (spec §4.8): BTC on-chain in, smart-chain token out.
//!
//! The intermediary locks tokens on the smart chain with `kind = Chain`
//! against `txoHash = H(amount || outputScript)`. The user pays the
//! matching on-chain Bitcoin transaction; once it reaches the required
//! confirmations, the claim (anyone may submit it, e.g. a watchtower) is
//! verified on-chain via the BTC relay. States mirror
//! [`crate::handlers::from_btc_ln::FromBtcLnState`] with on-chain funding
//! replacing the HODL invoice.

use std::sync::Arc;

use thiserror::Error;

use crate::btc_rpc::{BitcoinChainReader, BitcoinRpcError};
use crate::chain::adapter::{AdapterError, ChainAdapter, CommitmentQuery};
use crate::chain::events::{ChainEvent, SwapEventSink};
use crate::collaborators::{CollaboratorError, PricingOracle, QuotePlugin};
use crate::config::IntermediaryConfig;
use crate::handlers::common::now_secs;
use crate::pricing::{self, AmountSpec, PricingError};
use crate::store::{StoreError, SwapStore};
use crate::types::{
    Authorization, ChainId, ContractData, Direction, Fees, Metadata, PaymentHash, Sequence,
    SwapKind, SwapRecord, TxIds,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FromBtcState {
    Created,
    Committed,
    Claimed,
    Settled,
    Canceled,
    Refunded,
}

#[derive(Debug, Error)]
pub enum FromBtcError {
    #[error("no vault initialized for token {0} on this chain (spec error 20201)")]
    VaultNotInitialized(String),
    #[error("destination output script length {0} is out of bounds (spec error 20102)")]
    BadOutputScriptLength(usize),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Rpc(#[from] BitcoinRpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("swap ({0}, {1:?}) not found")]
    NotFound(PaymentHash, Sequence),
    #[error("swap lock busy, skip this tick")]
    LockBusy,
}

/// Quote/funding-address request for the `FromBtc` direction (spec §4.8).
#[derive(Debug, Clone)]
pub struct FromBtcQuoteRequest {
    pub chain_id: ChainId,
    pub token: String,
    pub offerer_vault: String,
    pub claimer_address: String,
    pub output_script: Vec<u8>,
    pub amount: AmountSpec,
    pub confirmations: u32,
}

#[derive(Debug, Clone)]
pub struct FromBtcQuote {
    pub amount_in_sats: u64,
    pub amount_out_token: u64,
    pub swap_fee_sats: u64,
    pub min_required_expiry: u64,
    pub contract_data: ContractData,
    pub authorization: Authorization,
}

pub struct FromBtcHandler<A, St, P, Q, R> {
    adapter: Arc<A>,
    store: Arc<St>,
    pricing: Arc<P>,
    plugin: Arc<Q>,
    btc_chain: Arc<R>,
    config: Arc<IntermediaryConfig>,
}

impl<A, St, P, Q, R> FromBtcHandler<A, St, P, Q, R>
where
    A: ChainAdapter,
    St: SwapStore<FromBtcState>,
    P: PricingOracle,
    Q: QuotePlugin,
    R: BitcoinChainReader,
{
    pub fn new(
        adapter: Arc<A>,
        store: Arc<St>,
        pricing: Arc<P>,
        plugin: Arc<Q>,
        btc_chain: Arc<R>,
        config: Arc<IntermediaryConfig>,
    ) -> Self {
        Self {
            adapter,
            store,
            pricing,
            plugin,
            btc_chain,
            config,
        }
    }

    /// Quote path (spec §4.8): locks tokens on the smart chain against
    /// `txoHash = H(amount || outputScript)` ahead of the user's on-chain
    /// payment, mirroring §4.5's fee arithmetic.
    pub async fn quote(&self, req: FromBtcQuoteRequest) -> Result<FromBtcQuote, FromBtcError> {
        if req.output_script.is_empty() || req.output_script.len() > 42 {
            return Err(FromBtcError::BadOutputScriptLength(req.output_script.len()));
        }
        if !self
            .adapter
            .is_vault_initialized(&req.token)
            .await
            .map_err(FromBtcError::Adapter)?
        {
            return Err(FromBtcError::VaultNotInitialized(req.token.clone()));
        }

        let price = self
            .pricing
            .price_of(&req.chain_id.0, &req.token)
            .await
            .map_err(FromBtcError::Collaborator)?;
        let schedule = self
            .plugin
            .fee_schedule(&req.chain_id.0, &req.token)
            .await
            .map_err(FromBtcError::Collaborator)?;

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

        let now = now_secs();
        let min_required_expiry = now
            + self.config.grace_period.as_secs()
            + self.config.bitcoin_blocktime.as_secs()
                * (req.confirmations as f64 * self.config.safety_factor) as u64;

        let contract_data = ContractData {
            offerer: req.offerer_vault.clone(),
            claimer: req.claimer_address.clone(),
            token: req.token.clone(),
            amount: amount_in_sats,
            expiry: min_required_expiry,
            confirmations: req.confirmations,
            pay_in: false,
            pay_out: true,
            security_deposit: 0,
            claimer_bounty: 0,
            kind: SwapKind::Chain,
            escrow_nonce: 0,
            output_script: Some(req.output_script.clone()),
        };

        let authorization = self
            .adapter
            .sign_authorization(&contract_data, now + self.config.quote_authorization_window.as_secs())
            .await?;

        let payment_hash_bytes =
            self.adapter
                .hash_for_onchain(&req.output_script, amount_in_sats, 0);
        let payment_hash = PaymentHash(payment_hash_bytes);

        let record = SwapRecord {
            chain_id: req.chain_id.clone(),
            payment_hash,
            sequence: Sequence::HTLC,
            direction: Direction::FromBtc,
            state: FromBtcState::Created,
            contract_data: Some(contract_data.clone()),
            fees: Fees {
                swap_fee_sats,
                swap_fee_token: pricing::decimal_to_token_units(resolved.swap_fee_token, price.token_decimals),
                network_fee_sats: 0,
                network_fee_token: 0,
                max_sats_per_vbyte: 0,
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

        Ok(FromBtcQuote {
            amount_in_sats,
            amount_out_token,
            swap_fee_sats,
            min_required_expiry,
            contract_data,
            authorization,
        })
    }

    /// `Initialize` event handler (spec §4.8): the intermediary's own
    /// locking transaction landed on the smart chain; `Created -> Committed`.
    pub async fn on_initialize(&self, payment_hash: PaymentHash) -> Result<(), FromBtcError> {
        let sequence = Sequence::HTLC;
        let mut record = self
            .store
            .get(payment_hash, sequence)
            .await?
            .ok_or(FromBtcError::NotFound(payment_hash, sequence))?;
        if record.state == FromBtcState::Created {
            record.state = FromBtcState::Committed;
            self.store.update(record).await?;
        }
        Ok(())
    }

    /// Confirmation watchdog (spec §4.8): once the user's Bitcoin payment
    /// reaches the swap's required confirmations, claims the commitment on
    /// the smart chain by presenting the covering transaction.
    pub async fn process_btc_txs(&self, txid_by_payment_hash: impl Fn(PaymentHash) -> Option<bitcoin::Txid>) {
        let active = match self.store.list_active().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("failed to list active FromBtc swaps: {e}");
                return;
            }
        };

        for record in active {
            if record.state != FromBtcState::Committed {
                continue;
            }
            let Some(contract_data) = &record.contract_data else {
                continue;
            };
            let Some(txid) = txid_by_payment_hash(record.payment_hash) else {
                continue;
            };

            let confirmations = match self.btc_chain.confirmations(txid).await {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("confirmations lookup failed for {txid}: {e}");
                    continue;
                }
            };
            if confirmations < contract_data.confirmations {
                continue;
            }

            let lock = self.store.lock_for(record.payment_hash, record.sequence);
            let Some(_guard) = lock.try_acquire(self.config.swap_lock_ttl) else {
                continue;
            };

            let query = CommitmentQuery {
                payment_hash: record.payment_hash,
                sequence: record.sequence,
            };
            match self.adapter.claim(query, txid.to_string().as_bytes()).await {
                Ok(claim_tx) => {
                    let mut record = record;
                    record.state = FromBtcState::Claimed;
                    record.tx_ids.claim = Some(claim_tx);
                    if let Err(e) = self.store.update(record).await {
                        log::warn!("failed to persist Claimed state: {e}");
                    }
                }
                Err(AdapterError::NonPayable | AdapterError::Reverted(_)) => {
                    let mut record = record;
                    record.state = FromBtcState::Canceled;
                    if let Err(e) = self.store.update(record).await {
                        log::warn!("failed to persist Canceled state: {e}");
                    }
                }
                Err(e) => log::warn!("claim failed for {}, will retry: {e}", record.payment_hash),
            }
        }
    }

    /// `processPastSwaps` watchdog (spec §4.8, §5): cancels swaps whose
    /// pre-commit authorization elapsed untouched, and refunds swaps that
    /// expired post-commit without ever being claimed.
    pub async fn process_past_swaps(&self) {
        let active = match self.store.list_active().await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("failed to list active FromBtc swaps: {e}");
                return;
            }
        };
        let now = now_secs();

        for record in active {
            match record.state {
                FromBtcState::Created => {
                    let timed_out = record
                        .authorization
                        .as_ref()
                        .map(|a| a.timeout < now)
                        .unwrap_or(true);
                    if timed_out {
                        if let Err(e) = self.store.remove(record.payment_hash, record.sequence).await {
                            log::warn!("failed to delete canceled swap {}: {e}", record.payment_hash);
                        }
                    }
                }
                FromBtcState::Committed => {
                    if let Some(contract_data) = &record.contract_data {
                        if contract_data.expiry < now {
                            let query = CommitmentQuery {
                                payment_hash: record.payment_hash,
                                sequence: record.sequence,
                            };
                            match self.adapter.refund(query).await {
                                Ok(tx) => {
                                    let mut record = record;
                                    record.state = FromBtcState::Refunded;
                                    record.tx_ids.refund = Some(tx);
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
                _ => {}
            }
        }
    }
}

impl<A, St, P, Q, R> SwapEventSink for Arc<FromBtcHandler<A, St, P, Q, R>>
where
    A: ChainAdapter + 'static,
    St: SwapStore<FromBtcState> + 'static,
    P: PricingOracle + 'static,
    Q: QuotePlugin + 'static,
    R: BitcoinChainReader + 'static,
{
    fn on_chain_event(&self, event: ChainEvent) {
        if let ChainEvent::Initialize { payment_hash, .. } = event {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.on_initialize(payment_hash).await {
                    log::warn!("on_initialize failed for {payment_hash}: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btc_rpc::test_support::MockBitcoinChainReader;
    use crate::chain::adapter::test_support::MockAdapter;
    use crate::collaborators::test_support::FixedPrice;
    use crate::collaborators::{FeeSchedule, FixedFeeSchedule, PriceQuote};
    use crate::store::InMemorySwapStore;
    use bitcoin::Txid;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn handler() -> FromBtcHandler<MockAdapter, InMemorySwapStore<FromBtcState>, FixedPrice, FixedFeeSchedule, MockBitcoinChainReader>
    {
        FromBtcHandler::new(
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
            Arc::new(MockBitcoinChainReader::new()),
            Arc::new(IntermediaryConfig::default()),
        )
    }

    fn quote_request() -> FromBtcQuoteRequest {
        FromBtcQuoteRequest {
            chain_id: ChainId("evm:1".into()),
            token: "USDC".into(),
            offerer_vault: "0xvault".into(),
            claimer_address: "0xrecipient".into(),
            output_script: vec![0u8; 22],
            amount: AmountSpec::ExactIn(Decimal::new(100_000, 0)),
            confirmations: 3,
        }
    }

    #[tokio::test]
    async fn quote_rejects_bad_output_script() {
        let handler = handler();
        let mut req = quote_request();
        req.output_script = vec![];
        assert!(matches!(
            handler.quote(req).await.unwrap_err(),
            FromBtcError::BadOutputScriptLength(0)
        ));
    }

    #[tokio::test]
    async fn quote_persists_created_record() {
        let handler = handler();
        handler.quote(quote_request()).await.unwrap();
        let active = handler.store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, FromBtcState::Created);
    }

    #[tokio::test]
    async fn confirmation_watchdog_claims_once_confirmed() {
        let handler = handler();
        let quote = handler.quote(quote_request()).await.unwrap();
        let active = handler.store.list_active().await.unwrap();
        let record = &active[0];

        handler.on_initialize(record.payment_hash).await.unwrap();

        let txid = Txid::from_str(&"33".repeat(32)).unwrap();
        handler.adapter.commit(record.payment_hash, record.sequence, quote.contract_data);
        handler.btc_chain.set_confirmations(txid, 5).await;

        let ph = record.payment_hash;
        handler
            .process_btc_txs(move |lookup_ph| (lookup_ph == ph).then_some(txid))
            .await;

        let updated = handler
            .store
            .get(record.payment_hash, record.sequence)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, FromBtcState::Claimed);
    }
}
