//! End-to-end scenarios against the in-memory collaborators (spec §8).
//!
//! Each scenario drives a handler through its full state machine the way the
//! REST layer and watchdogs would, using nothing but `test-support` mocks --
//! no real chain, Lightning node, or Bitcoin node involved.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::Txid;
use rust_decimal::Decimal;

use swap_intermediary::btc_rpc::test_support::{MockBitcoinChainReader, MockBitcoinWallet};
use swap_intermediary::btc_rpc::Utxo;
use swap_intermediary::chain::adapter::test_support::MockAdapter;
use swap_intermediary::collaborators::test_support::{FixedChannels, FixedPrice};
use swap_intermediary::collaborators::{ChannelBalance, FeeSchedule, FixedFeeSchedule, PriceQuote};
use swap_intermediary::config::IntermediaryConfig;
use swap_intermediary::handlers::from_btc_ln::{CreateInvoiceRequest, FromBtcLnHandler, FromBtcLnState};
use swap_intermediary::handlers::to_btc::{ToBtcHandler, ToBtcQuoteRequest, ToBtcState};
use swap_intermediary::lightning::node::test_support::MockLightningNode;
use swap_intermediary::lightning::node::HeldHtlc;
use swap_intermediary::locks::PayoutQueue;
use swap_intermediary::payout::nonce;
use swap_intermediary::pricing::AmountSpec;
use swap_intermediary::spv::header::BitcoinHeader;
use swap_intermediary::spv::relay::test_support::InMemoryRelay;
use swap_intermediary::spv::relay::{BtcRelayDriver, ForkId};
use swap_intermediary::spv::sync::RelaySynchronizer;
use swap_intermediary::store::InMemorySwapStore;
use swap_intermediary::types::ChainId;

fn sample_utxo(value: u64) -> Utxo {
    Utxo {
        txid: Txid::from_str(&"11".repeat(32)).unwrap(),
        vout: 0,
        value_sats: value,
        confirmations: 6,
    }
}

fn to_btc_handler(
    fee_rate: u64,
) -> (
    ToBtcHandler<
        MockAdapter,
        InMemorySwapStore<ToBtcState>,
        FixedPrice,
        FixedFeeSchedule,
        FixedChannels,
        MockBitcoinWallet,
        MockBitcoinChainReader,
    >,
    Arc<MockBitcoinWallet>,
) {
    let wallet = Arc::new(MockBitcoinWallet::new(vec![sample_utxo(5_000_000)], fee_rate as u32));
    let handler = ToBtcHandler::new(
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
        wallet.clone(),
        Arc::new(MockBitcoinChainReader::new()),
        Arc::new(PayoutQueue::new(4)),
        Arc::new(IntermediaryConfig::default()),
    );
    (handler, wallet)
}

/// Scenario 1 (spec §8): ToBtc happy path, including the documented
/// escrow-nonce locktime/sequence encoding.
#[tokio::test]
async fn scenario_1_to_btc_happy_path() {
    let (handler, _wallet) = to_btc_handler(10);
    let quote = handler
        .quote(ToBtcQuoteRequest {
            chain_id: ChainId("evm:1".into()),
            token: "USDC".into(),
            offerer: "0xoffer".into(),
            claimer: "0xintermediary".into(),
            output_script: vec![0u8; 22],
            amount: AmountSpec::ExactIn(Decimal::new(1000, 0)),
            nonce: 0x0000_0000_00AB_CDEF,
            confirmation_target: 3,
            confirmations: 3,
        })
        .await
        .unwrap();

    let encoded = nonce::encode(quote.contract_data.escrow_nonce).unwrap();
    assert_eq!(encoded.sequence, 0xFEAB_CDEF);

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
}

/// Scenario 2 (spec §8): a fee spike leaves the counterparty's
/// `max_sats_per_vbyte` ceiling unpayable -- the swap goes `NonPayable` and
/// is refunded once its contract expires.
#[tokio::test]
async fn scenario_2_to_btc_fee_spike_then_refund() {
    // Quoted while the network sits at 10 sat/vbyte, giving a 12.5
    // sat/vbyte ceiling (networkFeeMultiplierPPM = 1_250_000). Before the
    // payout builds, the network jumps to 40 sat/vbyte -- well past the
    // ceiling the counterparty agreed to pay.
    let (handler, wallet) = to_btc_handler(10);
    let quote = handler
        .quote(ToBtcQuoteRequest {
            chain_id: ChainId("evm:1".into()),
            token: "USDC".into(),
            offerer: "0xoffer".into(),
            claimer: "0xintermediary".into(),
            output_script: vec![0u8; 22],
            amount: AmountSpec::ExactIn(Decimal::new(1000, 0)),
            nonce: 0xABCDEF,
            confirmation_target: 3,
            confirmations: 3,
        })
        .await
        .unwrap();
    let active = handler.store.list_active().await.unwrap();
    let record = &active[0];

    wallet.set_fee_rate(40);
    handler
        .on_initialize(record.payment_hash, record.sequence)
        .await
        .unwrap();
    let after_spike = handler
        .store
        .get(record.payment_hash, record.sequence)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after_spike.state, ToBtcState::NonPayable);

    let mut expired = after_spike.clone();
    expired.contract_data = Some({
        let mut cd = quote.contract_data.clone();
        cd.expiry = 1;
        cd
    });
    handler.store.update(expired).await.unwrap();
    handler
        .adapter
        .commit(record.payment_hash, record.sequence, quote.contract_data.clone());

    handler.process_past_swaps().await;

    let refunded = handler
        .store
        .get(record.payment_hash, record.sequence)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refunded.state, ToBtcState::Refunded);
    assert!(refunded.tx_ids.refund.is_some());
}

fn from_btc_ln_handler() -> FromBtcLnHandler<
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

/// Scenario 3 (spec §8): FromBtcLn happy path -- HTLC held with ample CLTV,
/// commitment lands, counterparty's claim settles the invoice and the
/// record is cleaned up.
#[tokio::test]
async fn scenario_3_from_btc_ln_happy_path() {
    let handler = from_btc_ln_handler();
    let ph = swap_intermediary::types::PaymentHash([7u8; 32]);

    handler
        .create_invoice(CreateInvoiceRequest {
            chain_id: ChainId("evm:1".into()),
            token: "USDC".into(),
            address: "0xrecipient".into(),
            offerer_vault: "0xvault".into(),
            payment_hash: ph,
            amount: AmountSpec::ExactIn(Decimal::new(100_000, 0)),
            min_cltv: 72,
            value_in_native_currency: Decimal::new(100_000, 0),
        })
        .await
        .unwrap();

    handler
        .lightning_node()
        .arrive_htlc(
            ph,
            HeldHtlc {
                amount_sats: 100_000,
                expiry_height: 1_000 + 72 + 10,
            },
        )
        .await;

    handler
        .on_htlc_received(ph, "0xvault", "0xrecipient", "USDC", &ChainId("evm:1".into()))
        .await
        .unwrap();
    let received = handler
        .store
        .get(ph, swap_intermediary::types::Sequence::HTLC)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.state, FromBtcLnState::Received);

    handler.on_initialize(ph).await.unwrap();
    let committed = handler
        .store
        .get(ph, swap_intermediary::types::Sequence::HTLC)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(committed.state, FromBtcLnState::Committed);

    handler.on_claim(ph, [1u8; 32]).await.unwrap();
    assert!(handler
        .store
        .get(ph, swap_intermediary::types::Sequence::HTLC)
        .await
        .unwrap()
        .is_none());
}

/// Scenario 4 (spec §8): the payer's HTLC arrives with less CLTV remaining
/// than the intermediary's minimum -- the invoice is canceled rather than
/// ever being turned into a smart-chain commitment (spec error 20002).
#[tokio::test]
async fn scenario_4_from_btc_ln_late_htlc_arrival() {
    let handler = from_btc_ln_handler();
    let ph = swap_intermediary::types::PaymentHash([8u8; 32]);

    handler
        .create_invoice(CreateInvoiceRequest {
            chain_id: ChainId("evm:1".into()),
            token: "USDC".into(),
            address: "0xrecipient".into(),
            offerer_vault: "0xvault".into(),
            payment_hash: ph,
            amount: AmountSpec::ExactIn(Decimal::new(100_000, 0)),
            min_cltv: 72,
            value_in_native_currency: Decimal::new(100_000, 0),
        })
        .await
        .unwrap();

    handler
        .lightning_node()
        .arrive_htlc(
            ph,
            HeldHtlc {
                amount_sats: 100_000,
                expiry_height: 1_000 + 72 - 1,
            },
        )
        .await;

    handler
        .on_htlc_received(ph, "0xvault", "0xrecipient", "USDC", &ChainId("evm:1".into()))
        .await
        .unwrap();

    let record = handler
        .store
        .get(ph, swap_intermediary::types::Sequence::HTLC)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, FromBtcLnState::Canceled);
}

fn header_at(timestamp: u32, nonce: u32) -> BitcoinHeader {
    BitcoinHeader {
        version: 1,
        prev_block_hash: [0u8; 32],
        merkle_root: [0u8; 32],
        timestamp,
        nbits: 0x1d00ffff,
        nonce,
    }
}

/// Scenario 5 (spec §8): the relay simply extends when the node's tip is a
/// direct descendant of the relay's main tip -- no reorg machinery invoked.
#[tokio::test]
async fn scenario_5_relay_extends_without_reorg() {
    let relay = Arc::new(InMemoryRelay::new());
    let genesis = header_at(1_700_000_000, 0);
    relay.save_initial_header(genesis, 100).await.unwrap();

    let node = Arc::new(MockBitcoinChainReader::new());
    node.set_header(100, genesis).await;
    node.set_header(101, header_at(1_700_000_600, 1)).await;

    let sync = RelaySynchronizer::new(relay.clone(), node);
    let tip = sync.sync_to_latest().await.unwrap();
    assert_eq!(tip.blockheight, 101);
    assert_eq!(relay.main_tip().await.unwrap().blockheight, 101);
}

/// Scenario 6 (spec §8): a heavier competing fork causes the relay to
/// reorg onto it, flipping which chain is "main".
#[tokio::test]
async fn scenario_6_relay_reorgs_onto_heavier_fork() {
    let relay = InMemoryRelay::new();
    relay.save_initial_header(header_at(1_700_000_000, 0), 100).await.unwrap();
    relay
        .save_main_headers(&[header_at(1_700_000_600, 1)])
        .await
        .unwrap();

    // Open a competing fork at height 100 and give it two blocks -- more
    // accumulated work than main's single block.
    let (fork_id, _) = relay
        .save_new_fork_headers(100, &[header_at(1_700_000_550, 2), header_at(1_700_001_100, 3)])
        .await
        .unwrap();

    let main_tip = relay.main_tip().await.unwrap();
    assert_eq!(main_tip.blockheight, 102);
    assert!(fork_id != ForkId::MAIN);
}
