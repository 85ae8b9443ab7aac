//! swap-intermediary: the market-maker side of a trust-minimized atomic
//! swap protocol connecting Bitcoin (on-chain and Lightning) to generic
//! smart-contract chains.
//!
//! This crate is the core engine only. REST framing, the pricing oracle's
//! concrete backend, persistent key-value storage, Bitcoin/Lightning node
//! RPC clients, and concrete smart-chain bindings all stay behind the trait
//! boundaries defined here (`collaborators`, `btc_rpc`, `lightning::node`,
//! `chain::adapter`, `store::SwapStore`) -- an embedder wires concrete
//! implementations of each and assembles the four swap handlers under
//! `handlers`.
//!
//! # Example
//!
//! ```rust,ignore
//! use swap_intermediary::chain::ChainAdapter;
//! use swap_intermediary::handlers::to_btc::ToBtcHandler;
//!
//! // An embedder provides concrete ChainAdapter, BitcoinRpc, SwapStore and
//! // PricingOracle implementations, then drives the handler from its own
//! // REST layer and watchdog scheduler.
//! let handler = ToBtcHandler::new(adapter, store, pricing, btc_wallet, config);
//! ```

pub mod btc_rpc;
pub mod chain;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod handlers;
pub mod lightning;
pub mod locks;
pub mod payout;
pub mod pricing;
pub mod rest;
pub mod spv;
pub mod store;
pub mod types;

pub use config::IntermediaryConfig;
pub use error::{EngineError, Result};
pub use store::{InMemorySwapStore, SwapStore};
pub use types::{
    Authorization, ChainId, ContractData, Direction, Fees, Metadata, PaymentHash, Sequence,
    SwapKind, SwapRecord, TxIds,
};
