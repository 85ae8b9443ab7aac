//! Chain-agnostic boundary to whatever smart-contract chain a swap's token
//! leg lives on (spec §4.4, §4.5): the [`adapter::ChainAdapter`] trait plus
//! the event demultiplexer that routes its events to swap handlers.

pub mod adapter;
pub mod events;

pub use adapter::{AdapterError, ChainAdapter, CommitmentQuery, SignedCommitment};
pub use events::{ChainEvent, ChainEventDemux, SwapEventSink};
