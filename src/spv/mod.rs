//! SPV header relay: the pure header codec, the on-chain relay driver trait,
//! and the synchronizer that keeps the relay's tip caught up with Bitcoin
//! (spec §4.1, §4.2, §4.3).

pub mod header;
pub mod relay;
pub mod sync;

pub use header::{BitcoinHeader, HeaderError, StoredHeader, U256};
pub use relay::{BtcRelayDriver, ForkId, RelayError};
pub use sync::{RelaySynchronizer, SyncError};
