//! BTC Payout Engine (spec §2 component H): escrow-nonce encoding, UTXO
//! coin selection, and PSBT build/sign/broadcast for `ToBtc` payouts.

pub mod coinselect;
pub mod engine;
pub mod nonce;

pub use coinselect::{CoinSelectError, CoinSelection};
pub use engine::{PayoutEngine, PayoutError, PayoutRequest, PayoutResult, PendingPayouts};
pub use nonce::{EncodedNonce, NonceError};
