//! BTC Relay Driver (spec §4.2): the typed boundary to the on-chain SPV
//! light client contract. A concrete chain's adapter implements this trait
//! against whatever RPC/transaction-submission machinery that chain uses;
//! the synchronizer (§4.3) only ever talks to this trait.

use async_trait::async_trait;
use thiserror::Error;

use crate::spv::header::{BitcoinHeader, StoredHeader};

/// Identifies one of the relay's tracked chain tips. `0` is always the main
/// chain; any other value names a fork opened by `save_new_fork_headers`
/// (spec §4.2 "fork-id semantics": fork ids are allocated by the contract,
/// never chosen by the caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForkId(pub u64);

impl ForkId {
    pub const MAIN: ForkId = ForkId(0);

    pub fn is_main(self) -> bool {
        self == ForkId::MAIN
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay has not been initialized with a starting header")]
    Uninitialized,

    #[error("header does not extend a known tip (fork-id {0:?})")]
    UnknownParent(ForkId),

    #[error("header batch was empty")]
    EmptyBatch,

    #[error("fork {0:?} has not accumulated enough work to become main")]
    InsufficientForkWork(ForkId),

    #[error("collaborator call failed: {0}")]
    Collaborator(#[from] anyhow::Error),
}

/// Chain-agnostic view of the on-chain SPV light client (spec §4.2).
///
/// Every write method submits a transaction and awaits its inclusion; the
/// synchronizer treats each call as atomic from its own perspective even
/// though the underlying chain may require retries (that retry policy is
/// the adapter's concern, not this trait's).
#[async_trait]
pub trait BtcRelayDriver: Send + Sync {
    /// The relay's current main-chain tip.
    async fn main_tip(&self) -> Result<StoredHeader, RelayError>;

    /// The stored header at `height` on `fork_id`, if the relay has it.
    async fn stored_header_at(
        &self,
        fork_id: ForkId,
        height: u32,
    ) -> Result<Option<StoredHeader>, RelayError>;

    /// Bootstraps the relay with a single starting header (spec §4.2
    /// `saveInitialHeader`). Only valid when the relay has no tip yet.
    async fn save_initial_header(
        &self,
        header: BitcoinHeader,
        blockheight: u32,
    ) -> Result<StoredHeader, RelayError>;

    /// Extends the current main chain with a contiguous run of headers
    /// (spec §4.2 `saveMainHeaders`). Every header in `headers` must chain
    /// from the previous one and from the relay's current main tip.
    async fn save_main_headers(
        &self,
        headers: &[BitcoinHeader],
    ) -> Result<StoredHeader, RelayError>;

    /// Opens a new fork at a point behind the main tip and submits its first
    /// headers, returning the fork id the contract allocated (spec §4.2
    /// `saveNewForkHeaders`).
    async fn save_new_fork_headers(
        &self,
        fork_point_height: u32,
        headers: &[BitcoinHeader],
    ) -> Result<(ForkId, StoredHeader), RelayError>;

    /// Extends an already-open fork (spec §4.2 `saveForkHeaders`). If the
    /// fork's accumulated chainwork now exceeds the main tip's, the
    /// contract reorgs and this fork becomes the new main chain; the
    /// returned tip's fork id reflects whichever chain is now main.
    async fn save_fork_headers(
        &self,
        fork_id: ForkId,
        headers: &[BitcoinHeader],
    ) -> Result<StoredHeader, RelayError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// An in-memory relay used by synchronizer tests. Applies `computeNext`
    /// exactly like a real on-chain verifier would, so a test that feeds it
    /// a bad header chain fails the same way production code would.
    ///
    /// Unlike the tip-only bookkeeping a real contract needs, this keeps
    /// every height it has ever seen on every fork, since tests exercise
    /// [`BtcRelayDriver::stored_header_at`] for arbitrary ancestor heights.
    #[derive(Default)]
    pub struct InMemoryRelay {
        history: Mutex<HashMap<(ForkId, u32), StoredHeader>>,
        main_height: Mutex<Option<u32>>,
        next_fork_id: Mutex<u64>,
    }

    impl InMemoryRelay {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl BtcRelayDriver for InMemoryRelay {
        async fn main_tip(&self) -> Result<StoredHeader, RelayError> {
            let height = self.main_height.lock().await.ok_or(RelayError::Uninitialized)?;
            self.history
                .lock()
                .await
                .get(&(ForkId::MAIN, height))
                .copied()
                .ok_or(RelayError::Uninitialized)
        }

        async fn stored_header_at(
            &self,
            fork_id: ForkId,
            height: u32,
        ) -> Result<Option<StoredHeader>, RelayError> {
            Ok(self.history.lock().await.get(&(fork_id, height)).copied())
        }

        async fn save_initial_header(
            &self,
            header: BitcoinHeader,
            blockheight: u32,
        ) -> Result<StoredHeader, RelayError> {
            let mut main_height = self.main_height.lock().await;
            if main_height.is_some() {
                return Err(RelayError::UnknownParent(ForkId::MAIN));
            }
            let stored = StoredHeader {
                chain_work: crate::spv::header::difficulty_from_nbits(header.nbits),
                last_diff_adjustment_timestamp: header.timestamp,
                blockheight,
                prev_block_timestamps: [header.timestamp; 10],
                header,
            };
            self.history
                .lock()
                .await
                .insert((ForkId::MAIN, blockheight), stored);
            *main_height = Some(blockheight);
            Ok(stored)
        }

        async fn save_main_headers(
            &self,
            headers: &[BitcoinHeader],
        ) -> Result<StoredHeader, RelayError> {
            if headers.is_empty() {
                return Err(RelayError::EmptyBatch);
            }
            let mut main_height = self.main_height.lock().await;
            let start_height = main_height.ok_or(RelayError::Uninitialized)?;
            let mut history = self.history.lock().await;
            let mut tip = *history
                .get(&(ForkId::MAIN, start_height))
                .ok_or(RelayError::Uninitialized)?;
            for header in headers {
                tip = tip.compute_next(*header);
                history.insert((ForkId::MAIN, tip.blockheight), tip);
            }
            *main_height = Some(tip.blockheight);
            Ok(tip)
        }

        async fn save_new_fork_headers(
            &self,
            fork_point_height: u32,
            headers: &[BitcoinHeader],
        ) -> Result<(ForkId, StoredHeader), RelayError> {
            if headers.is_empty() {
                return Err(RelayError::EmptyBatch);
            }
            let main_height = self.main_height.lock().await.ok_or(RelayError::Uninitialized)?;
            if fork_point_height > main_height {
                return Err(RelayError::UnknownParent(ForkId::MAIN));
            }
            let mut history = self.history.lock().await;
            let fork_point = *history
                .get(&(ForkId::MAIN, fork_point_height))
                .ok_or(RelayError::UnknownParent(ForkId::MAIN))?;

            let mut id_guard = self.next_fork_id.lock().await;
            *id_guard += 1;
            let fork_id = ForkId(*id_guard);

            let mut tip = fork_point;
            for header in headers {
                tip = tip.compute_next(*header);
                history.insert((fork_id, tip.blockheight), tip);
            }
            drop(history);
            self.promote_if_heavier(fork_id, tip).await?;
            Ok((fork_id, tip))
        }

        async fn save_fork_headers(
            &self,
            fork_id: ForkId,
            headers: &[BitcoinHeader],
        ) -> Result<StoredHeader, RelayError> {
            if headers.is_empty() {
                return Err(RelayError::EmptyBatch);
            }
            let mut history = self.history.lock().await;
            let fork_tip_height = history
                .keys()
                .filter(|(fid, _)| *fid == fork_id)
                .map(|(_, h)| *h)
                .max()
                .ok_or(RelayError::UnknownParent(fork_id))?;
            let mut tip = *history.get(&(fork_id, fork_tip_height)).unwrap();
            for header in headers {
                tip = tip.compute_next(*header);
                history.insert((fork_id, tip.blockheight), tip);
            }
            drop(history);
            self.promote_if_heavier(fork_id, tip).await?;
            Ok(tip)
        }
    }

    impl InMemoryRelay {
        /// If `fork_id`'s new tip has overtaken main's chainwork, reorgs
        /// onto it (spec §4.2: forks become main once they accumulate more
        /// proof-of-work than the current tip).
        async fn promote_if_heavier(
            &self,
            fork_id: ForkId,
            tip: StoredHeader,
        ) -> Result<(), RelayError> {
            if fork_id.is_main() {
                return Ok(());
            }
            let mut history = self.history.lock().await;
            let mut main_height = self.main_height.lock().await;
            let main = *history
                .get(&(ForkId::MAIN, main_height.ok_or(RelayError::Uninitialized)?))
                .ok_or(RelayError::Uninitialized)?;
            if tip.chain_work > main.chain_work {
                *main_height = Some(tip.blockheight);
                let fork_headers: Vec<_> = history
                    .iter()
                    .filter(|((fid, _), _)| *fid == fork_id)
                    .map(|(&(_, h), &sh)| (h, sh))
                    .collect();
                for (h, sh) in fork_headers {
                    history.insert((ForkId::MAIN, h), sh);
                }
            }
            Ok(())
        }
    }
}
