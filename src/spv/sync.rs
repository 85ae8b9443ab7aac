//! Relay Synchronizer (spec §4.3): reconciles the Bitcoin node's chain
//! against the on-chain relay's tracked tip, including reorgs.

use std::sync::Arc;

use thiserror::Error;

use crate::btc_rpc::{BitcoinChainReader, BitcoinRpcError};
use crate::spv::header::StoredHeader;
use crate::spv::relay::{BtcRelayDriver, ForkId, RelayError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Rpc(#[from] BitcoinRpcError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("reorg search exceeded {0} blocks without finding a common ancestor")]
    AncestorNotFound(u32),
}

/// How far back the synchronizer will walk looking for the fork point
/// before giving up (spec §4.3: "bounded reorg depth").
const MAX_REORG_DEPTH: u32 = 200;

/// Drives a [`BtcRelayDriver`] to track a [`BitcoinChainReader`]'s view of
/// the chain (spec §4.3).
///
/// Stateless between calls: every sync asks the relay for its current tip
/// fresh, so a restart loses no progress and two synchronizers racing each
/// other just submit redundant (idempotent, rejected-or-no-op) transactions.
pub struct RelaySynchronizer<R, C> {
    relay: Arc<R>,
    chain: Arc<C>,
}

impl<R, C> RelaySynchronizer<R, C>
where
    R: BtcRelayDriver,
    C: BitcoinChainReader,
{
    pub fn new(relay: Arc<R>, chain: Arc<C>) -> Self {
        Self { relay, chain }
    }

    /// Brings the relay's main tip up to the node's current tip (spec §4.3
    /// algorithm):
    ///
    /// 1. Read the relay's main tip and the node's tip height.
    /// 2. If the node is not ahead, nothing to do.
    /// 3. If the relay's tip header still matches the node's header at that
    ///    height, it's a simple extension: submit the missing headers via
    ///    `save_main_headers`.
    /// 4. Otherwise the relay's tip was reorged out: walk backwards (up to
    ///    [`MAX_REORG_DEPTH`]) until a height where the node and the relay
    ///    agree, open a fork there with `save_new_fork_headers`, then feed
    ///    it the rest of the node's chain with `save_fork_headers` until the
    ///    fork's chainwork overtakes main and the relay reorgs onto it.
    pub async fn sync_to_latest(&self) -> Result<StoredHeader, SyncError> {
        let relay_tip = self.relay.main_tip().await?;
        let node_tip_height = self.chain.tip_height().await?;

        if node_tip_height <= relay_tip.blockheight {
            return Ok(relay_tip);
        }

        let node_header_at_relay_tip = self.chain.header_at(relay_tip.blockheight).await?;
        if node_header_at_relay_tip == relay_tip.header {
            let missing = self
                .chain
                .headers_from(relay_tip.blockheight + 1)
                .await?;
            return Ok(self.relay.save_main_headers(&missing).await?);
        }

        self.handle_reorg(relay_tip, node_tip_height).await
    }

    async fn handle_reorg(
        &self,
        relay_tip: StoredHeader,
        node_tip_height: u32,
    ) -> Result<StoredHeader, SyncError> {
        let floor = relay_tip.blockheight.saturating_sub(MAX_REORG_DEPTH);
        let mut ancestor_height = relay_tip.blockheight;
        let ancestor = loop {
            if ancestor_height == floor {
                return Err(SyncError::AncestorNotFound(MAX_REORG_DEPTH));
            }
            ancestor_height -= 1;

            let stored = self
                .relay
                .stored_header_at(ForkId::MAIN, ancestor_height)
                .await?;
            let node_header = self.chain.header_at(ancestor_height).await?;
            if let Some(stored) = stored {
                if stored.header == node_header {
                    break ancestor_height;
                }
            }
        };

        let fork_headers = self.chain.headers_from(ancestor + 1).await?;
        let (fork_id, mut fork_tip) = self
            .relay
            .save_new_fork_headers(ancestor, &fork_headers)
            .await?;

        while fork_tip.blockheight < node_tip_height {
            let more = self.chain.headers_from(fork_tip.blockheight + 1).await?;
            fork_tip = self.relay.save_fork_headers(fork_id, &more).await?;
        }

        Ok(self.relay.main_tip().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spv::header::{difficulty_from_nbits, BitcoinHeader};
    use crate::spv::relay::test_support::InMemoryRelay;
    use async_trait::async_trait;
    use bitcoin::Txid;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn header(prev: [u8; 32], nonce: u32, timestamp: u32) -> BitcoinHeader {
        BitcoinHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: [0u8; 32],
            timestamp,
            nbits: 0x1d00ffff,
            nonce,
        }
    }

    struct FakeChain {
        headers: StdMutex<HashMap<u32, BitcoinHeader>>,
    }

    impl FakeChain {
        fn new(headers: Vec<(u32, BitcoinHeader)>) -> Self {
            Self {
                headers: StdMutex::new(headers.into_iter().collect()),
            }
        }

        fn set(&self, height: u32, h: BitcoinHeader) {
            self.headers.lock().unwrap().insert(height, h);
        }
    }

    #[async_trait]
    impl BitcoinChainReader for FakeChain {
        async fn tip_height(&self) -> Result<u32, BitcoinRpcError> {
            Ok(*self.headers.lock().unwrap().keys().max().unwrap())
        }

        async fn header_at(&self, height: u32) -> Result<BitcoinHeader, BitcoinRpcError> {
            self.headers
                .lock()
                .unwrap()
                .get(&height)
                .copied()
                .ok_or(BitcoinRpcError::UnknownHeight(height))
        }

        async fn confirmations(&self, _txid: Txid) -> Result<u32, BitcoinRpcError> {
            Ok(6)
        }
    }

    #[tokio::test]
    async fn extends_main_chain_when_no_reorg() {
        let relay = Arc::new(InMemoryRelay::new());
        let genesis = header([0u8; 32], 0, 100);
        relay.save_initial_header(genesis, 0).await.unwrap();

        let h1 = header([1u8; 32], 1, 200);
        let h2 = header([2u8; 32], 2, 300);
        let chain = Arc::new(FakeChain::new(vec![(0, genesis), (1, h1), (2, h2)]));

        let sync = RelaySynchronizer::new(relay.clone(), chain);
        let tip = sync.sync_to_latest().await.unwrap();
        assert_eq!(tip.blockheight, 2);
        assert_eq!(relay.main_tip().await.unwrap().blockheight, 2);
    }

    #[tokio::test]
    async fn no_op_when_relay_already_caught_up() {
        let relay = Arc::new(InMemoryRelay::new());
        let genesis = header([0u8; 32], 0, 100);
        relay.save_initial_header(genesis, 0).await.unwrap();
        let chain = Arc::new(FakeChain::new(vec![(0, genesis)]));

        let sync = RelaySynchronizer::new(relay, chain);
        let tip = sync.sync_to_latest().await.unwrap();
        assert_eq!(tip.blockheight, 0);
    }

    #[tokio::test]
    async fn reorg_switches_to_heavier_fork() {
        let relay = Arc::new(InMemoryRelay::new());
        let genesis = header([0u8; 32], 0, 100);
        relay.save_initial_header(genesis, 0).await.unwrap();

        let stale1 = header([1u8; 32], 1, 200);
        relay.save_main_headers(&[stale1]).await.unwrap();

        // The node now has a different, longer chain at height 1 onward.
        let fresh1 = header([9u8; 32], 9, 250);
        let fresh2 = header([10u8; 32], 10, 260);
        let chain = Arc::new(FakeChain::new(vec![(0, genesis), (1, fresh1), (2, fresh2)]));

        let sync = RelaySynchronizer::new(relay.clone(), chain);
        let tip = sync.sync_to_latest().await.unwrap();
        assert_eq!(tip.blockheight, 2);
        assert_eq!(tip.header, fresh2);
    }

    #[tokio::test]
    async fn ancestor_not_found_beyond_max_depth() {
        let relay = Arc::new(InMemoryRelay::new());
        let genesis = header([0u8; 32], 0, 100);
        relay.save_initial_header(genesis, 0).await.unwrap();

        // A single stale header that never matches anything the node has,
        // forcing the walk to exhaust its depth budget immediately.
        let stale = header([1u8; 32], 1, 200);
        relay.save_main_headers(&[stale]).await.unwrap();

        let node_header_0 = header([0xffu8; 32], 0xff, 999); // disagrees even at height 0
        let fresh1 = header([9u8; 32], 9, 250);
        let chain = Arc::new(FakeChain::new(vec![(0, node_header_0), (1, fresh1)]));
        chain.set(1, fresh1);

        let sync = RelaySynchronizer::new(relay, chain);
        let err = sync.sync_to_latest().await.unwrap_err();
        assert!(matches!(err, SyncError::AncestorNotFound(_)));
    }
}
