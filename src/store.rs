//! Swap Store (spec §3, §9): persistence keyed by `(paymentHash, sequence)`.
//!
//! Out of scope to back with a real database here (spec §1 Non-goals); the
//! trait is the seam a production embedder points at Postgres/sqlite/etc,
//! mirroring how the teacher's `storage.rs` kept `WalletStorage` as a trait
//! with an in-memory implementation for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::locks::SwapLock;
use crate::types::{PaymentHash, Sequence, SwapRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no swap found for ({0}, {1:?})")]
    NotFound(PaymentHash, Sequence),
    #[error("a swap for ({0}, {1:?}) already exists")]
    AlreadyExists(PaymentHash, Sequence),
    #[error("backing store error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Persistence boundary for swap records, generic over a handler's own
/// state enum. Implementations must make `insert` atomic with respect to
/// the `(payment_hash, sequence)` uniqueness invariant (spec §3).
#[async_trait]
pub trait SwapStore<State>: Send + Sync
where
    State: Clone + Send + Sync + 'static,
{
    async fn insert(&self, record: SwapRecord<State>) -> Result<(), StoreError>;

    async fn get(
        &self,
        payment_hash: PaymentHash,
        sequence: Sequence,
    ) -> Result<Option<SwapRecord<State>>, StoreError>;

    async fn update(&self, record: SwapRecord<State>) -> Result<(), StoreError>;

    async fn remove(
        &self,
        payment_hash: PaymentHash,
        sequence: Sequence,
    ) -> Result<(), StoreError>;

    async fn list_active(&self) -> Result<Vec<SwapRecord<State>>, StoreError>;

    /// The re-entrancy lock guarding this swap's critical sections (spec
    /// §5). Lives alongside the record rather than inside it, since it must
    /// survive `update` calls that replace the record's serializable state.
    fn lock_for(&self, payment_hash: PaymentHash, sequence: Sequence) -> Arc<SwapLock>;
}

use std::sync::Arc;

/// In-memory [`SwapStore`], used by tests and as a reference for what a
/// durable backend must implement.
pub struct InMemorySwapStore<State> {
    records: DashMap<(PaymentHash, Sequence), SwapRecord<State>>,
    locks: DashMap<(PaymentHash, Sequence), Arc<SwapLock>>,
}

impl<State> Default for InMemorySwapStore<State> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            locks: DashMap::new(),
        }
    }
}

impl<State> InMemorySwapStore<State> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<State> SwapStore<State> for InMemorySwapStore<State>
where
    State: Clone + Send + Sync + 'static,
{
    async fn insert(&self, record: SwapRecord<State>) -> Result<(), StoreError> {
        let key = record.key();
        if self.records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.0, key.1));
        }
        self.records.insert(key, record);
        Ok(())
    }

    async fn get(
        &self,
        payment_hash: PaymentHash,
        sequence: Sequence,
    ) -> Result<Option<SwapRecord<State>>, StoreError> {
        Ok(self.records.get(&(payment_hash, sequence)).map(|r| r.clone()))
    }

    async fn update(&self, record: SwapRecord<State>) -> Result<(), StoreError> {
        let key = record.key();
        if !self.records.contains_key(&key) {
            return Err(StoreError::NotFound(key.0, key.1));
        }
        self.records.insert(key, record);
        Ok(())
    }

    async fn remove(
        &self,
        payment_hash: PaymentHash,
        sequence: Sequence,
    ) -> Result<(), StoreError> {
        self.records.remove(&(payment_hash, sequence));
        self.locks.remove(&(payment_hash, sequence));
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<SwapRecord<State>>, StoreError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    fn lock_for(&self, payment_hash: PaymentHash, sequence: Sequence) -> Arc<SwapLock> {
        self.locks
            .entry((payment_hash, sequence))
            .or_insert_with(|| Arc::new(SwapLock::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainId, Direction, Fees, Metadata, TxIds};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestState {
        Quoted,
        Committed,
    }

    fn sample(n: u8) -> SwapRecord<TestState> {
        SwapRecord {
            chain_id: ChainId("evm:1".into()),
            payment_hash: PaymentHash([n; 32]),
            sequence: Sequence(n as u64),
            direction: Direction::ToBtc,
            state: TestState::Quoted,
            contract_data: None,
            fees: Fees {
                swap_fee_sats: 100,
                swap_fee_token: 100,
                network_fee_sats: 10,
                network_fee_token: 10,
                max_sats_per_vbyte: 50,
            },
            authorization: None,
            tx_ids: TxIds::default(),
            metadata: Metadata::default(),
            preimage: None,
        }
    }

    #[tokio::test]
    async fn insert_get_update_round_trip() {
        let store = InMemorySwapStore::new();
        let record = sample(1);
        store.insert(record.clone()).await.unwrap();

        let fetched = store.get(record.payment_hash, record.sequence).await.unwrap();
        assert_eq!(fetched.unwrap().state, TestState::Quoted);

        let mut updated = record.clone();
        updated.state = TestState::Committed;
        store.update(updated).await.unwrap();

        let fetched = store.get(record.payment_hash, record.sequence).await.unwrap();
        assert_eq!(fetched.unwrap().state, TestState::Committed);
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = InMemorySwapStore::new();
        store.insert(sample(2)).await.unwrap();
        let err = store.insert(sample(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_, _)));
    }

    #[tokio::test]
    async fn lock_for_is_stable_across_calls() {
        let store: InMemorySwapStore<TestState> = InMemorySwapStore::new();
        let record = sample(3);
        let lock_a = store.lock_for(record.payment_hash, record.sequence);
        let _guard = lock_a.try_acquire(std::time::Duration::from_secs(5)).unwrap();

        let lock_b = store.lock_for(record.payment_hash, record.sequence);
        assert!(lock_b.is_held());
    }
}
