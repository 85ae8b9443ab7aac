//! Chain Adapter Contract (spec §4.4): the trait every smart-contract chain
//! binding implements so the rest of the engine never branches on which
//! chain a swap's token leg lives on.
//!
//! Out of scope to implement concretely (spec §1 Non-goals: "concrete chain
//! bindings"). Swap handlers (§4.5-§4.8) are generic over `A: ChainAdapter`.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Authorization, ChainId, ContractData, PaymentHash, Sequence, SwapKind};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("commitment for ({0}, {1:?}) not found")]
    CommitmentNotFound(PaymentHash, Sequence),
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("swap is not in a payable state")]
    NonPayable,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("insufficient balance to cover security deposit/bounty")]
    InsufficientBalance,
    #[error("collaborator rpc error: {0}")]
    Rpc(#[from] anyhow::Error),
}

/// Parameters identifying which on-chain commitment to read or act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitmentQuery {
    pub payment_hash: PaymentHash,
    pub sequence: Sequence,
}

/// An adapter-signed pre-commit authorization, ready to hand to the
/// counterparty so they can submit the initializing transaction themselves
/// (spec §3 `authorization`, §4.4 "signed-and-send wrappers").
#[derive(Debug, Clone)]
pub struct SignedCommitment {
    pub contract_data: ContractData,
    pub authorization: Authorization,
}

/// Chain-agnostic capability set a smart-contract chain binding must expose
/// (spec §4.4). Every method that touches the chain is async and fallible;
/// callers distinguish terminal failures (`Reverted`, `NonPayable`) from
/// transient RPC trouble (`Rpc`) when deciding whether to retry.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Current confirmed block number, used to evaluate `expiry` and to
    /// decide whether a swap's refund timelock has passed.
    async fn current_block(&self) -> Result<u64, AdapterError>;

    /// Whether the intermediary has a reputation record for `token` on this
    /// chain (spec §4.5 step 3 `checkVaultInitialized`). A swap cannot be
    /// quoted for a token the intermediary has never posted a vault for.
    async fn is_vault_initialized(&self, token: &str) -> Result<bool, AdapterError>;

    /// Reads the on-chain commitment for a swap, if one has been submitted.
    async fn get_commitment(
        &self,
        query: CommitmentQuery,
    ) -> Result<Option<ContractData>, AdapterError>;

    /// Computes the binding hash for a nonced on-chain BTC payout (spec §3,
    /// §6 `hashForOnchain(outputScript, amount, nonce)`), matching whatever
    /// hash function the chain's contract checks on claim.
    fn hash_for_onchain(&self, output_script: &[u8], amount: u64, nonce: u64) -> [u8; 32];

    /// Signs a pre-commit authorization the counterparty can submit
    /// directly (spec §4.4), valid until `timeout`.
    async fn sign_authorization(
        &self,
        contract_data: &ContractData,
        timeout: u64,
    ) -> Result<Authorization, AdapterError>;

    /// Submits the initializing commitment ourselves (used when the
    /// intermediary is the payer, e.g. `FromBtc`/`FromBtcLn`). Returns the
    /// submitting transaction's id.
    async fn initialize(&self, contract_data: &ContractData) -> Result<String, AdapterError>;

    /// Claims a committed swap by revealing `witness` (a preimage for
    /// [`SwapKind::Htlc`], or the relevant BTC tx proof for the `Chain*`
    /// kinds). Returns the claiming transaction's id.
    async fn claim(
        &self,
        query: CommitmentQuery,
        witness: &[u8],
    ) -> Result<String, AdapterError>;

    /// Refunds a committed swap past its `expiry`. Returns the refunding
    /// transaction's id.
    async fn refund(&self, query: CommitmentQuery) -> Result<String, AdapterError>;

    /// Current network fee estimate for committing/claiming/refunding,
    /// expressed in the chain's native fee unit.
    async fn estimate_fee(&self, kind: SwapKind) -> Result<u64, AdapterError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! In-memory [`ChainAdapter`] used by the handler unit tests and the
    //! scenario suite (spec §1 Non-goals: concrete chain bindings are out
    //! of scope; grounded on the teacher's in-memory storage test pattern,
    //! same as [`crate::spv::relay::test_support::InMemoryRelay`]).

    use super::*;
    use dashmap::DashMap;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MockAdapter {
        chain_id: String,
        block: AtomicU64,
        commitments: DashMap<(PaymentHash, Sequence), ContractData>,
        /// Queued outcome for the next `claim` call, keyed by swap; lets a
        /// test force `Reverted`/`NonPayable` without a real chain.
        pub claim_failures: DashMap<(PaymentHash, Sequence), AdapterError>,
        pub fee_estimate: Mutex<u64>,
        /// Tokens the mock vault has *not* been initialized for; everything
        /// else reads as initialized (test default: permissive).
        pub uninitialized_vaults: DashMap<String, ()>,
    }

    impl MockAdapter {
        pub fn new(chain_id: impl Into<String>) -> Self {
            Self {
                chain_id: chain_id.into(),
                block: AtomicU64::new(0),
                commitments: DashMap::new(),
                claim_failures: DashMap::new(),
                fee_estimate: Mutex::new(1),
                uninitialized_vaults: DashMap::new(),
            }
        }

        pub fn advance_block(&self) -> u64 {
            self.block.fetch_add(1, Ordering::SeqCst) + 1
        }

        pub fn set_block(&self, height: u64) {
            self.block.store(height, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChainAdapter for MockAdapter {
        fn chain_id(&self) -> ChainId {
            ChainId(self.chain_id.clone())
        }

        async fn current_block(&self) -> Result<u64, AdapterError> {
            Ok(self.block.load(Ordering::SeqCst))
        }

        async fn is_vault_initialized(&self, token: &str) -> Result<bool, AdapterError> {
            Ok(!self.uninitialized_vaults.contains_key(token))
        }

        async fn get_commitment(
            &self,
            query: CommitmentQuery,
        ) -> Result<Option<ContractData>, AdapterError> {
            Ok(self
                .commitments
                .get(&(query.payment_hash, query.sequence))
                .map(|r| r.clone()))
        }

        fn hash_for_onchain(&self, output_script: &[u8], amount: u64, nonce: u64) -> [u8; 32] {
            // spec §6: H(nonce_8BE || H(amount_8LE || outputScript)).
            let inner = Sha256::digest(
                [amount.to_le_bytes().as_slice(), output_script].concat(),
            );
            Sha256::digest([nonce.to_be_bytes().as_slice(), inner.as_slice()].concat()).into()
        }

        async fn sign_authorization(
            &self,
            contract_data: &ContractData,
            timeout: u64,
        ) -> Result<Authorization, AdapterError> {
            Ok(Authorization {
                prefix: "mock".into(),
                timeout,
                signature: contract_data.offerer.as_bytes().to_vec(),
            })
        }

        async fn initialize(&self, contract_data: &ContractData) -> Result<String, AdapterError> {
            // The mock keys commitments by (offerer-embedded payment hash,
            // sequence) via the caller-supplied query in tests; production
            // adapters derive the key from the submitted calldata itself.
            unreachable!("MockAdapter::initialize is not used directly by tests; use commit()")
        }

        async fn claim(
            &self,
            query: CommitmentQuery,
            _witness: &[u8],
        ) -> Result<String, AdapterError> {
            if let Some((_, err)) = self.claim_failures.remove(&(query.payment_hash, query.sequence)) {
                return Err(err);
            }
            self.commitments
                .remove(&(query.payment_hash, query.sequence))
                .ok_or(AdapterError::CommitmentNotFound(query.payment_hash, query.sequence))?;
            Ok(format!("claim-tx-{}", query.payment_hash))
        }

        async fn refund(&self, query: CommitmentQuery) -> Result<String, AdapterError> {
            self.commitments
                .remove(&(query.payment_hash, query.sequence))
                .ok_or(AdapterError::CommitmentNotFound(query.payment_hash, query.sequence))?;
            Ok(format!("refund-tx-{}", query.payment_hash))
        }

        async fn estimate_fee(&self, _kind: SwapKind) -> Result<u64, AdapterError> {
            Ok(*self.fee_estimate.lock().await)
        }
    }

    impl MockAdapter {
        /// Test helper standing in for the counterparty submitting the
        /// initializing commitment on-chain (spec §4.5 step: "Post-commit
        /// processing (triggered by `Initialize` event ...)").
        pub fn commit(&self, payment_hash: PaymentHash, sequence: Sequence, data: ContractData) {
            self.commitments.insert((payment_hash, sequence), data);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn sample_data() -> ContractData {
            ContractData {
                offerer: "offerer".into(),
                claimer: "claimer".into(),
                token: "USDC".into(),
                amount: 100_000,
                expiry: 9_999_999_999,
                confirmations: 3,
                pay_in: true,
                pay_out: false,
                security_deposit: 0,
                claimer_bounty: 0,
                kind: SwapKind::ChainNonced,
                escrow_nonce: 0xABCDEF,
                output_script: Some(vec![0u8; 22]),
            }
        }

        #[tokio::test]
        async fn commit_then_claim_round_trip() {
            let adapter = MockAdapter::new("evm:1");
            let ph = PaymentHash([1u8; 32]);
            let seq = Sequence(42);
            adapter.commit(ph, seq, sample_data());

            let query = CommitmentQuery {
                payment_hash: ph,
                sequence: seq,
            };
            assert!(adapter.get_commitment(query).await.unwrap().is_some());

            adapter.claim(query, b"witness").await.unwrap();
            assert!(adapter.get_commitment(query).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn hash_for_onchain_is_deterministic() {
            let adapter = MockAdapter::new("evm:1");
            let a = adapter.hash_for_onchain(b"script", 1_000, 7);
            let b = adapter.hash_for_onchain(b"script", 1_000, 7);
            assert_eq!(a, b);
            let c = adapter.hash_for_onchain(b"script", 1_001, 7);
            assert_ne!(a, c);
        }
    }
}
