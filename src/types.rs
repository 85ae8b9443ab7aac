//! Shared data model for the swap-intermediary engine (spec §3).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Serde module for serializing `[u8; 32]` as hex strings.
pub(crate) mod hex_bytes32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Bitcoin network the intermediary's on-chain collaborators operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn to_bitcoin_network(self) -> bitcoin::Network {
        match self {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl std::str::FromStr for Network {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" | "testnet3" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(crate::error::EngineError::Validation(format!(
                "unknown network: {s}"
            ))),
        }
    }
}

/// Opaque identifier for a smart-contract chain (spec §3 `chainId`).
///
/// Kept as an owned string rather than an enum: concrete chain bindings are
/// out of scope (spec §1), so the engine only ever needs to carry the id
/// through, never branch on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub String);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-byte binding value: `sha256(preimage)` for HTLC swaps, or
/// `hashForOnchain(outputScript, amount, nonce)` for nonced on-chain BTC
/// claim swaps (spec §3, §6).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentHash(#[serde(with = "hex_bytes32")] pub [u8; 32]);

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl PaymentHash {
    pub fn from_preimage(preimage: &[u8; 32]) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(preimage);
        PaymentHash(digest.into())
    }
}

/// 64-bit swap identifier (spec §3 `sequence`). Random for on-chain BTC
/// payouts (`ToBtc`), zero for HTLC swaps. `(PaymentHash, Sequence)` must be
/// unique across the lifetime of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const HTLC: Sequence = Sequence(0);

    pub fn random() -> Self {
        Sequence(rand::random())
    }
}

/// The four swap directions (spec §3 `direction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Smart-chain token -> BTC on-chain (PTLC, §4.5).
    ToBtc,
    /// Smart-chain token -> Lightning (HTLC, §4.6).
    ToBtcLn,
    /// BTC on-chain -> smart-chain token (§4.8).
    FromBtc,
    /// Lightning -> smart-chain token (HODL invoice, §4.7).
    FromBtcLn,
}

/// The on-chain commitment kind a swap's `ContractData` is committed as
/// (spec §3 `kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapKind {
    /// Hash-time-locked: claimable by revealing a preimage.
    Htlc,
    /// Proof-time-locked against a BTC tx proof (`txoHash`).
    Chain,
    /// Proof-time-locked against a nonce-bound output script + amount (PTLC payout, §4.5).
    ChainNonced,
    /// Proof-time-locked identified by a specific BTC txid.
    ChainTxid,
}

/// The on-chain commitment payload (spec §3 `contractData`).
///
/// Immutable once committed (`state >= Committed`); see spec §3 invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractData {
    pub offerer: String,
    pub claimer: String,
    pub token: String,
    pub amount: u64,
    /// Unix timestamp after which the swap may be refunded.
    pub expiry: u64,
    /// Required Bitcoin confirmations (on-chain directions only).
    pub confirmations: u32,
    pub pay_in: bool,
    pub pay_out: bool,
    pub security_deposit: u64,
    pub claimer_bounty: u64,
    pub kind: SwapKind,
    /// 64-bit replay-protection nonce used for `ChainNonced` payouts (spec §4.5, §6).
    pub escrow_nonce: u64,
    /// The Bitcoin `scriptPubkey` bound into `hashForOnchain`/`txoHash` for
    /// the `Chain`/`ChainNonced` kinds (spec §3 `paymentHash`, §4.8
    /// `txoHash = H(amount || outputScript)`): the payout destination for
    /// `ToBtc`, the funding destination for `FromBtc`. `None` for `Htlc`
    /// and `ChainTxid` swaps, which don't bind to a specific script.
    pub output_script: Option<Vec<u8>>,
}

/// Swap-fee and network-fee breakdown (spec §3 `fees`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fees {
    /// Intermediary's swap fee, denominated in BTC satoshis.
    pub swap_fee_sats: u64,
    /// Same fee, re-expressed in the swap's input/output token.
    pub swap_fee_token: u64,
    /// Network (miner) fee, in BTC satoshis.
    pub network_fee_sats: u64,
    /// Same fee, re-expressed in token units.
    pub network_fee_token: u64,
    /// Maximum sat/vB the intermediary is willing to pay for the BTC payout.
    /// Invariant (spec §3): actual broadcast fee rate must be <= this.
    pub max_sats_per_vbyte: u64,
}

/// Pre-commit counterparty authorization (spec §3 `authorization`).
///
/// Non-null only while the swap is pre-commit; once committed the spec
/// invariant forbids mutating it further, so the field is simply dropped
/// from the record rather than tracked as stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    /// Adapter-chosen wire prefix for the signed commitment message.
    pub prefix: String,
    /// Unix timestamp after which this authorization can no longer be submitted.
    pub timeout: u64,
    /// Adapter signature over `(prefix, commit_hash, timeout)`.
    pub signature: Vec<u8>,
}

/// Informational transaction ids observed over the swap's lifetime (spec §3 `txIds`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxIds {
    pub init: Option<String>,
    pub claim: Option<String>,
    pub refund: Option<String>,
    pub btc_payout: Option<String>,
}

/// Timing breadcrumbs (spec §3 `metadata`), optional and purely informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub created_at: Option<i64>,
    pub committed_at: Option<i64>,
    pub claimed_at: Option<i64>,
    pub refunded_at: Option<i64>,
}

/// A persisted swap, generic over its direction-specific state enum (spec §3).
///
/// `(chain_id, payment_hash, sequence)` is the store's primary key. The
/// per-swap [`crate::locks::SwapLock`] deliberately lives outside this type:
/// it's runtime-only re-entrancy bookkeeping, not swap state, and must never
/// round-trip through serialization (a restarted process starts every swap
/// unlocked, which is the crash-safe behavior spec §5 asks for).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord<State> {
    pub chain_id: ChainId,
    pub payment_hash: PaymentHash,
    pub sequence: Sequence,
    pub direction: Direction,
    pub state: State,
    pub contract_data: Option<ContractData>,
    pub fees: Fees,
    /// Present only before the swap is committed on-chain; dropped once
    /// `contract_data` exists (spec §3 invariant).
    pub authorization: Option<Authorization>,
    pub tx_ids: TxIds,
    pub metadata: Metadata,
    /// The HTLC secret, once revealed by the counterparty's on-chain claim
    /// (spec §4.7 step 4). Persisted so a `Claimed`-state retry can settle
    /// the HODL invoice with the real preimage instead of a placeholder --
    /// `None` until a `Claim` event carries the witness.
    pub preimage: Option<[u8; 32]>,
}

impl<State> SwapRecord<State> {
    pub fn key(&self) -> (PaymentHash, Sequence) {
        (self.payment_hash, self.sequence)
    }
}
