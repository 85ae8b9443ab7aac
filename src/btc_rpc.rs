//! Bitcoin RPC collaborator (spec §2 component C, §6 Environment).
//!
//! Out of scope to implement here (spec §1 Non-goals): a concrete
//! implementation wraps a `bitcoind_async_client::Client` (or an Esplora/
//! Electrum client in production) against a live node. This trait is the
//! typed seam the Relay Synchronizer and BTC Payout Engine hold instead of a
//! concrete RPC client, mirroring how the `bitcoind-async-client` crate
//! itself splits `Reader`/`Broadcaster`/`Wallet` into separate traits.

use async_trait::async_trait;
use bitcoin::{ScriptBuf, Transaction, Txid};
use thiserror::Error;

use crate::spv::header::BitcoinHeader;

#[derive(Debug, Error)]
pub enum BitcoinRpcError {
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("unknown block at height {0}")]
    UnknownHeight(u32),
    #[error("unknown transaction {0}")]
    UnknownTx(Txid),
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
    #[error("rpc error: {0}")]
    Other(String),
}

/// Read access to the node's best-known chain (spec §4.3 step 1: "fetch the
/// node's current tip height and header chain since the relay's tip").
#[async_trait]
pub trait BitcoinChainReader: Send + Sync {
    async fn tip_height(&self) -> Result<u32, BitcoinRpcError>;

    async fn header_at(&self, height: u32) -> Result<BitcoinHeader, BitcoinRpcError>;

    /// Headers for `[from_height, tip_height]`, inclusive, in ascending order.
    async fn headers_from(&self, from_height: u32) -> Result<Vec<BitcoinHeader>, BitcoinRpcError> {
        let tip = self.tip_height().await?;
        let mut out = Vec::new();
        for height in from_height..=tip {
            out.push(self.header_at(height).await?);
        }
        Ok(out)
    }

    async fn confirmations(&self, txid: Txid) -> Result<u32, BitcoinRpcError>;
}

/// Write access used by the BTC Payout Engine (spec §4.9) to fund, sign and
/// broadcast PSBTs, and by the synchronizer to estimate payout fee rates.
#[async_trait]
pub trait BitcoinWallet: Send + Sync {
    async fn list_unspent(&self, min_confirmations: u32) -> Result<Vec<Utxo>, BitcoinRpcError>;

    async fn estimate_fee_rate(&self, target_blocks: u32) -> Result<u64, BitcoinRpcError>;

    async fn sign_psbt(&self, psbt: &bitcoin::psbt::Psbt) -> Result<bitcoin::psbt::Psbt, BitcoinRpcError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, BitcoinRpcError>;

    /// A fresh (or stable, implementation's choice) change `scriptPubkey`
    /// managed by the Lightning node's on-chain wallet (spec §4.5: "optional
    /// change output to LND-managed address").
    async fn change_script_pubkey(&self) -> Result<ScriptBuf, BitcoinRpcError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value_sats: u64,
    pub confirmations: u32,
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! In-memory Bitcoin RPC/wallet stand-ins used by the payout-engine
    //! unit tests and the scenario suite (spec §1 Non-goals: no concrete
    //! node binding ships here).

    use super::*;
    use bitcoin::Witness;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MockBitcoinChainReader {
        headers: Mutex<HashMap<u32, BitcoinHeader>>,
        confirmations: Mutex<HashMap<Txid, u32>>,
    }

    impl MockBitcoinChainReader {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_header(&self, height: u32, header: BitcoinHeader) {
            self.headers.lock().await.insert(height, header);
        }

        pub async fn set_confirmations(&self, txid: Txid, confs: u32) {
            self.confirmations.lock().await.insert(txid, confs);
        }
    }

    #[async_trait]
    impl BitcoinChainReader for MockBitcoinChainReader {
        async fn tip_height(&self) -> Result<u32, BitcoinRpcError> {
            self.headers
                .lock()
                .await
                .keys()
                .max()
                .copied()
                .ok_or(BitcoinRpcError::Other("no headers".into()))
        }

        async fn header_at(&self, height: u32) -> Result<BitcoinHeader, BitcoinRpcError> {
            self.headers
                .lock()
                .await
                .get(&height)
                .copied()
                .ok_or(BitcoinRpcError::UnknownHeight(height))
        }

        async fn confirmations(&self, txid: Txid) -> Result<u32, BitcoinRpcError> {
            Ok(self.confirmations.lock().await.get(&txid).copied().unwrap_or(0))
        }
    }

    /// Fake wallet that finalizes every PSBT input with an empty witness
    /// and hands back incrementing UTXOs, so the payout engine's
    /// build-sign-broadcast pipeline can run end to end in tests without a
    /// real signer.
    pub struct MockBitcoinWallet {
        utxos: Mutex<Vec<Utxo>>,
        fee_rate: AtomicU32,
        pub broadcasted: Mutex<Vec<Transaction>>,
    }

    impl MockBitcoinWallet {
        pub fn new(utxos: Vec<Utxo>, fee_rate: u32) -> Self {
            Self {
                utxos: Mutex::new(utxos),
                fee_rate: AtomicU32::new(fee_rate),
                broadcasted: Mutex::new(Vec::new()),
            }
        }

        pub fn set_fee_rate(&self, fee_rate: u32) {
            self.fee_rate.store(fee_rate, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BitcoinWallet for MockBitcoinWallet {
        async fn list_unspent(&self, min_confirmations: u32) -> Result<Vec<Utxo>, BitcoinRpcError> {
            Ok(self
                .utxos
                .lock()
                .await
                .iter()
                .filter(|u| u.confirmations >= min_confirmations)
                .copied()
                .collect())
        }

        async fn estimate_fee_rate(&self, _target_blocks: u32) -> Result<u64, BitcoinRpcError> {
            Ok(self.fee_rate.load(Ordering::SeqCst) as u64)
        }

        async fn sign_psbt(
            &self,
            psbt: &bitcoin::psbt::Psbt,
        ) -> Result<bitcoin::psbt::Psbt, BitcoinRpcError> {
            let mut signed = psbt.clone();
            for input in signed.inputs.iter_mut() {
                input.final_script_witness = Some(Witness::from_slice(&[[0u8; 64].as_slice()]));
            }
            Ok(signed)
        }

        async fn broadcast(&self, tx: &Transaction) -> Result<Txid, BitcoinRpcError> {
            let txid = tx.compute_txid();
            self.broadcasted.lock().await.push(tx.clone());
            Ok(txid)
        }

        async fn change_script_pubkey(&self) -> Result<ScriptBuf, BitcoinRpcError> {
            Ok(ScriptBuf::new())
        }
    }
}
