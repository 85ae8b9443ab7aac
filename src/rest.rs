//! REST surface (spec §6): typed request/response payloads and the error
//! code families a framing layer maps to HTTP responses.
//!
//! Out of scope to implement the actual HTTP framing or schema validation
//! (spec §1 Non-goals) -- this module only specifies the wire shapes,
//! mirroring the teacher's `api/types.rs` convention of plain serde structs
//! shared between the backend and its clients.

use serde::{Deserialize, Serialize};

use crate::chain::adapter::AdapterError;
use crate::collaborators::CollaboratorError;
use crate::handlers::{FromBtcError, FromBtcLnError, ToBtcError, ToBtcLnError};
use crate::lightning::hold_invoice::HoldInvoiceError;
use crate::payout::coinselect::CoinSelectError;
use crate::payout::engine::PayoutError;
use crate::pricing::PricingError;
use crate::store::StoreError;
use crate::types::{Authorization, ContractData, PaymentHash, Sequence};

/// `POST /<path>/createInvoice` request (spec §6, §4.7 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    pub address: String,
    pub payment_hash: PaymentHash,
    pub amount: String,
    pub token: String,
    pub description_hash: Option<String>,
    pub exact_out: Option<bool>,
    pub fee_rate: Option<u64>,
}

/// `POST /<path>/createInvoice` response: the issued invoice plus its quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceResponse {
    pub bolt11: String,
    pub payment_hash: PaymentHash,
    pub amount_out_token: u64,
    pub swap_fee_sats: u64,
    pub security_deposit_sats: u64,
    pub expiry_unix: u64,
}

/// `GET|POST /<path>/getInvoiceStatus` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInvoiceStatusRequest {
    pub payment_hash: PaymentHash,
}

/// `10xxx` invoice-lookup states (spec §6 error code families).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// `10001`: invoice issued, no HTLC has arrived yet.
    AwaitingPayment,
    /// `10002`: a payer's HTLC is sitting `held`, not yet committed on-chain.
    HtlcHeld,
    /// `10003`: the smart-chain commitment landed, awaiting claim.
    Committed,
    /// `10004`: claimed and the HODL invoice has been settled.
    Settled,
    /// `10005`: canceled, refunded, or otherwise never going to settle.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInvoiceStatusResponse {
    pub status: InvoiceStatus,
}

/// `GET|POST /<path>/getInvoicePaymentAuth` request: once `Committed`,
/// hands back the adapter-signed authorization so the counterparty can
/// claim (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInvoicePaymentAuthRequest {
    pub payment_hash: PaymentHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInvoicePaymentAuthResponse {
    pub contract_data: ContractData,
    pub authorization: Authorization,
}

/// `POST /<path>/payInvoice` request, shared by `ToBtc` and `ToBtcLn` (spec
/// §4.5, §4.6): `destination` carries either a BTC output script (ToBtc) or
/// a bolt11 invoice (ToBtcLn); the handler the path resolves to decides
/// which it expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayInvoiceRequest {
    pub chain_id: String,
    pub token: String,
    pub offerer: String,
    pub destination: String,
    pub amount: String,
    pub exact_out: Option<bool>,
    pub nonce: Option<u64>,
    pub confirmation_target: Option<u32>,
    pub confirmations: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayInvoiceResponse {
    pub amount: u64,
    pub sats_per_vbyte: Option<u64>,
    pub network_fee: u64,
    pub swap_fee: u64,
    pub total: u64,
    pub min_required_expiry: u64,
    pub contract_data: ContractData,
    pub prefix: String,
    pub timeout: u64,
    pub signature: Vec<u8>,
}

/// `GET|POST /<path>/getRefundAuthorization` request (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRefundAuthorizationRequest {
    pub payment_hash: PaymentHash,
    pub sequence: Sequence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRefundAuthorizationResponse {
    pub prefix: String,
    pub timeout: u64,
    pub signature: Vec<u8>,
}

/// Structured REST error payload (spec §6): `{httpStatus, code, msg, data?}`.
/// `code` falls into one of the three families spec §6/§7 names:
/// `20xxx` swap/business errors, `10xxx` invoice lookup states, `90xxx`
/// payout-engine errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestError {
    pub http_status: u16,
    pub code: u32,
    pub msg: String,
    pub data: Option<serde_json::Value>,
}

impl RestError {
    fn new(http_status: u16, code: u32, msg: impl Into<String>) -> Self {
        Self {
            http_status,
            code,
            msg: msg.into(),
            data: None,
        }
    }

    fn with_bounds(mut self, min: u64, max: u64) -> Self {
        self.data = Some(serde_json::json!({ "min": min, "max": max }));
        self
    }
}

/// Quote-time validation and business-rule failures map to `400`/`409` with
/// a `20xxx` code; never persisted (spec §7).
impl From<&ToBtcError> for RestError {
    fn from(err: &ToBtcError) -> Self {
        match err {
            ToBtcError::NonceNotMonotonic { .. } => RestError::new(400, 20101, err.to_string()),
            ToBtcError::BadOutputScriptLength(_) => RestError::new(400, 20102, err.to_string()),
            ToBtcError::BadConfirmations => RestError::new(400, 20103, err.to_string()),
            ToBtcError::VaultNotInitialized(_) => RestError::new(409, 20201, err.to_string()),
            ToBtcError::Pricing(e) => RestError::from(e),
            ToBtcError::CoinSelect(e) => RestError::from(e),
            ToBtcError::Adapter(e) => RestError::from(e),
            ToBtcError::Payout(e) => RestError::from(e),
            ToBtcError::Store(e) => RestError::from(e),
            ToBtcError::Nonce(_) => RestError::new(400, 20101, err.to_string()),
            ToBtcError::Rpc(_) => RestError::new(503, 90001, err.to_string()),
            ToBtcError::Collaborator(e) => RestError::from(e),
            ToBtcError::NotFound(_, _) => RestError::new(404, 20001, err.to_string()),
            ToBtcError::LockBusy => RestError::new(409, 20010, err.to_string()),
        }
    }
}

impl From<&ToBtcLnError> for RestError {
    fn from(err: &ToBtcLnError) -> Self {
        match err {
            ToBtcLnError::BadInvoice => RestError::new(400, 20102, err.to_string()),
            ToBtcLnError::VaultNotInitialized(_) => RestError::new(409, 20201, err.to_string()),
            ToBtcLnError::Pricing(e) => RestError::from(e),
            ToBtcLnError::Adapter(e) => RestError::from(e),
            ToBtcLnError::Store(e) => RestError::from(e),
            ToBtcLnError::Collaborator(e) => RestError::from(e),
            ToBtcLnError::Lightning(_) => RestError::new(502, 20302, err.to_string()),
            ToBtcLnError::NotFound(_, _) => RestError::new(404, 20001, err.to_string()),
            ToBtcLnError::LockBusy => RestError::new(409, 20010, err.to_string()),
        }
    }
}

impl From<&FromBtcError> for RestError {
    fn from(err: &FromBtcError) -> Self {
        match err {
            FromBtcError::VaultNotInitialized(_) => RestError::new(409, 20201, err.to_string()),
            FromBtcError::BadOutputScriptLength(_) => RestError::new(400, 20102, err.to_string()),
            FromBtcError::Pricing(e) => RestError::from(e),
            FromBtcError::Adapter(e) => RestError::from(e),
            FromBtcError::Rpc(_) => RestError::new(503, 90001, err.to_string()),
            FromBtcError::Store(e) => RestError::from(e),
            FromBtcError::Collaborator(e) => RestError::from(e),
            FromBtcError::NotFound(_, _) => RestError::new(404, 20001, err.to_string()),
            FromBtcError::LockBusy => RestError::new(409, 20010, err.to_string()),
        }
    }
}

impl From<&FromBtcLnError> for RestError {
    fn from(err: &FromBtcLnError) -> Self {
        match err {
            FromBtcLnError::InsufficientInboundLiquidity { needed, available } => {
                RestError::new(409, 20301, err.to_string()).with_bounds(0, *available.min(needed))
            }
            FromBtcLnError::VaultNotInitialized(_) => RestError::new(409, 20201, err.to_string()),
            FromBtcLnError::Pricing(e) => RestError::from(e),
            FromBtcLnError::Adapter(e) => RestError::from(e),
            FromBtcLnError::HoldInvoice(e) => RestError::from(e),
            FromBtcLnError::Store(e) => RestError::from(e),
            FromBtcLnError::Collaborator(e) => RestError::from(e),
            FromBtcLnError::NotFound(_, _) => RestError::new(404, 20001, err.to_string()),
            FromBtcLnError::LockBusy => RestError::new(409, 20010, err.to_string()),
        }
    }
}

impl From<&PricingError> for RestError {
    fn from(err: &PricingError) -> Self {
        match err {
            PricingError::OutOfBounds { min, max, .. } => {
                let min = crate::pricing::decimal_to_u64(*min);
                let max = crate::pricing::decimal_to_u64(*max);
                RestError::new(400, 20104, err.to_string()).with_bounds(min, max)
            }
            PricingError::NonPositiveAmount | PricingError::DegenerateFeeRate => {
                RestError::new(400, 20104, err.to_string())
            }
        }
    }
}

impl From<&CoinSelectError> for RestError {
    fn from(err: &CoinSelectError) -> Self {
        RestError::new(409, 90101, err.to_string())
    }
}

impl From<&PayoutError> for RestError {
    fn from(err: &PayoutError) -> Self {
        let code = match err {
            PayoutError::CoinSelect(_) => 90101,
            PayoutError::Nonce(_) => 90102,
            PayoutError::Rpc(_) => 90001,
            PayoutError::FeeRateExceeded { .. } => 90103,
            PayoutError::FeeAmountExceeded { .. } => 90104,
            PayoutError::Unsigned(_) => 90105,
        };
        RestError::new(502, code, err.to_string())
    }
}

impl From<&AdapterError> for RestError {
    fn from(err: &AdapterError) -> Self {
        let code = match err {
            AdapterError::CommitmentNotFound(_, _) => 20001,
            AdapterError::Reverted(_) => 20202,
            AdapterError::NonPayable => 20203,
            AdapterError::InvalidSignature => 20204,
            AdapterError::InsufficientBalance => 20205,
            AdapterError::Rpc(_) => 90001,
        };
        RestError::new(502, code, err.to_string())
    }
}

impl From<&HoldInvoiceError> for RestError {
    fn from(err: &HoldInvoiceError) -> Self {
        let code = match err {
            HoldInvoiceError::ExpiresTooSoon { .. } => 20002,
            HoldInvoiceError::NotYetHeld => 10001,
            HoldInvoiceError::Node(_) => 90002,
        };
        RestError::new(502, code, err.to_string())
    }
}

impl From<&StoreError> for RestError {
    fn from(err: &StoreError) -> Self {
        RestError::new(500, 90201, err.to_string())
    }
}

impl From<&CollaboratorError> for RestError {
    fn from(err: &CollaboratorError) -> Self {
        RestError::new(503, 90301, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_not_initialized_maps_to_20201_across_directions() {
        let to_btc = RestError::from(&ToBtcError::VaultNotInitialized("USDC".into()));
        let from_btc = RestError::from(&FromBtcError::VaultNotInitialized("USDC".into()));
        assert_eq!(to_btc.code, 20201);
        assert_eq!(from_btc.code, 20201);
    }

    #[test]
    fn late_htlc_arrival_maps_to_spec_20002() {
        let err = FromBtcLnError::HoldInvoice(HoldInvoiceError::ExpiresTooSoon {
            remaining: 5,
            required: 72,
        });
        assert_eq!(RestError::from(&err).code, 20002);
    }

    #[test]
    fn fee_rate_exceeded_is_a_90xxx_payout_error() {
        let err = PayoutError::FeeRateExceeded { actual: 12, max: 10 };
        let rest_err = RestError::from(&err);
        assert_eq!(rest_err.code, 90103);
        assert!(rest_err.code >= 90_000 && rest_err.code < 91_000);
    }

    #[test]
    fn insufficient_liquidity_carries_bounds_data() {
        let err = FromBtcLnError::InsufficientInboundLiquidity {
            needed: 100_000,
            available: 40_000,
        };
        let rest_err = RestError::from(&err);
        assert_eq!(rest_err.code, 20301);
        assert!(rest_err.data.is_some());
    }
}
