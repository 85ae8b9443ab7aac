//! Crate-wide error types.
//!
//! Each module that can fail in a way callers need to match on defines its
//! own error enum; all of them convert into [`EngineError`] via `#[from]` so
//! handlers can propagate with `?` while still letting a caller downcast to
//! the precise failure if it matters (e.g. distinguishing `NonPayable` from
//! a transient RPC error, per spec §7).

use thiserror::Error;

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error type for the swap-intermediary engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Header(#[from] crate::spv::header::HeaderError),

    #[error(transparent)]
    Relay(#[from] crate::spv::relay::RelayError),

    #[error(transparent)]
    Sync(#[from] crate::spv::sync::SyncError),

    #[error(transparent)]
    Adapter(#[from] crate::chain::adapter::AdapterError),

    #[error(transparent)]
    Payout(#[from] crate::payout::engine::PayoutError),

    #[error(transparent)]
    Pricing(#[from] crate::pricing::PricingError),

    #[error(transparent)]
    HoldInvoice(#[from] crate::lightning::hold_invoice::HoldInvoiceError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// A quote-time validation failure. Never persisted (spec §7).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Amount/liquidity outside the quotable bounds, re-expressed in input-token units.
    #[error("amount out of bounds: min={min}, max={max}")]
    OutOfBounds { min: u64, max: u64 },

    /// The swap's pre-commit authorization window elapsed.
    #[error("authorization expired")]
    AuthorizationExpired,

    /// A per-swap critical section was already held; caller must skip, not wait.
    #[error("swap lock busy")]
    LockBusy,

    /// The global BTC payout queue is at capacity; caller should back off.
    #[error("payout queue saturated")]
    QueueSaturated,

    /// Serialization/deserialization of a persisted record failed.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Catch-all for opaque collaborator errors (pricing oracle, plugin hooks,
    /// Lightning node RPC, chain RPC) that only need to be logged, never matched on.
    #[error("{0}")]
    Collaborator(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Collaborator(format!("{err:#}"))
    }
}
