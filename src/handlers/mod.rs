//! The four swap direction handlers (spec §2 component G, §4.5-§4.8): each
//! owns its own state enum, quote path, post-commit processing and
//! watchdog re-entry. `common` holds the small pieces shared by all four.

pub mod common;
pub mod from_btc;
pub mod from_btc_ln;
pub mod to_btc;
pub mod to_btc_ln;

pub use from_btc::{FromBtcError, FromBtcHandler, FromBtcQuote, FromBtcQuoteRequest, FromBtcState};
pub use from_btc_ln::{
    CreateInvoiceRequest, CreateInvoiceResponse, FromBtcLnError, FromBtcLnHandler, FromBtcLnState,
};
pub use to_btc::{ToBtcError, ToBtcHandler, ToBtcQuote, ToBtcQuoteRequest, ToBtcState};
pub use to_btc_ln::{
    ToBtcLnError, ToBtcLnHandler, ToBtcLnQuote, ToBtcLnQuoteRequest, ToBtcLnState,
};
