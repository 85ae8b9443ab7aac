//! Lightning collaborator surface: the out-of-scope node RPC trait
//! ([`node`]) and the HOLD-invoice business logic layered on top of it
//! ([`hold_invoice`]), spec §2 component I, §4.6, §4.7.

pub mod hold_invoice;
pub mod node;

pub use hold_invoice::{HoldInvoiceError, HoldInvoiceHandler};
pub use node::{HeldHtlc, HoldInvoice, LightningError, LightningNode, PaymentResult};
