//! doubao-signer: headless Chrome signing service.
//!
//! Owns one Chrome process driven over the DevTools protocol. A single
//! page stays parked on the chat site so its anti-abuse script can sign
//! outbound requests; all page access is serialized behind one lock.

pub mod cdp;
pub mod chrome;
pub mod cookies;
pub mod error;
pub mod signer;

pub use error::SignerError;
pub use signer::{BrowserSigner, Signer};
