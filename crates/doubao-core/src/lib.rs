//! doubao-core: shared configuration and error types for the relay.
//!
//! Everything here is plain data. The browser signer and the chat relay
//! both depend on this crate and nothing else in the workspace does any
//! environment reading outside of it.

pub mod config;
pub mod error;

pub use config::{Fingerprint, RelayConfig};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
