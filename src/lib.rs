//! Quillgate: coordination and metering core.
//!
//! - [`coordination`]: RESP client, distributed locks, fixed-window counters
//! - [`security`]: encrypted secret envelopes
//! - [`billing`]: tiers, credit ledger, monetization settings, runtime resolution
//! - [`store`]: persisted-row contract and its SQLite implementation
//! - [`service`]: the facade request handlers use

pub mod billing;
pub mod config;
pub mod coordination;
pub mod error;
pub mod security;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::MeteringError;
pub use service::MeteringService;
