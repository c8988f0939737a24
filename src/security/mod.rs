//! Secret handling: the encrypted envelope used for stored API keys.

pub mod vault;

pub use vault::{mask_plain, SecretVault};
