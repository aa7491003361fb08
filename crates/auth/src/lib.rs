//! Authentication core: encrypted secret storage, the compact signed-token
//! engine, and the admin-key check.
//!
//! The token engine is pure with respect to time and replay state; both the
//! clock and the store are injected, so every verification path is
//! deterministic under test.

pub mod admin;
pub mod messages;
pub mod token;
pub mod vault;

pub use admin::AdminKey;
pub use token::{MintParams, TokenEngine, VerifiedClaims, VerifyError};
pub use vault::{SecretVault, VaultError};
