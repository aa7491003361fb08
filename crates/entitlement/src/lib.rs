//! Entitlement resolution and the contract/bundle administration surface.
//!
//! Resolution is a pure function of stored state; the per-process cache in
//! [`EntitlementService`] is invalidated by the explicit "refresh entitlements
//! for team T" command that every contract or subscription mutation emits.

pub mod admin;
pub mod resolver;

pub use admin::{ContractAdminService, NewBundle, NewContract, OverrideEntry};
pub use resolver::{EntitlementResult, EntitlementService};
