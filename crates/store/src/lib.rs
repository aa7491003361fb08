//! The store contract and its two implementations.
//!
//! Every component talks to the store through the repository traits defined
//! here. The traits expose *coarse transactional operations* rather than raw
//! row access: an operation like [`UsageStore::commit_pricing`] or
//! [`InvoiceStore::create_invoice_with_lines`] is one atomic unit in every
//! implementation. Correctness between concurrent workers rests on exactly
//! three mechanisms, all surfaced here:
//!
//! 1. unique indices (idempotency keys, `(app_id, idempotency_key)`,
//!    `gateway_subscription_id`, `jti`, …) reported as
//!    [`StoreError::UniqueViolation`];
//! 2. the at-most-one-ACTIVE-contract-per-bill-to predicate, re-checked inside
//!    the activating transaction;
//! 3. the optimistic `stripe_customer_id` single-row update, reported as a
//!    rows-affected boolean.
//!
//! [`MemoryStore`] backs every test and the no-`DATABASE_URL` mode;
//! [`PgStore`] is the production Postgres implementation.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::{
    AppStore, AuditStore, CatalogStore, ContractStore, IngestOutcome, InvoiceStore, JtiStore,
    LedgerStore, Store, SubscriptionStore, TeamStore, UsageStore,
};

#[cfg(test)]
mod test;
