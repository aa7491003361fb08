//! The usage → money pipeline: rule evaluation (pricing engine), the polling
//! pricing worker, and the wallet-debit service.
//!
//! Failure classification is the backbone here: [`PricingError`] splits into
//! *permanent* errors (no price book, no matching rule, undecodable rule),
//! which flag the event and stop, and *transient* errors (store), which are
//! retried with exponential backoff by the worker.

pub mod engine;
pub mod metrics;
pub mod rules;
pub mod wallet;
pub mod worker;

pub use engine::{PricingEngine, PricingError};
pub use metrics::WorkerMetrics;
pub use rules::{MatchSpec, RuleSpec};
pub use wallet::{AutoTopUp, DebitOutcome, NoopAutoTopUp, WalletDebitService};
pub use worker::{PricingWorker, TickOutcome};

#[cfg(test)]
mod test;
