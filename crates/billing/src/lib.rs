//! Money-side services: the payment-gateway surface (sessions, webhooks,
//! subscriptions) and the contract period close that turns usage into
//! invoices and ledger entries.

pub mod checkout;
pub mod gateway;
pub mod invoices;
pub mod period_close;
pub mod subscriptions;
pub mod webhooks;

pub use checkout::{CheckoutDriver, CheckoutUrls};
pub use gateway::{
    DisabledGateway, GatewayError, PaymentGateway, StripeHttpGateway, WebhookVerifier,
};
pub use invoices::InvoiceAdminService;
pub use period_close::{PeriodCloseService, RunOutcome};
pub use subscriptions::SubscriptionHandler;
pub use webhooks::{DispatchOutcome, WebhookDispatcher};

#[cfg(any(test, feature = "testutils"))]
pub use gateway::MockGateway;

#[cfg(test)]
mod test;
