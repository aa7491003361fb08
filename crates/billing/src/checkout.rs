//! Checkout, top-up and portal session driver, plus the auto-top-up check.
//!
//! The only interesting race lives in `get_or_create_customer`: two requests
//! can both miss the stored id and both create a gateway customer; the
//! optimistic single-row update picks one winner and the loser re-reads.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use meterline_ledger::LedgerService;
use meterline_pricing::AutoTopUp;
use meterline_shared::catalog::ProductMapKind;
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, TeamId};
use meterline_shared::tenant::Team;
use meterline_store::{CatalogStore, Store, TeamStore};

use crate::gateway::{
    CheckoutSessionRequest, CreateCustomer, GatewaySession, PaymentGateway, PaymentIntentRequest,
    SessionLineItem, SessionMode,
};

/// Sentinel some SDK builds wrote while a customer create was in flight; a
/// team carrying it is treated as having no customer.
const PENDING_SENTINEL: &str = "pending:";

#[derive(Clone, Debug)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
    pub portal_return_url: String,
}

#[derive(Clone)]
pub struct CheckoutDriver {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: LedgerService,
    urls: CheckoutUrls,
}

impl CheckoutDriver {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: LedgerService,
        urls: CheckoutUrls,
    ) -> Self {
        Self {
            store,
            gateway,
            ledger,
            urls,
        }
    }

    async fn team(&self, app_id: AppId, team_id: TeamId) -> Result<Team, ServiceError> {
        let team = self
            .store
            .get_team(team_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("team not found"))?;
        if team.app_id != app_id {
            return Err(ServiceError::not_found("team not found"));
        }
        Ok(team)
    }

    /// Returns the stored gateway customer id, creating one on first use.
    /// Losing the create race is fine: the loser re-reads the winner's id.
    pub async fn get_or_create_customer(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> Result<String, ServiceError> {
        let team = self.team(app_id, team_id).await?;
        if let Some(existing) = usable_customer_id(&team) {
            return Ok(existing.to_owned());
        }

        let created = self
            .gateway
            .create_customer(CreateCustomer {
                name: team.name.clone(),
                metadata: BTreeMap::from([
                    ("teamId".to_owned(), team_id.to_string()),
                    ("appId".to_owned(), app_id.to_string()),
                ]),
            })
            .await?;

        let won = self
            .store
            .set_stripe_customer_id_if_absent(team_id, &created.id)
            .await?;
        if won {
            return Ok(created.id);
        }
        // Lost the race; the winner's id is authoritative.
        let team = self.team(app_id, team_id).await?;
        usable_customer_id(&team)
            .map(str::to_owned)
            .ok_or_else(|| ServiceError::internal("customer id vanished after race"))
    }

    pub async fn create_subscription_checkout(
        &self,
        app_id: AppId,
        team_id: TeamId,
        plan_code: &str,
        seats: i64,
    ) -> Result<GatewaySession, ServiceError> {
        let plan = self
            .store
            .get_plan_by_code(app_id, plan_code)
            .await?
            .ok_or_else(|| ServiceError::not_found("plan not found"))?;

        let maps = self.store.product_maps_for_plan(plan.id).await?;
        let base = maps
            .iter()
            .find(|m| m.kind == ProductMapKind::Base)
            .ok_or_else(|| ServiceError::validation("plan has no BASE price mapping"))?;

        let mut line_items = vec![SessionLineItem::Price {
            price_id: base.stripe_price_id.clone(),
            quantity: 1,
        }];
        if seats > 0 {
            let seat = maps
                .iter()
                .find(|m| m.kind == ProductMapKind::Seat)
                .ok_or_else(|| ServiceError::validation("plan has no SEAT price mapping"))?;
            line_items.push(SessionLineItem::Price {
                price_id: seat.stripe_price_id.clone(),
                quantity: seats,
            });
        }

        let customer_id = self.get_or_create_customer(app_id, team_id).await?;
        let session = self
            .gateway
            .create_checkout_session(CheckoutSessionRequest {
                mode: SessionMode::Subscription,
                customer_id,
                success_url: self.urls.success_url.clone(),
                cancel_url: self.urls.cancel_url.clone(),
                line_items,
                metadata: BTreeMap::from([
                    ("teamId".to_owned(), team_id.to_string()),
                    ("appId".to_owned(), app_id.to_string()),
                    ("planId".to_owned(), plan.id.to_string()),
                ]),
                payment_intent_metadata: None,
            })
            .await?;
        Ok(session)
    }

    pub async fn create_topup_checkout(
        &self,
        app_id: AppId,
        team_id: TeamId,
        amount_minor: i64,
    ) -> Result<GatewaySession, ServiceError> {
        if amount_minor <= 0 {
            return Err(ServiceError::validation("amountMinor must be positive"));
        }
        let team = self.team(app_id, team_id).await?;
        let customer_id = self.get_or_create_customer(app_id, team_id).await?;

        let metadata = topup_metadata(app_id, team_id, amount_minor);
        let session = self
            .gateway
            .create_checkout_session(CheckoutSessionRequest {
                mode: SessionMode::Payment,
                customer_id,
                success_url: self.urls.success_url.clone(),
                cancel_url: self.urls.cancel_url.clone(),
                line_items: vec![SessionLineItem::Dynamic {
                    currency: team.default_currency.clone(),
                    unit_amount_minor: amount_minor,
                    product_name: "Wallet Top-Up".into(),
                    quantity: 1,
                }],
                metadata: metadata.clone(),
                // The payment_intent.succeeded webhook identifies the top-up
                // by this copy.
                payment_intent_metadata: Some(metadata),
            })
            .await?;
        Ok(session)
    }

    pub async fn create_portal_session(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> Result<GatewaySession, ServiceError> {
        let team = self.team(app_id, team_id).await?;
        let Some(customer_id) = usable_customer_id(&team) else {
            return Err(ServiceError::validation(
                "team has no billing profile yet",
            ));
        };
        Ok(self
            .gateway
            .create_portal_session(customer_id, &self.urls.portal_return_url)
            .await?)
    }

    /// Fire an off-session top-up when the wallet has fallen strictly below
    /// the configured threshold. Equality does not trigger.
    pub async fn check_and_trigger_auto_topup(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> Result<Option<String>, ServiceError> {
        let Some(config) = self.store.get_wallet_config(app_id, team_id).await? else {
            return Ok(None);
        };
        if !config.auto_top_up_enabled || config.top_up_amount_minor <= 0 {
            return Ok(None);
        }

        let team = self.team(app_id, team_id).await?;
        let Some(customer_id) = usable_customer_id(&team) else {
            return Ok(None);
        };

        let entity = self
            .store
            .billing_entity_for_team(team_id)
            .await?
            .ok_or_else(|| ServiceError::internal("team has no billing entity"))?;
        let balance = self.ledger.wallet_balance(app_id, entity.id).await.map_err(
            |e| ServiceError::internal(e.to_string()),
        )?;
        if balance >= config.threshold_minor {
            return Ok(None);
        }

        let mut metadata = topup_metadata(app_id, team_id, config.top_up_amount_minor);
        metadata.insert("trigger".to_owned(), "auto_topup".to_owned());
        // The gateway rejects the intent when no default payment method is on
        // file; that failure is the caller's to log and swallow.
        let intent = self
            .gateway
            .create_payment_intent(PaymentIntentRequest {
                customer_id: customer_id.to_owned(),
                amount_minor: config.top_up_amount_minor,
                currency: team.default_currency.clone(),
                off_session: true,
                confirm: true,
                metadata,
            })
            .await?;
        tracing::info!(team = %team_id, intent = %intent.id, "auto top-up triggered");
        Ok(Some(intent.id))
    }
}

#[async_trait]
impl AutoTopUp for CheckoutDriver {
    async fn check_and_trigger(&self, app_id: AppId, team_id: TeamId) -> anyhow::Result<()> {
        self.check_and_trigger_auto_topup(app_id, team_id)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!(e))
    }
}

fn usable_customer_id(team: &Team) -> Option<&str> {
    team.stripe_customer_id
        .as_deref()
        .filter(|id| !id.starts_with(PENDING_SENTINEL) && !id.is_empty())
}

fn topup_metadata(
    app_id: AppId,
    team_id: TeamId,
    amount_minor: i64,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("teamId".to_owned(), team_id.to_string()),
        ("appId".to_owned(), app_id.to_string()),
        ("type".to_owned(), "wallet_topup".to_owned()),
        ("amountMinor".to_owned(), amount_minor.to_string()),
    ])
}
