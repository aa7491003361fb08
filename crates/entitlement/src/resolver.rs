//! Layered entitlement resolution.
//!
//! Merge order, last write wins:
//! 1. empty
//! 2. ACTIVE contract's bundle: per-app default feature flags, then the
//!    bundle's meter policies for the app
//! 3. contract overrides for the same (app, meter)
//! 4. ACTIVE subscription's plan feature flags
//!
//! `billable[meter]` is true iff the effective policy's overage billing is
//! anything but NONE.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use meterline_shared::agreement::{MeterPolicy, OverageBilling};
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, TeamId};
use meterline_shared::tenant::BillingMode;
use meterline_store::{CatalogStore, ContractStore, Store, SubscriptionStore, TeamStore};

/// The effective entitlement view for one `(app, team)`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementResult {
    pub features: BTreeMap<String, bool>,
    pub meter_policies: BTreeMap<String, MeterPolicy>,
    pub billing_mode: BillingMode,
    pub billable: BTreeMap<String, bool>,
}

#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn Store>,
    cache: Arc<DashMap<(AppId, TeamId), Arc<EntitlementResult>>>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Resolve with the per-process cache. The cache holds whatever the last
    /// resolution produced and is dropped wholesale by [`Self::refresh`].
    pub async fn resolve(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> Result<Arc<EntitlementResult>, ServiceError> {
        if let Some(hit) = self.cache.get(&(app_id, team_id)) {
            return Ok(hit.value().clone());
        }
        let result = Arc::new(self.resolve_uncached(app_id, team_id).await?);
        self.cache.insert((app_id, team_id), result.clone());
        Ok(result)
    }

    /// The explicit command invoked on every contract or subscription change.
    pub fn refresh(&self, team_id: TeamId) {
        self.cache.retain(|(_, cached_team), _| *cached_team != team_id);
        tracing::debug!(team = %team_id, "entitlement cache invalidated");
    }

    pub async fn resolve_uncached(
        &self,
        app_id: AppId,
        team_id: TeamId,
    ) -> Result<EntitlementResult, ServiceError> {
        let team = self
            .store
            .get_team(team_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("team not found"))?;

        let mut features: BTreeMap<String, bool> = BTreeMap::new();
        let mut meter_policies: BTreeMap<String, MeterPolicy> = BTreeMap::new();

        // Layer 2: bundle defaults through the ACTIVE enterprise contract.
        let entity = self
            .store
            .billing_entity_for_team(team_id)
            .await?;
        if let Some(entity) = entity {
            if let Some(contract) = self
                .store
                .active_contract_for_bill_to(entity.id)
                .await?
            {
                for bundle_app in self
                    .store
                    .bundle_apps(contract.bundle_id)
                    .await?
                {
                    if bundle_app.app_id == app_id {
                        merge_flags(&mut features, &bundle_app.default_feature_flags);
                    }
                }
                for policy in self
                    .store
                    .bundle_meter_policies(contract.bundle_id)
                    .await?
                {
                    if policy.app_id == app_id {
                        meter_policies.insert(policy.meter_key.clone(), policy.policy.clone());
                    }
                }

                // Layer 3: contract overrides shadow the bundle entries.
                for entry in self
                    .store
                    .overrides_for_contract(contract.id)
                    .await?
                {
                    if entry.app_id == app_id {
                        meter_policies.insert(entry.meter_key.clone(), entry.policy.clone());
                    }
                }
            }
        }

        // Layer 4: live subscription plan flags win last.
        if let Some(subscription) = self
            .store
            .active_subscription_for_team(team_id)
            .await?
        {
            if let Some(plan_id) = subscription.plan_id {
                if let Some(plan) = self
                    .store
                    .get_plan(plan_id)
                    .await?
                {
                    merge_flags(&mut features, &plan.feature_flags);
                }
            }
        }

        let billable = meter_policies
            .iter()
            .map(|(meter, policy)| {
                (meter.clone(), policy.overage_billing != OverageBilling::None)
            })
            .collect();

        Ok(EntitlementResult {
            features,
            meter_policies,
            billing_mode: team.billing_mode,
            billable,
        })
    }
}

/// Overlay boolean flags from a JSON object; non-boolean values are ignored.
fn merge_flags(features: &mut BTreeMap<String, bool>, flags: &Value) {
    if let Some(map) = flags.as_object() {
        for (key, value) in map {
            if let Some(flag) = value.as_bool() {
                features.insert(key.clone(), flag);
            }
        }
    }
}
