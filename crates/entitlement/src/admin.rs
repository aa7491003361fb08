//! Contract and bundle administration.
//!
//! Uniqueness and status invariants live in the store's transactional
//! operations; this layer maps them onto client-facing conflicts and emits
//! the entitlement-refresh command after every mutation that can change a
//! team's effective view.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use meterline_shared::agreement::{
    BillingPeriod, Bundle, BundleApp, BundleMeterPolicy, BundleStatus, Contract, ContractOverride,
    ContractStatus, MeterPolicy, PricingMode,
};
use meterline_shared::error::ServiceError;
use meterline_shared::ids::{AppId, BillToId, BundleId, ContractId};
use meterline_shared::Clock;
use meterline_store::{ContractStore, Store, StoreError, TeamStore};

use crate::resolver::EntitlementService;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBundle {
    pub code: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContract {
    pub bill_to_id: BillToId,
    pub bundle_id: BundleId,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub terms_days: i64,
    pub pricing_mode: PricingMode,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activate: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideEntry {
    pub app_id: AppId,
    pub meter_key: String,
    #[serde(flatten)]
    pub policy: MeterPolicy,
}

#[derive(Clone)]
pub struct ContractAdminService {
    store: Arc<dyn Store>,
    entitlements: EntitlementService,
    clock: Arc<dyn Clock>,
}

impl ContractAdminService {
    pub fn new(
        store: Arc<dyn Store>,
        entitlements: EntitlementService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            entitlements,
            clock,
        }
    }

    // ── Bundles ───────────────────────────────────────────────────────────────

    pub async fn create_bundle(&self, input: NewBundle) -> Result<Bundle, ServiceError> {
        if input.code.trim().is_empty() {
            return Err(ServiceError::validation("bundle code must not be empty"));
        }
        let bundle = Bundle {
            id: BundleId::new(),
            code: input.code,
            name: input.name,
            status: BundleStatus::Active,
            created_at: self.clock.now(),
        };
        match self.store.insert_bundle(bundle.clone()).await {
            Ok(()) => Ok(bundle),
            Err(err) if err.is_unique_violation() => {
                Err(ServiceError::conflict("bundle.code"))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update_bundle(
        &self,
        id: BundleId,
        name: Option<String>,
        status: Option<BundleStatus>,
    ) -> Result<Bundle, ServiceError> {
        let mut bundle = self
            .store
            .get_bundle(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("bundle not found"))?;
        if let Some(name) = name {
            bundle.name = name;
        }
        if let Some(status) = status {
            bundle.status = status;
        }
        self.store.update_bundle(bundle.clone()).await?;
        Ok(bundle)
    }

    pub async fn set_bundle_app(
        &self,
        bundle_id: BundleId,
        app_id: AppId,
        default_feature_flags: Value,
    ) -> Result<(), ServiceError> {
        self.require_bundle(bundle_id).await?;
        self.store
            .upsert_bundle_app(BundleApp {
                bundle_id,
                app_id,
                default_feature_flags,
            })
            .await?;
        Ok(())
    }

    pub async fn set_bundle_meter_policy(
        &self,
        bundle_id: BundleId,
        app_id: AppId,
        meter_key: String,
        policy: MeterPolicy,
    ) -> Result<(), ServiceError> {
        self.require_bundle(bundle_id).await?;
        self.store
            .upsert_bundle_meter_policy(BundleMeterPolicy {
                bundle_id,
                app_id,
                meter_key,
                policy,
            })
            .await?;
        Ok(())
    }

    async fn require_bundle(&self, id: BundleId) -> Result<Bundle, ServiceError> {
        self.store
            .get_bundle(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("bundle not found"))
    }

    // ── Contracts ─────────────────────────────────────────────────────────────

    pub async fn create_contract(&self, input: NewContract) -> Result<Contract, ServiceError> {
        self.require_bundle(input.bundle_id).await?;
        let contract = Contract {
            id: ContractId::new(),
            bill_to_id: input.bill_to_id,
            bundle_id: input.bundle_id,
            currency: input.currency,
            billing_period: input.billing_period,
            terms_days: input.terms_days,
            pricing_mode: input.pricing_mode,
            starts_at: input.starts_at,
            ends_at: input.ends_at,
            status: if input.activate {
                ContractStatus::Active
            } else {
                ContractStatus::Draft
            },
            created_at: self.clock.now(),
        };
        match self.store.insert_contract(contract.clone()).await {
            Ok(()) => {
                self.refresh_for_bill_to(contract.bill_to_id).await;
                Ok(contract)
            }
            Err(StoreError::Conflict(reason)) => Err(ServiceError::conflict(reason)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn transition_contract(
        &self,
        id: ContractId,
        status: ContractStatus,
    ) -> Result<Contract, ServiceError> {
        let contract = match self.store.update_contract_status(id, status).await {
            Ok(contract) => contract,
            Err(StoreError::Conflict(reason)) => return Err(ServiceError::conflict(reason)),
            Err(StoreError::RowNotFound(_)) => {
                return Err(ServiceError::not_found("contract not found"))
            }
            Err(err) => return Err(err.into()),
        };
        self.refresh_for_bill_to(contract.bill_to_id).await;
        Ok(contract)
    }

    /// Delete-then-insert inside one transaction; an empty list clears all.
    pub async fn replace_overrides(
        &self,
        contract_id: ContractId,
        entries: Vec<OverrideEntry>,
    ) -> Result<usize, ServiceError> {
        let contract = self
            .store
            .get_contract(contract_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("contract not found"))?;

        let overrides: Vec<ContractOverride> = entries
            .into_iter()
            .map(|entry| ContractOverride {
                contract_id,
                app_id: entry.app_id,
                meter_key: entry.meter_key,
                policy: entry.policy,
            })
            .collect();
        let count = overrides.len();
        self.store.replace_overrides(contract_id, overrides).await?;
        self.refresh_for_bill_to(contract.bill_to_id).await;
        Ok(count)
    }

    pub async fn get_contract(&self, id: ContractId) -> Result<Contract, ServiceError> {
        self.store
            .get_contract(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("contract not found"))
    }

    async fn refresh_for_bill_to(&self, bill_to: BillToId) {
        match self.store.team_for_bill_to(bill_to).await {
            Ok(Some(team)) => self.entitlements.refresh(team.id),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(bill_to = %bill_to, error = %err, "refresh lookup failed")
            }
        }
    }
}
