//! Route table. Paths are contractually stable; see the handler modules for
//! semantics.

use axum::routing::{delete, get, patch, post, put};
use axum::Router;

use crate::handlers::{admin, checkout, meta, teams, usage, webhook};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Admin: tenants & catalog
        .route("/v1/admin/apps", post(admin::create_app))
        .route("/v1/admin/apps/:appId/secrets", post(admin::mint_secret))
        .route(
            "/v1/admin/apps/:appId/secrets/:kid",
            delete(admin::revoke_secret),
        )
        .route("/v1/admin/apps/:appId/plans", post(admin::create_plan))
        .route("/v1/admin/apps/:appId/addons", post(admin::create_addon))
        .route(
            "/v1/admin/apps/:appId/product-maps",
            post(admin::create_product_map),
        )
        .route(
            "/v1/admin/apps/:appId/price-books",
            post(admin::create_price_book),
        )
        .route(
            "/v1/admin/price-books/:bookId/rules",
            post(admin::create_price_rule),
        )
        .route("/v1/admin/period-close/run", post(admin::run_period_close))
        // Admin: bundles, contracts, invoices
        .route("/v1/bundles", post(admin::create_bundle))
        .route("/v1/bundles/:id", patch(admin::patch_bundle))
        .route("/v1/bundles/:id/apps/:appId", put(admin::put_bundle_app))
        .route(
            "/v1/bundles/:id/apps/:appId/meters/:meterKey",
            put(admin::put_bundle_meter_policy),
        )
        .route("/v1/contracts", post(admin::create_contract))
        .route("/v1/contracts/:id", patch(admin::patch_contract))
        .route("/v1/contracts/:id/overrides", put(admin::put_overrides))
        .route("/v1/invoices/:id/mark-paid", post(admin::mark_invoice_paid))
        .route("/v1/invoices/:id/export", post(admin::export_invoice))
        // SDK: teams & membership
        .route("/v1/apps/:appId/teams", post(teams::create_team))
        .route("/v1/apps/:appId/teams/:teamId", get(teams::get_team))
        .route(
            "/v1/apps/:appId/teams/:teamId/users/:userId",
            delete(teams::remove_member),
        )
        .route(
            "/v1/apps/:appId/teams/:teamId/entitlements",
            get(teams::entitlements),
        )
        .route(
            "/v1/apps/:appId/teams/:teamId/wallet",
            get(teams::wallet_balance),
        )
        .route(
            "/v1/apps/:appId/teams/:teamId/wallet/config",
            put(teams::put_wallet_config),
        )
        // SDK: usage
        .route("/v1/apps/:appId/usage/events", post(usage::ingest))
        .route("/v1/teams/:teamId/usage", get(usage::team_usage))
        .route("/v1/teams/:teamId/cogs", get(usage::team_cogs))
        // SDK: checkout
        .route(
            "/v1/apps/:appId/teams/:teamId/checkout/subscription",
            post(checkout::subscription_checkout),
        )
        .route(
            "/v1/apps/:appId/teams/:teamId/checkout/topup",
            post(checkout::topup_checkout),
        )
        .route("/v1/apps/:appId/teams/:teamId/portal", post(checkout::portal))
        // Meta
        .route("/v1/schemas/usage-events", get(meta::list_schemas))
        .route("/v1/schemas/usage-events/:type", get(meta::get_schema))
        .route("/v1/meta/capabilities", get(meta::capabilities))
        // Unauthenticated
        .route("/v1/stripe/webhook", post(webhook::stripe_webhook))
        .route("/healthz", get(meta::healthz))
        .layer(axum::middleware::from_fn(crate::middleware::request_id))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
