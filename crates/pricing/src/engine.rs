//! The pricing engine: one usage event in, zero or more line-item drafts out.
//!
//! COGS pricing is always required; CUSTOMER pricing is required only when
//! the app has any CUSTOMER book at all (a COGS-only product prices COGS and
//! nothing else). Book selection walks effective books most-recent-first and
//! takes the first book containing a matching rule; within a book the
//! highest-priority matching rule wins, ties broken by earliest creation.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use meterline_shared::catalog::{PriceBook, PriceBookKind, PriceRule};
use meterline_shared::usage::{LineItemDraft, UsageEvent};
use meterline_store::{CatalogStore, Store, StoreError};

use crate::rules::{MatchSpec, RuleSpec};

#[derive(Debug, Error)]
pub enum PricingError {
    /// Permanent: a required price book is missing for the event's time.
    #[error("NO_PRICEBOOK: no effective {0} price book")]
    NoPriceBook(&'static str),
    /// Permanent: no rule in any effective book matched the event.
    #[error("NO_MATCHING_RULE: no {0} rule matched")]
    NoMatchingRule(&'static str),
    /// Permanent: a rule or match body failed to decode or evaluate.
    #[error("INVALID_RULE: {0}")]
    InvalidRule(String),
    /// Transient: the store misbehaved; the worker retries with backoff.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PricingError {
    pub fn is_permanent(&self) -> bool {
        !matches!(self, PricingError::Store(_))
    }
}

#[derive(Clone)]
pub struct PricingEngine {
    store: Arc<dyn Store>,
}

impl PricingEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Deterministically price one event. Emits one COGS draft and, when the
    /// app runs a CUSTOMER book, one CUSTOMER draft.
    pub async fn price_event(
        &self,
        event: &UsageEvent,
    ) -> Result<Vec<LineItemDraft>, PricingError> {
        let mut drafts = Vec::with_capacity(2);

        let cogs_books = self
            .store
            .price_books_effective(event.app_id, PriceBookKind::Cogs, event.timestamp)
            .await?;
        if cogs_books.is_empty() {
            return Err(PricingError::NoPriceBook("COGS"));
        }
        drafts.push(self.price_against(&cogs_books, event, "COGS").await?);

        let customer_books = self
            .store
            .price_books_effective(event.app_id, PriceBookKind::Customer, event.timestamp)
            .await?;
        if customer_books.is_empty() {
            // Only acceptable when the app has no CUSTOMER book at all.
            if self
                .store
                .has_price_book(event.app_id, PriceBookKind::Customer)
                .await?
            {
                return Err(PricingError::NoPriceBook("CUSTOMER"));
            }
        } else {
            drafts.push(
                self.price_against(&customer_books, event, "CUSTOMER")
                    .await?,
            );
        }

        Ok(drafts)
    }

    async fn price_against(
        &self,
        books: &[PriceBook],
        event: &UsageEvent,
        side: &'static str,
    ) -> Result<LineItemDraft, PricingError> {
        for book in books {
            let rules = self.store.rules_for_book(book.id).await?;
            if let Some(rule) = select_rule(&rules, event)? {
                return self.evaluate(book, rule, event, side);
            }
        }
        Err(PricingError::NoMatchingRule(side))
    }

    fn evaluate(
        &self,
        book: &PriceBook,
        rule: &PriceRule,
        event: &UsageEvent,
        side: &'static str,
    ) -> Result<LineItemDraft, PricingError> {
        let spec = RuleSpec::decode(&rule.rule_spec)
            .map_err(|e| PricingError::InvalidRule(e.to_string()))?;
        let (amount_minor, inputs) = spec
            .evaluate(&event.payload)
            .map_err(|e| PricingError::InvalidRule(e.to_string()))?;

        let description = match book.kind {
            PriceBookKind::Customer => format!("Usage charge: {}", event.event_type),
            PriceBookKind::Cogs => format!("COGS accrual: {}", event.event_type),
        };

        Ok(LineItemDraft {
            price_book_id: book.id,
            price_rule_id: rule.id,
            amount_minor,
            currency: book.currency.clone(),
            description,
            inputs_snapshot: json!({
                "eventType": event.event_type,
                "priceBookKind": side,
                "ruleId": rule.id,
                "inputs": inputs,
                "amountMinor": amount_minor,
            }),
        })
    }
}

/// Highest priority wins; ties break toward the earliest-created rule.
fn select_rule<'r>(
    rules: &'r [PriceRule],
    event: &UsageEvent,
) -> Result<Option<&'r PriceRule>, PricingError> {
    let mut best: Option<&PriceRule> = None;
    for rule in rules {
        let spec = MatchSpec::decode(&rule.match_spec)
            .map_err(|e| PricingError::InvalidRule(e.to_string()))?;
        if !spec.matches(&event.event_type, &event.payload) {
            continue;
        }
        best = match best {
            None => Some(rule),
            Some(current)
                if rule.priority > current.priority
                    || (rule.priority == current.priority
                        && rule.created_at < current.created_at) =>
            {
                Some(rule)
            }
            Some(current) => Some(current),
        };
    }
    Ok(best)
}
