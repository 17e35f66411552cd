//! LLM token cost metering
//!
//! Usage reports from the chat model are priced per-model and appended to a
//! durable ledger. Money is fixed-point decimal at scale 6; binary floating
//! point never touches a cost figure after configuration load.

mod ledger;

pub use ledger::{CostLedger, SqliteLedger};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::PricingConfig;
use crate::providers::TokenUsage;
use crate::{Error, Result};

/// Ledger scale for cost figures
const COST_SCALE: u32 = 6;

/// Pricing for one model, per thousand tokens
#[derive(Debug, Clone)]
pub struct PricingRule {
    /// Price per 1K prompt tokens
    pub input_price: Decimal,
    /// Price per 1K completion tokens
    pub output_price: Decimal,
    /// ISO currency code
    pub currency: String,
}

/// A priced usage report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cost {
    /// Total cost at scale 6
    pub amount: Decimal,
    /// ISO currency code, `UNKNOWN` for unpriced models
    pub currency: String,
}

/// One durable ledger row
#[derive(Debug, Clone)]
pub struct CostRecord {
    /// Device serial number the call served
    pub sn: String,
    /// Model identifier
    pub model_name: String,
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens in the completion
    pub completion_tokens: u32,
    /// Total billed tokens
    pub total_tokens: u32,
    /// Cost at scale 6
    pub cost: Decimal,
    /// ISO currency code
    pub currency: String,
    /// Wall-clock duration of the chat call
    pub duration_ms: i64,
    /// Row creation time
    pub created_at: DateTime<Utc>,
}

/// Prices usage reports against per-model rules
pub struct CostCalculator {
    rules: HashMap<String, PricingRule>,
}

impl CostCalculator {
    /// Create a calculator over explicit rules
    #[must_use]
    pub fn new(rules: HashMap<String, PricingRule>) -> Self {
        Self { rules }
    }

    /// Build rules from the pricing configuration section
    #[must_use]
    pub fn from_config(pricing: &PricingConfig) -> Self {
        let rules = pricing
            .models
            .iter()
            .map(|(model, rule)| {
                (
                    model.clone(),
                    PricingRule {
                        input_price: Decimal::from_f64_retain(rule.input_price)
                            .unwrap_or_default(),
                        output_price: Decimal::from_f64_retain(rule.output_price)
                            .unwrap_or_default(),
                        currency: rule.currency.clone(),
                    },
                )
            })
            .collect();
        Self::new(rules)
    }

    /// Price one usage report
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownModel`] when no rule covers the model.
    pub fn calculate(&self, usage: &TokenUsage) -> Result<Cost> {
        let Some(rule) = self.rules.get(&usage.model) else {
            return Err(Error::UnknownModel(usage.model.clone()));
        };

        let thousand = Decimal::ONE_THOUSAND;
        let prompt_cost = Decimal::from(usage.prompt_tokens) / thousand * rule.input_price;
        let completion_cost =
            Decimal::from(usage.completion_tokens) / thousand * rule.output_price;

        Ok(Cost {
            amount: (prompt_cost + completion_cost).round_dp(COST_SCALE),
            currency: rule.currency.clone(),
        })
    }
}

/// The metering service: calculator plus ledger sink
///
/// A disabled service accepts records and does nothing, so callers never
/// branch on whether metering is configured.
pub struct Metering {
    inner: Option<MeteringInner>,
}

struct MeteringInner {
    calculator: CostCalculator,
    ledger: Arc<dyn CostLedger>,
}

impl Metering {
    /// A metering service wired to a ledger
    #[must_use]
    pub fn new(calculator: CostCalculator, ledger: Arc<dyn CostLedger>) -> Self {
        Self {
            inner: Some(MeteringInner { calculator, ledger }),
        }
    }

    /// A no-op service for deployments without a ledger
    #[must_use]
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Price a usage report and append it to the ledger.
    ///
    /// An unpriced model is recorded at cost zero with currency `UNKNOWN`;
    /// the condition is logged, not surfaced, so accounting gaps never break
    /// the voice path. A disabled service returns success without recording.
    ///
    /// # Errors
    ///
    /// Returns an error only when the ledger append fails.
    pub fn record(&self, device_sn: &str, usage: &TokenUsage) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let cost = match inner.calculator.calculate(usage) {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(error = %e, model = %usage.model, "cost calculation failed");
                Cost {
                    amount: Decimal::ZERO,
                    currency: "UNKNOWN".to_string(),
                }
            }
        };

        let record = CostRecord {
            sn: device_sn.to_string(),
            model_name: usage.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cost: cost.amount,
            currency: cost.currency,
            duration_ms: usage.duration_ms(),
            created_at: Utc::now(),
        };

        inner.ledger.append(&record)
    }
}
