use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{PlanError, Result};
use crate::types::SettlementPrecedence;

/// engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// length of the grace window opened when an installment goes overdue
    pub grace_period_days: u32,
    /// settle installment 1 at signup
    pub settle_first_installment: bool,
    /// allowed drift between `count x installment amount` and the plan total, per installment
    pub amount_tolerance: Money,
    pub settlement_precedence: SettlementPrecedence,
    /// re-derive aggregate status for payments touched by a sweep
    pub reconcile_after_sweep: bool,
    /// hours between scheduled sweeps, informational for schedulers
    pub sweep_interval_hours: u32,
    /// age after which an unfinished creation sequence counts as stalled
    pub stalled_creation_minutes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::program_default()
    }
}

impl EngineConfig {
    /// youth program policy: 5 day grace, first installment due at enrollment
    pub fn program_default() -> Self {
        Self {
            grace_period_days: 5,
            settle_first_installment: true,
            amount_tolerance: Money::CENT,
            settlement_precedence: SettlementPrecedence::HonorSuppression,
            reconcile_after_sweep: true,
            sweep_interval_hours: 24,
            stalled_creation_minutes: 15,
        }
    }

    /// processor settlements always win over manual unmarks
    pub fn processor_authoritative() -> Self {
        Self {
            settlement_precedence: SettlementPrecedence::ExternalAuthoritative,
            ..Self::program_default()
        }
    }

    /// load from a json document, missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| PlanError::InvalidConfiguration {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount_tolerance.is_negative() {
            return Err(PlanError::InvalidConfiguration {
                message: format!("amount tolerance must not be negative: {}", self.amount_tolerance),
            });
        }
        if self.sweep_interval_hours == 0 {
            return Err(PlanError::InvalidConfiguration {
                message: "sweep interval must be at least one hour".to_string(),
            });
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::days(self.grace_period_days as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.grace_period_days, 5);
        assert!(config.settle_first_installment);
        assert_eq!(config.grace_period(), Duration::days(5));
        assert_eq!(config.settlement_precedence, SettlementPrecedence::HonorSuppression);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "grace_period_days": 10 }"#).unwrap();
        assert_eq!(config.grace_period_days, 10);
        assert!(config.settle_first_installment);
        assert_eq!(config.amount_tolerance, Money::CENT);
    }

    #[test]
    fn test_json_precedence() {
        let config = EngineConfig::from_json_str(
            r#"{ "settlement_precedence": "external_authoritative" }"#,
        )
        .unwrap();
        assert_eq!(config, EngineConfig::processor_authoritative());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "sweep_interval_hours": 0 }"#).unwrap_err();
        assert!(matches!(err, PlanError::InvalidConfiguration { .. }));

        let err = EngineConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, PlanError::InvalidConfiguration { .. }));
    }
}
