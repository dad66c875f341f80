use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{PlanError, Result};
use crate::installment::CustomScheduleLine;
use crate::types::{CreationStage, ParentId, PaymentId, PlanId, PlanStatus};

/// commercial terms of a multi-installment obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub parent_id: ParentId,
    pub payment_id: Option<PaymentId>,

    pub total_amount: Money,
    pub installment_amount: Money,
    pub installment_count: u32,
    pub cadence_months: u32,
    pub start_date: DateTime<Utc>,
    pub custom_schedule: Option<Vec<CustomScheduleLine>>,

    pub status: PlanStatus,
    pub creation_stage: CreationStage,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// request to open a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTerms {
    pub parent_id: ParentId,
    pub total_amount: Money,
    /// defaults to an even split of the total
    pub installment_amount: Option<Money>,
    pub installment_count: u32,
    pub cadence_months: u32,
    pub start_date: DateTime<Utc>,
    pub custom_schedule: Option<Vec<CustomScheduleLine>>,
}

impl PlanTerms {
    /// equal monthly installments starting at `start_date`
    pub fn monthly(
        parent_id: ParentId,
        total_amount: Money,
        installment_count: u32,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            parent_id,
            total_amount,
            installment_amount: None,
            installment_count,
            cadence_months: 1,
            start_date,
            custom_schedule: None,
        }
    }

    pub fn with_cadence(mut self, months: u32) -> Self {
        self.cadence_months = months;
        self
    }

    pub fn with_installment_amount(mut self, amount: Money) -> Self {
        self.installment_amount = Some(amount);
        self
    }

    pub fn with_custom_schedule(mut self, lines: Vec<CustomScheduleLine>) -> Self {
        self.custom_schedule = Some(lines);
        self
    }

    /// installment amount to schedule, explicit or evenly split
    pub fn resolved_installment_amount(&self) -> Money {
        match self.installment_amount {
            Some(amount) => amount,
            None => self
                .total_amount
                .split_even(self.installment_count)
                .first()
                .copied()
                .unwrap_or(Money::ZERO),
        }
    }

    /// reject bad terms before anything is written
    pub fn validate(&self, tolerance: Money) -> Result<()> {
        if self.installment_count < 1 {
            return Err(PlanError::InvalidInstallmentCount {
                count: self.installment_count,
            });
        }
        if !self.total_amount.is_positive() {
            return Err(PlanError::InvalidAmount {
                amount: self.total_amount,
            });
        }
        if self.cadence_months < 1 {
            return Err(PlanError::InvalidCadence {
                months: self.cadence_months,
            });
        }

        if let Some(lines) = &self.custom_schedule {
            if lines.len() != self.installment_count as usize {
                return Err(PlanError::ScheduleLengthMismatch {
                    expected: self.installment_count,
                    provided: lines.len(),
                });
            }
            if let Some(line) = lines.iter().find(|l| !l.amount.is_positive()) {
                return Err(PlanError::InvalidAmount { amount: line.amount });
            }
            let scheduled: Money = lines.iter().map(|l| l.amount).sum();
            if scheduled != self.total_amount {
                return Err(PlanError::ScheduleTotalMismatch {
                    expected: self.total_amount,
                    scheduled,
                });
            }
            return Ok(());
        }

        let amount = self.resolved_installment_amount();
        if !amount.is_positive() {
            return Err(PlanError::InvalidAmount { amount });
        }
        let scheduled = amount * Decimal::from(self.installment_count);
        let allowed = tolerance * Decimal::from(self.installment_count);
        if (scheduled - self.total_amount).abs() > allowed {
            return Err(PlanError::ScheduleTotalMismatch {
                expected: self.total_amount,
                scheduled,
            });
        }
        Ok(())
    }
}

impl Plan {
    pub fn from_terms(terms: PlanTerms, payment_id: PaymentId, now: DateTime<Utc>) -> Self {
        let installment_amount = terms.resolved_installment_amount();
        Self {
            id: uuid::Uuid::new_v4(),
            parent_id: terms.parent_id,
            payment_id: Some(payment_id),
            total_amount: terms.total_amount,
            installment_amount,
            installment_count: terms.installment_count,
            cadence_months: terms.cadence_months,
            start_date: terms.start_date,
            custom_schedule: terms.custom_schedule,
            status: PlanStatus::Active,
            creation_stage: CreationStage::Started,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance_stage(&mut self, stage: CreationStage, now: DateTime<Utc>) {
        if stage > self.creation_stage {
            self.creation_stage = stage;
            self.updated_at = now;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == PlanStatus::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_even_split_terms() {
        let terms = PlanTerms::monthly(Uuid::new_v4(), Money::from_major(1200), 12, start());
        assert_eq!(terms.resolved_installment_amount(), Money::from_major(100));
        assert!(terms.validate(Money::CENT).is_ok());
    }

    #[test]
    fn test_uneven_split_within_tolerance() {
        let terms = PlanTerms::monthly(Uuid::new_v4(), Money::from_major(100), 3, start());
        assert_eq!(terms.resolved_installment_amount(), Money::from_minor(3333));
        assert!(terms.validate(Money::CENT).is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let parent = Uuid::new_v4();
        let base = PlanTerms::monthly(parent, Money::from_major(1200), 12, start());

        let zero_count = PlanTerms { installment_count: 0, ..base.clone() };
        assert_eq!(
            zero_count.validate(Money::CENT),
            Err(PlanError::InvalidInstallmentCount { count: 0 })
        );

        let zero_total = PlanTerms { total_amount: Money::ZERO, ..base.clone() };
        assert!(matches!(
            zero_total.validate(Money::CENT),
            Err(PlanError::InvalidAmount { .. })
        ));

        let negative_amount = base.clone().with_installment_amount(Money::from_major(-100));
        assert!(matches!(
            negative_amount.validate(Money::CENT),
            Err(PlanError::InvalidAmount { .. })
        ));

        let wrong_amount = base.clone().with_installment_amount(Money::from_major(90));
        assert!(matches!(
            wrong_amount.validate(Money::CENT),
            Err(PlanError::ScheduleTotalMismatch { .. })
        ));

        let no_cadence = base.with_cadence(0);
        assert_eq!(
            no_cadence.validate(Money::CENT),
            Err(PlanError::InvalidCadence { months: 0 })
        );
    }

    #[test]
    fn test_custom_schedule_validation() {
        let line = |major: i64, day: u32| CustomScheduleLine {
            amount: Money::from_major(major),
            due_date: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            method: None,
            check_number: None,
        };
        let terms = PlanTerms::monthly(Uuid::new_v4(), Money::from_major(300), 2, start());

        let short = terms.clone().with_custom_schedule(vec![line(300, 1)]);
        assert_eq!(
            short.validate(Money::CENT),
            Err(PlanError::ScheduleLengthMismatch { expected: 2, provided: 1 })
        );

        let wrong_sum = terms.clone().with_custom_schedule(vec![line(100, 1), line(100, 15)]);
        assert!(matches!(
            wrong_sum.validate(Money::CENT),
            Err(PlanError::ScheduleTotalMismatch { .. })
        ));

        let ok = terms.with_custom_schedule(vec![line(200, 1), line(100, 15)]);
        assert!(ok.validate(Money::CENT).is_ok());
    }
}
