use chrono::{DateTime, Months, Utc};
use hourglass_rs::SafeTimeProvider;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::decimal::Money;
use crate::errors::{PlanError, Result};
use crate::installment::{CustomScheduleLine, Installment};
use crate::plan::Plan;
use crate::store::Store;
use crate::types::{InstallmentId, ParentId, PaymentId, PlanId};

/// inputs for generating a schedule
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub payment_id: PaymentId,
    pub parent_id: ParentId,
    pub plan_id: Option<PlanId>,
    pub total_amount: Money,
    pub installment_amount: Money,
    pub installment_count: u32,
    pub cadence_months: u32,
    pub start_date: DateTime<Utc>,
    pub custom_lines: Option<Vec<CustomScheduleLine>>,
    /// create installment 1 already settled
    pub settle_first: bool,
    /// allowed drift per installment between count x amount and the total
    pub amount_tolerance: Money,
}

impl ScheduleRequest {
    pub fn for_plan(plan: &Plan, payment_id: PaymentId, config: &EngineConfig) -> Self {
        Self {
            payment_id,
            parent_id: plan.parent_id,
            plan_id: Some(plan.id),
            total_amount: plan.total_amount,
            installment_amount: plan.installment_amount,
            installment_count: plan.installment_count,
            cadence_months: plan.cadence_months,
            start_date: plan.start_date,
            custom_lines: plan.custom_schedule.clone(),
            settle_first: config.settle_first_installment,
            amount_tolerance: config.amount_tolerance,
        }
    }
}

/// one computed line of a schedule
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledLine {
    pub index: u32,
    pub amount: Money,
    pub due_date: DateTime<Utc>,
    pub custom: Option<CustomScheduleLine>,
}

/// turns a commitment into dated installments
pub struct ScheduleGenerator;

impl ScheduleGenerator {
    /// due date of installment `index` (1-based): start + (index - 1) x cadence calendar months
    pub fn due_date(start: DateTime<Utc>, index: u32, cadence_months: u32) -> Result<DateTime<Utc>> {
        let offset = index
            .checked_sub(1)
            .and_then(|i| i.checked_mul(cadence_months))
            .ok_or(PlanError::InvalidDate {
                message: format!("installment index {} out of range", index),
            })?;
        start
            .checked_add_months(Months::new(offset))
            .ok_or(PlanError::InvalidDate {
                message: format!("{} months after {} is out of range", offset, start),
            })
    }

    /// compute every line; the last line absorbs rounding so the sum is exact
    pub fn lines(request: &ScheduleRequest) -> Result<Vec<ScheduledLine>> {
        let count = request.installment_count;
        if count < 1 {
            return Err(PlanError::InvalidInstallmentCount { count });
        }

        if let Some(custom) = &request.custom_lines {
            if custom.len() != count as usize {
                return Err(PlanError::ScheduleLengthMismatch {
                    expected: count,
                    provided: custom.len(),
                });
            }
            let scheduled: Money = custom.iter().map(|l| l.amount).sum();
            if scheduled != request.total_amount {
                return Err(PlanError::ScheduleTotalMismatch {
                    expected: request.total_amount,
                    scheduled,
                });
            }
            return Ok(custom
                .iter()
                .enumerate()
                .map(|(i, line)| ScheduledLine {
                    index: i as u32 + 1,
                    amount: line.amount,
                    due_date: line.due_date,
                    custom: Some(line.clone()),
                })
                .collect());
        }

        if !request.installment_amount.is_positive() {
            return Err(PlanError::InvalidAmount {
                amount: request.installment_amount,
            });
        }
        if request.cadence_months < 1 {
            return Err(PlanError::InvalidCadence {
                months: request.cadence_months,
            });
        }

        let scheduled = request.installment_amount * Decimal::from(count);
        let allowed = request.amount_tolerance * Decimal::from(count);
        let allocated = request.installment_amount * Decimal::from(count - 1);
        let last_amount = request.total_amount - allocated;
        if (scheduled - request.total_amount).abs() > allowed || !last_amount.is_positive() {
            return Err(PlanError::ScheduleTotalMismatch {
                expected: request.total_amount,
                scheduled,
            });
        }

        let mut lines = Vec::with_capacity(count as usize);
        for index in 1..=count {
            let amount = if index == count {
                last_amount
            } else {
                request.installment_amount
            };
            lines.push(ScheduledLine {
                index,
                amount,
                due_date: Self::due_date(request.start_date, index, request.cadence_months)?,
                custom: None,
            });
        }
        Ok(lines)
    }

    /// build installment records without writing them
    pub fn build(request: &ScheduleRequest, now: DateTime<Utc>) -> Result<Vec<Installment>> {
        let lines = Self::lines(request)?;
        Ok(lines
            .into_iter()
            .map(|line| Self::installment_for(request, line, now))
            .collect())
    }

    fn installment_for(
        request: &ScheduleRequest,
        line: ScheduledLine,
        now: DateTime<Utc>,
    ) -> Installment {
        let mut installment = Installment::new(
            request.payment_id,
            request.parent_id,
            request.plan_id,
            line.index,
            request.installment_count,
            line.amount,
            line.due_date,
            now,
        );
        installment.metadata.schedule_line = line.custom;
        // enrollment requires the first payment up front
        if line.index == 1 && request.settle_first {
            installment.settle(now, &[]);
        }
        installment
    }

    /// generate and persist a full schedule, returning ids in index order
    pub fn generate<S: Store + ?Sized>(
        store: &S,
        request: &ScheduleRequest,
        time_provider: &SafeTimeProvider,
    ) -> Result<Vec<InstallmentId>> {
        let installments = Self::build(request, time_provider.now())?;
        Self::persist(store, request.payment_id, installments)
    }

    /// persist only the indices missing from `existing`, used to finish an interrupted batch
    pub fn generate_missing<S: Store + ?Sized>(
        store: &S,
        request: &ScheduleRequest,
        existing: &[u32],
        time_provider: &SafeTimeProvider,
    ) -> Result<Vec<InstallmentId>> {
        let missing: Vec<Installment> = Self::build(request, time_provider.now())?
            .into_iter()
            .filter(|i| !existing.contains(&i.index))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            payment_id = %request.payment_id,
            missing = missing.len(),
            "completing partially written schedule"
        );
        Self::persist(store, request.payment_id, missing)
    }

    fn persist<S: Store + ?Sized>(
        store: &S,
        payment_id: PaymentId,
        installments: Vec<Installment>,
    ) -> Result<Vec<InstallmentId>> {
        let expected = installments.len();
        let mut written = Vec::with_capacity(expected);
        for installment in installments {
            let id = installment.id;
            if let Err(err) = store.insert_installment(installment) {
                warn!(
                    %payment_id,
                    written = written.len(),
                    expected,
                    error = %err,
                    "installment batch interrupted"
                );
                return Err(PlanError::PartialBatch {
                    payment_id,
                    written: written.len(),
                    expected,
                });
            }
            written.push(id);
        }
        info!(%payment_id, installments = expected, "schedule persisted");
        Ok(written)
    }
}
