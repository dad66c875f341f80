use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decimal::{Money, Rate};
use crate::installment::Installment;
use crate::payment::ParentPayment;
use crate::plan::Plan;
use crate::types::{InstallmentStatus, ParentId, PaymentId};

/// revenue totals in exact money
#[derive(Debug, Clone, PartialEq)]
pub struct RevenueSummary {
    pub committed: Money,
    pub collected: Money,
    pub pending: Money,
    pub overdue: Money,
    pub success_rate: Rate,
    pub due_count: u64,
    pub paid_on_time_count: u64,
    /// keyed by (year, month) of settlement
    pub collected_by_month: BTreeMap<(i32, u32), Money>,
    pub committed_plans: usize,
}

/// revenue figures for dashboards, computed from one dataset snapshot
pub struct RevenueAggregator;

impl RevenueAggregator {
    pub fn compute(plans: &[Plan], installments: &[Installment], now: DateTime<Utc>) -> RevenueSummary {
        let committed_plans = Self::committed_plans(plans);
        let committed: Money = committed_plans.iter().map(|p| p.total_amount).sum();

        let mut collected = Money::ZERO;
        let mut overdue = Money::ZERO;
        let mut collected_by_month: BTreeMap<(i32, u32), Money> = BTreeMap::new();
        let mut due_count = 0u64;
        let mut paid_on_time_count = 0u64;

        for inst in installments {
            match inst.status {
                InstallmentStatus::Paid => {
                    collected += inst.amount;
                    if let Some(paid_at) = inst.paid_at {
                        *collected_by_month
                            .entry((paid_at.year(), paid_at.month()))
                            .or_insert(Money::ZERO) += inst.amount;
                    }
                }
                InstallmentStatus::Overdue => overdue += inst.amount,
                InstallmentStatus::Pending | InstallmentStatus::Failed => {}
            }

            if inst.due_date < now {
                due_count += 1;
                if inst.paid_on_time() {
                    paid_on_time_count += 1;
                }
            }
        }

        let summary = RevenueSummary {
            committed,
            collected,
            pending: committed.saturating_sub(collected),
            overdue,
            success_rate: Rate::from_ratio(paid_on_time_count, due_count),
            due_count,
            paid_on_time_count,
            collected_by_month,
            committed_plans: committed_plans.len(),
        };
        debug!(
            committed = %summary.committed,
            collected = %summary.collected,
            overdue = %summary.overdue,
            "revenue computed"
        );
        summary
    }

    /// active or completed plans, one per parent: latest first, larger total on ties
    pub fn committed_plans(plans: &[Plan]) -> Vec<&Plan> {
        let mut latest: HashMap<ParentId, &Plan> = HashMap::new();
        for plan in plans.iter().filter(|p| p.status.is_committed()) {
            latest
                .entry(plan.parent_id)
                .and_modify(|current| {
                    let newer = (plan.created_at, plan.total_amount)
                        > (current.created_at, current.total_amount);
                    if newer {
                        *current = plan;
                    }
                })
                .or_insert(plan);
        }
        let mut chosen: Vec<&Plan> = latest.into_values().collect();
        chosen.sort_by_key(|p| (p.created_at, p.id));
        chosen
    }
}

/// dashboard view: integer cents and epoch milliseconds only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueReport {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub generated_at: DateTime<Utc>,
    pub committed_minor: i64,
    pub collected_minor: i64,
    pub pending_minor: i64,
    pub overdue_minor: i64,
    pub success_rate_percent: f64,
    pub due_count: u64,
    pub paid_on_time_count: u64,
    pub committed_plans: usize,
    pub collected_by_month: Vec<MonthlyCollection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCollection {
    pub year: i32,
    pub month: u32,
    pub collected_minor: i64,
}

impl RevenueReport {
    pub fn from_summary(summary: &RevenueSummary, generated_at: DateTime<Utc>) -> Self {
        RevenueReport {
            generated_at,
            committed_minor: summary.committed.to_minor(),
            collected_minor: summary.collected.to_minor(),
            pending_minor: summary.pending.to_minor(),
            overdue_minor: summary.overdue.to_minor(),
            success_rate_percent: summary
                .success_rate
                .as_percentage()
                .to_f64()
                .unwrap_or_default(),
            due_count: summary.due_count,
            paid_on_time_count: summary.paid_on_time_count,
            committed_plans: summary.committed_plans,
            collected_by_month: summary
                .collected_by_month
                .iter()
                .map(|(&(year, month), amount)| MonthlyCollection {
                    year,
                    month,
                    collected_minor: amount.to_minor(),
                })
                .collect(),
        }
    }
}

/// progress of one aggregate, from a single installment snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentProgress {
    pub payment_id: PaymentId,
    pub total_count: u32,
    pub paid_count: u32,
    pub overdue_count: u32,
    pub paid_minor: i64,
    pub remaining_minor: i64,
    pub completion_percent: f64,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub next_due: Option<DateTime<Utc>>,
    pub next_due_minor: Option<i64>,
}

impl PaymentProgress {
    pub fn from_snapshot(payment: &ParentPayment, installments: &[Installment]) -> Self {
        let paid: Vec<&Installment> = installments.iter().filter(|i| i.is_paid()).collect();
        let paid_amount: Money = paid.iter().map(|i| i.amount).sum();
        let scheduled: Money = installments.iter().map(|i| i.amount).sum();
        let next = installments
            .iter()
            .filter(|i| !i.is_paid())
            .min_by_key(|i| (i.due_date, i.index));

        PaymentProgress {
            payment_id: payment.id,
            total_count: installments.len() as u32,
            paid_count: paid.len() as u32,
            overdue_count: installments
                .iter()
                .filter(|i| i.status == InstallmentStatus::Overdue)
                .count() as u32,
            paid_minor: paid_amount.to_minor(),
            remaining_minor: scheduled.saturating_sub(paid_amount).to_minor(),
            completion_percent: Rate::from_ratio(paid.len() as u64, installments.len() as u64)
                .as_percentage()
                .to_f64()
                .unwrap_or_default(),
            next_due: next.map(|i| i.due_date),
            next_due_minor: next.map(|i| i.amount.to_minor()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_count > 0 && self.paid_count == self.total_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanTerms;
    use crate::types::PlanStatus;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn plan(parent: ParentId, total: i64, created: DateTime<Utc>, status: PlanStatus) -> Plan {
        let terms = PlanTerms::monthly(parent, Money::from_major(total), 4, created);
        let mut plan = Plan::from_terms(terms, Uuid::new_v4(), created);
        plan.status = status;
        plan
    }

    fn installment(amount: i64, due: DateTime<Utc>) -> Installment {
        Installment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            1,
            1,
            Money::from_major(amount),
            due,
            due,
        )
    }

    #[test]
    fn test_superseded_plan_not_double_counted() {
        let parent = Uuid::new_v4();
        let plans = vec![
            plan(parent, 800, day(2024, 1, 1), PlanStatus::Active),
            plan(parent, 1200, day(2024, 3, 1), PlanStatus::Active),
            plan(Uuid::new_v4(), 400, day(2024, 2, 1), PlanStatus::Completed),
            plan(Uuid::new_v4(), 900, day(2024, 2, 1), PlanStatus::Cancelled),
        ];
        let summary = RevenueAggregator::compute(&plans, &[], day(2024, 4, 1));
        assert_eq!(summary.committed, Money::from_major(1600));
        assert_eq!(summary.committed_plans, 2);
    }

    #[test]
    fn test_same_day_plans_prefer_larger_total() {
        let parent = Uuid::new_v4();
        let plans = vec![
            plan(parent, 1200, day(2024, 1, 1), PlanStatus::Active),
            plan(parent, 800, day(2024, 1, 1), PlanStatus::Active),
        ];
        let chosen = RevenueAggregator::committed_plans(&plans);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].total_amount, Money::from_major(1200));
    }

    #[test]
    fn test_pending_clamps_at_zero() {
        let mut paid = installment(500, day(2024, 1, 1));
        paid.settle(day(2024, 1, 1), &[]);
        let plans = vec![plan(Uuid::new_v4(), 300, day(2024, 1, 1), PlanStatus::Active)];
        let summary = RevenueAggregator::compute(&plans, &[paid], day(2024, 2, 1));
        assert_eq!(summary.collected, Money::from_major(500));
        assert_eq!(summary.pending, Money::ZERO);
    }

    #[test]
    fn test_success_rate_by_calendar_day() {
        let now = day(2024, 6, 1);
        let mut same_day = installment(100, day(2024, 5, 1));
        same_day.settle(day(2024, 5, 1) + Duration::hours(23), &[]);
        let mut late = installment(100, day(2024, 5, 1));
        late.settle(day(2024, 5, 3), &[]);
        let mut overdue = installment(100, day(2024, 5, 15));
        overdue.mark_overdue(day(2024, 5, 16), Duration::days(5));
        let future = installment(100, day(2024, 7, 1));

        let summary = RevenueAggregator::compute(&[], &[same_day, late, overdue, future], now);
        assert_eq!(summary.due_count, 3);
        assert_eq!(summary.paid_on_time_count, 1);
        assert_eq!(summary.overdue, Money::from_major(100));
        assert_eq!(summary.success_rate.as_percentage().to_string(), "33.33");
        assert_eq!(summary.collected_by_month.get(&(2024, 5)), Some(&Money::from_major(200)));
    }

    #[test]
    fn test_empty_dataset() {
        let summary = RevenueAggregator::compute(&[], &[], day(2024, 1, 1));
        assert_eq!(summary.success_rate, Rate::ZERO);
        let report = RevenueReport::from_summary(&summary, day(2024, 1, 1));
        assert_eq!(report.success_rate_percent, 0.0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["generated_at"], serde_json::json!(1_704_067_200_000i64));
        assert_eq!(json["committed_minor"], serde_json::json!(0));
    }
}
