use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::decimal::Money;
use crate::deletion;
use crate::errors::{PlanError, Result};
use crate::events::{Event, EventStore};
use crate::installment::Installment;
use crate::payment::ParentPayment;
use crate::plan::Plan;
use crate::schedule::{ScheduleGenerator, ScheduleRequest};
use crate::store::Store;
use crate::types::{
    CreationStage, InstallmentId, InstallmentStatus, PaymentId, PaymentStatus, PlanId, PlanStatus,
    RecordKind,
};

// bound on derive/write/verify rounds under concurrent writers
const MAX_DERIVE_ROUNDS: usize = 5;

/// aggregate status computed from installments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedPayment {
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

/// derive aggregate status; cancelled and empty aggregates keep their stored state
pub fn derive_payment(payment: &ParentPayment, installments: &[Installment]) -> DerivedPayment {
    let stored = DerivedPayment {
        status: payment.status,
        paid_at: payment.paid_at,
    };
    if payment.is_cancelled() || installments.is_empty() {
        return stored;
    }

    // a partially written series is never paid, whatever its rows say
    let expected = installments
        .iter()
        .map(|i| i.total_in_series)
        .max()
        .unwrap_or(1);
    let indices: HashSet<u32> = installments.iter().map(|i| i.index).collect();
    let series_complete = (1..=expected).all(|index| indices.contains(&index));

    if series_complete && installments.iter().all(|i| i.is_paid()) {
        return DerivedPayment {
            status: PaymentStatus::Paid,
            paid_at: installments.iter().filter_map(|i| i.paid_at).max(),
        };
    }

    let status = if installments.iter().any(|i| i.status == InstallmentStatus::Overdue) {
        PaymentStatus::Overdue
    } else if installments.iter().any(|i| i.status == InstallmentStatus::Failed) {
        PaymentStatus::Failed
    } else {
        PaymentStatus::Pending
    };
    DerivedPayment { status, paid_at: None }
}

/// derive plan status; cancelled plans never change
pub fn derive_plan(plan: &Plan, installments: &[Installment]) -> PlanStatus {
    if plan.is_cancelled() {
        return PlanStatus::Cancelled;
    }
    let complete = installments.len() == plan.installment_count as usize
        && installments.iter().all(|i| i.is_paid());
    if complete {
        PlanStatus::Completed
    } else {
        PlanStatus::Active
    }
}

/// inconsistency found by a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Issue {
    /// installment whose aggregate or plan no longer exists
    OrphanedInstallment {
        installment_id: InstallmentId,
        payment_id: PaymentId,
        plan_id: Option<PlanId>,
    },
    /// plan references an aggregate that was never written
    PlanWithoutPayment { plan_id: PlanId },
    /// fewer installments than the series length
    IncompleteSchedule {
        payment_id: PaymentId,
        plan_id: Option<PlanId>,
        present: Vec<u32>,
        expected: u32,
    },
    DuplicateIndex {
        payment_id: PaymentId,
        index: u32,
        installment_ids: Vec<InstallmentId>,
    },
    AmountMismatch {
        payment_id: PaymentId,
        expected: Money,
        scheduled: Money,
    },
    PaymentStatusDrift {
        payment_id: PaymentId,
        stored: PaymentStatus,
        derived: PaymentStatus,
    },
    PlanStatusDrift {
        plan_id: PlanId,
        stored: PlanStatus,
        derived: PlanStatus,
    },
    PaidTimestampMismatch { installment_id: InstallmentId },
    /// creation sequence stopped before completing
    StalledCreation { plan_id: PlanId, stage: CreationStage },
}

/// result of a scan, for operator review
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReconciliationReport {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scanned_at: DateTime<Utc>,
    pub plans_scanned: usize,
    pub payments_scanned: usize,
    pub installments_scanned: usize,
    pub issues: Vec<Issue>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| matches!(i, Issue::OrphanedInstallment { .. }))
            .count()
    }
}

/// how to resolve an interrupted creation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaRecovery {
    /// write the missing steps
    Complete,
    /// delete what was written, only when nothing was ever paid
    RollBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOptions {
    /// report only, write nothing
    pub dry_run: bool,
    /// allow destructive actions
    pub confirm: bool,
    pub saga: SagaRecovery,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            confirm: false,
            saga: SagaRecovery::Complete,
        }
    }
}

impl RepairOptions {
    pub fn apply() -> Self {
        Self {
            dry_run: false,
            ..Self::default()
        }
    }

    pub fn apply_confirmed() -> Self {
        Self {
            dry_run: false,
            confirm: true,
            ..Self::default()
        }
    }

    pub fn with_saga(mut self, saga: SagaRecovery) -> Self {
        self.saga = saga;
        self
    }
}

/// repair step derived from an issue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairAction {
    RederivePayment { payment_id: PaymentId },
    CreateMissingPayment { plan_id: PlanId },
    CompleteSchedule { payment_id: PaymentId },
    MarkCreationComplete { plan_id: PlanId },
    FixPaidTimestamp { installment_id: InstallmentId },
    DeleteOrphan { installment_id: InstallmentId },
    RollBackCreation { plan_id: PlanId },
}

impl RepairAction {
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            RepairAction::DeleteOrphan { .. } | RepairAction::RollBackCreation { .. }
        )
    }

    fn describe(&self) -> String {
        match self {
            RepairAction::RederivePayment { payment_id } => {
                format!("re-derived status of payment {}", payment_id)
            }
            RepairAction::CreateMissingPayment { plan_id } => {
                format!("created missing payment for plan {}", plan_id)
            }
            RepairAction::CompleteSchedule { payment_id } => {
                format!("completed schedule of payment {}", payment_id)
            }
            RepairAction::MarkCreationComplete { plan_id } => {
                format!("marked creation of plan {} complete", plan_id)
            }
            RepairAction::FixPaidTimestamp { installment_id } => {
                format!("fixed paid timestamp of installment {}", installment_id)
            }
            RepairAction::DeleteOrphan { installment_id } => {
                format!("deleted orphaned installment {}", installment_id)
            }
            RepairAction::RollBackCreation { plan_id } => {
                format!("rolled back creation of plan {}", plan_id)
            }
        }
    }
}

/// what a repair run did
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub dry_run: bool,
    pub planned: Vec<RepairAction>,
    pub applied: Vec<RepairAction>,
    /// destructive actions held back for lack of confirmation
    pub awaiting_confirmation: Vec<RepairAction>,
    /// issues with no automatic repair
    pub needs_review: Vec<Issue>,
}

/// keeps aggregates and plans consistent with their installments
///
/// Finds and repairs records left inconsistent by interrupted write
/// sequences.
pub struct Reconciler<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: Store + ?Sized> Reconciler<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    /// re-derive one aggregate (and its plan) from a fresh installment snapshot
    pub fn reconcile_payment(
        &self,
        payment_id: PaymentId,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<ParentPayment> {
        let now = time_provider.now();
        let mut payment = self
            .store
            .payment(payment_id)?
            .ok_or(PlanError::NotFound {
                kind: RecordKind::Payment,
                id: payment_id,
            })?;

        for _ in 0..MAX_DERIVE_ROUNDS {
            let installments = self.store.installments_for_payment(payment_id)?;
            let derived = derive_payment(&payment, &installments);
            if derived.status == payment.status && derived.paid_at == payment.paid_at {
                if let Some(plan_id) = payment.plan_id {
                    self.reconcile_plan(plan_id, &installments, now, events)?;
                }
                return Ok(payment);
            }

            let mut old_status = payment.status;
            let mut written = derived;
            payment = self.store.update_payment(payment_id, &mut |p| {
                // derive again against the stored record so a concurrent cancel wins
                old_status = p.status;
                written = derive_payment(p, &installments);
                if written.status == p.status && written.paid_at == p.paid_at {
                    return Ok(());
                }
                p.status = written.status;
                p.paid_at = written.paid_at;
                p.updated_at = now;
                Ok(())
            })?;
            debug!(
                %payment_id,
                from = ?old_status,
                to = ?written.status,
                "payment status derived"
            );
            if old_status != written.status {
                events.emit(Event::PaymentStatusChanged {
                    payment_id,
                    old_status,
                    new_status: written.status,
                    timestamp: now,
                });
            }
        }

        warn!(%payment_id, "payment status did not settle, leaving for next reconciliation");
        Ok(payment)
    }

    fn reconcile_plan(
        &self,
        plan_id: PlanId,
        installments: &[Installment],
        now: DateTime<Utc>,
        events: &mut EventStore,
    ) -> Result<()> {
        let Some(plan) = self.store.plan(plan_id)? else {
            return Ok(());
        };
        let derived = derive_plan(&plan, installments);
        if derived == plan.status {
            return Ok(());
        }
        self.store.update_plan(plan_id, &mut |p| {
            p.status = derived;
            p.updated_at = now;
            Ok(())
        })?;
        info!(%plan_id, from = ?plan.status, to = ?derived, "plan status derived");
        events.emit(Event::PlanStatusChanged {
            plan_id,
            old_status: plan.status,
            new_status: derived,
            timestamp: now,
        });
        Ok(())
    }

    /// enumerate every inconsistency without writing anything
    pub fn scan(&self, time_provider: &SafeTimeProvider) -> Result<ReconciliationReport> {
        let now = time_provider.now();
        let plans = self.store.plans()?;
        let payments = self.store.payments()?;
        let installments = self.store.installments()?;

        let plan_ids: HashSet<PlanId> = plans.iter().map(|p| p.id).collect();
        let payment_ids: HashSet<PaymentId> = payments.iter().map(|p| p.id).collect();
        let mut by_payment: HashMap<PaymentId, Vec<Installment>> = HashMap::new();
        let mut issues = Vec::new();

        for inst in &installments {
            let plan_missing = inst.plan_id.map(|id| !plan_ids.contains(&id)).unwrap_or(false);
            if !payment_ids.contains(&inst.payment_id) || plan_missing {
                issues.push(Issue::OrphanedInstallment {
                    installment_id: inst.id,
                    payment_id: inst.payment_id,
                    plan_id: inst.plan_id,
                });
                continue;
            }
            if !inst.paid_state_consistent() {
                issues.push(Issue::PaidTimestampMismatch {
                    installment_id: inst.id,
                });
            }
            by_payment.entry(inst.payment_id).or_default().push(inst.clone());
        }

        let stall_cutoff = now - Duration::minutes(self.config.stalled_creation_minutes as i64);
        for plan in &plans {
            let payment_written = plan
                .payment_id
                .map(|id| payment_ids.contains(&id))
                .unwrap_or(false);
            if !payment_written {
                issues.push(Issue::PlanWithoutPayment { plan_id: plan.id });
            }
            if plan.creation_stage < CreationStage::Complete && plan.created_at <= stall_cutoff {
                issues.push(Issue::StalledCreation {
                    plan_id: plan.id,
                    stage: plan.creation_stage,
                });
            }
        }

        for payment in &payments {
            let rows = by_payment.get(&payment.id).map(Vec::as_slice).unwrap_or(&[]);
            let plan = payment
                .plan_id
                .and_then(|id| plans.iter().find(|p| p.id == id));
            let expected = plan
                .map(|p| p.installment_count)
                .or_else(|| rows.first().map(|r| r.total_in_series))
                .unwrap_or(1);

            let mut indices: BTreeMap<u32, Vec<InstallmentId>> = BTreeMap::new();
            for row in rows {
                indices.entry(row.index).or_default().push(row.id);
            }
            for (index, ids) in &indices {
                if ids.len() > 1 {
                    issues.push(Issue::DuplicateIndex {
                        payment_id: payment.id,
                        index: *index,
                        installment_ids: ids.clone(),
                    });
                }
            }

            let in_creation = plan
                .map(|p| p.creation_stage < CreationStage::Complete && p.created_at > stall_cutoff)
                .unwrap_or(false);
            if in_creation {
                continue;
            }

            let present: Vec<u32> = indices.keys().copied().collect();
            if (present.len() as u32) < expected {
                issues.push(Issue::IncompleteSchedule {
                    payment_id: payment.id,
                    plan_id: payment.plan_id,
                    present,
                    expected,
                });
            } else {
                let scheduled: Money = rows.iter().map(|r| r.amount).sum();
                let declared = plan.map(|p| p.total_amount).unwrap_or(payment.amount);
                if (scheduled - declared).abs() > self.config.amount_tolerance {
                    issues.push(Issue::AmountMismatch {
                        payment_id: payment.id,
                        expected: declared,
                        scheduled,
                    });
                }
            }

            let derived = derive_payment(payment, rows);
            if derived.status != payment.status {
                issues.push(Issue::PaymentStatusDrift {
                    payment_id: payment.id,
                    stored: payment.status,
                    derived: derived.status,
                });
            }
            if let Some(plan) = plan {
                let derived = derive_plan(plan, rows);
                if derived != plan.status {
                    issues.push(Issue::PlanStatusDrift {
                        plan_id: plan.id,
                        stored: plan.status,
                        derived,
                    });
                }
            }
        }

        if !issues.is_empty() {
            warn!(issues = issues.len(), "reconciliation found inconsistencies");
        }

        Ok(ReconciliationReport {
            scanned_at: now,
            plans_scanned: plans.len(),
            payments_scanned: payments.len(),
            installments_scanned: installments.len(),
            issues,
        })
    }

    /// translate a report into repair actions and optionally apply them
    pub fn repair(
        &self,
        report: &ReconciliationReport,
        options: RepairOptions,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<RepairOutcome> {
        let mut outcome = RepairOutcome {
            dry_run: options.dry_run,
            ..RepairOutcome::default()
        };

        for issue in &report.issues {
            match self.plan_actions(issue, options)? {
                Some(actions) => {
                    for action in actions {
                        if !outcome.planned.contains(&action) {
                            outcome.planned.push(action);
                        }
                    }
                }
                None => outcome.needs_review.push(issue.clone()),
            }
        }

        if options.dry_run {
            info!(planned = outcome.planned.len(), "repair dry run");
            return Ok(outcome);
        }

        for action in outcome.planned.clone() {
            if action.is_destructive() && !options.confirm {
                outcome.awaiting_confirmation.push(action);
                continue;
            }
            if action.is_destructive() {
                warn!(action = ?action, "applying destructive repair");
            }
            self.apply(&action, time_provider, events)?;
            events.emit(Event::RepairApplied {
                description: action.describe(),
                timestamp: time_provider.now(),
            });
            outcome.applied.push(action);
        }

        info!(
            applied = outcome.applied.len(),
            awaiting_confirmation = outcome.awaiting_confirmation.len(),
            needs_review = outcome.needs_review.len(),
            "repair finished"
        );
        Ok(outcome)
    }

    /// `None` when the issue needs a person
    fn plan_actions(&self, issue: &Issue, options: RepairOptions) -> Result<Option<Vec<RepairAction>>> {
        let actions = match issue {
            Issue::OrphanedInstallment { installment_id, .. } => {
                let inst = self.store.installment(*installment_id)?;
                if inst.map(|i| i.was_ever_paid()).unwrap_or(false) {
                    return Ok(None);
                }
                vec![RepairAction::DeleteOrphan {
                    installment_id: *installment_id,
                }]
            }
            Issue::PlanWithoutPayment { plan_id } | Issue::StalledCreation { plan_id, .. } => {
                match self.saga_actions(*plan_id, options.saga)? {
                    Some(actions) => actions,
                    None => return Ok(None),
                }
            }
            Issue::IncompleteSchedule { payment_id, plan_id, .. } => match (plan_id, options.saga) {
                (Some(plan_id), SagaRecovery::RollBack) => {
                    match self.saga_actions(*plan_id, SagaRecovery::RollBack)? {
                        Some(actions) => actions,
                        None => return Ok(None),
                    }
                }
                _ => vec![
                    RepairAction::CompleteSchedule {
                        payment_id: *payment_id,
                    },
                    RepairAction::RederivePayment {
                        payment_id: *payment_id,
                    },
                ],
            },
            Issue::PaymentStatusDrift { payment_id, .. } => vec![RepairAction::RederivePayment {
                payment_id: *payment_id,
            }],
            Issue::PlanStatusDrift { plan_id, .. } => {
                match self.store.plan(*plan_id)?.and_then(|p| p.payment_id) {
                    Some(payment_id) => vec![RepairAction::RederivePayment { payment_id }],
                    None => return Ok(None),
                }
            }
            Issue::PaidTimestampMismatch { installment_id } => {
                vec![RepairAction::FixPaidTimestamp {
                    installment_id: *installment_id,
                }]
            }
            Issue::DuplicateIndex { .. } | Issue::AmountMismatch { .. } => return Ok(None),
        };
        Ok(Some(actions))
    }

    fn saga_actions(&self, plan_id: PlanId, saga: SagaRecovery) -> Result<Option<Vec<RepairAction>>> {
        let Some(plan) = self.store.plan(plan_id)? else {
            return Ok(None);
        };
        match saga {
            SagaRecovery::RollBack => {
                let ever_paid = self
                    .store
                    .installments_for_plan(plan_id)?
                    .iter()
                    .any(|i| i.was_ever_paid());
                if ever_paid {
                    return Ok(None);
                }
                Ok(Some(vec![RepairAction::RollBackCreation { plan_id }]))
            }
            SagaRecovery::Complete => {
                let Some(payment_id) = plan.payment_id else {
                    return Ok(None);
                };
                let mut actions = Vec::new();
                if self.store.payment(payment_id)?.is_none() {
                    actions.push(RepairAction::CreateMissingPayment { plan_id });
                }
                actions.push(RepairAction::CompleteSchedule { payment_id });
                actions.push(RepairAction::RederivePayment { payment_id });
                actions.push(RepairAction::MarkCreationComplete { plan_id });
                Ok(Some(actions))
            }
        }
    }

    fn apply(
        &self,
        action: &RepairAction,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<()> {
        let now = time_provider.now();
        match action {
            RepairAction::RederivePayment { payment_id } => {
                if self.store.payment(*payment_id)?.is_some() {
                    self.reconcile_payment(*payment_id, time_provider, events)?;
                }
            }
            RepairAction::CreateMissingPayment { plan_id } => {
                let plan = self.require_plan(*plan_id)?;
                if let Some(payment_id) = plan.payment_id {
                    if self.store.payment(payment_id)?.is_none() {
                        self.store.insert_payment(ParentPayment::new(
                            payment_id,
                            plan.parent_id,
                            Some(plan.id),
                            plan.total_amount,
                            plan.start_date,
                            now,
                        ))?;
                    }
                    self.store.update_plan(plan.id, &mut |p| {
                        p.advance_stage(CreationStage::PaymentCreated, now);
                        Ok(())
                    })?;
                }
            }
            RepairAction::CompleteSchedule { payment_id } => {
                self.complete_schedule(*payment_id, time_provider)?;
            }
            RepairAction::MarkCreationComplete { plan_id } => {
                self.store.update_plan(*plan_id, &mut |p| {
                    p.advance_stage(CreationStage::Complete, now);
                    Ok(())
                })?;
            }
            RepairAction::FixPaidTimestamp { installment_id } => {
                self.store.update_installment(*installment_id, &mut |i| {
                    if i.is_paid() && i.paid_at.is_none() {
                        i.paid_at = Some(i.updated_at);
                    } else if !i.is_paid() && i.paid_at.is_some() {
                        i.paid_at = None;
                    }
                    Ok(())
                })?;
            }
            RepairAction::DeleteOrphan { installment_id } => {
                if let Some(inst) = self.store.installment(*installment_id)? {
                    if inst.was_ever_paid() {
                        return Err(PlanError::HasPaidInstallments {
                            kind: RecordKind::Installment,
                            id: inst.id,
                            paid: 1,
                        });
                    }
                    self.store.delete_installment(inst.id)?;
                    events.emit(Event::RecordDeleted {
                        kind: RecordKind::Installment,
                        id: inst.id,
                        timestamp: now,
                    });
                }
            }
            RepairAction::RollBackCreation { plan_id } => {
                deletion::delete_plan(self.store, *plan_id, time_provider, events)?;
            }
        }
        Ok(())
    }

    fn complete_schedule(&self, payment_id: PaymentId, time_provider: &SafeTimeProvider) -> Result<()> {
        let now = time_provider.now();
        let Some(payment) = self.store.payment(payment_id)? else {
            return Ok(());
        };
        let existing: Vec<u32> = self
            .store
            .installments_for_payment(payment_id)?
            .iter()
            .map(|i| i.index)
            .collect();

        let request = match payment.plan_id {
            Some(plan_id) => {
                let plan = self.require_plan(plan_id)?;
                ScheduleRequest::for_plan(&plan, payment_id, self.config)
            }
            None => ScheduleRequest {
                payment_id,
                parent_id: payment.parent_id,
                plan_id: None,
                total_amount: payment.amount,
                installment_amount: payment.amount,
                installment_count: 1,
                cadence_months: 1,
                start_date: payment.due_date,
                custom_lines: None,
                settle_first: false,
                amount_tolerance: self.config.amount_tolerance,
            },
        };
        ScheduleGenerator::generate_missing(self.store, &request, &existing, time_provider)?;

        if let Some(plan_id) = payment.plan_id {
            self.store.update_plan(plan_id, &mut |p| {
                p.advance_stage(CreationStage::ScheduleGenerated, now);
                Ok(())
            })?;
        }
        Ok(())
    }

    fn require_plan(&self, plan_id: PlanId) -> Result<Plan> {
        self.store.plan(plan_id)?.ok_or(PlanError::NotFound {
            kind: RecordKind::Plan,
            id: plan_id,
        })
    }

    /// delete installments that reference missing aggregates or plans
    pub fn cleanup_orphans(
        &self,
        options: RepairOptions,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<RepairOutcome> {
        if !options.dry_run && !options.confirm {
            return Err(PlanError::ConfirmationRequired);
        }
        let report = self.scan(time_provider)?;
        let orphans = ReconciliationReport {
            issues: report
                .issues
                .into_iter()
                .filter(|i| matches!(i, Issue::OrphanedInstallment { .. }))
                .collect(),
            ..report
        };
        self.repair(&orphans, options, time_provider, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use hourglass_rs::TimeSource;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn rows(count: u32) -> (ParentPayment, Vec<Installment>) {
        let payment = ParentPayment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            Money::from_major(100 * count as i64),
            start(),
            start(),
        );
        let installments = (1..=count)
            .map(|i| {
                Installment::new(
                    payment.id,
                    payment.parent_id,
                    None,
                    i,
                    count,
                    Money::from_major(100),
                    start(),
                    start(),
                )
            })
            .collect();
        (payment, installments)
    }

    #[test]
    fn test_derive_all_paid_takes_latest_timestamp() {
        let (payment, mut installments) = rows(3);
        for (i, inst) in installments.iter_mut().enumerate() {
            inst.settle(start() + Duration::days(i as i64 * 30), &[]);
        }
        let derived = derive_payment(&payment, &installments);
        assert_eq!(derived.status, PaymentStatus::Paid);
        assert_eq!(derived.paid_at, Some(start() + Duration::days(60)));
    }

    #[test]
    fn test_derive_overdue_beats_pending() {
        let (payment, mut installments) = rows(3);
        installments[0].settle(start(), &[]);
        installments[1].mark_overdue(start(), Duration::days(5));
        assert_eq!(derive_payment(&payment, &installments).status, PaymentStatus::Overdue);

        installments[1].settle(start(), &[]);
        let derived = derive_payment(&payment, &installments);
        assert_eq!(derived.status, PaymentStatus::Pending);
        assert_eq!(derived.paid_at, None);
    }

    #[test]
    fn test_derive_leaves_cancelled_alone() {
        let (mut payment, mut installments) = rows(2);
        payment.status = PaymentStatus::Cancelled;
        for inst in installments.iter_mut() {
            inst.settle(start(), &[]);
        }
        assert_eq!(derive_payment(&payment, &installments).status, PaymentStatus::Cancelled);
    }

    #[test]
    fn test_paid_aggregate_reverts_when_installment_unpaid() {
        let (mut payment, mut installments) = rows(2);
        payment.status = PaymentStatus::Paid;
        payment.paid_at = Some(start());
        installments[0].settle(start(), &[]);
        let derived = derive_payment(&payment, &installments);
        assert_eq!(derived.status, PaymentStatus::Pending);
        assert_eq!(derived.paid_at, None);
    }

    #[test]
    fn test_partial_series_never_paid() {
        let (payment, mut installments) = rows(12);
        installments.truncate(2);
        for inst in installments.iter_mut() {
            inst.settle(start(), &[]);
        }
        let derived = derive_payment(&payment, &installments);
        assert_eq!(derived.status, PaymentStatus::Pending);
        assert_eq!(derived.paid_at, None);

        // a gap in the middle counts as missing too
        let (payment, mut installments) = rows(3);
        installments.remove(1);
        for inst in installments.iter_mut() {
            inst.settle(start(), &[]);
        }
        assert_eq!(derive_payment(&payment, &installments).status, PaymentStatus::Pending);
    }

    #[test]
    fn test_scan_flags_drift_and_orphans() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));

        let (mut payment, installments) = rows(2);
        payment.status = PaymentStatus::Paid;
        payment.paid_at = Some(start());
        store.insert_payment(payment.clone()).unwrap();
        for inst in installments {
            store.insert_installment(inst).unwrap();
        }
        let (_, stray) = rows(1);
        let stray_id = stray[0].id;
        store.insert_installment(stray[0].clone()).unwrap();

        let reconciler = Reconciler::new(&store, &config);
        let report = reconciler.scan(&time).unwrap();
        assert_eq!(report.orphan_count(), 1);
        assert!(report.issues.contains(&Issue::PaymentStatusDrift {
            payment_id: payment.id,
            stored: PaymentStatus::Paid,
            derived: PaymentStatus::Pending,
        }));

        // default options never write
        let mut events = EventStore::new();
        let outcome = reconciler.repair(&report, RepairOptions::default(), &time, &mut events).unwrap();
        assert!(outcome.dry_run);
        assert!(outcome.applied.is_empty());
        assert!(outcome.planned.contains(&RepairAction::DeleteOrphan { installment_id: stray_id }));
        assert!(store.installment(stray_id).unwrap().is_some());

        // unconfirmed apply fixes drift but keeps the orphan
        let outcome = reconciler.repair(&report, RepairOptions::apply(), &time, &mut events).unwrap();
        assert_eq!(
            outcome.awaiting_confirmation,
            vec![RepairAction::DeleteOrphan { installment_id: stray_id }]
        );
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Pending);
        assert!(store.installment(stray_id).unwrap().is_some());

        let outcome = reconciler
            .repair(&report, RepairOptions::apply_confirmed(), &time, &mut events)
            .unwrap();
        assert!(outcome.applied.contains(&RepairAction::DeleteOrphan { installment_id: stray_id }));
        assert!(store.installment(stray_id).unwrap().is_none());
        assert!(reconciler.scan(&time).unwrap().is_clean());
    }

    #[test]
    fn test_cleanup_requires_confirmation() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let reconciler = Reconciler::new(&store, &config);
        let mut events = EventStore::new();

        let err = reconciler
            .cleanup_orphans(RepairOptions::apply(), &time, &mut events)
            .unwrap_err();
        assert_eq!(err, PlanError::ConfirmationRequired);
        assert!(reconciler
            .cleanup_orphans(RepairOptions::default(), &time, &mut events)
            .is_ok());
    }

    #[test]
    fn test_paid_orphan_needs_review() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (_, mut stray) = rows(1);
        stray[0].settle(start(), &[]);
        store.insert_installment(stray[0].clone()).unwrap();

        let reconciler = Reconciler::new(&store, &config);
        let report = reconciler.scan(&time).unwrap();
        let mut events = EventStore::new();
        let outcome = reconciler
            .repair(&report, RepairOptions::apply_confirmed(), &time, &mut events)
            .unwrap();
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.needs_review.len(), 1);
        assert!(store.installment(stray[0].id).unwrap().is_some());
    }
}
