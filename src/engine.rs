use chrono::{DateTime, Duration, Utc};
use hourglass_rs::SafeTimeProvider;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::decimal::Money;
use crate::deletion::{self, DeletionSummary};
use crate::errors::{PlanError, Result};
use crate::events::{Event, EventStore};
use crate::installment::Installment;
use crate::lifecycle::{InstallmentLedger, InstallmentUpdate};
use crate::overrides::{ManualOverride, ManualStatusRequest};
use crate::payment::ParentPayment;
use crate::plan::{Plan, PlanTerms};
use crate::processor::{ProcessorEvent, ProcessorEvents, ProcessorOutcome};
use crate::reconcile::{Issue, Reconciler, ReconciliationReport, RepairOptions, RepairOutcome};
use crate::revenue::{PaymentProgress, RevenueAggregator, RevenueReport, RevenueSummary};
use crate::schedule::{ScheduleGenerator, ScheduleRequest};
use crate::store::Store;
use crate::sweeper::{OverdueSweeper, SweepReport};
use crate::types::{
    CreationStage, InstallmentId, ParentId, PaymentId, PaymentStatus, PlanId, PlanStatus,
    RecordKind,
};

/// records written by a completed creation sequence
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedPlan {
    pub plan: Plan,
    pub payment: ParentPayment,
    pub installment_ids: Vec<InstallmentId>,
}

/// entry point for plan and installment operations
///
/// Holds no locks across store calls. Every operation is a sequence of
/// individually atomic store writes; statuses are re-derived after each
/// installment change and the reconciler repairs sequences cut short.
pub struct PaymentPlanEngine<S: Store> {
    store: S,
    config: EngineConfig,
    events: Mutex<EventStore>,
}

impl<S: Store> PaymentPlanEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            events: Mutex::new(EventStore::new()),
        })
    }

    pub fn with_defaults(store: S) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            events: Mutex::new(EventStore::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// drain the audit log
    pub fn take_events(&self) -> Vec<Event> {
        self.events.lock().take_events()
    }

    /// copy of the audit log
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().events().to_vec()
    }

    // events emitted before a failure are still recorded
    fn with_events<T>(&self, op: impl FnOnce(&mut EventStore) -> Result<T>) -> Result<T> {
        let mut local = EventStore::new();
        let result = op(&mut local);
        if !local.is_empty() {
            self.events.lock().extend(local.take_events());
        }
        result
    }

    fn ledger(&self) -> InstallmentLedger<'_, S> {
        InstallmentLedger::new(&self.store, &self.config)
    }

    fn reconciler(&self) -> Reconciler<'_, S> {
        Reconciler::new(&self.store, &self.config)
    }

    // ---- creation ----

    /// open a plan: plan, aggregate, schedule, derived status
    ///
    /// Each step records its stage on the plan. When a step fails the
    /// records written so far stay in place, `scan` reports them as a
    /// stalled creation and `repair` or `resume_creation` finishes or
    /// rolls back the sequence.
    pub fn create_plan(
        &self,
        terms: PlanTerms,
        time_provider: &SafeTimeProvider,
    ) -> Result<CreatedPlan> {
        terms.validate(self.config.amount_tolerance)?;
        let now = time_provider.now();
        let payment_id = Uuid::new_v4();
        let plan = Plan::from_terms(terms, payment_id, now);
        // every line must be computable before the first write
        let request = ScheduleRequest::for_plan(&plan, payment_id, &self.config);
        ScheduleGenerator::lines(&request)?;

        self.with_events(|events| {
            let plan_id = plan.id;
            self.store.insert_plan(plan.clone())?;
            info!(
                %plan_id,
                parent_id = %plan.parent_id,
                total = %plan.total_amount,
                installments = plan.installment_count,
                "plan created"
            );
            events.emit(Event::PlanCreated {
                plan_id,
                parent_id: plan.parent_id,
                total_amount: plan.total_amount,
                installment_count: plan.installment_count,
                timestamp: now,
            });

            let payment = ParentPayment::new(
                payment_id,
                plan.parent_id,
                Some(plan_id),
                plan.total_amount,
                plan.start_date,
                now,
            );
            self.store.insert_payment(payment)?;
            self.advance(plan_id, CreationStage::PaymentCreated, now)?;

            let installment_ids = ScheduleGenerator::generate(&self.store, &request, time_provider)?;
            self.advance(plan_id, CreationStage::ScheduleGenerated, now)?;
            events.emit(Event::ScheduleGenerated {
                payment_id,
                installments: installment_ids.len() as u32,
                total_amount: plan.total_amount,
                timestamp: now,
            });

            let payment = self
                .reconciler()
                .reconcile_payment(payment_id, time_provider, events)?;
            let plan = self.advance(plan_id, CreationStage::Complete, now)?;

            Ok(CreatedPlan {
                plan,
                payment,
                installment_ids,
            })
        })
    }

    fn advance(&self, plan_id: PlanId, stage: CreationStage, now: DateTime<Utc>) -> Result<Plan> {
        self.store.update_plan(plan_id, &mut |p| {
            p.advance_stage(stage, now);
            Ok(())
        })
    }

    /// finish an interrupted creation sequence in place
    pub fn resume_creation(
        &self,
        plan_id: PlanId,
        time_provider: &SafeTimeProvider,
    ) -> Result<RepairOutcome> {
        let plan = self.require_plan(plan_id)?;
        let report = ReconciliationReport {
            scanned_at: time_provider.now(),
            plans_scanned: 1,
            issues: vec![Issue::StalledCreation {
                plan_id,
                stage: plan.creation_stage,
            }],
            ..ReconciliationReport::default()
        };
        self.with_events(|events| {
            self.reconciler()
                .repair(&report, RepairOptions::apply(), time_provider, events)
        })
    }

    /// payment without a plan, backed by a single unsettled installment
    pub fn create_one_off_payment(
        &self,
        parent_id: ParentId,
        amount: Money,
        due_date: DateTime<Utc>,
        time_provider: &SafeTimeProvider,
    ) -> Result<ParentPayment> {
        if !amount.is_positive() {
            return Err(PlanError::InvalidAmount { amount });
        }
        let now = time_provider.now();
        self.with_events(|events| {
            let payment = ParentPayment::new(Uuid::new_v4(), parent_id, None, amount, due_date, now);
            let payment_id = payment.id;
            self.store.insert_payment(payment)?;

            let request = ScheduleRequest {
                payment_id,
                parent_id,
                plan_id: None,
                total_amount: amount,
                installment_amount: amount,
                installment_count: 1,
                cadence_months: 1,
                start_date: due_date,
                custom_lines: None,
                settle_first: false,
                amount_tolerance: self.config.amount_tolerance,
            };
            ScheduleGenerator::generate(&self.store, &request, time_provider)?;
            events.emit(Event::ScheduleGenerated {
                payment_id,
                installments: 1,
                total_amount: amount,
                timestamp: now,
            });
            info!(%payment_id, %parent_id, %amount, "one-off payment created");
            self.reconciler()
                .reconcile_payment(payment_id, time_provider, events)
        })
    }

    /// stop an active plan; its aggregate is cancelled with it
    pub fn cancel_plan(&self, plan_id: PlanId, time_provider: &SafeTimeProvider) -> Result<Plan> {
        let plan = self.require_plan(plan_id)?;
        match plan.status {
            PlanStatus::Cancelled => return Ok(plan),
            PlanStatus::Completed => {
                return Err(PlanError::PlanNotModifiable {
                    id: plan_id,
                    status: plan.status,
                })
            }
            PlanStatus::Active => {}
        }
        let now = time_provider.now();

        self.with_events(|events| {
            let plan = self.store.update_plan(plan_id, &mut |p| {
                if p.status == PlanStatus::Completed {
                    return Err(PlanError::PlanNotModifiable {
                        id: p.id,
                        status: p.status,
                    });
                }
                p.status = PlanStatus::Cancelled;
                p.updated_at = now;
                Ok(())
            })?;
            events.emit(Event::PlanStatusChanged {
                plan_id,
                old_status: PlanStatus::Active,
                new_status: PlanStatus::Cancelled,
                timestamp: now,
            });
            events.emit(Event::PlanCancelled {
                plan_id,
                timestamp: now,
            });

            if let Some(payment_id) = plan.payment_id {
                if let Some(payment) = self.store.payment(payment_id)? {
                    if !payment.is_cancelled() {
                        self.store.update_payment(payment_id, &mut |p| {
                            p.status = PaymentStatus::Cancelled;
                            p.updated_at = now;
                            Ok(())
                        })?;
                        events.emit(Event::PaymentStatusChanged {
                            payment_id,
                            old_status: payment.status,
                            new_status: PaymentStatus::Cancelled,
                            timestamp: now,
                        });
                    }
                }
            }
            info!(%plan_id, "plan cancelled");
            Ok(plan)
        })
    }

    // ---- installment state machine ----

    pub fn mark_paid(
        &self,
        installment_id: InstallmentId,
        external_refs: &[String],
        time_provider: &SafeTimeProvider,
    ) -> Result<InstallmentUpdate> {
        self.with_events(|events| {
            self.ledger()
                .mark_paid(installment_id, external_refs, time_provider, events)
        })
    }

    pub fn mark_overdue(
        &self,
        installment_id: InstallmentId,
        time_provider: &SafeTimeProvider,
    ) -> Result<InstallmentUpdate> {
        self.with_events(|events| self.ledger().mark_overdue(installment_id, time_provider, events))
    }

    pub fn mark_failed(
        &self,
        installment_id: InstallmentId,
        reason: Option<String>,
        time_provider: &SafeTimeProvider,
    ) -> Result<InstallmentUpdate> {
        self.with_events(|events| {
            self.ledger()
                .mark_failed(installment_id, reason, time_provider, events)
        })
    }

    pub fn retry_failed(
        &self,
        installment_id: InstallmentId,
        time_provider: &SafeTimeProvider,
    ) -> Result<InstallmentUpdate> {
        self.with_events(|events| self.ledger().retry_failed(installment_id, time_provider, events))
    }

    pub fn increment_reminder(
        &self,
        installment_id: InstallmentId,
        time_provider: &SafeTimeProvider,
    ) -> Result<Installment> {
        self.with_events(|events| {
            self.ledger()
                .record_reminder(installment_id, time_provider, events)
        })
    }

    pub fn set_manual_status(
        &self,
        request: &ManualStatusRequest,
        time_provider: &SafeTimeProvider,
    ) -> Result<InstallmentUpdate> {
        self.with_events(|events| {
            ManualOverride::new(&self.store, &self.config).set_manual_status(
                request,
                time_provider,
                events,
            )
        })
    }

    pub fn handle_processor_event(
        &self,
        event: &ProcessorEvent,
        time_provider: &SafeTimeProvider,
    ) -> Result<ProcessorOutcome> {
        self.with_events(|events| {
            ProcessorEvents::new(&self.store, &self.config).handle(event, time_provider, events)
        })
    }

    pub fn sweep(&self, time_provider: &SafeTimeProvider) -> Result<SweepReport> {
        self.with_events(|events| {
            OverdueSweeper::new(&self.store, &self.config).sweep(time_provider, events)
        })
    }

    // ---- reconciliation ----

    pub fn reconcile_payment(
        &self,
        payment_id: PaymentId,
        time_provider: &SafeTimeProvider,
    ) -> Result<ParentPayment> {
        self.with_events(|events| {
            self.reconciler()
                .reconcile_payment(payment_id, time_provider, events)
        })
    }

    pub fn scan(&self, time_provider: &SafeTimeProvider) -> Result<ReconciliationReport> {
        self.reconciler().scan(time_provider)
    }

    pub fn repair(
        &self,
        report: &ReconciliationReport,
        options: RepairOptions,
        time_provider: &SafeTimeProvider,
    ) -> Result<RepairOutcome> {
        self.with_events(|events| {
            self.reconciler()
                .repair(report, options, time_provider, events)
        })
    }

    pub fn cleanup_orphans(
        &self,
        options: RepairOptions,
        time_provider: &SafeTimeProvider,
    ) -> Result<RepairOutcome> {
        self.with_events(|events| {
            self.reconciler()
                .cleanup_orphans(options, time_provider, events)
        })
    }

    // ---- deletion ----

    pub fn delete_plan(
        &self,
        plan_id: PlanId,
        time_provider: &SafeTimeProvider,
    ) -> Result<DeletionSummary> {
        self.with_events(|events| deletion::delete_plan(&self.store, plan_id, time_provider, events))
    }

    pub fn delete_payment(
        &self,
        payment_id: PaymentId,
        time_provider: &SafeTimeProvider,
    ) -> Result<DeletionSummary> {
        self.with_events(|events| {
            deletion::delete_payment(&self.store, payment_id, time_provider, events)
        })
    }

    // ---- reads ----

    pub fn plan(&self, plan_id: PlanId) -> Result<Option<Plan>> {
        self.store.plan(plan_id)
    }

    pub fn payment(&self, payment_id: PaymentId) -> Result<Option<ParentPayment>> {
        self.store.payment(payment_id)
    }

    pub fn installments_for_payment(&self, payment_id: PaymentId) -> Result<Vec<Installment>> {
        self.store.installments_for_payment(payment_id)
    }

    pub fn installments_for_parent(&self, parent_id: ParentId) -> Result<Vec<Installment>> {
        self.store.installments_for_parent(parent_id)
    }

    /// progress from a single snapshot of the aggregate's installments
    pub fn payment_progress(&self, payment_id: PaymentId) -> Result<PaymentProgress> {
        let payment = self.store.payment(payment_id)?.ok_or(PlanError::NotFound {
            kind: RecordKind::Payment,
            id: payment_id,
        })?;
        let installments = self.store.installments_for_payment(payment_id)?;
        Ok(PaymentProgress::from_snapshot(&payment, &installments))
    }

    /// unpaid installments due within `days` from now, for reminder senders
    pub fn upcoming_installments(
        &self,
        days: i64,
        time_provider: &SafeTimeProvider,
    ) -> Result<Vec<Installment>> {
        let now = time_provider.now();
        Ok(self
            .store
            .installments_due_between(now, now + Duration::days(days))?
            .into_iter()
            .filter(|i| i.status.is_open())
            .collect())
    }

    pub fn revenue(&self, time_provider: &SafeTimeProvider) -> Result<RevenueSummary> {
        let plans = self.store.plans()?;
        let installments = self.store.installments()?;
        Ok(RevenueAggregator::compute(
            &plans,
            &installments,
            time_provider.now(),
        ))
    }

    pub fn revenue_report(&self, time_provider: &SafeTimeProvider) -> Result<RevenueReport> {
        let summary = self.revenue(time_provider)?;
        Ok(RevenueReport::from_summary(&summary, time_provider.now()))
    }

    fn require_plan(&self, plan_id: PlanId) -> Result<Plan> {
        self.store.plan(plan_id)?.ok_or_else(|| {
            warn!(%plan_id, "plan not found");
            PlanError::NotFound {
                kind: RecordKind::Plan,
                id: plan_id,
            }
        })
    }
}
