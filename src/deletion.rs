use hourglass_rs::SafeTimeProvider;
use tracing::{info, warn};

use crate::errors::{PlanError, Result};
use crate::events::{Event, EventStore};
use crate::installment::Installment;
use crate::store::Store;
use crate::types::{PaymentId, PaymentStatus, PlanId, RecordKind};

/// records removed by a cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeletionSummary {
    pub installments: usize,
    pub payments: usize,
    pub plans: usize,
}

fn guard(kind: RecordKind, id: uuid::Uuid, installments: &[Installment]) -> Result<()> {
    let paid = installments.iter().filter(|i| i.was_ever_paid()).count();
    if paid > 0 {
        warn!(%kind, %id, paid, "deletion rejected, installments have been paid");
        return Err(PlanError::HasPaidInstallments { kind, id, paid });
    }
    Ok(())
}

/// delete a plan together with its aggregate and installments
///
/// Installments go first, then the aggregate, then the plan, so an
/// interrupted delete never leaves a dangling installment and re-running
/// it finishes the job.
pub fn delete_plan<S: Store + ?Sized>(
    store: &S,
    plan_id: PlanId,
    time_provider: &SafeTimeProvider,
    events: &mut EventStore,
) -> Result<DeletionSummary> {
    let plan = store.plan(plan_id)?.ok_or(PlanError::NotFound {
        kind: RecordKind::Plan,
        id: plan_id,
    })?;

    let mut installments = store.installments_for_plan(plan_id)?;
    if let Some(payment_id) = plan.payment_id {
        for inst in store.installments_for_payment(payment_id)? {
            if !installments.iter().any(|i| i.id == inst.id) {
                installments.push(inst);
            }
        }
        if let Some(payment) = store.payment(payment_id)? {
            if payment.status == PaymentStatus::Paid {
                return Err(PlanError::HasPaidInstallments {
                    kind: RecordKind::Plan,
                    id: plan_id,
                    paid: installments.iter().filter(|i| i.was_ever_paid()).count().max(1),
                });
            }
        }
    }
    guard(RecordKind::Plan, plan_id, &installments)?;

    let now = time_provider.now();
    let mut summary = remove_installments(store, &installments, now, events)?;
    if let Some(payment_id) = plan.payment_id {
        if store.delete_payment(payment_id)? {
            summary.payments += 1;
            events.emit(Event::RecordDeleted {
                kind: RecordKind::Payment,
                id: payment_id,
                timestamp: now,
            });
        }
    }
    if store.delete_plan(plan_id)? {
        summary.plans += 1;
        events.emit(Event::RecordDeleted {
            kind: RecordKind::Plan,
            id: plan_id,
            timestamp: now,
        });
    }

    info!(
        %plan_id,
        installments = summary.installments,
        payments = summary.payments,
        "plan deleted"
    );
    Ok(summary)
}

/// delete an aggregate; a plan-backed aggregate takes its plan with it
pub fn delete_payment<S: Store + ?Sized>(
    store: &S,
    payment_id: PaymentId,
    time_provider: &SafeTimeProvider,
    events: &mut EventStore,
) -> Result<DeletionSummary> {
    let payment = store.payment(payment_id)?.ok_or(PlanError::NotFound {
        kind: RecordKind::Payment,
        id: payment_id,
    })?;

    if let Some(plan_id) = payment.plan_id {
        if store.plan(plan_id)?.is_some() {
            return delete_plan(store, plan_id, time_provider, events);
        }
    }

    let installments = store.installments_for_payment(payment_id)?;
    if payment.status == PaymentStatus::Paid {
        return Err(PlanError::HasPaidInstallments {
            kind: RecordKind::Payment,
            id: payment_id,
            paid: installments.iter().filter(|i| i.was_ever_paid()).count().max(1),
        });
    }
    guard(RecordKind::Payment, payment_id, &installments)?;

    let now = time_provider.now();
    let mut summary = remove_installments(store, &installments, now, events)?;
    if store.delete_payment(payment_id)? {
        summary.payments += 1;
        events.emit(Event::RecordDeleted {
            kind: RecordKind::Payment,
            id: payment_id,
            timestamp: now,
        });
    }
    info!(%payment_id, installments = summary.installments, "payment deleted");
    Ok(summary)
}

fn remove_installments<S: Store + ?Sized>(
    store: &S,
    installments: &[Installment],
    now: chrono::DateTime<chrono::Utc>,
    events: &mut EventStore,
) -> Result<DeletionSummary> {
    let mut summary = DeletionSummary::default();
    for inst in installments {
        if store.delete_installment(inst.id)? {
            summary.installments += 1;
            events.emit(Event::RecordDeleted {
                kind: RecordKind::Installment,
                id: inst.id,
                timestamp: now,
            });
        }
    }
    Ok(summary)
}
