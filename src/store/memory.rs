use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::errors::{PlanError, Result};
use crate::installment::Installment;
use crate::payment::ParentPayment;
use crate::plan::Plan;
use crate::store::{Patch, Store};
use crate::types::{InstallmentId, InstallmentStatus, ParentId, PaymentId, PlanId, RecordKind};

#[derive(Debug, Default)]
struct Tables {
    plans: HashMap<PlanId, Plan>,
    payments: HashMap<PaymentId, ParentPayment>,
    installments: HashMap<InstallmentId, Installment>,
}

/// in-process store used by tests, demos and single-node deployments
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn filtered<F>(&self, predicate: F) -> Vec<Installment>
    where
        F: Fn(&Installment) -> bool,
    {
        let tables = self.tables.read();
        let mut rows: Vec<Installment> = tables
            .installments
            .values()
            .filter(|i| predicate(i))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.payment_id
                .cmp(&b.payment_id)
                .then(a.index.cmp(&b.index))
                .then(a.due_date.cmp(&b.due_date))
        });
        rows
    }
}

fn apply_patch<T: Clone>(
    record: Option<&mut T>,
    kind: RecordKind,
    id: uuid::Uuid,
    patch: Patch<'_, T>,
) -> Result<T> {
    let record = record.ok_or(PlanError::NotFound { kind, id })?;
    let mut draft = record.clone();
    patch(&mut draft)?;
    *record = draft.clone();
    Ok(draft)
}

impl Store for MemoryStore {
    fn insert_plan(&self, plan: Plan) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.plans.contains_key(&plan.id) {
            return Err(PlanError::AlreadyExists {
                kind: RecordKind::Plan,
                id: plan.id,
            });
        }
        tables.plans.insert(plan.id, plan);
        Ok(())
    }

    fn plan(&self, id: PlanId) -> Result<Option<Plan>> {
        Ok(self.tables.read().plans.get(&id).cloned())
    }

    fn update_plan(&self, id: PlanId, patch: Patch<'_, Plan>) -> Result<Plan> {
        let mut tables = self.tables.write();
        apply_patch(tables.plans.get_mut(&id), RecordKind::Plan, id, patch)
    }

    fn delete_plan(&self, id: PlanId) -> Result<bool> {
        Ok(self.tables.write().plans.remove(&id).is_some())
    }

    fn plans(&self) -> Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = self.tables.read().plans.values().cloned().collect();
        plans.sort_by_key(|p| (p.created_at, p.id));
        Ok(plans)
    }

    fn insert_payment(&self, payment: ParentPayment) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.payments.contains_key(&payment.id) {
            return Err(PlanError::AlreadyExists {
                kind: RecordKind::Payment,
                id: payment.id,
            });
        }
        tables.payments.insert(payment.id, payment);
        Ok(())
    }

    fn payment(&self, id: PaymentId) -> Result<Option<ParentPayment>> {
        Ok(self.tables.read().payments.get(&id).cloned())
    }

    fn update_payment(
        &self,
        id: PaymentId,
        patch: Patch<'_, ParentPayment>,
    ) -> Result<ParentPayment> {
        let mut tables = self.tables.write();
        apply_patch(tables.payments.get_mut(&id), RecordKind::Payment, id, patch)
    }

    fn delete_payment(&self, id: PaymentId) -> Result<bool> {
        Ok(self.tables.write().payments.remove(&id).is_some())
    }

    fn payments(&self) -> Result<Vec<ParentPayment>> {
        let mut payments: Vec<ParentPayment> =
            self.tables.read().payments.values().cloned().collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        Ok(payments)
    }

    fn insert_installment(&self, installment: Installment) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.installments.contains_key(&installment.id) {
            return Err(PlanError::AlreadyExists {
                kind: RecordKind::Installment,
                id: installment.id,
            });
        }
        tables.installments.insert(installment.id, installment);
        Ok(())
    }

    fn installment(&self, id: InstallmentId) -> Result<Option<Installment>> {
        Ok(self.tables.read().installments.get(&id).cloned())
    }

    fn update_installment(
        &self,
        id: InstallmentId,
        patch: Patch<'_, Installment>,
    ) -> Result<Installment> {
        let mut tables = self.tables.write();
        apply_patch(
            tables.installments.get_mut(&id),
            RecordKind::Installment,
            id,
            patch,
        )
    }

    fn delete_installment(&self, id: InstallmentId) -> Result<bool> {
        Ok(self.tables.write().installments.remove(&id).is_some())
    }

    fn installments(&self) -> Result<Vec<Installment>> {
        Ok(self.filtered(|_| true))
    }

    fn installments_for_payment(&self, payment_id: PaymentId) -> Result<Vec<Installment>> {
        Ok(self.filtered(|i| i.payment_id == payment_id))
    }

    fn installments_for_plan(&self, plan_id: PlanId) -> Result<Vec<Installment>> {
        Ok(self.filtered(|i| i.plan_id == Some(plan_id)))
    }

    fn installments_for_parent(&self, parent_id: ParentId) -> Result<Vec<Installment>> {
        Ok(self.filtered(|i| i.parent_id == parent_id))
    }

    fn pending_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Installment>> {
        Ok(self.filtered(|i| i.status == InstallmentStatus::Pending && i.due_date < cutoff))
    }

    fn grace_ended_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Installment>> {
        Ok(self.filtered(|i| {
            i.in_grace_period && i.grace_period_end.map(|end| end <= cutoff).unwrap_or(false)
        }))
    }

    fn installments_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Installment>> {
        Ok(self.filtered(|i| i.due_date >= from && i.due_date < to))
    }

    fn installment_by_external_ref(&self, reference: &str) -> Result<Option<Installment>> {
        let tables = self.tables.read();
        Ok(tables
            .installments
            .values()
            .find(|i| i.external_refs.iter().any(|r| r == reference))
            .cloned())
    }
}
