pub mod memory;

use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::installment::Installment;
use crate::payment::ParentPayment;
use crate::plan::Plan;
use crate::types::{InstallmentId, ParentId, PaymentId, PlanId};

pub use memory::MemoryStore;

/// record mutation applied atomically by the store
pub type Patch<'a, T> = &'a mut dyn FnMut(&mut T) -> Result<()>;

/// backing document store
///
/// Every call is atomic on its own. Nothing is atomic across calls, so
/// callers build multi-step sequences out of re-runnable steps.
/// `update_*` runs the patch against the current record under the store's
/// write lock and commits only when the patch returns `Ok`.
pub trait Store: Send + Sync {
    // plans
    fn insert_plan(&self, plan: Plan) -> Result<()>;
    fn plan(&self, id: PlanId) -> Result<Option<Plan>>;
    fn update_plan(&self, id: PlanId, patch: Patch<'_, Plan>) -> Result<Plan>;
    fn delete_plan(&self, id: PlanId) -> Result<bool>;
    fn plans(&self) -> Result<Vec<Plan>>;

    // parent payment aggregates
    fn insert_payment(&self, payment: ParentPayment) -> Result<()>;
    fn payment(&self, id: PaymentId) -> Result<Option<ParentPayment>>;
    fn update_payment(&self, id: PaymentId, patch: Patch<'_, ParentPayment>)
        -> Result<ParentPayment>;
    fn delete_payment(&self, id: PaymentId) -> Result<bool>;
    fn payments(&self) -> Result<Vec<ParentPayment>>;

    // installments
    fn insert_installment(&self, installment: Installment) -> Result<()>;
    fn installment(&self, id: InstallmentId) -> Result<Option<Installment>>;
    fn update_installment(
        &self,
        id: InstallmentId,
        patch: Patch<'_, Installment>,
    ) -> Result<Installment>;
    fn delete_installment(&self, id: InstallmentId) -> Result<bool>;
    fn installments(&self) -> Result<Vec<Installment>>;

    /// one consistent snapshot, ordered by index
    fn installments_for_payment(&self, payment_id: PaymentId) -> Result<Vec<Installment>>;
    fn installments_for_plan(&self, plan_id: PlanId) -> Result<Vec<Installment>>;
    fn installments_for_parent(&self, parent_id: ParentId) -> Result<Vec<Installment>>;
    /// pending installments with `due_date < cutoff`
    fn pending_due_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Installment>>;
    /// installments still flagged in grace whose window ended at or before `cutoff`
    fn grace_ended_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Installment>>;
    /// installments with `from <= due_date < to`, any status
    fn installments_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Installment>>;
    fn installment_by_external_ref(&self, reference: &str) -> Result<Option<Installment>>;
}
