use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::{ParentId, PaymentId, PaymentStatus, PlanId};

/// umbrella due record for one parent obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentPayment {
    pub id: PaymentId,
    pub parent_id: ParentId,
    pub plan_id: Option<PlanId>,
    /// equals the plan total when plan-backed
    pub amount: Money,
    /// first due date
    pub due_date: DateTime<Utc>,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    /// free text for people; structured data lives on installments
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParentPayment {
    pub fn new(
        id: PaymentId,
        parent_id: ParentId,
        plan_id: Option<PlanId>,
        amount: Money,
        due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent_id,
            plan_id,
            amount,
            due_date,
            status: PaymentStatus::Pending,
            paid_at: None,
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == PaymentStatus::Cancelled
    }
}
