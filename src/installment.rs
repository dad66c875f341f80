use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::errors::{PlanError, Result};
use crate::types::{
    InstallmentId, InstallmentStatus, ParentId, PaymentId, PaymentMethod, PlanId,
};

/// one scheduled due
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub id: InstallmentId,
    pub payment_id: PaymentId,
    pub parent_id: ParentId,
    pub plan_id: Option<PlanId>,

    // position in series, 1-based
    pub index: u32,
    pub total_in_series: u32,

    pub amount: Money,
    pub due_date: DateTime<Utc>,
    pub status: InstallmentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    /// first settlement, kept through later unmarks
    #[serde(default)]
    pub first_paid_at: Option<DateTime<Utc>>,

    // grace window opened by the overdue transition
    pub in_grace_period: bool,
    pub grace_period_end: Option<DateTime<Utc>>,

    // reminder bookkeeping, written only by record_reminder
    pub reminders_sent: u32,
    pub last_reminder_sent: Option<DateTime<Utc>>,

    /// processor references (checkout session, payment intent, charge)
    pub external_refs: Vec<String>,
    pub failure_count: u32,
    pub last_failure_reason: Option<String>,

    pub metadata: InstallmentMetadata,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// structured side-channel attached to an installment
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstallmentMetadata {
    /// present while an administrator-recorded payment stands
    pub manual_payment: Option<ManualPayment>,
    /// append-only override history
    pub overrides: Vec<OverrideEvent>,
    /// administrator customization this installment was generated from
    pub schedule_line: Option<CustomScheduleLine>,
    /// processor event ids already applied, for duplicate delivery
    #[serde(default)]
    pub processor_events: Vec<String>,
    /// integration-specific values
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// payment collected outside the processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualPayment {
    pub at: DateTime<Utc>,
    pub method: PaymentMethod,
    pub note: String,
    pub actor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    MarkedPaid,
    Unmarked,
}

/// audit entry for a manual status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEvent {
    pub at: DateTime<Utc>,
    pub action: OverrideAction,
    pub method: Option<PaymentMethod>,
    pub note: String,
    pub actor: String,
    /// unmark only: later processor settlements must not re-apply paid
    pub suppress_reapply: bool,
}

/// administrator-defined schedule line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomScheduleLine {
    pub amount: Money,
    pub due_date: DateTime<Utc>,
    pub method: Option<PaymentMethod>,
    pub check_number: Option<String>,
}

/// result of applying a transition to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Unchanged,
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

impl Installment {
    /// new pending installment
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payment_id: PaymentId,
        parent_id: ParentId,
        plan_id: Option<PlanId>,
        index: u32,
        total_in_series: u32,
        amount: Money,
        due_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            payment_id,
            parent_id,
            plan_id,
            index,
            total_in_series,
            amount,
            due_date,
            status: InstallmentStatus::Pending,
            paid_at: None,
            first_paid_at: None,
            in_grace_period: false,
            grace_period_end: None,
            reminders_sent: 0,
            last_reminder_sent: None,
            external_refs: Vec::new(),
            failure_count: 0,
            last_failure_reason: None,
            metadata: InstallmentMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.status.is_paid()
    }

    /// settled now or at any point in the past
    pub fn was_ever_paid(&self) -> bool {
        self.is_paid()
            || self.paid_at.is_some()
            || self.first_paid_at.is_some()
            || self
                .metadata
                .overrides
                .iter()
                .any(|o| o.action == OverrideAction::MarkedPaid)
    }

    /// settled no later than the calendar day it was due
    pub fn paid_on_time(&self) -> bool {
        match (self.status, self.paid_at) {
            (InstallmentStatus::Paid, Some(paid_at)) => {
                paid_at.date_naive() <= self.due_date.date_naive()
            }
            _ => false,
        }
    }

    /// latest manual override entry
    pub fn last_override(&self) -> Option<&OverrideEvent> {
        self.metadata.overrides.last()
    }

    /// pending/overdue/failed -> paid; idempotent on paid
    pub fn settle(&mut self, now: DateTime<Utc>, external_refs: &[String]) -> Transition {
        let mut changed = false;
        for reference in external_refs {
            if !self.external_refs.contains(reference) {
                self.external_refs.push(reference.clone());
                changed = true;
            }
        }

        if !self.is_paid() {
            self.status = InstallmentStatus::Paid;
            self.paid_at = Some(now);
            if self.first_paid_at.is_none() {
                self.first_paid_at = Some(now);
            }
            self.in_grace_period = false;
            self.grace_period_end = None;
            changed = true;
        }

        if changed {
            self.updated_at = now;
            Transition::Applied
        } else {
            Transition::Unchanged
        }
    }

    /// pending -> overdue, opening the grace window
    pub fn mark_overdue(&mut self, now: DateTime<Utc>, grace: Duration) -> Transition {
        if self.status != InstallmentStatus::Pending {
            return Transition::Unchanged;
        }
        self.status = InstallmentStatus::Overdue;
        self.in_grace_period = true;
        self.grace_period_end = Some(now + grace);
        self.updated_at = now;
        Transition::Applied
    }

    /// close the grace window once its end has passed
    pub fn expire_grace(&mut self, now: DateTime<Utc>) -> Transition {
        match self.grace_period_end {
            Some(end) if self.in_grace_period && end <= now => {
                self.in_grace_period = false;
                self.updated_at = now;
                Transition::Applied
            }
            _ => Transition::Unchanged,
        }
    }

    /// processor declined a charge
    pub fn fail(&mut self, now: DateTime<Utc>, reason: Option<String>) -> Result<Transition> {
        match self.status {
            InstallmentStatus::Paid => Err(PlanError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: InstallmentStatus::Failed,
            }),
            InstallmentStatus::Failed => Ok(Transition::Unchanged),
            InstallmentStatus::Pending | InstallmentStatus::Overdue => {
                self.status = InstallmentStatus::Failed;
                self.failure_count += 1;
                self.last_failure_reason = reason;
                self.in_grace_period = false;
                self.updated_at = now;
                Ok(Transition::Applied)
            }
        }
    }

    /// failed -> pending so the charge can be retried
    pub fn retry(&mut self, now: DateTime<Utc>) -> Result<Transition> {
        match self.status {
            InstallmentStatus::Failed => {
                self.status = InstallmentStatus::Pending;
                self.grace_period_end = None;
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            InstallmentStatus::Pending => Ok(Transition::Unchanged),
            from => Err(PlanError::InvalidTransition {
                id: self.id,
                from,
                to: InstallmentStatus::Pending,
            }),
        }
    }

    /// touches reminder fields only
    pub fn record_reminder(&mut self, now: DateTime<Utc>) {
        self.reminders_sent += 1;
        self.last_reminder_sent = Some(now);
    }

    /// administrator records an off-processor payment
    pub fn apply_manual_payment(&mut self, payment: ManualPayment) -> Transition {
        let now = payment.at;
        self.metadata.overrides.push(OverrideEvent {
            at: now,
            action: OverrideAction::MarkedPaid,
            method: Some(payment.method.clone()),
            note: payment.note.clone(),
            actor: payment.actor.clone(),
            suppress_reapply: false,
        });
        self.metadata.manual_payment = Some(payment);
        self.settle(now, &[]);
        self.updated_at = now;
        Transition::Applied
    }

    /// administrator reverts a payment; only the manual payment entry is removed
    pub fn revert_manual_payment(
        &mut self,
        now: DateTime<Utc>,
        note: String,
        actor: String,
        suppress_reapply: bool,
    ) -> Transition {
        if !self.is_paid() && self.metadata.manual_payment.is_none() {
            return Transition::Unchanged;
        }
        self.metadata.manual_payment = None;
        self.metadata.overrides.push(OverrideEvent {
            at: now,
            action: OverrideAction::Unmarked,
            method: None,
            note,
            actor,
            suppress_reapply,
        });
        // the next sweep re-opens overdue state if the due date has passed
        self.status = InstallmentStatus::Pending;
        self.in_grace_period = false;
        self.grace_period_end = None;
        self.paid_at = None;
        self.updated_at = now;
        Transition::Applied
    }

    /// `status == paid` exactly when `paid_at` is set
    pub fn paid_state_consistent(&self) -> bool {
        self.is_paid() == self.paid_at.is_some()
    }
}
