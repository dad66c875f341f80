use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::{
    InstallmentId, ParentId, PaymentId, PaymentMethod, PaymentStatus, PlanId,
    PlanStatus, RecordKind,
};

/// all events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // lifecycle events
    PlanCreated {
        plan_id: PlanId,
        parent_id: ParentId,
        total_amount: Money,
        installment_count: u32,
        timestamp: DateTime<Utc>,
    },
    ScheduleGenerated {
        payment_id: PaymentId,
        installments: u32,
        total_amount: Money,
        timestamp: DateTime<Utc>,
    },
    PlanCancelled {
        plan_id: PlanId,
        timestamp: DateTime<Utc>,
    },
    RecordDeleted {
        kind: RecordKind,
        id: uuid::Uuid,
        timestamp: DateTime<Utc>,
    },

    // installment events
    InstallmentPaid {
        installment_id: InstallmentId,
        payment_id: PaymentId,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    InstallmentOverdue {
        installment_id: InstallmentId,
        payment_id: PaymentId,
        due_date: DateTime<Utc>,
        grace_ends_at: DateTime<Utc>,
    },
    GracePeriodExpired {
        installment_id: InstallmentId,
        timestamp: DateTime<Utc>,
    },
    InstallmentFailed {
        installment_id: InstallmentId,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    InstallmentRetried {
        installment_id: InstallmentId,
        timestamp: DateTime<Utc>,
    },
    ReminderRecorded {
        installment_id: InstallmentId,
        reminders_sent: u32,
        timestamp: DateTime<Utc>,
    },

    // manual override events
    ManualPaymentRecorded {
        installment_id: InstallmentId,
        method: PaymentMethod,
        actor: String,
        timestamp: DateTime<Utc>,
    },
    ManualPaymentReverted {
        installment_id: InstallmentId,
        actor: String,
        suppress_reapply: bool,
        timestamp: DateTime<Utc>,
    },
    ProcessorSettlementSuppressed {
        installment_id: InstallmentId,
        external_ref: String,
        timestamp: DateTime<Utc>,
    },

    // derived status events
    PaymentStatusChanged {
        payment_id: PaymentId,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
        timestamp: DateTime<Utc>,
    },
    PlanStatusChanged {
        plan_id: PlanId,
        old_status: PlanStatus,
        new_status: PlanStatus,
        timestamp: DateTime<Utc>,
    },

    // reconciliation events
    RepairApplied {
        description: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// installment the event concerns, if any
    pub fn installment_id(&self) -> Option<InstallmentId> {
        match self {
            Event::InstallmentPaid { installment_id, .. }
            | Event::InstallmentOverdue { installment_id, .. }
            | Event::GracePeriodExpired { installment_id, .. }
            | Event::InstallmentFailed { installment_id, .. }
            | Event::InstallmentRetried { installment_id, .. }
            | Event::ReminderRecorded { installment_id, .. }
            | Event::ManualPaymentRecorded { installment_id, .. }
            | Event::ManualPaymentReverted { installment_id, .. }
            | Event::ProcessorSettlementSuppressed { installment_id, .. } => Some(*installment_id),
            _ => None,
        }
    }
}

/// event store for collecting events during operations
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
