use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// unique identifier for a plan
pub type PlanId = Uuid;

/// unique identifier for a parent payment aggregate
pub type PaymentId = Uuid;

/// unique identifier for an installment
pub type InstallmentId = Uuid;

/// unique identifier for a guardian
pub type ParentId = Uuid;

/// record families held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Plan,
    Payment,
    Installment,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Plan => "plan",
            RecordKind::Payment => "payment",
            RecordKind::Installment => "installment",
        };
        f.write_str(name)
    }
}

/// plan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// schedule in progress
    Active,
    /// every installment paid
    Completed,
    /// withdrawn by an administrator
    Cancelled,
}

impl PlanStatus {
    /// counted toward committed revenue
    pub fn is_committed(&self) -> bool {
        matches!(self, PlanStatus::Active | PlanStatus::Completed)
    }
}

/// parent payment aggregate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Overdue,
    Failed,
    Cancelled,
}

/// installment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentStatus {
    /// scheduled, not yet due or not yet swept
    Pending,
    /// settled
    Paid,
    /// due date passed without settlement
    Overdue,
    /// processor declined a charge, awaiting retry
    Failed,
}

impl InstallmentStatus {
    pub fn is_paid(&self) -> bool {
        matches!(self, InstallmentStatus::Paid)
    }

    pub fn is_open(&self) -> bool {
        !self.is_paid()
    }
}

/// progress of the multi-step plan creation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationStage {
    /// plan record written
    Started,
    /// aggregate written
    PaymentCreated,
    /// every installment written
    ScheduleGenerated,
    /// statuses derived
    Complete,
}

/// how an installment was settled outside the processor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    BankTransfer,
    Card,
    Other(String),
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentMethod::Cash => f.write_str("cash"),
            PaymentMethod::Check => f.write_str("check"),
            PaymentMethod::BankTransfer => f.write_str("bank_transfer"),
            PaymentMethod::Card => f.write_str("card"),
            PaymentMethod::Other(name) => f.write_str(name),
        }
    }
}

/// who wins when a processor settlement arrives after a manual unmark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPrecedence {
    /// processor settlement always re-applies paid, suppression flags ignored
    ExternalAuthoritative,
    /// processor settlement re-applies paid unless the latest unmark asked to suppress it
    HonorSuppression,
}

impl Default for SettlementPrecedence {
    fn default() -> Self {
        SettlementPrecedence::HonorSuppression
    }
}
