use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::decimal::Money;
use crate::types::{InstallmentStatus, PlanStatus, RecordKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("invalid installment count: {count}")]
    InvalidInstallmentCount {
        count: u32,
    },

    #[error("invalid amount: {amount}")]
    InvalidAmount {
        amount: Money,
    },

    #[error("invalid cadence: {months} months")]
    InvalidCadence {
        months: u32,
    },

    #[error("installments do not cover total: expected {expected}, scheduled {scheduled}")]
    ScheduleTotalMismatch {
        expected: Money,
        scheduled: Money,
    },

    #[error("schedule length mismatch: expected {expected} lines, got {provided}")]
    ScheduleLengthMismatch {
        expected: u32,
        provided: usize,
    },

    #[error("invalid date: {message}")]
    InvalidDate {
        message: String,
    },

    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        message: String,
    },

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound {
        kind: RecordKind,
        id: Uuid,
    },

    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        kind: RecordKind,
        id: Uuid,
    },

    #[error("invalid transition for installment {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: InstallmentStatus,
        to: InstallmentStatus,
    },

    #[error("plan {id} cannot change from {status:?}")]
    PlanNotModifiable {
        id: Uuid,
        status: PlanStatus,
    },

    #[error("{kind} {id} has {paid} paid installment(s) and cannot be deleted")]
    HasPaidInstallments {
        kind: RecordKind,
        id: Uuid,
        paid: usize,
    },

    #[error("schedule for payment {payment_id} partially written: {written} of {expected} installments")]
    PartialBatch {
        payment_id: Uuid,
        written: usize,
        expected: usize,
    },

    #[error("destructive repair requires explicit confirmation")]
    ConfirmationRequired,

    #[error("storage failure: {message}")]
    Storage {
        message: String,
    },
}

/// error category surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InvalidTransition,
    DeletionGuard,
    PartialBatch,
    Confirmation,
    Storage,
}

/// structured failure returned to end users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOutcome {
    pub kind: ErrorKind,
    pub message: String,
    pub record_id: Option<Uuid>,
}

impl PlanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanError::InvalidInstallmentCount { .. }
            | PlanError::InvalidAmount { .. }
            | PlanError::InvalidCadence { .. }
            | PlanError::ScheduleTotalMismatch { .. }
            | PlanError::ScheduleLengthMismatch { .. }
            | PlanError::InvalidDate { .. }
            | PlanError::InvalidConfiguration { .. }
            | PlanError::InvalidRequest { .. } => ErrorKind::Validation,
            PlanError::NotFound { .. } => ErrorKind::NotFound,
            PlanError::AlreadyExists { .. } => ErrorKind::Conflict,
            PlanError::InvalidTransition { .. } | PlanError::PlanNotModifiable { .. } => {
                ErrorKind::InvalidTransition
            }
            PlanError::HasPaidInstallments { .. } => ErrorKind::DeletionGuard,
            PlanError::PartialBatch { .. } => ErrorKind::PartialBatch,
            PlanError::ConfirmationRequired => ErrorKind::Confirmation,
            PlanError::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// identifier of the record the request was about, if any
    pub fn record_id(&self) -> Option<Uuid> {
        match self {
            PlanError::NotFound { id, .. }
            | PlanError::AlreadyExists { id, .. }
            | PlanError::InvalidTransition { id, .. }
            | PlanError::PlanNotModifiable { id, .. }
            | PlanError::HasPaidInstallments { id, .. } => Some(*id),
            PlanError::PartialBatch { payment_id, .. } => Some(*payment_id),
            _ => None,
        }
    }

    /// user-facing view; storage internals are never exposed
    pub fn to_outcome(&self) -> ErrorOutcome {
        let message = match self {
            PlanError::Storage { .. } => "the request could not be completed".to_string(),
            other => other.to_string(),
        };
        ErrorOutcome {
            kind: self.kind(),
            message,
            record_id: self.record_id(),
        }
    }

    pub(crate) fn storage(message: impl Into<String>) -> Self {
        PlanError::Storage {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;
