pub mod config;
pub mod decimal;
pub mod deletion;
pub mod engine;
pub mod errors;
pub mod events;
pub mod installment;
pub mod lifecycle;
pub mod overrides;
pub mod payment;
pub mod plan;
pub mod processor;
pub mod reconcile;
pub mod revenue;
pub mod schedule;
pub mod store;
pub mod sweeper;
pub mod types;

// re-export key types
pub use config::EngineConfig;
pub use decimal::{Money, Rate};
pub use deletion::DeletionSummary;
pub use engine::{CreatedPlan, PaymentPlanEngine};
pub use errors::{ErrorKind, ErrorOutcome, PlanError, Result};
pub use events::{Event, EventStore};
pub use installment::{
    CustomScheduleLine, Installment, InstallmentMetadata, ManualPayment, OverrideAction,
    OverrideEvent, Transition,
};
pub use lifecycle::{InstallmentLedger, InstallmentUpdate};
pub use overrides::{ManualOverride, ManualStatusRequest};
pub use payment::ParentPayment;
pub use plan::{Plan, PlanTerms};
pub use processor::{ProcessorEvent, ProcessorEventKind, ProcessorEvents, ProcessorOutcome};
pub use reconcile::{
    derive_payment, derive_plan, Issue, Reconciler, ReconciliationReport, RepairAction,
    RepairOptions, RepairOutcome, SagaRecovery,
};
pub use revenue::{MonthlyCollection, PaymentProgress, RevenueAggregator, RevenueReport, RevenueSummary};
pub use schedule::{ScheduleGenerator, ScheduleRequest, ScheduledLine};
pub use store::{MemoryStore, Store};
pub use sweeper::{OverdueSweeper, SweepReport};
pub use types::{
    CreationStage, InstallmentId, InstallmentStatus, ParentId, PaymentId, PaymentMethod,
    PaymentStatus, PlanId, PlanStatus, RecordKind, SettlementPrecedence,
};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
