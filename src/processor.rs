use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::events::{Event, EventStore};
use crate::installment::{Installment, OverrideAction, Transition};
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::types::{InstallmentId, SettlementPrecedence};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorEventKind {
    ChargeSucceeded,
    ChargeFailed { reason: Option<String> },
}

/// webhook delivered by the external processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorEvent {
    /// unique per event, repeated on redelivery
    pub event_id: String,
    /// checkout session, payment intent or charge id
    pub external_ref: String,
    /// set when the charge was created with installment metadata
    pub installment_id: Option<InstallmentId>,
    pub kind: ProcessorEventKind,
    /// other ids for the same charge, recorded on success
    #[serde(default)]
    pub related_refs: Vec<String>,
}

impl ProcessorEvent {
    pub fn succeeded(event_id: impl Into<String>, external_ref: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            external_ref: external_ref.into(),
            installment_id: None,
            kind: ProcessorEventKind::ChargeSucceeded,
            related_refs: Vec::new(),
        }
    }

    pub fn failed(
        event_id: impl Into<String>,
        external_ref: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            external_ref: external_ref.into(),
            installment_id: None,
            kind: ProcessorEventKind::ChargeFailed { reason },
            related_refs: Vec::new(),
        }
    }

    pub fn for_installment(mut self, installment_id: InstallmentId) -> Self {
        self.installment_id = Some(installment_id);
        self
    }

    fn references(&self) -> Vec<String> {
        let mut refs = vec![self.external_ref.clone()];
        for r in &self.related_refs {
            if !refs.contains(r) {
                refs.push(r.clone());
            }
        }
        refs
    }
}

/// what handling a webhook did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorOutcome {
    Applied,
    /// event id seen before
    Duplicate,
    /// success for an installment that was already paid
    AlreadySettled,
    /// decline for an installment that was already paid
    IgnoredDecline,
    /// decline for an installment already marked failed
    AlreadyFailed,
    /// an administrator unmarked the installment and asked to keep it unpaid
    Suppressed,
    /// no installment matches the event
    Unmatched,
}

/// maps payment processor webhooks onto the installment state machine
///
/// Processors redeliver events, so every event id is recorded on the
/// installment inside the same atomic patch that applies it.
pub struct ProcessorEvents<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: Store + ?Sized> ProcessorEvents<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn handle(
        &self,
        event: &ProcessorEvent,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<ProcessorOutcome> {
        let Some(target) = self.resolve(event)? else {
            warn!(
                event_id = %event.event_id,
                external_ref = %event.external_ref,
                "processor event matches no installment"
            );
            return Ok(ProcessorOutcome::Unmatched);
        };

        let now = time_provider.now();
        let honor_suppression =
            self.config.settlement_precedence == SettlementPrecedence::HonorSuppression;
        let refs = event.references();
        let mut outcome = ProcessorOutcome::Duplicate;
        let mut was_paid = false;

        let installment = self.store.update_installment(target, &mut |i| {
            was_paid = i.is_paid();
            if i.metadata.processor_events.contains(&event.event_id) {
                outcome = ProcessorOutcome::Duplicate;
                return Ok(());
            }
            outcome = match &event.kind {
                ProcessorEventKind::ChargeSucceeded => {
                    if i.is_paid() {
                        i.settle(now, &refs);
                        ProcessorOutcome::AlreadySettled
                    } else if honor_suppression && suppressed(i) {
                        ProcessorOutcome::Suppressed
                    } else {
                        i.settle(now, &refs);
                        ProcessorOutcome::Applied
                    }
                }
                ProcessorEventKind::ChargeFailed { reason } => {
                    if i.is_paid() {
                        ProcessorOutcome::IgnoredDecline
                    } else {
                        if !i.external_refs.contains(&event.external_ref) {
                            i.external_refs.push(event.external_ref.clone());
                        }
                        match i.fail(now, reason.clone())? {
                            Transition::Applied => ProcessorOutcome::Applied,
                            Transition::Unchanged => ProcessorOutcome::AlreadyFailed,
                        }
                    }
                }
            };
            i.metadata.processor_events.push(event.event_id.clone());
            i.updated_at = now;
            Ok(())
        })?;

        match outcome {
            ProcessorOutcome::Applied => self.record_applied(event, &installment, now, events),
            ProcessorOutcome::Suppressed => {
                warn!(
                    installment_id = %target,
                    external_ref = %event.external_ref,
                    "processor settlement suppressed by manual unmark"
                );
                events.emit(Event::ProcessorSettlementSuppressed {
                    installment_id: target,
                    external_ref: event.external_ref.clone(),
                    timestamp: now,
                });
            }
            other => {
                debug!(
                    installment_id = %target,
                    event_id = %event.event_id,
                    outcome = ?other,
                    "processor event skipped"
                );
            }
        }

        if was_paid != installment.is_paid() || outcome == ProcessorOutcome::Applied {
            if self.store.payment(installment.payment_id)?.is_some() {
                Reconciler::new(self.store, self.config).reconcile_payment(
                    installment.payment_id,
                    time_provider,
                    events,
                )?;
            }
        }
        Ok(outcome)
    }

    fn resolve(&self, event: &ProcessorEvent) -> Result<Option<InstallmentId>> {
        if let Some(id) = event.installment_id {
            if self.store.installment(id)?.is_some() {
                return Ok(Some(id));
            }
        }
        for reference in event.references() {
            if let Some(inst) = self.store.installment_by_external_ref(&reference)? {
                return Ok(Some(inst.id));
            }
        }
        Ok(None)
    }

    fn record_applied(
        &self,
        event: &ProcessorEvent,
        installment: &Installment,
        now: chrono::DateTime<chrono::Utc>,
        events: &mut EventStore,
    ) {
        match &event.kind {
            ProcessorEventKind::ChargeSucceeded => {
                info!(
                    installment_id = %installment.id,
                    external_ref = %event.external_ref,
                    "processor settled installment"
                );
                events.emit(Event::InstallmentPaid {
                    installment_id: installment.id,
                    payment_id: installment.payment_id,
                    amount: installment.amount,
                    timestamp: now,
                });
            }
            ProcessorEventKind::ChargeFailed { reason } => {
                warn!(
                    installment_id = %installment.id,
                    external_ref = %event.external_ref,
                    "processor declined installment"
                );
                events.emit(Event::InstallmentFailed {
                    installment_id: installment.id,
                    reason: reason.clone(),
                    timestamp: now,
                });
            }
        }
    }
}

/// latest override is an unmark that asked to keep the installment unpaid
fn suppressed(installment: &Installment) -> bool {
    installment
        .last_override()
        .map(|o| o.action == OverrideAction::Unmarked && o.suppress_reapply)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Money;
    use crate::payment::ParentPayment;
    use crate::types::{InstallmentStatus, PaymentStatus};
    use crate::store::MemoryStore;
    use chrono::{DateTime, TimeZone, Utc};
    use hourglass_rs::TimeSource;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn seed(store: &MemoryStore, reference: &str) -> (ParentPayment, InstallmentId) {
        let payment = ParentPayment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            Money::from_major(60),
            start(),
            start(),
        );
        let mut inst = Installment::new(
            payment.id,
            payment.parent_id,
            None,
            1,
            1,
            payment.amount,
            start(),
            start(),
        );
        inst.external_refs.push(reference.to_string());
        let id = inst.id;
        store.insert_payment(payment.clone()).unwrap();
        store.insert_installment(inst).unwrap();
        (payment, id)
    }

    #[test]
    fn test_redelivered_success_is_duplicate() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (payment, id) = seed(&store, "cs_1");
        let handler = ProcessorEvents::new(&store, &config);
        let mut events = EventStore::new();

        let mut event = ProcessorEvent::succeeded("evt_1", "cs_1");
        event.related_refs.push("pi_1".to_string());
        assert_eq!(handler.handle(&event, &time, &mut events).unwrap(), ProcessorOutcome::Applied);
        assert_eq!(handler.handle(&event, &time, &mut events).unwrap(), ProcessorOutcome::Duplicate);

        let stored = store.installment(id).unwrap().unwrap();
        assert_eq!(stored.status, InstallmentStatus::Paid);
        assert_eq!(stored.external_refs, vec!["cs_1".to_string(), "pi_1".to_string()]);
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Paid);
    }

    #[test]
    fn test_decline_after_settle_is_ignored() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (_, id) = seed(&store, "cs_2");
        let handler = ProcessorEvents::new(&store, &config);
        let mut events = EventStore::new();

        handler
            .handle(&ProcessorEvent::succeeded("evt_a", "cs_2"), &time, &mut events)
            .unwrap();
        let outcome = handler
            .handle(
                &ProcessorEvent::failed("evt_b", "cs_2", Some("card_declined".into())),
                &time,
                &mut events,
            )
            .unwrap();
        assert_eq!(outcome, ProcessorOutcome::IgnoredDecline);
        assert_eq!(store.installment(id).unwrap().unwrap().status, InstallmentStatus::Paid);
    }

    #[test]
    fn test_decline_marks_failed() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (payment, id) = seed(&store, "cs_3");
        let mut events = EventStore::new();

        let event = ProcessorEvent::failed("evt_c", "ignored", Some("insufficient_funds".into()))
            .for_installment(id);
        ProcessorEvents::new(&store, &config)
            .handle(&event, &time, &mut events)
            .unwrap();

        let stored = store.installment(id).unwrap().unwrap();
        assert_eq!(stored.status, InstallmentStatus::Failed);
        assert_eq!(stored.last_failure_reason.as_deref(), Some("insufficient_funds"));
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Failed);
    }

    #[test]
    fn test_repeated_decline_is_not_reapplied() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (_, id) = seed(&store, "cs_4");
        let handler = ProcessorEvents::new(&store, &config);
        let mut events = EventStore::new();

        let first = ProcessorEvent::failed("evt_d1", "cs_4", Some("card_declined".into()));
        assert_eq!(handler.handle(&first, &time, &mut events).unwrap(), ProcessorOutcome::Applied);
        let second = ProcessorEvent::failed("evt_d2", "cs_4", Some("card_declined".into()));
        assert_eq!(
            handler.handle(&second, &time, &mut events).unwrap(),
            ProcessorOutcome::AlreadyFailed
        );

        let stored = store.installment(id).unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);
        let failures = events
            .events()
            .iter()
            .filter(|e| matches!(e, Event::InstallmentFailed { .. }) && e.installment_id() == Some(id))
            .count();
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_unknown_reference() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let mut events = EventStore::new();
        let outcome = ProcessorEvents::new(&store, &config)
            .handle(&ProcessorEvent::succeeded("evt_x", "cs_404"), &time, &mut events)
            .unwrap();
        assert_eq!(outcome, ProcessorOutcome::Unmatched);
        assert!(events.is_empty());
    }
}
