use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::errors::{PlanError, Result};
use crate::events::{Event, EventStore};
use crate::installment::{Installment, ManualPayment, Transition};
use crate::lifecycle::InstallmentUpdate;
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::types::{InstallmentId, PaymentMethod};

/// administrator request to mark or unmark an installment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualStatusRequest {
    pub installment_id: InstallmentId,
    pub mark_paid: bool,
    pub method: PaymentMethod,
    pub note: String,
    pub actor: String,
    /// unmark only: keep later processor settlements from re-applying paid
    #[serde(default)]
    pub suppress_reapply: bool,
}

impl ManualStatusRequest {
    pub fn mark_paid(
        installment_id: InstallmentId,
        method: PaymentMethod,
        note: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            installment_id,
            mark_paid: true,
            method,
            note: note.into(),
            actor: actor.into(),
            suppress_reapply: false,
        }
    }

    pub fn unmark(
        installment_id: InstallmentId,
        note: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            installment_id,
            mark_paid: false,
            method: PaymentMethod::Other("none".to_string()),
            note: note.into(),
            actor: actor.into(),
            suppress_reapply: false,
        }
    }

    pub fn suppressing_reapply(mut self) -> Self {
        self.suppress_reapply = true;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.actor.trim().is_empty() {
            return Err(PlanError::InvalidRequest {
                message: "manual override requires an actor".to_string(),
            });
        }
        Ok(())
    }
}

/// cash, check and other off-processor collections
pub struct ManualOverride<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: Store + ?Sized> ManualOverride<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn set_manual_status(
        &self,
        request: &ManualStatusRequest,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<InstallmentUpdate> {
        request.validate()?;
        let now = time_provider.now();
        let id = request.installment_id;

        let mut was_paid = false;
        let mut transition = Transition::Unchanged;
        let installment = self.store.update_installment(id, &mut |i| {
            was_paid = i.is_paid();
            transition = if request.mark_paid {
                i.apply_manual_payment(ManualPayment {
                    at: now,
                    method: request.method.clone(),
                    note: request.note.clone(),
                    actor: request.actor.clone(),
                })
            } else {
                i.revert_manual_payment(
                    now,
                    request.note.clone(),
                    request.actor.clone(),
                    request.suppress_reapply,
                )
            };
            Ok(())
        })?;

        if request.mark_paid {
            info!(
                installment_id = %id,
                method = %request.method,
                actor = %request.actor,
                "manual payment recorded"
            );
            events.emit(Event::ManualPaymentRecorded {
                installment_id: id,
                method: request.method.clone(),
                actor: request.actor.clone(),
                timestamp: now,
            });
            if !was_paid {
                events.emit(Event::InstallmentPaid {
                    installment_id: id,
                    payment_id: installment.payment_id,
                    amount: installment.amount,
                    timestamp: now,
                });
            }
        } else if transition.applied() {
            warn!(
                installment_id = %id,
                actor = %request.actor,
                suppress_reapply = request.suppress_reapply,
                "manual payment reverted"
            );
            events.emit(Event::ManualPaymentReverted {
                installment_id: id,
                actor: request.actor.clone(),
                suppress_reapply: request.suppress_reapply,
                timestamp: now,
            });
        }

        if was_paid != installment.is_paid() {
            self.reconcile(&installment, time_provider, events)?;
        }

        Ok(InstallmentUpdate {
            installment,
            transition,
        })
    }

    fn reconcile(
        &self,
        installment: &Installment,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<()> {
        if self.store.payment(installment.payment_id)?.is_some() {
            Reconciler::new(self.store, self.config).reconcile_payment(
                installment.payment_id,
                time_provider,
                events,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Money;
    use crate::installment::OverrideAction;
    use crate::payment::ParentPayment;
    use crate::store::MemoryStore;
    use crate::types::{InstallmentStatus, PaymentStatus};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use hourglass_rs::TimeSource;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn seed(store: &MemoryStore) -> (ParentPayment, Installment) {
        let payment = ParentPayment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            Money::from_major(40),
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
        inst.metadata
            .extra
            .insert("registration".to_string(), serde_json::json!("spring-u10"));
        store.insert_payment(payment.clone()).unwrap();
        store.insert_installment(inst.clone()).unwrap();
        (payment, inst)
    }

    #[test]
    fn test_mark_paid_by_check_keeps_metadata() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (payment, inst) = seed(&store);
        let mut events = EventStore::new();

        let request = ManualStatusRequest::mark_paid(inst.id, PaymentMethod::Check, "check #1042", "coach.kim");
        let update = ManualOverride::new(&store, &config)
            .set_manual_status(&request, &time, &mut events)
            .unwrap();

        let stored = update.installment;
        assert_eq!(stored.status, InstallmentStatus::Paid);
        assert_eq!(stored.paid_at, Some(start()));
        let manual = stored.metadata.manual_payment.as_ref().unwrap();
        assert_eq!(manual.method, PaymentMethod::Check);
        assert_eq!(manual.actor, "coach.kim");
        assert!(stored.metadata.extra.contains_key("registration"));
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Paid);
    }

    #[test]
    fn test_unmark_removes_only_manual_entry() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (payment, inst) = seed(&store);
        let mut events = EventStore::new();
        let overrides = ManualOverride::new(&store, &config);

        overrides
            .set_manual_status(
                &ManualStatusRequest::mark_paid(inst.id, PaymentMethod::Cash, "", "front.desk"),
                &time,
                &mut events,
            )
            .unwrap();
        time.test_control().unwrap().advance(Duration::hours(2));
        let update = overrides
            .set_manual_status(
                &ManualStatusRequest::unmark(inst.id, "entered on wrong family", "front.desk"),
                &time,
                &mut events,
            )
            .unwrap();

        let stored = update.installment;
        assert_eq!(stored.status, InstallmentStatus::Pending);
        assert_eq!(stored.paid_at, None);
        assert!(stored.metadata.manual_payment.is_none());
        assert!(stored.metadata.extra.contains_key("registration"));
        let actions: Vec<OverrideAction> = stored.metadata.overrides.iter().map(|o| o.action).collect();
        assert_eq!(actions, vec![OverrideAction::MarkedPaid, OverrideAction::Unmarked]);

        // aggregate follows the installments back to pending
        let aggregate = store.payment(payment.id).unwrap().unwrap();
        assert_eq!(aggregate.status, PaymentStatus::Pending);
        assert_eq!(aggregate.paid_at, None);
    }

    #[test]
    fn test_actor_required() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let (_, inst) = seed(&store);
        let mut events = EventStore::new();

        let request = ManualStatusRequest::mark_paid(inst.id, PaymentMethod::Cash, "", "  ");
        let err = ManualOverride::new(&store, &config)
            .set_manual_status(&request, &time, &mut events)
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidRequest { .. }));
        assert!(events.is_empty());
    }
}
