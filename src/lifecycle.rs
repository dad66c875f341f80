use hourglass_rs::SafeTimeProvider;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::events::{Event, EventStore};
use crate::installment::{Installment, Transition};
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::types::InstallmentId;

/// result of a single installment operation
#[derive(Debug, Clone, PartialEq)]
pub struct InstallmentUpdate {
    pub installment: Installment,
    pub transition: Transition,
}

impl InstallmentUpdate {
    pub fn applied(&self) -> bool {
        self.transition.applied()
    }
}

/// installment state machine over the store
///
/// Each operation patches one installment atomically and touches only the
/// fields it owns, then re-derives the aggregate when the status moved.
pub struct InstallmentLedger<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: Store + ?Sized> InstallmentLedger<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    /// settle an installment; repeat calls with the same references are no-ops
    pub fn mark_paid(
        &self,
        id: InstallmentId,
        external_refs: &[String],
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<InstallmentUpdate> {
        let now = time_provider.now();
        let mut transition = Transition::Unchanged;
        let mut newly_paid = false;
        let installment = self.store.update_installment(id, &mut |i| {
            newly_paid = !i.is_paid();
            transition = i.settle(now, external_refs);
            Ok(())
        })?;

        if newly_paid {
            info!(
                installment_id = %id,
                index = installment.index,
                amount = %installment.amount,
                "installment paid"
            );
            events.emit(Event::InstallmentPaid {
                installment_id: id,
                payment_id: installment.payment_id,
                amount: installment.amount,
                timestamp: now,
            });
            self.reconcile(&installment, time_provider, events)?;
        } else {
            debug!(installment_id = %id, "installment already paid");
        }

        Ok(InstallmentUpdate {
            installment,
            transition,
        })
    }

    /// pending -> overdue with a fresh grace window
    pub fn mark_overdue(
        &self,
        id: InstallmentId,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<InstallmentUpdate> {
        let now = time_provider.now();
        let grace = self.config.grace_period();
        let mut transition = Transition::Unchanged;
        let installment = self.store.update_installment(id, &mut |i| {
            transition = i.mark_overdue(now, grace);
            Ok(())
        })?;

        if transition.applied() {
            let grace_ends_at = installment.grace_period_end.unwrap_or(now);
            warn!(
                installment_id = %id,
                due_date = %installment.due_date,
                %grace_ends_at,
                "installment overdue"
            );
            events.emit(Event::InstallmentOverdue {
                installment_id: id,
                payment_id: installment.payment_id,
                due_date: installment.due_date,
                grace_ends_at,
            });
            self.reconcile(&installment, time_provider, events)?;
        }

        Ok(InstallmentUpdate {
            installment,
            transition,
        })
    }

    /// close an elapsed grace window; status is unaffected
    pub fn expire_grace(
        &self,
        id: InstallmentId,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<InstallmentUpdate> {
        let now = time_provider.now();
        let mut transition = Transition::Unchanged;
        let installment = self.store.update_installment(id, &mut |i| {
            transition = i.expire_grace(now);
            Ok(())
        })?;

        if transition.applied() {
            debug!(installment_id = %id, "grace period expired");
            events.emit(Event::GracePeriodExpired {
                installment_id: id,
                timestamp: now,
            });
        }
        Ok(InstallmentUpdate {
            installment,
            transition,
        })
    }

    /// processor declined the charge
    pub fn mark_failed(
        &self,
        id: InstallmentId,
        reason: Option<String>,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<InstallmentUpdate> {
        let now = time_provider.now();
        let mut transition = Transition::Unchanged;
        let installment = self.store.update_installment(id, &mut |i| {
            transition = i.fail(now, reason.clone())?;
            Ok(())
        })?;

        if transition.applied() {
            warn!(
                installment_id = %id,
                failures = installment.failure_count,
                reason = installment.last_failure_reason.as_deref().unwrap_or(""),
                "installment charge failed"
            );
            events.emit(Event::InstallmentFailed {
                installment_id: id,
                reason,
                timestamp: now,
            });
            self.reconcile(&installment, time_provider, events)?;
        }
        Ok(InstallmentUpdate {
            installment,
            transition,
        })
    }

    /// failed -> pending ahead of a new charge attempt
    pub fn retry_failed(
        &self,
        id: InstallmentId,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<InstallmentUpdate> {
        let now = time_provider.now();
        let mut transition = Transition::Unchanged;
        let installment = self.store.update_installment(id, &mut |i| {
            transition = i.retry(now)?;
            Ok(())
        })?;

        if transition.applied() {
            info!(installment_id = %id, "installment queued for retry");
            events.emit(Event::InstallmentRetried {
                installment_id: id,
                timestamp: now,
            });
            self.reconcile(&installment, time_provider, events)?;
        }
        Ok(InstallmentUpdate {
            installment,
            transition,
        })
    }

    /// count a reminder without touching status or payment fields
    pub fn record_reminder(
        &self,
        id: InstallmentId,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<Installment> {
        let now = time_provider.now();
        let installment = self.store.update_installment(id, &mut |i| {
            i.record_reminder(now);
            Ok(())
        })?;
        debug!(
            installment_id = %id,
            reminders_sent = installment.reminders_sent,
            "reminder recorded"
        );
        events.emit(Event::ReminderRecorded {
            installment_id: id,
            reminders_sent: installment.reminders_sent,
            timestamp: now,
        });
        Ok(installment)
    }

    fn reconcile(
        &self,
        installment: &Installment,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<()> {
        if self.store.payment(installment.payment_id)?.is_none() {
            warn!(
                installment_id = %installment.id,
                payment_id = %installment.payment_id,
                "installment has no aggregate"
            );
            return Ok(());
        }
        Reconciler::new(self.store, self.config).reconcile_payment(
            installment.payment_id,
            time_provider,
            events,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Money;
    use crate::errors::PlanError;
    use crate::payment::ParentPayment;
    use crate::store::MemoryStore;
    use crate::types::{InstallmentStatus, PaymentStatus};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use hourglass_rs::TimeSource;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn seed(store: &MemoryStore, count: u32) -> (ParentPayment, Vec<InstallmentId>) {
        let payment = ParentPayment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            Money::from_major(50 * count as i64),
            start(),
            start(),
        );
        store.insert_payment(payment.clone()).unwrap();
        let ids = (1..=count)
            .map(|index| {
                let inst = Installment::new(
                    payment.id,
                    payment.parent_id,
                    None,
                    index,
                    count,
                    Money::from_major(50),
                    start() + Duration::days(30 * (index as i64 - 1)),
                    start(),
                );
                let id = inst.id;
                store.insert_installment(inst).unwrap();
                id
            })
            .collect();
        (payment, ids)
    }

    #[test]
    fn test_mark_paid_is_idempotent() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let ledger = InstallmentLedger::new(&store, &config);
        let mut events = EventStore::new();
        let (_, ids) = seed(&store, 2);
        let refs = vec!["ch_1".to_string()];

        let first = ledger.mark_paid(ids[0], &refs, &time, &mut events).unwrap();
        assert!(first.applied());
        let paid_at = first.installment.paid_at;

        time.test_control().unwrap().advance(Duration::hours(3));
        let second = ledger.mark_paid(ids[0], &refs, &time, &mut events).unwrap();
        assert!(!second.applied());
        assert_eq!(second.installment.paid_at, paid_at);

        let paid_events = events
            .events()
            .iter()
            .filter(|e| matches!(e, Event::InstallmentPaid { .. }))
            .count();
        assert_eq!(paid_events, 1);
    }

    #[test]
    fn test_last_payment_settles_aggregate() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let ledger = InstallmentLedger::new(&store, &config);
        let mut events = EventStore::new();
        let (payment, ids) = seed(&store, 2);

        ledger.mark_paid(ids[0], &[], &time, &mut events).unwrap();
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Pending);

        time.test_control().unwrap().advance(Duration::days(30));
        ledger.mark_paid(ids[1], &[], &time, &mut events).unwrap();
        let stored = store.payment(payment.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Paid);
        assert_eq!(stored.paid_at, Some(start() + Duration::days(30)));
    }

    #[test]
    fn test_overdue_then_paid_clears_grace() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start() + Duration::days(40)));
        let ledger = InstallmentLedger::new(&store, &config);
        let mut events = EventStore::new();
        let (payment, ids) = seed(&store, 2);

        let update = ledger.mark_overdue(ids[1], &time, &mut events).unwrap();
        assert_eq!(update.installment.status, InstallmentStatus::Overdue);
        assert_eq!(
            update.installment.grace_period_end,
            Some(start() + Duration::days(45))
        );
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Overdue);

        let update = ledger.mark_paid(ids[1], &[], &time, &mut events).unwrap();
        assert!(!update.installment.in_grace_period);
        assert_eq!(update.installment.grace_period_end, None);
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Pending);
    }

    #[test]
    fn test_failed_cannot_follow_paid() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start()));
        let ledger = InstallmentLedger::new(&store, &config);
        let mut events = EventStore::new();
        let (payment, ids) = seed(&store, 1);

        ledger
            .mark_failed(ids[0], Some("card_declined".into()), &time, &mut events)
            .unwrap();
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Failed);

        ledger.retry_failed(ids[0], &time, &mut events).unwrap();
        ledger.mark_paid(ids[0], &[], &time, &mut events).unwrap();
        let err = ledger.mark_failed(ids[0], None, &time, &mut events).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition { .. }));
        assert_eq!(
            store.installment(ids[0]).unwrap().unwrap().status,
            InstallmentStatus::Paid
        );
    }

    #[test]
    fn test_reminders_and_payment_do_not_clobber() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let (payment, ids) = seed(&store, 1);
        let id = ids[0];

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let time = SafeTimeProvider::new(TimeSource::Test(start()));
                    let ledger = InstallmentLedger::new(&store, &config);
                    let mut events = EventStore::new();
                    for _ in 0..25 {
                        ledger.record_reminder(id, &time, &mut events).unwrap();
                    }
                });
            }
            scope.spawn(|| {
                let time = SafeTimeProvider::new(TimeSource::Test(start()));
                let ledger = InstallmentLedger::new(&store, &config);
                let mut events = EventStore::new();
                ledger.mark_paid(id, &[], &time, &mut events).unwrap();
            });
        });

        let stored = store.installment(id).unwrap().unwrap();
        assert_eq!(stored.reminders_sent, 100);
        assert_eq!(stored.status, InstallmentStatus::Paid);
        assert!(stored.paid_at.is_some());
        assert_eq!(store.payment(payment.id).unwrap().unwrap().status, PaymentStatus::Paid);
    }
}
