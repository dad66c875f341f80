use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::events::{Event, EventStore};
use crate::reconcile::Reconciler;
use crate::store::Store;
use crate::types::{InstallmentId, PaymentId};

/// what one sweep changed
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SweepReport {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub swept_at: DateTime<Utc>,
    pub candidates: usize,
    pub marked_overdue: Vec<InstallmentId>,
    pub grace_expired: Vec<InstallmentId>,
    pub payments_reconciled: usize,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.marked_overdue.is_empty() && self.grace_expired.is_empty()
    }
}

/// flips past-due pending installments to overdue
///
/// Safe to run concurrently with itself: the pending check happens inside
/// each atomic patch, so only one sweep wins any given row.
pub struct OverdueSweeper<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: Store + ?Sized> OverdueSweeper<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn sweep(
        &self,
        time_provider: &SafeTimeProvider,
        events: &mut EventStore,
    ) -> Result<SweepReport> {
        let now = time_provider.now();
        let grace = self.config.grace_period();
        let mut report = SweepReport {
            swept_at: now,
            ..SweepReport::default()
        };
        let mut touched: BTreeSet<PaymentId> = BTreeSet::new();

        let candidates = self.store.pending_due_before(now)?;
        report.candidates = candidates.len();
        let mut cancelled: HashMap<PaymentId, bool> = HashMap::new();
        for candidate in candidates {
            let skip = match cancelled.get(&candidate.payment_id) {
                Some(&skip) => skip,
                None => {
                    let skip = self
                        .store
                        .payment(candidate.payment_id)?
                        .map(|p| p.is_cancelled())
                        .unwrap_or(false);
                    cancelled.insert(candidate.payment_id, skip);
                    skip
                }
            };
            if skip {
                continue;
            }
            let mut flipped = false;
            let installment = self.store.update_installment(candidate.id, &mut |i| {
                flipped = i.mark_overdue(now, grace).applied();
                Ok(())
            })?;
            if !flipped {
                // settled or swept by someone else since the query
                continue;
            }
            debug!(
                installment_id = %installment.id,
                due_date = %installment.due_date,
                "installment overdue"
            );
            events.emit(Event::InstallmentOverdue {
                installment_id: installment.id,
                payment_id: installment.payment_id,
                due_date: installment.due_date,
                grace_ends_at: installment.grace_period_end.unwrap_or(now + grace),
            });
            touched.insert(installment.payment_id);
            report.marked_overdue.push(installment.id);
        }

        for candidate in self.store.grace_ended_before(now)? {
            let mut closed = false;
            self.store.update_installment(candidate.id, &mut |i| {
                closed = i.expire_grace(now).applied();
                Ok(())
            })?;
            if closed {
                events.emit(Event::GracePeriodExpired {
                    installment_id: candidate.id,
                    timestamp: now,
                });
                report.grace_expired.push(candidate.id);
            }
        }

        if self.config.reconcile_after_sweep {
            let reconciler = Reconciler::new(self.store, self.config);
            for payment_id in touched {
                if self.store.payment(payment_id)?.is_none() {
                    warn!(%payment_id, "overdue installment has no aggregate");
                    continue;
                }
                reconciler.reconcile_payment(payment_id, time_provider, events)?;
                report.payments_reconciled += 1;
            }
        }

        info!(
            candidates = report.candidates,
            marked_overdue = report.marked_overdue.len(),
            grace_expired = report.grace_expired.len(),
            payments_reconciled = report.payments_reconciled,
            "overdue sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Money;
    use crate::installment::Installment;
    use crate::payment::ParentPayment;
    use crate::store::MemoryStore;
    use crate::types::{InstallmentStatus, PaymentStatus};
    use chrono::{Duration, TimeZone};
    use hourglass_rs::TimeSource;
    use uuid::Uuid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn seed(store: &MemoryStore) -> (PaymentId, Vec<InstallmentId>) {
        let payment = ParentPayment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            Money::from_major(300),
            start(),
            start(),
        );
        store.insert_payment(payment.clone()).unwrap();
        let ids = (1..=3u32)
            .map(|index| {
                let mut inst = Installment::new(
                    payment.id,
                    payment.parent_id,
                    None,
                    index,
                    3,
                    Money::from_major(100),
                    start() + Duration::days(31 * (index as i64 - 1)),
                    start(),
                );
                if index == 1 {
                    inst.settle(start(), &[]);
                }
                let id = inst.id;
                store.insert_installment(inst).unwrap();
                id
            })
            .collect();
        (payment.id, ids)
    }

    #[test]
    fn test_sweep_marks_past_due_only() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start() + Duration::days(40)));
        let (payment_id, ids) = seed(&store);
        let mut events = EventStore::new();

        let report = OverdueSweeper::new(&store, &config).sweep(&time, &mut events).unwrap();
        assert_eq!(report.marked_overdue, vec![ids[1]]);
        assert_eq!(report.payments_reconciled, 1);
        assert_eq!(
            store.installment(ids[2]).unwrap().unwrap().status,
            InstallmentStatus::Pending
        );
        assert_eq!(store.payment(payment_id).unwrap().unwrap().status, PaymentStatus::Overdue);

        // second run changes nothing
        let again = OverdueSweeper::new(&store, &config).sweep(&time, &mut events).unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn test_grace_window_closes() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let time = SafeTimeProvider::new(TimeSource::Test(start() + Duration::days(32)));
        let control = time.test_control().unwrap();
        let (_, ids) = seed(&store);
        let mut events = EventStore::new();
        let sweeper = OverdueSweeper::new(&store, &config);

        sweeper.sweep(&time, &mut events).unwrap();
        let inst = store.installment(ids[1]).unwrap().unwrap();
        assert!(inst.in_grace_period);

        control.advance(Duration::days(4));
        assert!(sweeper.sweep(&time, &mut events).unwrap().grace_expired.is_empty());

        control.advance(Duration::days(1));
        let report = sweeper.sweep(&time, &mut events).unwrap();
        assert_eq!(report.grace_expired, vec![ids[1]]);
        let inst = store.installment(ids[1]).unwrap().unwrap();
        assert!(!inst.in_grace_period);
        assert_eq!(inst.status, InstallmentStatus::Overdue);
    }

    #[test]
    fn test_concurrent_sweeps_flip_each_row_once() {
        let store = MemoryStore::new();
        let config = EngineConfig::default();
        let mut seeded = Vec::new();
        for _ in 0..10 {
            seeded.push(seed(&store));
        }

        let flipped: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let time = SafeTimeProvider::new(TimeSource::Test(
                            start() + Duration::days(70),
                        ));
                        let mut events = EventStore::new();
                        OverdueSweeper::new(&store, &config)
                            .sweep(&time, &mut events)
                            .unwrap()
                            .marked_overdue
                            .len()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        // installments 2 and 3 of every payment are past due
        assert_eq!(flipped, 20);
        for (payment_id, _) in seeded {
            assert_eq!(store.payment(payment_id).unwrap().unwrap().status, PaymentStatus::Overdue);
        }
    }
}
