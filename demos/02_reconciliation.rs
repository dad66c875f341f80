/// reconciliation - find drift and orphans, preview, then repair
use chrono::{Duration, TimeZone, Utc};
use payment_plan_rs::{
    Installment, MemoryStore, Money, ParentPayment, PaymentPlanEngine, PaymentStatus, PlanTerms,
    RepairOptions, SafeTimeProvider, Store, TimeSource, Uuid,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("=== reconciliation example ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let controller = time.test_control().unwrap();
    let engine = PaymentPlanEngine::with_defaults(MemoryStore::new());

    let terms = PlanTerms::monthly(Uuid::new_v4(), Money::from_major(600), 6, time.now());
    let created = engine.create_plan(terms, &time)?;

    // an older integration wrote the aggregate status directly
    engine.store().update_payment(created.payment.id, &mut |p| {
        p.status = PaymentStatus::Paid;
        p.paid_at = Some(Utc::now());
        Ok(())
    })?;

    // and left an installment behind for an aggregate it deleted
    let ghost = ParentPayment::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        None,
        Money::from_major(80),
        time.now(),
        time.now(),
    );
    engine.store().insert_installment(Installment::new(
        ghost.id,
        ghost.parent_id,
        None,
        1,
        1,
        ghost.amount,
        ghost.due_date,
        time.now(),
    ))?;

    controller.advance(Duration::hours(1));
    let report = engine.scan(&time)?;
    println!("scan found {} issue(s):", report.issues.len());
    for issue in &report.issues {
        println!("  {:?}", issue);
    }

    // default options only preview
    let preview = engine.repair(&report, RepairOptions::default(), &time)?;
    println!("\npreview: {} action(s) planned, none applied", preview.planned.len());

    let applied = engine.repair(&report, RepairOptions::apply(), &time)?;
    println!(
        "applied {} action(s), {} waiting for confirmation",
        applied.applied.len(),
        applied.awaiting_confirmation.len()
    );

    let confirmed = engine.cleanup_orphans(RepairOptions::apply_confirmed(), &time)?;
    println!("orphan cleanup removed {} record(s)", confirmed.applied.len());

    let after = engine.scan(&time)?;
    println!("\nclean after repair: {}", after.is_clean());
    println!(
        "aggregate status: {:?}",
        engine.payment(created.payment.id)?.map(|p| p.status)
    );
    Ok(())
}
