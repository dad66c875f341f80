/// plan lifecycle - enrollment, monthly payments, overdue sweep, cash at the desk
use chrono::{Duration, TimeZone, Utc};
use payment_plan_rs::{
    ManualStatusRequest, MemoryStore, Money, PaymentMethod, PaymentPlanEngine, PlanTerms,
    SafeTimeProvider, TimeSource, Uuid,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== plan lifecycle example ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let controller = time.test_control().unwrap();
    let engine = PaymentPlanEngine::with_defaults(MemoryStore::new());

    // $1200 season fee over 12 months
    let terms = PlanTerms::monthly(Uuid::new_v4(), Money::from_major(1200), 12, time.now());
    let created = engine.create_plan(terms, &time)?;
    let payment_id = created.payment.id;
    println!("plan {} created", created.plan.id);
    for row in engine.installments_for_payment(payment_id)? {
        println!(
            "  #{:>2} due {} ${} {:?}",
            row.index,
            row.due_date.format("%Y-%m-%d"),
            row.amount,
            row.status
        );
    }

    // february paid by card
    controller.advance(Duration::days(31));
    let ids = created.installment_ids.clone();
    engine.mark_paid(ids[1], &["pi_feb".to_string()], &time)?;
    println!("\n{}: installment 2 paid", time.now().format("%Y-%m-%d"));

    // march missed
    controller.advance(Duration::days(30));
    let sweep = engine.sweep(&time)?;
    println!(
        "{}: sweep marked {} installment(s) overdue",
        time.now().format("%Y-%m-%d"),
        sweep.marked_overdue.len()
    );
    println!("aggregate status: {:?}", engine.payment(payment_id)?.map(|p| p.status));

    // family pays cash at practice
    controller.advance(Duration::days(2));
    let request = ManualStatusRequest::mark_paid(ids[2], PaymentMethod::Cash, "paid at practice", "admin1");
    engine.set_manual_status(&request, &time)?;
    println!(
        "{}: cash recorded, aggregate status: {:?}",
        time.now().format("%Y-%m-%d"),
        engine.payment(payment_id)?.map(|p| p.status)
    );

    let progress = engine.payment_progress(payment_id)?;
    println!(
        "\nprogress: {}/{} paid ({}%), remaining ${}",
        progress.paid_count,
        progress.total_count,
        progress.completion_percent,
        Money::from_minor(progress.remaining_minor)
    );

    let report = engine.revenue_report(&time)?;
    println!("\nrevenue report:\n{}", serde_json::to_string_pretty(&report)?);

    println!("\n{} audit events recorded", engine.events().len());
    Ok(())
}
