use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::TimeZone;
use skein::prelude::*;

#[derive(Default)]
struct Billing {
    charges: AtomicUsize,
}

struct ChargeCard;

impl Activity for ChargeCard {
    type Args = u64;
    type Output = u64;

    fn info() -> ActivityInfo {
        ActivityInfo::new("charge_card").inject::<Billing>()
    }

    async fn run(ctx: ActivityContext, cents: u64) -> Result<u64> {
        ctx.service::<Billing>()?
            .charges
            .fetch_add(1, Ordering::SeqCst);
        Ok(cents)
    }
}

/// Charge after a week unless the trial is cancelled.
#[derive(Default)]
struct Trial;

impl Workflow for Trial {
    type Input = u64;
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("trial")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<ChargeCard>();
    }

    async fn execute(&self, ctx: &WorkflowContext, cents: u64) -> Result<String> {
        let week = Duration::from_secs(7 * 24 * 60 * 60);
        if ctx.wait_for_events(week, &["Cancel"]).await?.is_some() {
            return Ok("cancelled".to_string());
        }
        let charged = ctx.call::<ChargeCard>(cents).await?;
        Ok(format!("charged {}", charged))
    }
}

async fn build(clock: &MockClock) -> (Skein, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let skein = Skein::builder()
        .store(store.clone())
        .clock(Arc::new(clock.clone()))
        .workflow::<Trial>()
        .unwrap()
        .service(Billing::default())
        .build()
        .await
        .unwrap();
    (skein, store)
}

#[tokio::test]
async fn test_trial_charges_after_a_week() {
    let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let (skein, store) = build(&clock).await;

    let id = skein.start::<Trial>(1999).await.unwrap();
    skein.engine().process_due().await.unwrap();
    assert_eq!(skein.status(&id).await.unwrap().status, WorkflowStatus::Suspended);
    assert_eq!(store.queue_len().await, 1);

    clock.advance(chrono::Duration::days(7));
    skein.engine().process_due().await.unwrap();

    let result: Option<String> = skein.engine().result(&id).await.unwrap();
    assert_eq!(result.as_deref(), Some("charged 1999"));
    assert_eq!(store.queue_len().await, 0);
}

#[tokio::test]
async fn test_trial_cancelled() {
    let clock = MockClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let (skein, _store) = build(&clock).await;

    let id = skein.start::<Trial>(1999).await.unwrap();
    skein.engine().process_due().await.unwrap();

    clock.advance(chrono::Duration::days(2));
    assert!(skein.raise_event(&id, "Cancel", ()).await.unwrap());
    skein.engine().process_due().await.unwrap();

    let result: Option<String> = skein.engine().result(&id).await.unwrap();
    assert_eq!(result.as_deref(), Some("cancelled"));

    let report = skein.engine().replay(&id).await.unwrap();
    assert_eq!(
        report.outcome,
        DispatchOutcome::Completed(serde_json::json!("cancelled"))
    );
}

#[tokio::test]
async fn test_missing_service_is_rejected_at_build() {
    let result = Skein::builder()
        .store(Arc::new(MemoryStore::new()))
        .workflow::<Trial>()
        .unwrap()
        .build()
        .await;
    assert!(matches!(result, Err(SkeinError::Config(_))));
}
