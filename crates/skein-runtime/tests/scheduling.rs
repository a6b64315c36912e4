mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    Broken, Checkout, DailyFollowUp, Nap, Ping, Reminder, Soon, StrictCheckout, Team, DAY, HOUR,
    MINUTE, SOON,
};
use skein_core::workflow::{ActivityKind, WorkflowStatus};
use skein_core::SkeinError;
use skein_runtime::DispatchOutcome;

#[tokio::test]
async fn test_activity_in_the_future_suspends_until_due() {
    let h = common::Harness::new();
    let id = h.engine.start::<Reminder>(()).await.unwrap();

    h.engine.process_due().await.unwrap();
    assert!(h.recorder.effects().is_empty());
    let snapshot = h.engine.status(&id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Suspended);

    h.advance(30 * MINUTE);
    assert_eq!(h.engine.process_due().await.unwrap(), 0);
    assert!(h.recorder.effects().is_empty());

    h.advance(30 * MINUTE);
    assert_eq!(h.engine.process_due().await.unwrap(), 1);

    let effects = h.recorder.effects();
    assert_eq!(effects.len(), 1);
    assert!(effects[0].1 >= h.at(HOUR));

    let result: Option<String> = h.engine.result(&id).await.unwrap();
    assert_eq!(result.as_deref(), Some("reminder"));
    assert!(h.engine.pending_wakeups(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sequential_delayed_activities() {
    let h = common::Harness::new();
    let id = h.engine.start::<DailyFollowUp>(()).await.unwrap();

    h.engine.process_due().await.unwrap();
    assert!(h.recorder.effects().is_empty());

    h.advance(DAY);
    h.engine.process_due().await.unwrap();
    assert_eq!(h.recorder.labels(), vec!["day-1"]);

    // The second activity is scheduled a day after the first resolved.
    let pending = h.engine.pending_wakeups(&id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].due_at, h.at(2 * DAY));

    h.advance(DAY);
    h.engine.process_due().await.unwrap();

    let effects = h.recorder.effects();
    assert_eq!(effects.len(), 2);
    assert_eq!(effects[1].0, "day-2");
    assert!(effects[1].1 >= h.at(2 * DAY));

    let result: Option<Vec<String>> = h.engine.result(&id).await.unwrap();
    assert_eq!(result, Some(vec!["day-1".to_string(), "day-2".to_string()]));
}

#[tokio::test]
async fn test_delay_completes_at_its_eta() {
    let h = common::Harness::new();
    let id = h.engine.start::<Nap>(()).await.unwrap();

    h.engine.process_due().await.unwrap();
    h.advance(HOUR);
    h.engine.process_due().await.unwrap();

    let result: Option<String> = h.engine.result(&id).await.unwrap();
    assert_eq!(result.as_deref(), Some("after-nap"));

    let history = h.engine.history(&id).await.unwrap();
    assert_eq!(history[0].kind, ActivityKind::Delay);
    assert_eq!(history[0].last_updated, h.at(HOUR));
    assert_eq!(h.recorder.effects()[0].1, h.at(HOUR));
}

#[tokio::test]
async fn test_overdue_delay_completes_at_now() {
    let h = common::Harness::new();
    let id = h.engine.start::<Nap>(()).await.unwrap();

    h.engine.process_due().await.unwrap();
    h.advance(3 * HOUR);
    h.engine.process_due().await.unwrap();

    let history = h.engine.history(&id).await.unwrap();
    assert_eq!(history[0].last_updated, h.at(3 * HOUR));
}

#[tokio::test]
async fn test_failed_activity_is_visible_to_workflow() {
    let h = common::Harness::new();
    let id = h.engine.start::<Checkout>(42).await.unwrap();

    h.engine.process_due().await.unwrap();

    let result: Option<String> = h.engine.result(&id).await.unwrap();
    assert_eq!(
        result.as_deref(),
        Some("invoice: Activity error: card declined")
    );
    assert_eq!(
        h.recorder.labels(),
        vec!["declined", "invoice: Activity error: card declined"]
    );

    // The failure is memoized: replaying does not charge again.
    let report = h.engine.replay(&id).await.unwrap();
    assert!(matches!(report.outcome, DispatchOutcome::Completed(_)));
    assert_eq!(h.recorder.effects().len(), 2);
}

#[tokio::test]
async fn test_unhandled_activity_failure_fails_workflow() {
    let h = common::Harness::new();
    let id = h.engine.start::<StrictCheckout>(42).await.unwrap();

    h.engine.process_due().await.unwrap();

    let snapshot = h.engine.status(&id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(
        snapshot.error.as_deref(),
        Some("Activity 'decline_card' failed: Activity error: card declined")
    );

    let err = h.engine.result::<()>(&id).await.unwrap_err();
    assert!(matches!(err, SkeinError::WorkflowFailed(_)));
    assert!(h.engine.pending_wakeups(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_child_workflows_start_once() {
    let h = common::Harness::new();
    let id = h
        .engine
        .start::<Team>(vec!["ada".to_string(), "grace".to_string()])
        .await
        .unwrap();

    assert_eq!(h.engine.process_due().await.unwrap(), 1);
    let children: Vec<String> = h.engine.result(&id).await.unwrap().unwrap();
    assert_eq!(children.len(), 2);
    assert_ne!(children[0], children[1]);
    assert!(children.iter().all(|child| child.starts_with(&format!("{}/", id))));

    // Children run on their own wake-ups.
    assert_eq!(h.engine.process_due().await.unwrap(), 2);
    assert_eq!(h.recorder.children(), 2);

    let welcome: Option<String> = h.engine.result(&children[1]).await.unwrap();
    assert_eq!(welcome.as_deref(), Some("welcome grace"));

    let report = h.engine.replay(&id).await.unwrap();
    assert_eq!(
        report.outcome,
        DispatchOutcome::Completed(serde_json::json!(children))
    );
    assert_eq!(h.engine.process_due().await.unwrap(), 0);
    assert_eq!(h.recorder.children(), 2);
}

#[tokio::test]
async fn test_short_event_wait_stays_in_process() {
    let h = common::Harness::new();
    let id = h.engine.start::<Ping>(()).await.unwrap();
    let item = h.engine.pending_wakeups(&id).await.unwrap().remove(0);

    let engine = Arc::clone(&h.engine);
    let dispatch = tokio::spawn(async move { engine.dispatch(&item).await });

    let mut delivered = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if h.engine.raise_event(&id, "Pong", 7u32, false).await.unwrap() {
            delivered = true;
            break;
        }
    }
    assert!(delivered);

    let outcome = dispatch.await.unwrap().unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(serde_json::json!(7)));
    assert!(h.engine.pending_wakeups(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_activity_due_within_threshold_waits_for_its_eta() {
    let h = common::Harness::new();
    let id = h.engine.start::<Soon>(()).await.unwrap();
    let item = h.engine.pending_wakeups(&id).await.unwrap().remove(0);

    let engine = Arc::clone(&h.engine);
    let dispatch = tokio::spawn(async move { engine.dispatch(&item).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.recorder.effects().is_empty());

    h.advance(SOON);
    let outcome = dispatch.await.unwrap().unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed(serde_json::json!("soon")));

    let eta = h.at(SOON);
    assert_eq!(h.recorder.effects(), vec![("soon".to_string(), eta)]);
    assert_eq!(h.engine.history(&id).await.unwrap()[0].eta, eta);
}

#[tokio::test]
async fn test_internal_error_from_workflow_code_fails_the_workflow() {
    let h = common::Harness::new();
    let id = h.engine.start::<Broken>(()).await.unwrap();
    let item = h.engine.pending_wakeups(&id).await.unwrap().remove(0);

    let outcome = h.engine.dispatch(&item).await.unwrap();
    match &outcome {
        DispatchOutcome::Failed { error } => assert!(error.contains("ledger out of balance")),
        other => panic!("unexpected outcome {:?}", other),
    }

    assert_eq!(
        h.engine.status(&id).await.unwrap().status,
        WorkflowStatus::Failed
    );
    assert!(h.engine.pending_wakeups(&id).await.unwrap().is_empty());
}
