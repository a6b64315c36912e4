#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use skein_core::clock::MockClock;
use skein_core::config::EngineConfig;
use skein_core::workflow::{
    Activity, ActivityContext, ActivityInfo, ActivitySet, Services, Workflow, WorkflowContext,
    WorkflowInfo,
};
use skein_core::{Result, SkeinError};
use skein_runtime::{MemoryStore, WorkflowEngine, WorkflowRegistry};

pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(60 * 60);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// Records every email "sent".
#[derive(Default)]
pub struct Mailer {
    sent: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl Mailer {
    pub fn sent(&self) -> Vec<(String, DateTime<Utc>)> {
        self.sent.lock().unwrap().clone()
    }
}

/// Records side effects of generic activities.
#[derive(Default)]
pub struct Recorder {
    effects: Mutex<Vec<(String, DateTime<Utc>)>>,
    children: AtomicUsize,
}

impl Recorder {
    pub fn effects(&self) -> Vec<(String, DateTime<Utc>)> {
        self.effects.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.effects().into_iter().map(|(label, _)| label).collect()
    }

    pub fn children(&self) -> usize {
        self.children.load(Ordering::SeqCst)
    }
}

pub struct SendVerificationEmail;

impl Activity for SendVerificationEmail {
    type Args = String;
    type Output = ();

    fn info() -> ActivityInfo {
        ActivityInfo::new("send_verification_email").inject::<Mailer>()
    }

    async fn run(ctx: ActivityContext, to: String) -> Result<()> {
        let mailer = ctx.service::<Mailer>()?;
        mailer.sent.lock().unwrap().push((to, ctx.now()));
        Ok(())
    }
}

pub const CODE: u32 = 1234;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    /// Code the user has to send back with "Verify".
    pub code: u32,
}

pub fn signup(email: &str) -> SignupRequest {
    SignupRequest {
        email: email.to_string(),
        code: CODE,
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Verification {
    pub code: u32,
}

/// Payload of a "Verify" event.
pub fn verify(code: u32) -> Verification {
    Verification { code }
}

/// Email verification: send a mail, then wait up to 15 minutes for the user
/// to send the right code or ask for another mail. A wrong code starts a new
/// wait.
#[derive(Default)]
pub struct Signup;

impl Workflow for Signup {
    type Input = SignupRequest;
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("signup")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<SendVerificationEmail>();
    }

    async fn execute(&self, ctx: &WorkflowContext, request: SignupRequest) -> Result<String> {
        ctx.activity::<SendVerificationEmail>(request.email.clone())
            .salted_by_time()
            .run()
            .await?;

        loop {
            match ctx
                .wait_for_events(15 * MINUTE, &["Verify", "Resend"])
                .await?
            {
                Some(event) if event.name == "Verify" => {
                    let matches = event
                        .value_as::<Verification>()
                        .is_ok_and(|v| v.code == request.code);
                    if matches {
                        return Ok("Verified".to_string());
                    }
                }
                Some(_) => {
                    ctx.activity::<SendVerificationEmail>(request.email.clone())
                        .salted_by_time()
                        .run()
                        .await?;
                }
                None => return Ok("NotVerified".to_string()),
            }
        }
    }
}

pub struct RecordEffect;

impl Activity for RecordEffect {
    type Args = String;
    type Output = String;

    fn info() -> ActivityInfo {
        ActivityInfo::new("record_effect").inject::<Recorder>()
    }

    async fn run(ctx: ActivityContext, label: String) -> Result<String> {
        let recorder = ctx.service::<Recorder>()?;
        recorder
            .effects
            .lock()
            .unwrap()
            .push((label.clone(), ctx.now()));
        Ok(label)
    }
}

/// Holds its step lock for a while so concurrent dispatches contend.
pub struct SlowEffect;

impl Activity for SlowEffect {
    type Args = String;
    type Output = String;

    fn info() -> ActivityInfo {
        ActivityInfo::new("slow_effect").inject::<Recorder>()
    }

    async fn run(ctx: ActivityContext, label: String) -> Result<String> {
        let recorder = ctx.service::<Recorder>()?;
        recorder
            .effects
            .lock()
            .unwrap()
            .push((label.clone(), ctx.now()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(label)
    }
}

pub struct DeclineCard;

impl Activity for DeclineCard {
    type Args = u64;
    type Output = ();

    fn info() -> ActivityInfo {
        ActivityInfo::new("decline_card").inject::<Recorder>()
    }

    async fn run(ctx: ActivityContext, _amount: u64) -> Result<()> {
        let recorder = ctx.service::<Recorder>()?;
        recorder
            .effects
            .lock()
            .unwrap()
            .push(("declined".to_string(), ctx.now()));
        Err(SkeinError::activity("card declined"))
    }
}

/// One activity one hour after start.
#[derive(Default)]
pub struct Reminder;

impl Workflow for Reminder {
    type Input = ();
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("reminder")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<RecordEffect>();
    }

    async fn execute(&self, ctx: &WorkflowContext, _input: ()) -> Result<String> {
        ctx.activity::<RecordEffect>("reminder".to_string())
            .after(HOUR)
            .run()
            .await
    }
}

/// One activity due shortly, inside the suspend threshold.
#[derive(Default)]
pub struct Soon;

impl Workflow for Soon {
    type Input = ();
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("soon")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<RecordEffect>();
    }

    async fn execute(&self, ctx: &WorkflowContext, _input: ()) -> Result<String> {
        ctx.activity::<RecordEffect>("soon".to_string())
            .after(SOON)
            .run()
            .await
    }
}

pub const SOON: Duration = Duration::from_millis(300);

/// Gives up with an internal error of its own.
#[derive(Default)]
pub struct Broken;

impl Workflow for Broken {
    type Input = ();
    type Output = ();

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("broken")
    }

    async fn execute(&self, _ctx: &WorkflowContext, _input: ()) -> Result<()> {
        Err(SkeinError::Internal("ledger out of balance".to_string()))
    }
}

/// Two activities, each one day after the previous one resolved.
#[derive(Default)]
pub struct DailyFollowUp;

impl Workflow for DailyFollowUp {
    type Input = ();
    type Output = Vec<String>;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("daily_follow_up")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<RecordEffect>();
    }

    async fn execute(&self, ctx: &WorkflowContext, _input: ()) -> Result<Vec<String>> {
        let first = ctx
            .activity::<RecordEffect>("day-1".to_string())
            .after(DAY)
            .run()
            .await?;
        let second = ctx
            .activity::<RecordEffect>("day-2".to_string())
            .after(DAY)
            .run()
            .await?;
        Ok(vec![first, second])
    }
}

/// One immediate activity.
#[derive(Default)]
pub struct Once;

impl Workflow for Once {
    type Input = String;
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("once")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<SlowEffect>();
    }

    async fn execute(&self, ctx: &WorkflowContext, label: String) -> Result<String> {
        ctx.call::<SlowEffect>(label).await
    }
}

/// Waits for a timer, then records.
#[derive(Default)]
pub struct Nap;

impl Workflow for Nap {
    type Input = ();
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("nap")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<RecordEffect>();
    }

    async fn execute(&self, ctx: &WorkflowContext, _input: ()) -> Result<String> {
        ctx.delay(HOUR).await?;
        ctx.call::<RecordEffect>("after-nap".to_string()).await
    }
}

/// Falls back when the card is declined.
#[derive(Default)]
pub struct Checkout;

impl Workflow for Checkout {
    type Input = u64;
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("checkout")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<DeclineCard>().add::<RecordEffect>();
    }

    async fn execute(&self, ctx: &WorkflowContext, amount: u64) -> Result<String> {
        match ctx.call::<DeclineCard>(amount).await {
            Ok(()) => Ok("charged".to_string()),
            Err(SkeinError::ActivityFailed { message, .. }) => {
                ctx.call::<RecordEffect>(format!("invoice: {}", message))
                    .await
            }
            Err(e) => Err(e),
        }
    }
}

/// Lets the card failure fail the workflow.
#[derive(Default)]
pub struct StrictCheckout;

impl Workflow for StrictCheckout {
    type Input = u64;
    type Output = ();

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("strict_checkout")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<DeclineCard>();
    }

    async fn execute(&self, ctx: &WorkflowContext, amount: u64) -> Result<()> {
        ctx.call::<DeclineCard>(amount).await
    }
}

pub struct CountChild;

impl Activity for CountChild {
    type Args = String;
    type Output = ();

    fn info() -> ActivityInfo {
        ActivityInfo::new("count_child").inject::<Recorder>()
    }

    async fn run(ctx: ActivityContext, _name: String) -> Result<()> {
        ctx.service::<Recorder>()?
            .children
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct Onboarding;

impl Workflow for Onboarding {
    type Input = String;
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("onboarding")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<CountChild>();
    }

    async fn execute(&self, ctx: &WorkflowContext, name: String) -> Result<String> {
        ctx.call::<CountChild>(name.clone()).await?;
        Ok(format!("welcome {}", name))
    }
}

#[derive(Default)]
pub struct Team;

impl Workflow for Team {
    type Input = Vec<String>;
    type Output = Vec<String>;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("team")
    }

    async fn execute(&self, ctx: &WorkflowContext, members: Vec<String>) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for member in members {
            ids.push(ctx.start_child::<Onboarding>(member).await?);
        }
        Ok(ids)
    }
}

/// Waits in-process for a short event.
#[derive(Default)]
pub struct Ping;

impl Workflow for Ping {
    type Input = ();
    type Output = Option<u32>;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("ping")
    }

    async fn execute(&self, ctx: &WorkflowContext, _input: ()) -> Result<Option<u32>> {
        ctx.wait_for_event::<u32>(Duration::from_secs(3), "Pong").await
    }
}

/// Flips to a different call site once `DIVERGE` is set.
pub static DIVERGE: AtomicBool = AtomicBool::new(false);

#[derive(Default)]
pub struct Fickle;

impl Workflow for Fickle {
    type Input = ();
    type Output = String;

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("fickle")
    }

    fn activities(activities: &mut ActivitySet) {
        activities.add::<RecordEffect>();
    }

    async fn execute(&self, ctx: &WorkflowContext, _input: ()) -> Result<String> {
        let label = if DIVERGE.load(Ordering::SeqCst) {
            "b"
        } else {
            "a"
        };
        ctx.call::<RecordEffect>(label.to_string()).await
    }
}

pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<MemoryStore>,
    pub clock: MockClock,
    pub mailer: Arc<Mailer>,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = MockClock::new(start_time());
        let mailer = Arc::new(Mailer::default());
        let recorder = Arc::new(Recorder::default());

        let mut registry = WorkflowRegistry::new();
        registry.register::<Signup>().unwrap();
        registry.register::<Reminder>().unwrap();
        registry.register::<DailyFollowUp>().unwrap();
        registry.register::<Once>().unwrap();
        registry.register::<Nap>().unwrap();
        registry.register::<Checkout>().unwrap();
        registry.register::<StrictCheckout>().unwrap();
        registry.register::<Onboarding>().unwrap();
        registry.register::<Team>().unwrap();
        registry.register::<Ping>().unwrap();
        registry.register::<Fickle>().unwrap();
        registry.register::<Soon>().unwrap();
        registry.register::<Broken>().unwrap();

        let mut services = Services::new();
        services.insert_arc(mailer.clone());
        services.insert_arc(recorder.clone());

        let engine = WorkflowEngine::new(
            store.clone(),
            Arc::new(clock.clone()),
            registry,
            services,
            config,
        )
        .unwrap();

        Self {
            engine: Arc::new(engine),
            store,
            clock,
            mailer,
            recorder,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).unwrap());
    }

    pub fn at(&self, offset: Duration) -> DateTime<Utc> {
        start_time() + chrono::Duration::from_std(offset).unwrap()
    }
}
