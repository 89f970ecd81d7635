//! End-to-end job flow over the in-memory stores.
//!
//! Covers admission, status bookkeeping, failure escalation, panic isolation and
//! the maintenance pass, with a manual clock driving every time-based rule.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use tokio::sync::Notify;

use feedsync_core::{
    Clock, Integration, IntegrationId, IntegrationStatus, ManualClock, QueueEntry, QueueStatus,
    TransitionPolicy, UserId,
};
use feedsync_infra::{
    ExecutionContext, FeedProcessor, HeartbeatOutcome, InMemoryCoordinationStore,
    InMemoryQueueStore, JobOrchestrator, JobOutcome, NoTenantActivity, OrchestrationServices,
    OrchestratorConfig, ProcessingOptions, ProcessingResult, ProgressReporter, QueueStore,
    RetryPolicy, SlotDenial,
};
use feedsync_observability::{AlertSeverity, RecordingNotifier};

enum Step {
    Return(ProcessingResult),
    Panic(&'static str),
}

/// Plays back a fixed list of results, one per run.
struct ScriptedProcessor {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedProcessor {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedProcessor for ScriptedProcessor {
    async fn process(&self, _integration: &Integration, progress: ProgressReporter) -> ProcessingResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.update("fetch", Some(50)).await;

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Return(result)) => result,
            Some(Step::Panic(msg)) => panic!("{msg}"),
            None => ProcessingResult::transient("script exhausted"),
        }
    }
}

/// Holds its run open until the test lets it finish.
struct GatedProcessor {
    started: Notify,
    finish: Notify,
}

#[async_trait]
impl FeedProcessor for GatedProcessor {
    async fn process(&self, _integration: &Integration, _progress: ProgressReporter) -> ProcessingResult {
        self.started.notify_one();
        self.finish.notified().await;
        ProcessingResult::success(5, 5)
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    queue: Arc<InMemoryQueueStore>,
    services: OrchestrationServices,
    notifier: Arc<RecordingNotifier>,
}

fn harness(max_slots: usize) -> Harness {
    harness_with_policy(max_slots, TransitionPolicy::Permissive)
}

fn harness_with_policy(max_slots: usize, policy: TransitionPolicy) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = InMemoryQueueStore::arc();
    let coordination = InMemoryCoordinationStore::arc(clock.clone());

    let mut config = OrchestratorConfig::default();
    config.slots.max_slots = max_slots;
    config.heartbeat.worker_id = "flow-worker".to_string();
    config.coordination_retry = RetryPolicy::fixed(3, Duration::ZERO);
    config.transition_policy = policy;

    let services = OrchestrationServices::build(
        config,
        coordination,
        queue.clone(),
        Arc::new(NoTenantActivity),
        clock.clone(),
    );

    Harness {
        clock,
        queue,
        services,
        notifier: Arc::new(RecordingNotifier::new()),
    }
}

impl Harness {
    async fn register(&self) -> IntegrationId {
        let integration = Integration::new(UserId::new(), "https://shop.example/feed.xml", "generic", self.clock.now());
        let id = integration.id;
        self.queue
            .enqueue(&integration, &QueueEntry::new(id, 0, self.clock.now()))
            .await
            .unwrap();
        id
    }

    fn orchestrator(&self, processor: Arc<ScriptedProcessor>) -> JobOrchestrator {
        self.services.orchestrator(processor, self.notifier.clone())
    }

    fn entry(&self, id: IntegrationId) -> QueueEntry {
        self.queue.entry(id).unwrap()
    }

    async fn active(&self) -> usize {
        self.services.slots().active_count().await.unwrap()
    }
}

#[tokio::test]
async fn successful_run_completes_and_releases_everything() {
    let h = harness(6);
    let id = h.register().await;
    let processor = ScriptedProcessor::new([Step::Return(ProcessingResult::success(12, 15))]);

    let outcome = h
        .orchestrator(processor.clone())
        .execute(id, ExecutionContext::default())
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Completed { processed_items: 12, .. }));
    assert!(!outcome.should_requeue());

    let entry = h.entry(id);
    assert_eq!(entry.status, QueueStatus::Done);
    assert_eq!(entry.attempts, 0);
    assert!(entry.completed_at.is_some());

    let integration = h.queue.integration(id).unwrap();
    assert_eq!(integration.status, IntegrationStatus::Integrated);
    assert_eq!(integration.item_count, 12);

    assert_eq!(h.active().await, 0);
    let heartbeats = h.services.heartbeats();
    assert!(heartbeats.get(id).await.unwrap().is_none());
    let tombstone = heartbeats.final_status(id).await.unwrap().unwrap();
    assert_eq!(tombstone.outcome, HeartbeatOutcome::Completed);
    assert_eq!(tombstone.worker_id, "flow-worker");
    assert!(h.notifier.alerts().is_empty());
}

#[tokio::test]
async fn finished_integration_needs_reprocess_request() {
    let h = harness(6);
    let id = h.register().await;
    let processor = ScriptedProcessor::new([
        Step::Return(ProcessingResult::success(3, 3)),
        Step::Return(ProcessingResult::success(4, 4)),
    ]);
    let orchestrator = h.orchestrator(processor.clone());

    orchestrator.execute(id, ExecutionContext::default()).await.unwrap();
    assert!(orchestrator.execute(id, ExecutionContext::default()).await.is_err());
    assert_eq!(processor.calls(), 1);
    assert_eq!(h.active().await, 0);

    let outcome = orchestrator
        .execute(id, ExecutionContext::reprocess().with_trigger("manual"))
        .await
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Completed { processed_items: 4, .. }));
    assert_eq!(h.queue.integration(id).unwrap().item_count, 4);
}

async fn escalates_to_failed_on_fifth_attempt(policy: TransitionPolicy) {
    let h = harness_with_policy(6, policy);
    let id = h.register().await;
    let processor =
        ScriptedProcessor::new((0..5).map(|_| Step::Return(ProcessingResult::transient("upstream timeout"))));
    let orchestrator = h.orchestrator(processor);

    for attempt in 1..=4u32 {
        let outcome = orchestrator.execute(id, ExecutionContext::default()).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Retryable {
                attempt,
                message: "upstream timeout".to_string()
            }
        );
        assert!(outcome.should_requeue());
        let entry = h.entry(id);
        assert_eq!(entry.status, QueueStatus::Error);
        assert_eq!(entry.attempts, attempt);
    }
    assert!(h.notifier.alerts().is_empty());

    let outcome = orchestrator.execute(id, ExecutionContext::default()).await.unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Terminal {
            attempt: 5,
            message: "upstream timeout".to_string()
        }
    );
    assert!(!outcome.should_requeue());

    let entry = h.entry(id);
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.error_message.as_deref(), Some("upstream timeout"));

    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(alerts[0].context["attempts_exhausted"], true);
    assert_eq!(h.active().await, 0);
}

#[tokio::test]
async fn repeated_failures_escalate_to_failed_on_fifth_attempt() {
    escalates_to_failed_on_fifth_attempt(TransitionPolicy::Permissive).await;
}

#[tokio::test]
async fn strict_policy_still_retries_errored_entries() {
    escalates_to_failed_on_fifth_attempt(TransitionPolicy::Strict).await;
}

#[tokio::test]
async fn reclaimed_run_cannot_overwrite_or_free_the_next_run() {
    let h = harness(6);
    let id = h.register().await;
    let gate = Arc::new(GatedProcessor {
        started: Notify::new(),
        finish: Notify::new(),
    });
    let orchestrator = h.services.orchestrator(gate.clone(), h.notifier.clone());
    let first = tokio::spawn(async move { orchestrator.execute(id, ExecutionContext::default()).await });
    gate.started.notified().await;

    // The first worker goes quiet past the slot TTL; cleanup hands the job to a second run.
    h.clock.advance(Duration::from_secs(31 * 60));
    let report = h.services.slots().cleanup_expired().await.unwrap();
    assert_eq!(report.reset, vec![id]);
    assert!(h.services.slots().acquire(id).await.admitted);
    let second = h
        .services
        .status()
        .mark_processing(id, ProcessingOptions::default())
        .await
        .unwrap();
    h.services.heartbeats().start(id).await.unwrap();

    gate.finish.notify_one();
    let outcome = first.await.unwrap().unwrap();

    assert_eq!(outcome, JobOutcome::Superseded);
    assert!(!outcome.should_requeue());
    let entry = h.entry(id);
    assert_eq!(entry, second);
    assert_eq!(entry.status, QueueStatus::InProcess);
    assert_eq!(entry.attempts, 3);
    assert_eq!(h.active().await, 1);
    assert!(h.services.heartbeats().get(id).await.unwrap().is_some());
}

#[tokio::test]
async fn terminal_failure_is_not_retried() {
    let h = harness(6);
    let id = h.register().await;
    let processor = ScriptedProcessor::new([Step::Return(ProcessingResult::terminal("feed removed upstream"))]);

    let outcome = h
        .orchestrator(processor)
        .execute(id, ExecutionContext::default())
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Terminal { attempt: 1, .. }));
    assert_eq!(h.entry(id).status, QueueStatus::Failed);
    assert_eq!(h.queue.integration(id).unwrap().status, IntegrationStatus::Error);

    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(alerts[0].context["terminal"], true);

    let tombstone = h.services.heartbeats().final_status(id).await.unwrap().unwrap();
    assert_eq!(tombstone.outcome, HeartbeatOutcome::Failed);
}

#[tokio::test]
async fn zero_processed_items_counts_as_failure() {
    let h = harness(6);
    let id = h.register().await;
    let processor = ScriptedProcessor::new([Step::Return(ProcessingResult::success(0, 40))]);

    let outcome = h
        .orchestrator(processor)
        .execute(id, ExecutionContext::default())
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Retryable { attempt: 1, .. }));
    let entry = h.entry(id);
    assert_eq!(entry.status, QueueStatus::Error);
    assert_eq!(entry.error_message.as_deref(), Some("no items processed"));
    assert_eq!(entry.error_details.as_ref().unwrap()["total_items"], 40);
    assert_eq!(entry.completed_at, None);
}

#[tokio::test]
async fn business_critical_error_raises_warning() {
    let h = harness(6);
    let id = h.register().await;
    let processor =
        ScriptedProcessor::new([Step::Return(ProcessingResult::transient("HTTP 403 from supplier"))]);

    let outcome = h
        .orchestrator(processor)
        .execute(id, ExecutionContext::default())
        .await
        .unwrap();

    assert!(matches!(outcome, JobOutcome::Retryable { .. }));
    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Warning);
}

#[tokio::test]
async fn processor_panic_still_releases_slot_and_heartbeat() {
    let h = harness(6);
    let id = h.register().await;
    let processor = ScriptedProcessor::new([Step::Panic("parser exploded")]);

    let outcome = h
        .orchestrator(processor)
        .execute(id, ExecutionContext::default())
        .await
        .unwrap();

    match outcome {
        JobOutcome::Retryable { attempt, message } => {
            assert_eq!(attempt, 1);
            assert!(message.starts_with("processor panicked"), "{message}");
            assert!(message.contains("parser exploded"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    assert_eq!(h.entry(id).status, QueueStatus::Error);
    assert_eq!(h.active().await, 0);
    let heartbeats = h.services.heartbeats();
    assert!(heartbeats.get(id).await.unwrap().is_none());
    assert_eq!(
        heartbeats.final_status(id).await.unwrap().unwrap().outcome,
        HeartbeatOutcome::Error
    );
}

#[tokio::test]
async fn full_ceiling_defers_without_touching_the_job() {
    let h = harness(2);
    let slots = h.services.slots();
    assert!(slots.acquire(IntegrationId::new()).await.admitted);
    assert!(slots.acquire(IntegrationId::new()).await.admitted);

    let id = h.register().await;
    let before = h.entry(id);
    let processor = ScriptedProcessor::new([Step::Return(ProcessingResult::success(1, 1))]);

    let outcome = h
        .orchestrator(processor.clone())
        .execute(id, ExecutionContext::default())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        JobOutcome::RetryLater {
            reason: SlotDenial::CeilingReached,
            delay: Duration::from_secs(60)
        }
    );
    assert_eq!(processor.calls(), 0);
    assert_eq!(h.entry(id), before);
    assert!(h.services.heartbeats().get(id).await.unwrap().is_none());
    assert_eq!(h.active().await, 2);
}

#[tokio::test]
async fn unknown_integration_is_not_found_and_frees_slot() {
    let h = harness(6);
    let processor = ScriptedProcessor::new([]);

    let outcome = h
        .orchestrator(processor.clone())
        .execute(IntegrationId::new(), ExecutionContext::default())
        .await
        .unwrap();

    assert_eq!(outcome, JobOutcome::NotFound);
    assert_eq!(processor.calls(), 0);
    assert_eq!(h.active().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_ceiling() {
    let h = harness(6);
    let slots = h.services.slots();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let slots = slots.clone();
            tokio::spawn(async move { slots.acquire(IntegrationId::new()).await.admitted })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 6);
    assert_eq!(h.active().await, 6);
}

#[tokio::test]
async fn maintenance_recovers_silent_job() {
    let h = harness(6);
    let id = h.register().await;
    let slots = h.services.slots();
    let status = h.services.status();
    let heartbeats = h.services.heartbeats();

    assert!(slots.acquire(id).await.admitted);
    status.mark_processing(id, Default::default()).await.unwrap();
    heartbeats.start(id).await.unwrap();

    h.clock.advance(Duration::from_secs(6 * 60));
    let report = h.services.maintenance().run_once().await;

    assert!(report.failed_steps.is_empty());
    assert!(report.orphaned.evicted.is_empty());
    assert_eq!(report.recovered, vec![id]);

    let entry = h.entry(id);
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.attempts, 2);
    assert_eq!(h.active().await, 0);
    assert_eq!(
        heartbeats.final_status(id).await.unwrap().unwrap().outcome,
        HeartbeatOutcome::Recovered
    );
}

#[tokio::test]
async fn maintenance_reclaims_expired_slots() {
    let h = harness(6);
    let id = h.register().await;
    assert!(h.services.slots().acquire(id).await.admitted);
    h.services
        .status()
        .mark_processing(id, Default::default())
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(31 * 60));
    let report = h.services.maintenance().run_once().await;

    assert_eq!(report.expired.evicted, vec![id]);
    assert_eq!(report.expired.reset, vec![id]);
    assert_eq!(h.entry(id).status, QueueStatus::Pending);
    assert_eq!(h.active().await, 0);
}

#[tokio::test]
async fn maintenance_loop_stops_on_shutdown() {
    let h = harness(6);
    let handle = h.services.maintenance().spawn(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(30)).await;
    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .unwrap();
}

#[derive(Debug, Clone)]
enum SlotOp {
    Acquire(usize),
    Release(usize),
}

fn slot_op() -> impl Strategy<Value = SlotOp> {
    prop_oneof![
        (0usize..10).prop_map(SlotOp::Acquire),
        (0usize..10).prop_map(SlotOp::Release),
    ]
}

proptest! {
    #[test]
    fn active_set_never_exceeds_ceiling(
        max_slots in 1usize..5,
        ops in proptest::collection::vec(slot_op(), 1..40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let h = harness(max_slots);
            let slots = h.services.slots();
            let ids: Vec<IntegrationId> = (0..10).map(|_| IntegrationId::new()).collect();
            let mut held = std::collections::HashSet::new();

            for op in ops {
                match op {
                    SlotOp::Acquire(i) => {
                        let acquisition = slots.acquire(ids[i]).await;
                        if held.contains(&i) {
                            prop_assert!(acquisition.admitted);
                        } else {
                            prop_assert_eq!(acquisition.admitted, held.len() < max_slots);
                        }
                        if acquisition.admitted {
                            held.insert(i);
                        }
                    }
                    SlotOp::Release(i) => {
                        slots.release(ids[i]).await.unwrap();
                        held.remove(&i);
                    }
                }
                let active = slots.active_count().await.unwrap();
                prop_assert!(active <= max_slots);
                prop_assert_eq!(active, held.len());
            }
            Ok(())
        })?;
    }
}
