//! Driver and resume behavior across simulated host restarts.
//!
//! A "kill" is a pipeline future abandoned by `tokio::time::timeout` while
//! a step's action is suspended forever. No cleanup runs, exactly like a
//! process kill. The "restart" assembles a fresh registry over the same
//! cursor store.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stagehand::context::{ArtifactSpec, BuildContext};
use stagehand::cursor::{CursorManager, CursorStore, FileCursorStore, MemoryCursorStore};
use stagehand::errors::PipelineError;
use stagehand::orchestrator::{Pipeline, PipelineOutcome};
use stagehand::registry::StepRegistry;
use stagehand::step::{ContextAction, InterruptionPolicy, StepAction, StepDescriptor};

const KILL_AFTER: Duration = Duration::from_millis(50);

/// Counts invocations; hangs for the first `hang_first`, optionally fails.
#[derive(Default)]
struct Script {
    calls: AtomicUsize,
    hang_first: usize,
    fail: bool,
}

impl Script {
    fn hanging(times: usize) -> Arc<Self> {
        Arc::new(Self {
            hang_first: times,
            ..Default::default()
        })
    }

    fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn scripted(
    name: &str,
    order: i32,
    policy: InterruptionPolicy,
    retry_limit: u32,
    script: Arc<Script>,
) -> StepDescriptor {
    StepDescriptor::new(name)
        .order(order)
        .policy(policy)
        .retry_limit(retry_limit)
        .action(StepAction::bare_fn(move || {
            let script = script.clone();
            Box::pin(async move {
                let n = script.calls.fetch_add(1, Ordering::SeqCst);
                if n < script.hang_first {
                    std::future::pending::<()>().await;
                }
                if script.fail {
                    anyhow::bail!("step logic failed");
                }
                Ok(())
            })
        }))
}

/// A pipeline definition that can be "re-assembled" after every restart.
struct Harness {
    store: Arc<MemoryCursorStore>,
    build: Box<dyn Fn() -> Vec<StepDescriptor>>,
}

impl Harness {
    fn new(build: impl Fn() -> Vec<StepDescriptor> + 'static) -> Self {
        Self {
            store: Arc::new(MemoryCursorStore::new()),
            build: Box::new(build),
        }
    }

    fn cursor(&self) -> CursorManager {
        CursorManager::new(self.store.clone())
    }

    fn boot(&self) -> (Pipeline, BuildContext) {
        let mut registry = StepRegistry::new();
        for descriptor in (self.build)() {
            registry.register(descriptor);
        }
        let pipeline = Pipeline::assemble(&registry, self.cursor());
        (pipeline, context(self.cursor()))
    }

    /// Start a fresh run; `None` means the host was killed mid-step.
    async fn start(&self) -> Option<PipelineOutcome> {
        let (pipeline, mut ctx) = self.boot();
        tokio::time::timeout(KILL_AFTER, pipeline.start(&mut ctx))
            .await
            .ok()
    }

    /// Process start: `Err(())` means killed again.
    async fn restart(&self) -> Result<Option<PipelineOutcome>, ()> {
        let (pipeline, mut ctx) = self.boot();
        tokio::time::timeout(KILL_AFTER, pipeline.resume(&mut ctx))
            .await
            .map_err(|_| ())
    }

    fn has_cursor(&self) -> bool {
        self.cursor().exists().unwrap()
    }
}

fn context(cursor: CursorManager) -> BuildContext {
    BuildContext::new(
        ArtifactSpec {
            id: "avtr_1".into(),
            name: "Avatar".into(),
            output: PathBuf::from("out/{platform}/avatar.bin"),
        },
        cursor,
    )
}

fn step_names(pipeline: &Pipeline) -> Vec<String> {
    pipeline.steps().iter().map(|s| s.name.clone()).collect()
}

mod assembly {
    use super::*;

    #[test]
    fn test_orders_sort_ascending() {
        let harness = Harness::new(|| {
            vec![
                scripted("ten", 10, InterruptionPolicy::Retry, 0, Script::ok()),
                scripted("five", 5, InterruptionPolicy::Retry, 0, Script::ok()),
                scripted("twenty", 20, InterruptionPolicy::Retry, 0, Script::ok()),
            ]
        });
        let (pipeline, _) = harness.boot();
        assert_eq!(step_names(&pipeline), vec!["five", "ten", "twenty"]);
    }

    #[test]
    fn test_assembly_is_identical_across_restarts() {
        let harness = Harness::new(|| {
            vec![
                scripted("b", 1, InterruptionPolicy::Retry, 0, Script::ok()),
                scripted("a", 1, InterruptionPolicy::Retry, 0, Script::ok()),
                scripted("c", 0, InterruptionPolicy::Retry, 0, Script::ok()),
            ]
        });
        let (first, _) = harness.boot();
        let (second, _) = harness.boot();
        assert_eq!(step_names(&first), step_names(&second));
        assert_eq!(step_names(&first), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_invalid_descriptor_is_skipped_not_fatal() {
        let harness = Harness::new(|| {
            vec![
                StepDescriptor::new("no-action").order(1),
                scripted("ok", 2, InterruptionPolicy::Retry, 0, Script::ok()),
            ]
        });
        let (pipeline, _) = harness.boot();
        assert_eq!(step_names(&pipeline), vec!["ok"]);
        assert_eq!(pipeline.rejected().len(), 1);
    }
}

mod retry_policy {
    use super::*;

    #[tokio::test]
    async fn test_interrupted_retry_limit_times_then_succeeds() {
        let flaky = Script::hanging(2);
        let after = Script::ok();
        let harness = Harness::new({
            let (flaky, after) = (flaky.clone(), after.clone());
            move || {
                vec![
                    scripted("flaky", 0, InterruptionPolicy::Retry, 2, flaky.clone()),
                    scripted("after", 1, InterruptionPolicy::Retry, 0, after.clone()),
                ]
            }
        });

        assert!(harness.start().await.is_none());
        assert!(harness.restart().await.is_err());
        let outcome = harness.restart().await.unwrap().unwrap();

        assert!(outcome.is_success(), "{:?}", outcome.error());
        assert_eq!(flaky.calls(), 3);
        assert_eq!(after.calls(), 1);
        assert!(!harness.has_cursor());
    }

    #[tokio::test]
    async fn test_interrupted_more_than_limit_fails_without_invoking() {
        let flaky = Script::hanging(usize::MAX);
        let after = Script::ok();
        let harness = Harness::new({
            let (flaky, after) = (flaky.clone(), after.clone());
            move || {
                vec![
                    scripted("flaky", 0, InterruptionPolicy::Retry, 2, flaky.clone()),
                    scripted("after", 1, InterruptionPolicy::Retry, 0, after.clone()),
                ]
            }
        });

        assert!(harness.start().await.is_none());
        assert!(harness.restart().await.is_err());
        assert!(harness.restart().await.is_err());
        let outcome = harness.restart().await.unwrap().unwrap();

        match outcome.error() {
            Some(PipelineError::RetriesExhausted {
                step,
                attempts,
                limit,
            }) => {
                assert_eq!(step, "flaky");
                assert_eq!(*attempts, 3);
                assert_eq!(*limit, 2);
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(flaky.calls(), 3);
        assert_eq!(after.calls(), 0);
        assert!(!harness.has_cursor());
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_allows_exactly_one_attempt() {
        let once = Script::hanging(1);
        let harness = Harness::new({
            let once = once.clone();
            move || vec![scripted("once", 0, InterruptionPolicy::Retry, 0, once.clone())]
        });

        assert!(harness.start().await.is_none());
        let outcome = harness.restart().await.unwrap().unwrap();
        assert!(matches!(
            outcome.error(),
            Some(PipelineError::RetriesExhausted { .. })
        ));
        assert_eq!(once.calls(), 1);
    }

    #[tokio::test]
    async fn test_completed_steps_are_not_rerun_after_kill() {
        let first = Script::ok();
        let second = Script::hanging(1);
        let harness = Harness::new({
            let (first, second) = (first.clone(), second.clone());
            move || {
                vec![
                    scripted("first", 0, InterruptionPolicy::Retry, 0, first.clone()),
                    scripted("second", 1, InterruptionPolicy::Retry, 1, second.clone()),
                ]
            }
        });

        assert!(harness.start().await.is_none());
        let outcome = harness.restart().await.unwrap().unwrap();
        assert!(outcome.is_success());
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 2);
    }
}

mod continue_policy {
    use super::*;

    #[tokio::test]
    async fn test_interrupted_step_is_skipped_not_reinvoked() {
        let switch = Script::hanging(usize::MAX);
        let after = Script::ok();
        let harness = Harness::new({
            let (switch, after) = (switch.clone(), after.clone());
            move || {
                vec![
                    scripted("switch", 0, InterruptionPolicy::Continue, 0, switch.clone()),
                    scripted("after", 1, InterruptionPolicy::Retry, 0, after.clone()),
                ]
            }
        });

        assert!(harness.start().await.is_none());
        let outcome = harness.restart().await.unwrap().unwrap();

        assert!(outcome.is_success());
        assert_eq!(switch.calls(), 1);
        assert_eq!(after.calls(), 1);
        assert!(!harness.has_cursor());
    }

    #[tokio::test]
    async fn test_continue_on_last_step_completes_run() {
        let last = Script::hanging(usize::MAX);
        let harness = Harness::new({
            let last = last.clone();
            move || vec![scripted("last", 0, InterruptionPolicy::Continue, 0, last.clone())]
        });

        assert!(harness.start().await.is_none());
        let outcome = harness.restart().await.unwrap().unwrap();
        assert!(matches!(outcome, PipelineOutcome::Completed { steps_run: 0 }));
        assert!(!harness.has_cursor());
    }
}

mod cancel_policy {
    use super::*;

    #[tokio::test]
    async fn test_interrupted_step_aborts_on_next_start() {
        let risky = Script::hanging(usize::MAX);
        let after = Script::ok();
        let harness = Harness::new({
            let (risky, after) = (risky.clone(), after.clone());
            move || {
                vec![
                    scripted("risky", 0, InterruptionPolicy::Cancel, 5, risky.clone()),
                    scripted("after", 1, InterruptionPolicy::Retry, 0, after.clone()),
                ]
            }
        });

        assert!(harness.start().await.is_none());
        assert!(harness.has_cursor());
        let outcome = harness.restart().await.unwrap().unwrap();

        match outcome.error() {
            Some(PipelineError::Cancelled { step }) => assert_eq!(step, "risky"),
            other => panic!("Expected Cancelled, got {:?}", other),
        }
        assert_eq!(risky.calls(), 1);
        assert_eq!(after.calls(), 0);
        assert!(!harness.has_cursor());
    }
}

mod execution_errors {
    use super::*;

    async fn assert_fails_immediately(policy: InterruptionPolicy) {
        let broken = Script::failing();
        let after = Script::ok();
        let harness = Harness::new({
            let (broken, after) = (broken.clone(), after.clone());
            move || {
                vec![
                    scripted("broken", 0, policy, 10, broken.clone()),
                    scripted("after", 1, InterruptionPolicy::Retry, 0, after.clone()),
                ]
            }
        });

        let outcome = harness.start().await.unwrap();
        match outcome.error() {
            Some(PipelineError::StepFailed { step, source }) => {
                assert_eq!(step, "broken");
                assert!(source.to_string().contains("step logic failed"));
            }
            other => panic!("Expected StepFailed, got {:?}", other),
        }
        assert_eq!(broken.calls(), 1);
        assert_eq!(after.calls(), 0);
        assert!(!harness.has_cursor());

        // Nothing left to resume.
        assert!(harness.restart().await.unwrap().is_none());
        assert_eq!(broken.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_fatal_under_retry() {
        assert_fails_immediately(InterruptionPolicy::Retry).await;
    }

    #[tokio::test]
    async fn test_failure_is_fatal_under_continue() {
        assert_fails_immediately(InterruptionPolicy::Continue).await;
    }

    #[tokio::test]
    async fn test_failure_is_fatal_under_cancel() {
        assert_fails_immediately(InterruptionPolicy::Cancel).await;
    }
}

mod resume_trigger {
    use super::*;

    #[tokio::test]
    async fn test_resume_without_cursor_is_a_no_op() {
        let step = Script::ok();
        let harness = Harness::new({
            let step = step.clone();
            move || vec![scripted("step", 0, InterruptionPolicy::Retry, 0, step.clone())]
        });
        harness.store.set("unrelated", serde_json::json!(1)).unwrap();
        let before = harness.store.entries().unwrap();

        assert!(harness.restart().await.unwrap().is_none());
        assert_eq!(step.calls(), 0);
        assert_eq!(harness.store.entries().unwrap(), before);
    }

    #[tokio::test]
    async fn test_cursor_past_step_list_aborts() {
        let harness = Harness::new(|| {
            vec![scripted("only", 0, InterruptionPolicy::Retry, 0, Script::ok())]
        });
        let mut cursor = stagehand::cursor::Cursor::fresh(5);
        cursor.retry_count = 0;
        harness.cursor().save(&cursor).unwrap();

        let outcome = harness.restart().await.unwrap().unwrap();
        assert!(matches!(
            outcome.error(),
            Some(PipelineError::UnknownStep { index: 5, .. })
        ));
        assert!(!harness.has_cursor());
    }

    #[tokio::test]
    async fn test_start_discards_previous_run() {
        let first = Script::ok();
        let harness = Harness::new({
            let first = first.clone();
            move || vec![scripted("first", 0, InterruptionPolicy::Retry, 0, first.clone())]
        });
        let mut stale = stagehand::cursor::Cursor::fresh(0);
        stale.retry_count = 7;
        harness.cursor().save(&stale).unwrap();

        let outcome = harness.start().await.unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.error());
        assert_eq!(first.calls(), 1);
    }
}

mod sub_progress {
    use super::*;

    /// Uploads to three destinations, recording each in step-local progress,
    /// and hangs once after the second.
    struct Uploader {
        uploads: Arc<AtomicUsize>,
        hung: AtomicUsize,
    }

    #[async_trait]
    impl ContextAction for Uploader {
        async fn run(&self, ctx: &mut BuildContext) -> Result<()> {
            let progress = ctx.progress();
            let done = progress.get_u64("uploaded")?.unwrap_or(0);
            for i in done..3 {
                if i == 2 && self.hung.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::future::pending::<()>().await;
                }
                self.uploads.fetch_add(1, Ordering::SeqCst);
                progress.set_u64("uploaded", i + 1)?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_resumes_from_recorded_progress() {
        let uploads = Arc::new(AtomicUsize::new(0));
        let uploader = Arc::new(Uploader {
            uploads: uploads.clone(),
            hung: AtomicUsize::new(0),
        });
        let harness = Harness::new({
            let uploader = uploader.clone();
            move || {
                vec![
                    StepDescriptor::new("publish")
                        .retry_limit(1)
                        .action(StepAction::WithContext(uploader.clone())),
                ]
            }
        });

        assert!(harness.start().await.is_none());
        assert_eq!(uploads.load(Ordering::SeqCst), 2);
        assert!(!harness.cursor().sub_progress().unwrap().is_empty());

        let outcome = harness.restart().await.unwrap().unwrap();
        assert!(outcome.is_success(), "{:?}", outcome.error());
        assert_eq!(uploads.load(Ordering::SeqCst), 3);
        assert!(harness.cursor().sub_progress().unwrap().is_empty());
    }
}

mod file_store {
    use super::*;
    use tempfile::tempdir;

    fn pipeline(store: Arc<FileCursorStore>, script: Arc<Script>) -> (Pipeline, BuildContext) {
        let mut registry = StepRegistry::new();
        registry.register(scripted("work", 0, InterruptionPolicy::Retry, 1, script));
        let cursor = CursorManager::new(store);
        (Pipeline::assemble(&registry, cursor.clone()), context(cursor))
    }

    #[tokio::test]
    async fn test_cursor_survives_reopening_the_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let work = Script::hanging(1);

        {
            let store = Arc::new(FileCursorStore::open(&path).unwrap());
            let (pipeline, mut ctx) = pipeline(store, work.clone());
            let killed = tokio::time::timeout(KILL_AFTER, pipeline.start(&mut ctx)).await;
            assert!(killed.is_err());
        }
        assert!(path.exists());

        let store = Arc::new(FileCursorStore::open(&path).unwrap());
        let (pipeline, mut ctx) = pipeline(store, work.clone());
        let outcome = pipeline.resume(&mut ctx).await.unwrap();

        assert!(outcome.is_success(), "{:?}", outcome.error());
        assert_eq!(work.calls(), 2);
        assert!(!path.exists());
    }
}
