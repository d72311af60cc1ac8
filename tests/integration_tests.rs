//! Integration tests for cairn
//!
//! Workflows run end to end against scripted doubles for the assistant, the
//! Generate/Verify/Review roles and version control. Memory scenarios run
//! against real files in temporary directories.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

use cairn::assistant::{AssistantClient, SessionConfig, SessionId, SessionManager};
use cairn::executor::{StepOutcome, TaskAgent, TaskContext};
use cairn::plan::{PhaseTask, WorkStatus};
use cairn::vcs::VersionControl;
use cairn::{Config, Orchestrator, OrchestratorError, WorkflowStatus};

const TWO_PHASE_PLAN: &str = r#"Plan follows.
{"phases": [
  {"name": "Core", "acceptance_criteria": ["parser handles empty input"],
   "tasks": [{"description": "Add parser", "target_files": ["src/parser.rs"]},
             {"description": "Add lexer"}]},
  {"name": "Wiring", "tasks": [{"description": "Hook up CLI"}]}
]}"#;

// =============================================================================
// Test doubles
// =============================================================================

/// Assistant that answers every prompt with the same text.
struct Planner {
    reply: String,
}

#[async_trait]
impl AssistantClient for Planner {
    async fn create_session(&self, config: &SessionConfig) -> anyhow::Result<SessionId> {
        Ok(SessionId::new(config.role.clone()))
    }
    async fn send(&self, _session: &SessionId, _prompt: &str) -> anyhow::Result<String> {
        Ok(self.reply.clone())
    }
    async fn close(&self, _session: &SessionId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Blocks the first Generate of one task until released.
struct Gate {
    task: String,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    fn on(task: &str) -> Arc<Self> {
        Arc::new(Self {
            task: task.to_string(),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[derive(Default)]
struct ScriptedAgent {
    /// Task id -> Generate failures still to hand out
    generate_failures: Mutex<HashMap<String, u32>>,
    /// Task ids whose Verify always fails
    failing_verify: Mutex<HashSet<String>>,
    /// Task id -> extra Generate output
    outputs: HashMap<String, String>,
    gate: Option<Arc<Gate>>,
    generated: Mutex<Vec<String>>,
    contexts: Mutex<Vec<Option<String>>>,
}

impl ScriptedAgent {
    fn generated(&self) -> Vec<String> {
        self.generated.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskAgent for ScriptedAgent {
    async fn generate(&self, task: &PhaseTask, ctx: &TaskContext) -> anyhow::Result<StepOutcome> {
        self.generated.lock().unwrap().push(task.id.clone());
        self.contexts.lock().unwrap().push(ctx.memory.clone());
        if let Some(gate) = &self.gate
            && gate.task == task.id
            && gate.armed.swap(false, Ordering::SeqCst)
        {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        {
            let mut failures = self.generate_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&task.id)
                && *remaining > 0
            {
                *remaining -= 1;
                return Ok(StepOutcome::failed("completion promise missing"));
            }
        }
        let extra = self.outputs.get(&task.id).cloned().unwrap_or_default();
        Ok(StepOutcome::passed(format!(
            "<promise>TASK COMPLETE</promise>\n{}",
            extra
        )))
    }

    async fn verify(&self, task: &PhaseTask, _generated: &str) -> anyhow::Result<StepOutcome> {
        if self.failing_verify.lock().unwrap().contains(&task.id) {
            Ok(StepOutcome::failed(format!("tests for {} failed", task.id)))
        } else {
            Ok(StepOutcome::passed("all checks passed"))
        }
    }

    async fn review(
        &self,
        _task: &PhaseTask,
        _ctx: &TaskContext,
        _generated: &str,
    ) -> anyhow::Result<StepOutcome> {
        Ok(StepOutcome::passed("<verdict>approve</verdict>"))
    }
}

#[derive(Default)]
struct RecordingVcs {
    log: Mutex<Vec<String>>,
    /// Pushes to reject before accepting
    failing_pushes: AtomicUsize,
    /// Reject the next commit whose message contains this text
    failing_commit: Mutex<Option<String>>,
}

impl RecordingVcs {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|l| l == entry)
    }
}

#[async_trait]
impl VersionControl for RecordingVcs {
    async fn stage(&self, _pathspec: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn commit(&self, message: &str) -> anyhow::Result<String> {
        {
            let mut failing = self.failing_commit.lock().unwrap();
            if failing.as_deref().is_some_and(|text| message.contains(text)) {
                *failing = None;
                anyhow::bail!("index.lock exists");
            }
        }
        let mut log = self.log.lock().unwrap();
        log.push(format!("commit {}", message));
        Ok(format!("{:040x}", log.len()))
    }
    async fn push(&self, branch: &str) -> anyhow::Result<()> {
        if self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("remote rejected");
        }
        self.log.lock().unwrap().push(format!("push {}", branch));
        Ok(())
    }
    async fn create_branch(&self, name: &str, _base: Option<&str>) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("branch {}", name));
        Ok(())
    }
    async fn checkout(&self, name: &str) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("checkout {}", name));
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config() -> Config {
    let mut config = Config::default();
    config.guidance.enabled = false;
    config
}

fn orchestrator(
    config: Config,
    planner_reply: &str,
    agent: Arc<ScriptedAgent>,
    vcs: Arc<RecordingVcs>,
) -> Orchestrator {
    let vcs: Arc<dyn VersionControl> = vcs;
    let agent: Arc<dyn TaskAgent> = agent;
    Orchestrator::builder(config)
        .sessions(SessionManager::new(Arc::new(Planner {
            reply: planner_reply.to_string(),
        })))
        .vcs_provider(move |_: &Path| -> anyhow::Result<Arc<dyn VersionControl>> { Ok(vcs.clone()) })
        .agent_provider(move |_: &Path| -> Arc<dyn TaskAgent> { agent.clone() })
        .build()
        .unwrap()
}

struct Fixture {
    dir: TempDir,
    agent: Arc<ScriptedAgent>,
    vcs: Arc<RecordingVcs>,
    orchestrator: Orchestrator,
}

fn fixture(agent: ScriptedAgent) -> Fixture {
    fixture_with(config(), TWO_PHASE_PLAN, agent)
}

fn fixture_with(config: Config, planner_reply: &str, agent: ScriptedAgent) -> Fixture {
    let dir = TempDir::new().unwrap();
    let agent = Arc::new(agent);
    let vcs = Arc::new(RecordingVcs::default());
    let orchestrator = orchestrator(config, planner_reply, agent.clone(), vcs.clone());
    Fixture {
        dir,
        agent,
        vcs,
        orchestrator,
    }
}

// =============================================================================
// Workflow scenarios
// =============================================================================

mod workflows {
    use super::*;

    #[tokio::test]
    async fn test_generate_retries_then_phase_completes_after_all_tasks() {
        let agent = ScriptedAgent::default();
        agent.generate_failures.lock().unwrap().insert("1.1".into(), 2);
        let f = fixture(agent);

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();

        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        let plan = snapshot.plan.unwrap();
        assert_eq!(plan.phases.len(), 2);
        let task = &plan.phases[0].tasks[0];
        assert_eq!(task.status, WorkStatus::Completed);
        assert_eq!(task.attempt_count, 3);
        assert_eq!(plan.phases[0].tasks[1].attempt_count, 1);
        assert_eq!(snapshot.workflow.iteration_count, 3);

        let task_12 = f.vcs.position("commit [cairn] task 1.2: Add lexer").unwrap();
        let phase_1 = f.vcs.position("commit [cairn] phase 1: Core").unwrap();
        let phase_2 = f.vcs.position("commit [cairn] phase 2: Wiring").unwrap();
        assert!(task_12 < phase_1);
        assert!(phase_1 < phase_2);
        assert_eq!(
            f.agent.generated(),
            vec!["1.1", "1.1", "1.1", "1.2", "2.1"]
        );
    }

    #[tokio::test]
    async fn test_branch_created_and_pushed_per_phase() {
        let f = fixture(ScriptedAgent::default());
        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();

        let branch = snapshot.workflow.branch.clone().unwrap();
        assert!(branch.starts_with("cairn/build-a-parser-"));
        let log = f.vcs.log();
        assert_eq!(log[0], format!("branch {}", branch));
        assert_eq!(log[1], format!("checkout {}", branch));
        assert_eq!(
            log.iter().filter(|l| **l == format!("push {}", branch)).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_unparsable_plan_falls_back_to_single_task() {
        let f = fixture_with(config(), "I would start with the parser, then...", ScriptedAgent::default());
        let id = f
            .orchestrator
            .start("Add a health endpoint", f.dir.path())
            .await
            .unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();

        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        let plan = snapshot.plan.unwrap();
        assert_eq!(plan.phases.len(), 1);
        assert_eq!(plan.phases[0].name, cairn::plan::FALLBACK_PHASE_NAME);
        assert_eq!(plan.phases[0].tasks.len(), 1);
        assert_eq!(plan.phases[0].tasks[0].description, "Add a health endpoint");
    }

    #[tokio::test]
    async fn test_abort_mid_phase_stops_dispatch_and_keeps_commits() {
        let f = fixture(ScriptedAgent {
            gate: Some(Gate::on("1.2")),
            ..Default::default()
        });
        let gate = f.agent.gate.clone().unwrap();

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        gate.entered.notified().await;
        f.orchestrator.abort(&id).unwrap();
        assert_eq!(f.orchestrator.status(&id).unwrap().status, WorkflowStatus::Aborted);

        gate.release.notify_one();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Aborted);
        assert_eq!(f.agent.generated(), vec!["1.1", "1.2"]);

        let log = f.vcs.log();
        assert!(log.contains(&"commit [cairn] task 1.1: Add parser".to_string()));
        assert!(!log.iter().any(|l| l.contains("task 1.2")));
        assert!(!log.iter().any(|l| l.contains("phase 1")));
        let plan = snapshot.plan.unwrap();
        assert_eq!(plan.phases[0].tasks[0].status, WorkStatus::Completed);
        assert_ne!(plan.phases[0].tasks[1].status, WorkStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_after_abort_resumes_at_interrupted_task() {
        let f = fixture(ScriptedAgent {
            gate: Some(Gate::on("1.2")),
            ..Default::default()
        });
        let gate = f.agent.gate.clone().unwrap();

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        gate.entered.notified().await;
        f.orchestrator.abort(&id).unwrap();
        gate.release.notify_one();
        f.orchestrator.wait(&id).await.unwrap();

        f.orchestrator.retry(&id).unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        assert_eq!(f.agent.generated(), vec!["1.1", "1.2", "1.2", "2.1"]);
        assert_eq!(
            f.vcs.log().iter().filter(|l| l.contains("task 1.1")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_exhausted_task_fails_workflow_then_retry_completes() {
        let agent = ScriptedAgent::default();
        agent.failing_verify.lock().unwrap().insert("1.1".into());
        let f = fixture(agent);

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Failed);
        let error = snapshot.workflow.errors.last().unwrap();
        assert!(error.contains("Phase 1 (Core) failed at task 1.1"));
        assert!(error.contains("tests for 1.1 failed"));
        let plan = snapshot.plan.unwrap();
        assert_eq!(plan.phases[0].tasks[0].status, WorkStatus::Failed);
        assert_eq!(plan.phases[0].tasks[0].attempt_count, 3);
        assert_eq!(plan.phases[0].status, WorkStatus::Failed);
        assert!(f.vcs.log().iter().all(|l| !l.starts_with("commit")));

        f.agent.failing_verify.lock().unwrap().clear();
        f.orchestrator.retry(&id).unwrap();
        assert!(matches!(
            f.orchestrator.retry(&id),
            Err(OrchestratorError::WorkflowRunning { .. })
        ));
        assert!(matches!(
            f.orchestrator.skip(&id),
            Err(OrchestratorError::WorkflowRunning { .. })
        ));

        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        let plan = snapshot.plan.unwrap();
        assert_eq!(plan.phases[0].tasks[0].attempt_count, 1);
        assert!(matches!(
            f.orchestrator.retry(&id),
            Err(OrchestratorError::NothingToResume { .. })
        ));
    }

    #[tokio::test]
    async fn test_skip_abandons_failed_phase() {
        let agent = ScriptedAgent::default();
        agent.failing_verify.lock().unwrap().insert("1.2".into());
        let f = fixture(agent);

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        assert_eq!(
            f.orchestrator.wait(&id).await.unwrap().workflow.status,
            WorkflowStatus::Failed
        );

        f.orchestrator.skip(&id).unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);

        let plan = snapshot.plan.unwrap();
        assert!(plan.phases[0].skipped);
        assert_eq!(plan.phases[0].status, WorkStatus::Failed);
        assert!(plan.phases[0].tasks[1].skipped);
        assert_eq!(plan.phases[1].status, WorkStatus::Completed);

        let log = f.vcs.log();
        assert!(log.contains(&"commit [cairn] task 1.1: Add parser".to_string()));
        assert!(!log.iter().any(|l| l.contains("phase 1")));
        assert!(log.contains(&"commit [cairn] phase 2: Wiring".to_string()));
    }

    #[tokio::test]
    async fn test_iteration_limit_fails_workflow() {
        let mut config = config();
        config.orchestrator.max_iterations = 2;
        let f = fixture_with(config, TWO_PHASE_PLAN, ScriptedAgent::default());

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Failed);
        assert_eq!(snapshot.workflow.iteration_count, 2);
        assert!(
            snapshot
                .workflow
                .errors
                .last()
                .unwrap()
                .contains("Iteration limit of 2 reached")
        );
        assert_eq!(f.agent.generated(), vec!["1.1", "1.2"]);
    }

    #[tokio::test]
    async fn test_second_workflow_on_same_repository_is_rejected() {
        let f = fixture(ScriptedAgent {
            gate: Some(Gate::on("1.1")),
            ..Default::default()
        });
        let gate = f.agent.gate.clone().unwrap();

        let first = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        gate.entered.notified().await;
        match f.orchestrator.start("Something else", f.dir.path()).await {
            Err(OrchestratorError::RepositoryBusy { workflow_id, .. }) => assert_eq!(workflow_id, first),
            other => panic!("Expected RepositoryBusy, got {:?}", other.map(|_| ())),
        }

        f.orchestrator.abort(&first).unwrap();
        gate.release.notify_one();
        f.orchestrator.wait(&first).await.unwrap();

        let second = f.orchestrator.start("Something else", f.dir.path()).await.unwrap();
        assert_eq!(
            f.orchestrator.wait(&second).await.unwrap().workflow.status,
            WorkflowStatus::Complete
        );
        assert_eq!(f.orchestrator.list().len(), 2);
    }

    #[tokio::test]
    async fn test_push_failure_fails_workflow_and_retry_pushes_the_phase() {
        let f = fixture(ScriptedAgent::default());
        f.vcs.failing_pushes.store(1, Ordering::SeqCst);

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Failed);
        assert!(snapshot.workflow.errors.last().unwrap().contains("remote rejected"));
        let plan = snapshot.plan.unwrap();
        assert_eq!(plan.phases[0].status, WorkStatus::InProgress);
        assert!(plan.phases[0].checkpoint.is_some());
        assert!(f.vcs.position("commit [cairn] phase 1: Core").is_some());
        assert!(!f.vcs.log().iter().any(|l| l.starts_with("push")));

        f.orchestrator.retry(&id).unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        assert_eq!(snapshot.plan.unwrap().phases[0].status, WorkStatus::Completed);

        let branch = snapshot.workflow.branch.unwrap();
        let push = format!("push {}", branch);
        let log = f.vcs.log();
        assert_eq!(log.iter().filter(|l| l.contains("phase 1: Core")).count(), 1);
        assert_eq!(log.iter().filter(|l| **l == push).count(), 2);
        let phase_1 = f.vcs.position("commit [cairn] phase 1: Core").unwrap();
        let task_21 = f.vcs.position("commit [cairn] task 2.1: Hook up CLI").unwrap();
        let first_push = f.vcs.position(&push).unwrap();
        assert!(phase_1 < first_push && first_push < task_21);
        assert_eq!(f.agent.generated(), vec!["1.1", "1.2", "2.1"]);
    }

    #[tokio::test]
    async fn test_task_commit_failure_is_redone_on_retry() {
        let f = fixture(ScriptedAgent::default());
        *f.vcs.failing_commit.lock().unwrap() = Some("task 1.1".into());

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Failed);
        let error = snapshot.workflow.errors.last().unwrap();
        assert!(error.contains("Failed to commit task 1.1"));
        assert!(error.contains("index.lock exists"));
        let plan = snapshot.plan.unwrap();
        assert_eq!(plan.phases[0].tasks[0].status, WorkStatus::InProgress);
        assert_ne!(plan.phases[0].status, WorkStatus::Completed);
        assert!(!f.vcs.log().iter().any(|l| l.starts_with("commit")));

        f.orchestrator.retry(&id).unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        let log = f.vcs.log();
        assert_eq!(
            log.iter()
                .filter(|l| **l == "commit [cairn] task 1.1: Add parser")
                .count(),
            1
        );
        let task_11 = f.vcs.position("commit [cairn] task 1.1: Add parser").unwrap();
        let task_12 = f.vcs.position("commit [cairn] task 1.2: Add lexer").unwrap();
        assert!(task_11 < task_12);
        assert_eq!(f.agent.generated(), vec!["1.1", "1.1", "1.2", "2.1"]);
    }

    #[tokio::test]
    async fn test_workflows_on_different_repositories_run_concurrently() {
        let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
        let mut vcs_by_path: HashMap<PathBuf, Arc<RecordingVcs>> = HashMap::new();
        let mut agents_by_path: HashMap<PathBuf, Arc<ScriptedAgent>> = HashMap::new();
        for dir in &dirs {
            let path = dir.path().canonicalize().unwrap();
            vcs_by_path.insert(path.clone(), Arc::new(RecordingVcs::default()));
            agents_by_path.insert(
                path,
                Arc::new(ScriptedAgent {
                    gate: Some(Gate::on("1.1")),
                    ..Default::default()
                }),
            );
        }
        let vcs_by_path = Arc::new(vcs_by_path);
        let agents_by_path = Arc::new(agents_by_path);

        let orchestrator = {
            let vcs_by_path = vcs_by_path.clone();
            let agents_by_path = agents_by_path.clone();
            Orchestrator::builder(config())
                .sessions(SessionManager::new(Arc::new(Planner {
                    reply: TWO_PHASE_PLAN.to_string(),
                })))
                .vcs_provider(move |path: &Path| -> anyhow::Result<Arc<dyn VersionControl>> {
                    match vcs_by_path.get(path) {
                        Some(vcs) => Ok(vcs.clone()),
                        None => anyhow::bail!("No repository at {}", path.display()),
                    }
                })
                .agent_provider(move |path: &Path| -> Arc<dyn TaskAgent> { agents_by_path[path].clone() })
                .build()
                .unwrap()
        };

        let first = orchestrator.start("Build a parser", dirs[0].path()).await.unwrap();
        let second = orchestrator.start("Build a lexer", dirs[1].path()).await.unwrap();
        for agent in agents_by_path.values() {
            agent.gate.as_ref().unwrap().entered.notified().await;
        }

        for id in [&first, &second] {
            assert_eq!(
                orchestrator.status(id).unwrap().status,
                WorkflowStatus::Implementation
            );
            assert!(orchestrator.handle(id).unwrap().is_running());
        }

        for agent in agents_by_path.values() {
            agent.gate.as_ref().unwrap().release.notify_one();
        }
        for id in [&first, &second] {
            assert_eq!(
                orchestrator.wait(id).await.unwrap().workflow.status,
                WorkflowStatus::Complete
            );
        }

        for (dir, id) in dirs.iter().zip([&first, &second]) {
            let path = dir.path().canonicalize().unwrap();
            let branch = orchestrator.status(id).unwrap().branch.unwrap();
            let log = vcs_by_path[&path].log();
            assert_eq!(log[0], format!("branch {}", branch));
            assert_eq!(log.iter().filter(|l| l.starts_with("commit")).count(), 5);
            assert!(log.iter().all(|l| !l.starts_with("branch") || l.ends_with(&branch)));
            assert_eq!(agents_by_path[&path].generated(), vec!["1.1", "1.2", "2.1"]);
        }
        assert_ne!(
            orchestrator.status(&first).unwrap().branch,
            orchestrator.status(&second).unwrap().branch
        );
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let f = fixture(ScriptedAgent::default());
        assert!(matches!(
            f.orchestrator.abort("nope"),
            Err(OrchestratorError::WorkflowNotFound { .. })
        ));
        assert!(matches!(
            f.orchestrator.stream_events("nope"),
            Err(OrchestratorError::WorkflowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.orchestrator.max_iterations = 0;
        let result = Orchestrator::builder(config)
            .sessions(SessionManager::new(Arc::new(Planner { reply: String::new() })))
            .build();
        assert!(matches!(result, Err(OrchestratorError::InvalidConfig(_))));
    }
}

// =============================================================================
// Event stream
// =============================================================================

mod events {
    use super::*;
    use cairn::orchestrator::EventType;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_starts_with_current_state_and_ends_after_completion() {
        let f = fixture(ScriptedAgent {
            gate: Some(Gate::on("1.1")),
            ..Default::default()
        });
        let gate = f.agent.gate.clone().unwrap();

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        gate.entered.notified().await;
        let stream = f.orchestrator.stream_events(&id).unwrap();
        gate.release.notify_one();

        let events: Vec<_> = stream.collect().await;
        let first = &events[0];
        assert_eq!(first.kind, EventType::Progress);
        assert_eq!(first.data.as_ref().unwrap()["status"], "implementation");

        let last = events.last().unwrap();
        assert_eq!(last.kind, EventType::Completed);
        assert_eq!(last.data.as_ref().unwrap()["status"], "complete");

        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.contains(&"Task 1.1 completed"));
        assert!(messages.contains(&"Phase 2 completed: Wiring"));
        assert_eq!(
            events.iter().filter(|e| e.kind == EventType::Completed).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_abort_ends_stream_with_error_event() {
        let f = fixture(ScriptedAgent {
            gate: Some(Gate::on("1.1")),
            ..Default::default()
        });
        let gate = f.agent.gate.clone().unwrap();

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        gate.entered.notified().await;
        let stream = f.orchestrator.stream_events(&id).unwrap();
        f.orchestrator.abort(&id).unwrap();
        gate.release.notify_one();

        let events: Vec<_> = stream.collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventType::Error);
        assert_eq!(last.message, "Workflow aborted");
        f.orchestrator.wait(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_only_current_state() {
        let f = fixture(ScriptedAgent::default());
        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        f.orchestrator.wait(&id).await.unwrap();

        let events: Vec<_> = f.orchestrator.stream_events(&id).unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventType::Progress);
        assert_eq!(events[0].data.as_ref().unwrap()["status"], "complete");
    }

    #[tokio::test]
    async fn test_independent_subscribers_see_the_same_events() {
        let f = fixture(ScriptedAgent {
            gate: Some(Gate::on("1.1")),
            ..Default::default()
        });
        let gate = f.agent.gate.clone().unwrap();

        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        gate.entered.notified().await;
        let a = f.orchestrator.stream_events(&id).unwrap();
        let b = f.orchestrator.stream_events(&id).unwrap();
        gate.release.notify_one();

        let (a, b) = tokio::join!(a.collect::<Vec<_>>(), b.collect::<Vec<_>>());
        let messages = |events: &[cairn::WorkflowEvent]| -> Vec<String> {
            events.iter().skip(1).map(|e| e.message.clone()).collect()
        };
        assert_eq!(messages(&a), messages(&b));
    }
}

// =============================================================================
// Persistence
// =============================================================================

mod persistence {
    use super::*;
    use cairn::RepositoryId;
    use cairn::orchestrator::{StateStore, Workflow, WorkflowSnapshot};
    use cairn::plan::ImplementationPlan;

    fn persisted_config() -> Config {
        let mut config = config();
        config.orchestrator.state_dir = Some(".cairn/state".into());
        config
    }

    #[tokio::test]
    async fn test_state_written_and_restored() {
        let f = fixture_with(persisted_config(), TWO_PHASE_PLAN, ScriptedAgent::default());
        let id = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        f.orchestrator.wait(&id).await.unwrap();

        let state = f.dir.path().join(".cairn/state").join(&id);
        assert!(state.join("plan.json").exists());
        let status = fs::read_to_string(state.join("status.json")).unwrap();
        assert!(status.contains("\"complete\""));

        let other = fixture_with(persisted_config(), TWO_PHASE_PLAN, ScriptedAgent::default());
        let restored = other.orchestrator.restore(&id, f.dir.path()).unwrap();
        assert_eq!(restored.status, WorkflowStatus::Complete);
        assert_eq!(other.orchestrator.plan(&id).unwrap().unwrap().phases.len(), 2);

        other.orchestrator.cleanup(&id).unwrap();
        assert!(!state.exists());
        assert!(matches!(
            other.orchestrator.status(&id),
            Err(OrchestratorError::WorkflowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_interrupted_workflow_restores_as_failed_and_resumes() {
        let f = fixture_with(persisted_config(), TWO_PHASE_PLAN, ScriptedAgent::default());
        let repo = fs::canonicalize(f.dir.path()).unwrap();

        let mut workflow = Workflow::new(
            "Add a health endpoint",
            &repo,
            RepositoryId::new(repo.display().to_string()),
            50,
        );
        workflow.status = WorkflowStatus::Implementation;
        let mut plan = ImplementationPlan::fallback("Add a health endpoint");
        plan.phases[0].status = WorkStatus::InProgress;
        plan.phases[0].tasks[0].status = WorkStatus::InProgress;
        plan.phases[0].tasks[0].attempt_count = 2;
        let id = workflow.id.clone();
        StateStore::new(repo.join(".cairn/state"))
            .save(&WorkflowSnapshot {
                workflow,
                plan: Some(plan),
            })
            .unwrap();

        let restored = f.orchestrator.restore(&id, &repo).unwrap();
        assert_eq!(restored.status, WorkflowStatus::Failed);
        assert!(restored.errors.last().unwrap().contains("interrupted"));

        f.orchestrator.retry(&id).unwrap();
        let snapshot = f.orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        assert_eq!(snapshot.plan.unwrap().phases[0].tasks[0].attempt_count, 1);
        assert_eq!(f.agent.generated(), vec!["1.1"]);
    }

    #[tokio::test]
    async fn test_restore_unknown_is_not_found() {
        let f = fixture_with(persisted_config(), TWO_PHASE_PLAN, ScriptedAgent::default());
        assert!(matches!(
            f.orchestrator.restore("missing", f.dir.path()),
            Err(OrchestratorError::WorkflowNotFound { .. })
        ));
    }
}

// =============================================================================
// Memory
// =============================================================================

mod memory {
    use super::*;
    use cairn::memory::{
        JsonFileMemoryStore, LocalFileSystem, MemoryCitation, MemoryFilter, RecommendedAction,
    };
    use cairn::{MemoryRecord, MemoryService, RepositoryId};

    async fn service(dir: &Path, repo: &RepositoryId) -> MemoryService {
        let store = JsonFileMemoryStore::open(dir.join("memory")).await.unwrap();
        let service = MemoryService::new(Arc::new(store));
        service.register_repository(repo.clone(), Arc::new(LocalFileSystem::new(dir.join("repo"))));
        service
    }

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join("repo").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_stale_citations_recommend_delete() {
        let dir = TempDir::new().unwrap();
        let repo = RepositoryId::new("acme/widgets");
        write(dir.path(), "a.txt", "fn renamed() {}\n");
        write(dir.path(), "b.txt", "1\n2\n3\n4\nlet y = 2;\n");
        let service = service(dir.path(), &repo).await;

        let record = service
            .create(MemoryRecord::new(
                repo.clone(),
                "Layout",
                "Setup lives in a.txt and b.txt",
                vec![
                    MemoryCitation::line("a.txt", 1).with_snippet("fn original()"),
                    MemoryCitation::line("b.txt", 5).with_snippet("let x = 1;"),
                ],
                "observed during planning",
            ))
            .await
            .unwrap();

        let result = service.validate(&record.id).await.unwrap();
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.action, RecommendedAction::Delete);
        assert_eq!(result.valid_count(), 0);
        let stored = service.get(&record.id).await.unwrap();
        assert!(stored.citations.iter().all(|c| !c.is_valid));
    }

    #[tokio::test]
    async fn test_repository_validation_buckets() {
        let dir = TempDir::new().unwrap();
        let repo = RepositoryId::new("acme/widgets");
        write(dir.path(), "src/lib.rs", "pub mod a;\npub mod b;\n");
        let service = service(dir.path(), &repo).await;

        let cite = |present: usize, missing: usize| -> Vec<MemoryCitation> {
            let mut citations: Vec<MemoryCitation> =
                (0..present).map(|_| MemoryCitation::line("src/lib.rs", 1)).collect();
            citations.extend((0..missing).map(|i| MemoryCitation::file(format!("gone{}.rs", i))));
            citations
        };
        let mut ids = Vec::new();
        for (present, missing) in [(2, 0), (1, 0), (2, 1), (1, 2), (0, 2)] {
            let record = service
                .create(MemoryRecord::new(repo.clone(), "s", "f", cite(present, missing), "r"))
                .await
                .unwrap();
            ids.push((record.id.clone(), record.expires_at()));
        }

        let report = service.validate_repository(&repo).await.unwrap();
        assert_eq!(report.total(), 5);
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.update_citations, 1);
        assert_eq!(report.review_manually, 1);
        assert_eq!(report.delete, 1);

        for (i, (id, before)) in ids.iter().enumerate() {
            let record = service.get(id).await.unwrap();
            if i < 2 {
                assert!(record.last_validated_at.is_some());
                assert!(record.expires_at() >= *before);
            } else {
                assert!(record.last_validated_at.is_none());
                assert_eq!(record.expires_at(), *before);
            }
        }
        assert_eq!(
            service.list(&repo, &MemoryFilter::default()).await.unwrap().len(),
            5
        );
    }

    async fn file_backed(base: &Path) -> Orchestrator {
        Orchestrator::builder(config())
            .sessions(SessionManager::new(Arc::new(Planner { reply: String::new() })))
            .file_memory(base)
            .await
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_file_memory_survives_orchestrator_restart() {
        let dir = TempDir::new().unwrap();
        let repo = RepositoryId::new("acme/widgets");
        let first = file_backed(dir.path()).await;
        first
            .memory()
            .create(MemoryRecord::new(
                repo.clone(),
                "Build",
                "cargo is the build tool",
                vec![MemoryCitation::file("Cargo.toml")],
                "seen at the root",
            ))
            .await
            .unwrap();
        assert!(dir.path().join(".cairn/memory").exists());

        let second = file_backed(dir.path()).await;
        let records = second.memory().list(&repo, &MemoryFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fact, "cargo is the build tool");
    }

    #[tokio::test]
    async fn test_discoveries_feed_later_workflows_and_guidance() {
        let mut config = config();
        config.guidance.enabled = true;
        let mut outputs = HashMap::new();
        outputs.insert(
            "1.1".to_string(),
            r#"<memory>{"subject": "Parser", "fact": "The parser lives in src/parser.rs", "citations": ["src/parser.rs:1"]}</memory>
<convention>Parsers return Result</convention>"#
                .to_string(),
        );
        let f = fixture_with(
            config,
            TWO_PHASE_PLAN,
            ScriptedAgent {
                outputs,
                ..Default::default()
            },
        );
        fs::create_dir_all(f.dir.path().join("src")).unwrap();
        fs::write(f.dir.path().join("src/parser.rs"), "pub fn parse() {}\n").unwrap();

        let first = f.orchestrator.start("Build a parser", f.dir.path()).await.unwrap();
        let snapshot = f.orchestrator.wait(&first).await.unwrap();
        assert_eq!(snapshot.workflow.status, WorkflowStatus::Complete);
        assert!(f.agent.contexts.lock().unwrap().iter().all(|c| c.is_none()));

        let repo = snapshot.workflow.repository_id.clone();
        let stored = f
            .orchestrator
            .memory()
            .list(&repo, &MemoryFilter::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].subject, "Parser");

        let guidance = fs::read_to_string(f.dir.path().join("CLAUDE.md")).unwrap();
        assert!(guidance.contains("## Conventions"));
        assert!(guidance.contains("- Parsers return Result"));

        f.agent.contexts.lock().unwrap().clear();
        let second = f.orchestrator.start("Extend the parser", f.dir.path()).await.unwrap();
        f.orchestrator.wait(&second).await.unwrap();
        let contexts = f.agent.contexts.lock().unwrap().clone();
        assert!(!contexts.is_empty());
        for context in contexts {
            let context = context.unwrap();
            assert!(context.contains("REPOSITORY MEMORY"));
            assert!(context.contains("The parser lives in src/parser.rs"));
        }
    }
}
