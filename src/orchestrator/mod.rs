//! Workflow orchestration.
//!
//! [`Orchestrator`] owns the registry of workflows. Each workflow runs on its
//! own tokio task that plans, walks the plan's phases through a
//! [`PhaseRunner`], and validates the result:
//!
//! ```text
//! Pending -> Planning -> Implementation -> Validation -> Complete
//!                \             |              |
//!                 +------------+--------------+--> Failed | Aborted
//! ```
//!
//! The execution loop is the only writer of a running workflow. It publishes
//! a [`WorkflowSnapshot`] through a `watch` channel after every change, and
//! emits [`WorkflowEvent`]s to any number of subscribers.

mod events;
mod state;

pub use events::{EventStream, EventType, WorkflowEvent};
pub use state::{StateStore, Workflow, WorkflowSnapshot, WorkflowStatus};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::assistant::{ClaudeCliAssistant, SessionManager};
use crate::config::{Config, VerifySection};
use crate::errors::OrchestratorError;
use crate::executor::{AssistantTaskAgent, ProgressSink, TaskAgent, TaskExecutor};
use crate::memory::{InMemoryMemoryStore, JsonFileMemoryStore, LocalFileSystem, MemoryService, PruneJob, RepositoryId};
use crate::phase::{IterationBudget, MarkdownGuidance, PhaseOutcome, PhaseRunner};
use crate::plan::{ImplementationPhase, ImplementationPlan, PlanGenerator, PlanStatus, WorkStatus};
use crate::util::slugify;
use crate::vcs::{GitVcs, VersionControl};

type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

const BRANCH_SLUG_LEN: usize = 40;

/// Opens the version-control collaborator for a repository.
pub trait VcsProvider: Send + Sync {
    fn open(&self, repository: &Path) -> anyhow::Result<Arc<dyn VersionControl>>;
}

impl<F> VcsProvider for F
where
    F: Fn(&Path) -> anyhow::Result<Arc<dyn VersionControl>> + Send + Sync,
{
    fn open(&self, repository: &Path) -> anyhow::Result<Arc<dyn VersionControl>> {
        self(repository)
    }
}

/// Builds the Generate/Verify/Review agent for a repository.
pub trait AgentProvider: Send + Sync {
    fn agent(&self, repository: &Path) -> Arc<dyn TaskAgent>;
}

impl<F> AgentProvider for F
where
    F: Fn(&Path) -> Arc<dyn TaskAgent> + Send + Sync,
{
    fn agent(&self, repository: &Path) -> Arc<dyn TaskAgent> {
        self(repository)
    }
}

/// [`GitVcs`] on the repository checkout.
pub struct GitVcsProvider {
    remote: String,
}

impl GitVcsProvider {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
        }
    }
}

impl VcsProvider for GitVcsProvider {
    fn open(&self, repository: &Path) -> anyhow::Result<Arc<dyn VersionControl>> {
        Ok(Arc::new(GitVcs::open(repository, self.remote.clone())?))
    }
}

/// [`AssistantTaskAgent`] sharing one session pool.
pub struct AssistantAgentProvider {
    sessions: Arc<SessionManager>,
    verify: VerifySection,
}

impl AssistantAgentProvider {
    pub fn new(sessions: Arc<SessionManager>, verify: VerifySection) -> Self {
        Self { sessions, verify }
    }
}

impl AgentProvider for AssistantAgentProvider {
    fn agent(&self, repository: &Path) -> Arc<dyn TaskAgent> {
        Arc::new(AssistantTaskAgent::new(
            self.sessions.clone(),
            repository,
            self.verify.clone(),
        ))
    }
}

/// Live state of one registered workflow.
pub struct WorkflowHandle {
    id: String,
    snapshot: watch::Sender<WorkflowSnapshot>,
    running: watch::Sender<bool>,
    cancel: Mutex<CancellationToken>,
    events: events::EventHub,
    store: Option<StateStore>,
}

impl WorkflowHandle {
    fn new(snapshot: WorkflowSnapshot, store: Option<StateStore>) -> Self {
        let events = if snapshot.workflow.status.is_terminal() {
            events::EventHub::closed()
        } else {
            events::EventHub::new()
        };
        Self {
            id: snapshot.workflow.id.clone(),
            snapshot: watch::Sender::new(snapshot),
            running: watch::Sender::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            events,
            store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.snapshot.subscribe()
    }

    /// Whether an execution loop is live for this workflow.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn claim_run(&self) -> bool {
        self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        })
    }

    fn release_run(&self) {
        self.running.send_replace(false);
    }

    async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|running| !*running).await;
    }

    fn new_cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        token
    }

    /// Replace the published state. Once a run has been aborted, later
    /// publishes keep the Aborted status.
    ///
    /// Returns the status actually published.
    fn publish(&self, workflow: &Workflow, plan: Option<&ImplementationPlan>) -> WorkflowStatus {
        let mut effective = workflow.status;
        self.snapshot.send_modify(|current| {
            let aborted = current.workflow.status == WorkflowStatus::Aborted;
            current.workflow = workflow.clone();
            current.plan = plan.cloned();
            if aborted {
                current.workflow.status = WorkflowStatus::Aborted;
            }
            effective = current.workflow.status;
        });
        self.persist();
        effective
    }

    /// Replace the published state unconditionally, for resuming.
    fn reset(&self, snapshot: WorkflowSnapshot) {
        self.snapshot.send_replace(snapshot);
        self.persist();
    }

    /// Fold a mid-phase update into the published plan.
    fn update_phase(&self, phase: &ImplementationPhase, iterations: u32) {
        self.snapshot.send_modify(|current| {
            if let Some(slot) = current
                .plan
                .as_mut()
                .and_then(|plan| plan.phases.get_mut(phase.index))
            {
                *slot = phase.clone();
            }
            current.workflow.current_phase = phase.index;
            current.workflow.current_task = current_task(phase);
            current.workflow.iteration_count = iterations;
            current.workflow.touch();
        });
        self.persist();
    }

    /// Returns `false` when the workflow was already terminal.
    fn abort(&self) -> bool {
        let aborted = self.snapshot.send_if_modified(|current| {
            if current.workflow.status.is_terminal() {
                return false;
            }
            current.workflow.status = WorkflowStatus::Aborted;
            current.workflow.touch();
            true
        });
        if aborted {
            self.cancel.lock().unwrap_or_else(|p| p.into_inner()).cancel();
            self.persist();
            let snapshot = self.snapshot();
            self.events
                .finish(WorkflowEvent::error("Workflow aborted").with_data(snapshot_data(&snapshot)));
            tracing::info!(workflow = %self.id, "Workflow aborted");
        }
        aborted
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.snapshot();
        if let Err(e) = store.save(&snapshot) {
            tracing::warn!(workflow = %self.id, error = %e, "Failed to persist workflow state");
        }
    }

    fn current_event(&self) -> WorkflowEvent {
        let snapshot = self.snapshot();
        WorkflowEvent::progress(format!(
            "Workflow {} is {}",
            snapshot.workflow.id, snapshot.workflow.status
        ))
        .with_data(snapshot_data(&snapshot))
    }
}

/// Routes executor and phase progress into a workflow's events and snapshot.
struct HandleProgress<'a>(&'a WorkflowHandle);

impl ProgressSink for HandleProgress<'_> {
    fn progress(&self, message: &str, data: serde_json::Value) {
        self.0.events.emit(WorkflowEvent::progress(message).with_data(data));
    }

    fn phase_updated(&self, phase: &ImplementationPhase, iterations: u32) {
        self.0.update_phase(phase, iterations);
    }
}

fn current_task(phase: &ImplementationPhase) -> Option<String> {
    phase
        .tasks
        .iter()
        .find(|t| !t.skipped && t.status != WorkStatus::Completed)
        .map(|t| t.id.clone())
}

fn snapshot_data(snapshot: &WorkflowSnapshot) -> serde_json::Value {
    let workflow = &snapshot.workflow;
    let phases: Vec<serde_json::Value> = snapshot
        .plan
        .iter()
        .flat_map(|plan| &plan.phases)
        .map(|p| json!({"name": p.name, "status": p.status, "skipped": p.skipped}))
        .collect();
    json!({
        "workflow_id": workflow.id,
        "status": workflow.status,
        "current_phase": workflow.current_phase,
        "current_task": workflow.current_task,
        "iteration_count": workflow.iteration_count,
        "max_iterations": workflow.max_iterations,
        "branch": workflow.branch,
        "errors": workflow.errors,
        "phases": phases,
    })
}

/// Phase-level problems that keep a fully walked plan from completing.
fn validation_failures(plan: &ImplementationPlan) -> Vec<String> {
    let mut failures = Vec::new();
    for phase in plan.phases.iter().filter(|p| !p.skipped) {
        if phase.status != WorkStatus::Completed {
            failures.push(format!("Phase {} ({}) is not complete", phase.number(), phase.name));
            continue;
        }
        for task in phase.tasks.iter().filter(|t| !t.skipped) {
            if task.status != WorkStatus::Completed {
                failures.push(format!("Task {} is not complete", task.id));
            } else if !task.is_verified() {
                failures.push(format!("Task {} has no passing verification", task.id));
            }
        }
    }
    failures
}

/// Put the interrupted or failed task of the open phase back in play.
fn prepare_retry(workflow: &mut Workflow, plan: Option<&mut ImplementationPlan>) {
    workflow.iteration_count = 0;
    let Some(plan) = plan else {
        workflow.status = WorkflowStatus::Pending;
        return;
    };
    workflow.status = WorkflowStatus::Implementation;
    let Some(index) = plan.next_open_phase() else {
        return;
    };
    let phase = &mut plan.phases[index];
    if phase.status == WorkStatus::Failed {
        phase.status = WorkStatus::InProgress;
    }
    for task in phase
        .tasks
        .iter_mut()
        .filter(|t| matches!(t.status, WorkStatus::Failed | WorkStatus::InProgress))
    {
        task.status = WorkStatus::InProgress;
        task.attempt_count = 0;
    }
    workflow.current_phase = index;
    workflow.current_task = current_task(phase);
}

/// Abandon the open phase. Returns `false` when there is no phase to skip.
fn prepare_skip(workflow: &mut Workflow, plan: Option<&mut ImplementationPlan>) -> bool {
    let Some(plan) = plan else {
        return false;
    };
    let Some(index) = plan.next_open_phase() else {
        return false;
    };
    let phase = &mut plan.phases[index];
    for task in phase
        .tasks
        .iter_mut()
        .filter(|t| matches!(t.status, WorkStatus::Failed | WorkStatus::InProgress))
    {
        task.status = WorkStatus::Failed;
        task.skipped = true;
    }
    phase.status = WorkStatus::Failed;
    phase.skipped = true;
    tracing::info!(workflow = %workflow.id, phase = phase.number(), "Skipping phase");

    workflow.iteration_count = 0;
    workflow.status = WorkflowStatus::Implementation;
    workflow.current_phase = plan.next_open_phase().unwrap_or(index);
    workflow.current_task = None;
    true
}

fn branch_name(prefix: &str, workflow: &Workflow) -> String {
    let slug = slugify(&workflow.requirements, BRANCH_SLUG_LEN);
    let slug = if slug.is_empty() { "workflow".to_string() } else { slug };
    format!("{}{}-{}", prefix, slug, workflow.short_id())
}

fn repository_identity(path: &Path) -> (PathBuf, RepositoryId) {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let id = RepositoryId::new(canonical.display().to_string());
    (canonical, id)
}

#[derive(Debug, Clone, Copy)]
enum Resume {
    Retry,
    Skip,
}

struct Inner {
    config: Config,
    sessions: Arc<SessionManager>,
    memory: MemoryService,
    vcs: Arc<dyn VcsProvider>,
    agents: Arc<dyn AgentProvider>,
    workflows: DashMap<String, Arc<WorkflowHandle>>,
    /// Repository -> id of the workflow that currently owns its working tree
    active: DashMap<RepositoryId, String>,
    pruner: Mutex<Option<PruneJob>>,
}

impl Inner {
    fn state_store(&self, repository: &Path) -> Option<StateStore> {
        self.config
            .orchestrator
            .state_dir
            .as_ref()
            .map(|dir| StateStore::new(Config::resolve(repository, dir)))
    }

    fn claim_repository(&self, repository: &RepositoryId, workflow_id: &str) -> Result<()> {
        match self.active.entry(repository.clone()) {
            Entry::Occupied(owner) if owner.get() != workflow_id => Err(OrchestratorError::RepositoryBusy {
                repository: repository.to_string(),
                workflow_id: owner.get().clone(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(workflow_id.to_string());
                Ok(())
            }
        }
    }

    fn release_repository(&self, repository: &RepositoryId, workflow_id: &str) {
        self.active.remove_if(repository, |_, owner| owner == workflow_id);
    }

    async fn memory_context(&self, repository: &RepositoryId) -> Option<String> {
        match self
            .memory
            .verified_context(repository, self.config.memory.context_limit)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(repository = %repository, error = %e, "Failed to load memory context");
                None
            }
        }
    }

    fn phase_runner(&self, workflow: &Workflow, vcs: Arc<dyn VersionControl>) -> PhaseRunner {
        let executor = TaskExecutor::new(self.agents.agent(&workflow.repository), vcs.clone())
            .with_memory(self.memory.clone(), workflow.repository_id.clone());
        let mut runner = PhaseRunner::new(executor, vcs);
        if self.config.guidance.enabled {
            let file = Config::resolve(&workflow.repository, &self.config.guidance.file);
            runner = runner.with_guidance(Arc::new(MarkdownGuidance::new(file)));
        }
        if self.config.orchestrator.push
            && let Some(branch) = &workflow.branch
        {
            runner = runner.with_push(branch.clone());
        }
        runner
    }

    /// Execution loop of one run; always leaves the workflow terminal.
    async fn drive(self: Arc<Self>, handle: Arc<WorkflowHandle>, cancel: CancellationToken) {
        let WorkflowSnapshot { mut workflow, mut plan } = handle.snapshot();

        let status = match self.run(&handle, &mut workflow, &mut plan, &cancel).await {
            Ok(status) => status,
            Err(e) => {
                workflow.record_error(format!("{:#}", e));
                WorkflowStatus::Failed
            }
        };
        workflow.status = status;
        workflow.touch();

        let published = handle.publish(&workflow, plan.as_ref());
        let data = snapshot_data(&handle.snapshot());
        let event = match published {
            WorkflowStatus::Complete => WorkflowEvent::completed("Workflow complete"),
            WorkflowStatus::Aborted => WorkflowEvent::error("Workflow aborted"),
            _ => WorkflowEvent::error(
                workflow
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| format!("Workflow {}", published)),
            ),
        };
        handle.events.finish(event.with_data(data));

        self.release_repository(&workflow.repository_id, &workflow.id);
        handle.release_run();
        tracing::info!(
            workflow = %workflow.id,
            status = %published,
            iterations = workflow.iteration_count,
            "Workflow finished"
        );
    }

    async fn run(
        &self,
        handle: &WorkflowHandle,
        workflow: &mut Workflow,
        plan: &mut Option<ImplementationPlan>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<WorkflowStatus> {
        let memory = self.memory_context(&workflow.repository_id).await;

        if plan.is_none() {
            workflow.status = WorkflowStatus::Planning;
            workflow.touch();
            handle.publish(workflow, None);

            let generated = PlanGenerator::new(self.sessions.clone(), &workflow.repository)
                .generate(&workflow.requirements, memory.as_deref())
                .await;
            let names: Vec<&str> = generated.phases.iter().map(|p| p.name.as_str()).collect();
            handle.events.emit(
                WorkflowEvent::progress(format!(
                    "Plan ready: {} phases, {} tasks",
                    generated.phases.len(),
                    generated.task_count()
                ))
                .with_data(json!({
                    "plan_id": generated.id,
                    "phases": names,
                    "estimated_duration": generated.estimated_duration,
                })),
            );
            *plan = Some(generated);
        }
        let Some(plan) = plan.as_mut() else {
            anyhow::bail!("Workflow has no plan");
        };
        if cancel.is_cancelled() {
            return Ok(WorkflowStatus::Aborted);
        }

        workflow.status = WorkflowStatus::Implementation;
        workflow.touch();
        handle.publish(workflow, Some(&*plan));

        let vcs = self.vcs.open(&workflow.repository)?;
        let runner = self.phase_runner(workflow, vcs);
        let mut budget = IterationBudget::new(workflow.iteration_count, workflow.max_iterations);
        let progress = HandleProgress(handle);

        while let Some(index) = plan.next_open_phase() {
            if cancel.is_cancelled() {
                return Ok(WorkflowStatus::Aborted);
            }
            workflow.current_phase = index;
            workflow.current_task = current_task(&plan.phases[index]);
            workflow.touch();
            handle.publish(workflow, Some(&*plan));

            let outcome = runner
                .run(&mut plan.phases[index], memory.clone(), &mut budget, cancel, &progress)
                .await;
            workflow.iteration_count = budget.used();
            workflow.current_task = current_task(&plan.phases[index]);

            match outcome? {
                PhaseOutcome::Completed { .. } => {
                    workflow.touch();
                    handle.publish(workflow, Some(&*plan));
                }
                PhaseOutcome::Failed { task_id, detail } => {
                    let phase = &plan.phases[index];
                    workflow.record_error(format!(
                        "Phase {} ({}) failed at task {}: {}",
                        phase.number(),
                        phase.name,
                        task_id,
                        detail
                    ));
                    return Ok(WorkflowStatus::Failed);
                }
                PhaseOutcome::Cancelled => return Ok(WorkflowStatus::Aborted),
                PhaseOutcome::BudgetExhausted => {
                    workflow.record_error(format!(
                        "Iteration limit of {} reached",
                        workflow.max_iterations
                    ));
                    return Ok(WorkflowStatus::Failed);
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(WorkflowStatus::Aborted);
        }
        workflow.status = WorkflowStatus::Validation;
        workflow.current_task = None;
        workflow.touch();
        handle.publish(workflow, Some(&*plan));

        let failures = validation_failures(plan);
        if !failures.is_empty() {
            for failure in failures {
                workflow.record_error(format!("Validation failed: {}", failure));
            }
            return Ok(WorkflowStatus::Failed);
        }

        plan.status = PlanStatus::Completed;
        let criteria: Vec<&String> = plan
            .phases
            .iter()
            .filter(|p| !p.skipped)
            .flat_map(|p| &p.acceptance_criteria)
            .collect();
        handle.events.emit(
            WorkflowEvent::progress("Validation passed")
                .with_data(json!({"acceptance_criteria": criteria})),
        );
        Ok(WorkflowStatus::Complete)
    }
}

/// Configures and builds an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: Config,
    sessions: Option<Arc<SessionManager>>,
    memory: Option<MemoryService>,
    vcs: Option<Arc<dyn VcsProvider>>,
    agents: Option<Arc<dyn AgentProvider>>,
    prune: bool,
}

impl OrchestratorBuilder {
    /// Session pool shared by planning and the default agent. Defaults to
    /// one backed by [`ClaudeCliAssistant`].
    pub fn sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Defaults to an in-memory store.
    pub fn memory(mut self, memory: MemoryService) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Durable memory in `memory.dir`, resolved against `base`.
    pub async fn file_memory(mut self, base: &Path) -> Result<Self> {
        let dir = Config::resolve(base, &self.config.memory.dir);
        let store = JsonFileMemoryStore::open(&dir).await?;
        tracing::debug!(dir = %dir.display(), "Using file-backed memory store");
        self.memory = Some(MemoryService::new(Arc::new(store)));
        Ok(self)
    }

    pub fn vcs_provider(mut self, provider: impl VcsProvider + 'static) -> Self {
        self.vcs = Some(Arc::new(provider));
        self
    }

    pub fn agent_provider(mut self, provider: impl AgentProvider + 'static) -> Self {
        self.agents = Some(Arc::new(provider));
        self
    }

    /// Run the memory prune job on `memory.prune_interval_secs` until shutdown.
    /// `build` must then be called inside a tokio runtime.
    pub fn with_pruning(mut self) -> Self {
        self.prune = true;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let config = self.config;
        let sessions = self.sessions.unwrap_or_else(|| {
            SessionManager::new(Arc::new(ClaudeCliAssistant::from_config(&config.assistant)))
        });
        let memory = self
            .memory
            .unwrap_or_else(|| MemoryService::new(Arc::new(InMemoryMemoryStore::new())));
        let vcs = self
            .vcs
            .unwrap_or_else(|| Arc::new(GitVcsProvider::new(config.orchestrator.remote.clone())));
        let agents = self.agents.unwrap_or_else(|| {
            Arc::new(AssistantAgentProvider::new(sessions.clone(), config.verify.clone()))
        });
        let pruner = self.prune.then(|| {
            PruneJob::spawn(
                memory.clone(),
                config.memory.prune_interval(),
                None,
                CancellationToken::new(),
            )
        });

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config,
                sessions,
                memory,
                vcs,
                agents,
                workflows: DashMap::new(),
                active: DashMap::new(),
                pruner: Mutex::new(pruner),
            }),
        })
    }
}

/// Control surface for workflows.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            sessions: None,
            memory: None,
            vcs: None,
            agents: None,
            prune: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn memory(&self) -> &MemoryService {
        &self.inner.memory
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn handle(&self, id: &str) -> Result<Arc<WorkflowHandle>> {
        self.inner
            .workflows
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::WorkflowNotFound { id: id.to_string() })
    }

    /// Create a workflow for `requirements` on `repository` and start running it.
    ///
    /// Fails with `RepositoryBusy` while another workflow is active on the
    /// same repository.
    pub async fn start(&self, requirements: &str, repository: impl AsRef<Path>) -> Result<String> {
        let requirements = requirements.trim();
        if requirements.is_empty() {
            return Err(anyhow::anyhow!("Requirements must not be empty").into());
        }
        let (repository, repository_id) = repository_identity(repository.as_ref());
        let mut workflow = Workflow::new(
            requirements,
            &repository,
            repository_id.clone(),
            self.inner.config.orchestrator.max_iterations,
        );
        let id = workflow.id.clone();

        self.inner.claim_repository(&repository_id, &id)?;
        if let Err(e) = self.prepare_branch(&mut workflow).await {
            self.inner.release_repository(&repository_id, &id);
            return Err(e);
        }
        self.inner
            .memory
            .register_repository(repository_id.clone(), Arc::new(LocalFileSystem::new(&repository)));

        let store = self.inner.state_store(&repository);
        let handle = Arc::new(WorkflowHandle::new(
            WorkflowSnapshot { workflow, plan: None },
            store,
        ));
        handle.claim_run();
        let cancel = handle.new_cancel_token();
        handle.persist();
        self.inner.workflows.insert(id.clone(), handle.clone());

        tracing::info!(workflow = %id, repository = %repository_id, "Workflow started");
        self.launch(handle, cancel, WorkflowEvent::started("Workflow started"));
        Ok(id)
    }

    async fn prepare_branch(&self, workflow: &mut Workflow) -> Result<()> {
        let settings = &self.inner.config.orchestrator;
        if !settings.create_branch {
            return Ok(());
        }
        let vcs_error = |e: anyhow::Error| OrchestratorError::Vcs(format!("{:#}", e));
        let vcs = self.inner.vcs.open(&workflow.repository).map_err(vcs_error)?;
        let branch = branch_name(&settings.branch_prefix, workflow);
        vcs.create_branch(&branch, None).await.map_err(vcs_error)?;
        vcs.checkout(&branch).await.map_err(vcs_error)?;
        tracing::info!(workflow = %workflow.id, branch = %branch, "Created workflow branch");
        workflow.branch = Some(branch);
        Ok(())
    }

    /// Spawn the execution loop for a handle whose run is already claimed.
    fn launch(&self, handle: Arc<WorkflowHandle>, cancel: CancellationToken, started: WorkflowEvent) {
        let snapshot = handle.snapshot();
        handle.events.emit(started.with_data(snapshot_data(&snapshot)));
        tokio::spawn(self.inner.clone().drive(handle, cancel));
    }

    /// Progress events: the current state first, then live events until the
    /// workflow ends.
    pub fn stream_events(&self, id: &str) -> Result<EventStream> {
        let handle = self.handle(id)?;
        Ok(handle.events.subscribe(|| handle.current_event()))
    }

    /// Mark the workflow Aborted now; the running step finishes, nothing
    /// further is dispatched. A no-op on a terminal workflow.
    pub fn abort(&self, id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.abort() {
            tracing::debug!(workflow = %id, "Abort ignored; workflow already terminal");
        }
        Ok(())
    }

    /// Resume a Failed or Aborted workflow at its failed task with a fresh
    /// attempt bound.
    pub fn retry(&self, id: &str) -> Result<()> {
        self.resume(id, Resume::Retry)
    }

    /// Abandon the failed phase and resume at the next one.
    pub fn skip(&self, id: &str) -> Result<()> {
        self.resume(id, Resume::Skip)
    }

    fn resume(&self, id: &str, kind: Resume) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.claim_run() {
            return Err(OrchestratorError::WorkflowRunning { id: id.to_string() });
        }

        let WorkflowSnapshot { mut workflow, mut plan } = handle.snapshot();
        if !matches!(
            workflow.status,
            WorkflowStatus::Failed | WorkflowStatus::Aborted
        ) {
            handle.release_run();
            return Err(OrchestratorError::NothingToResume { id: id.to_string() });
        }
        let resumable = match kind {
            Resume::Retry => {
                prepare_retry(&mut workflow, plan.as_mut());
                true
            }
            Resume::Skip => prepare_skip(&mut workflow, plan.as_mut()),
        };
        if !resumable {
            handle.release_run();
            return Err(OrchestratorError::NothingToResume { id: id.to_string() });
        }
        if let Err(e) = self.inner.claim_repository(&workflow.repository_id, id) {
            handle.release_run();
            return Err(e);
        }

        workflow.touch();
        // Token first: an abort landing after the reset must reach this run.
        let cancel = handle.new_cancel_token();
        handle.reset(WorkflowSnapshot { workflow, plan });
        handle.events.reopen();

        let message = match kind {
            Resume::Retry => "Workflow resumed by retry",
            Resume::Skip => "Workflow resumed after skipping a phase",
        };
        tracing::info!(workflow = %id, "{}", message);
        self.launch(handle, cancel, WorkflowEvent::started(message));
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<Workflow> {
        Ok(self.handle(id)?.snapshot().workflow)
    }

    pub fn plan(&self, id: &str) -> Result<Option<ImplementationPlan>> {
        Ok(self.handle(id)?.snapshot().plan)
    }

    /// All registered workflows, oldest first.
    pub fn list(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self
            .inner
            .workflows
            .iter()
            .map(|entry| entry.value().snapshot().workflow)
            .collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    /// Wait for the current run, if any, to exit.
    pub async fn wait(&self, id: &str) -> Result<WorkflowSnapshot> {
        let handle = self.handle(id)?;
        handle.wait_idle().await;
        Ok(handle.snapshot())
    }

    /// Forget a finished workflow and delete its persisted state.
    pub fn cleanup(&self, id: &str) -> Result<()> {
        let handle = self.handle(id)?;
        if handle.is_running() {
            return Err(OrchestratorError::WorkflowRunning { id: id.to_string() });
        }
        self.inner.workflows.remove(id);
        if let Some(store) = &handle.store {
            store.remove(id)?;
        }
        tracing::info!(workflow = %id, "Workflow cleaned up");
        Ok(())
    }

    /// Register a workflow from its persisted documents under `repository`.
    ///
    /// A workflow saved in a non-terminal status was interrupted and comes
    /// back as Failed, ready for `retry` or `skip`.
    pub fn restore(&self, id: &str, repository: impl AsRef<Path>) -> Result<Workflow> {
        if let Ok(handle) = self.handle(id) {
            return Ok(handle.snapshot().workflow);
        }
        let (repository, _) = repository_identity(repository.as_ref());
        let store = self.inner.state_store(&repository).ok_or_else(|| {
            OrchestratorError::InvalidConfig("orchestrator.state_dir is not configured".to_string())
        })?;
        if !store.exists(id) {
            return Err(OrchestratorError::WorkflowNotFound { id: id.to_string() });
        }

        let mut snapshot = store.load(id)?;
        if !snapshot.workflow.status.is_terminal() {
            let previous = snapshot.workflow.status;
            snapshot.workflow.status = WorkflowStatus::Failed;
            snapshot
                .workflow
                .record_error(format!("Workflow interrupted while {}", previous));
            snapshot.workflow.touch();
        }
        self.inner.memory.register_repository(
            snapshot.workflow.repository_id.clone(),
            Arc::new(LocalFileSystem::new(&snapshot.workflow.repository)),
        );

        let workflow = snapshot.workflow.clone();
        let handle = Arc::new(WorkflowHandle::new(snapshot, Some(store)));
        handle.persist();
        self.inner.workflows.insert(id.to_string(), handle);
        tracing::info!(workflow = %id, status = %workflow.status, "Workflow restored");
        Ok(workflow)
    }

    /// Abort every running workflow, wait for the loops to exit, then stop
    /// the prune job and close pooled assistant sessions.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<WorkflowHandle>> = self
            .inner
            .workflows
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in &handles {
            handle.wait_idle().await;
        }

        let pruner = self
            .inner
            .pruner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(job) = pruner {
            job.stop().await;
        }
        self.inner.sessions.shutdown().await;
        tracing::info!("Orchestrator shut down");
    }
}
