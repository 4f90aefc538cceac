//! The execution engine - drives executions from submission to a final
//! status.
//!
//! Each tick runs:
//! ```text
//! apply runner results → sweep timeouts → collect due executions
//!   → order by priority → dependency gate → slot → distributor → breaker → run
//! ```
//!
//! Runner calls happen on spawned tasks and report back over a channel, so
//! the control loop never waits on a workflow. Every state change of one
//! execution happens under that execution's own lock.

use crate::clock::EngineClock;
use crate::config::EngineConfig;
use crate::dependency::{DependencyGraph, TaskGraph};
use crate::error::{EngineError, Result};
use crate::hooks::{Hook, HookContext, HookStage, Hooks};
use crate::runner::{Distributor, RunContext, RunnerError, WorkflowRunner};
use crate::scheduler::ResourceScheduler;
use crate::selector::{Candidate, ExecutionSelector, PrioritySelector};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskmill_core::{
    ErrorKind, Execution, ExecutionError, ExecutionFilter, ExecutionId, ExecutionStatus, Priority,
    RetryStrategy, StatusEvent, TaskId, TaskSpec, Time,
};
use taskmill_resilience::{Admission, BreakerMetrics, CircuitBreaker, CircuitBreakerRegistry};
use taskmill_storage::TaskStore;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard, OwnedSemaphorePermit, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Outcome = std::result::Result<Value, ExecutionError>;

/// A runner result on its way back to the control loop.
struct Completion {
    execution_id: ExecutionId,
    dispatch: u64,
    outcome: Outcome,
}

/// An admitted breaker call whose outcome is not recorded yet.
#[derive(Debug, Clone, Copy)]
struct BreakerCall {
    dispatch: u64,
    admission: Admission,
}

/// Engine-side bookkeeping for one execution.
struct Entry {
    execution: Execution,
    /// Submission order
    seq: u64,
    permit: Option<OwnedSemaphorePermit>,
    cancel: Option<CancellationToken>,
    /// Bumped on every dispatch; results from older dispatches are orphans
    dispatch: u64,
    /// Breaker call still waiting for its outcome
    breaker_call: Option<BreakerCall>,
    running_since: Option<Time>,
    /// RUNNING time accumulated before the last pause
    running_before: Duration,
    /// Result that arrived while PAUSED
    held_outcome: Option<Outcome>,
}

impl Entry {
    fn new(execution: Execution, seq: u64) -> Self {
        Self {
            execution,
            seq,
            permit: None,
            cancel: None,
            dispatch: 0,
            breaker_call: None,
            running_since: None,
            running_before: Duration::ZERO,
            held_outcome: None,
        }
    }

    fn running_time(&self, now: Time) -> Duration {
        self.running_before
            + self
                .running_since
                .map(|since| EngineClock::between(since, now))
                .unwrap_or_default()
    }
}

enum DependencyState {
    Ready,
    Waiting,
    Failed(ExecutionId),
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Runner results applied
    pub completions: usize,
    /// PENDING → SCHEDULED promotions
    pub promoted: usize,
    /// Executions handed to the runner
    pub dispatched: usize,
    /// Eligible executions left waiting for a slot
    pub deferred_concurrency: usize,
    /// Dispatches refused by a circuit breaker
    pub breaker_rejected: usize,
    /// Executions forced to TIMEOUT
    pub timed_out: usize,
    /// Executions failed because a dependency did not complete
    pub dependency_failed: usize,
}

impl TickReport {
    /// Whether the tick changed nothing.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Counts over every execution the engine knows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// Executions known to the engine
    pub total: usize,
    /// Concurrency slots currently held
    pub slots_in_use: usize,
    /// Count per current status
    pub by_status: BTreeMap<ExecutionStatus, usize>,
    /// Count per priority
    pub by_priority: BTreeMap<Priority, usize>,
}

/// The scheduler.
///
/// Build it, wrap it in an [`Arc`], then either call [`ExecutionEngine::start`]
/// to run the control loop in the background or drive it with
/// [`ExecutionEngine::tick`].
pub struct ExecutionEngine {
    config: EngineConfig,
    runner: Arc<dyn WorkflowRunner>,
    registry: Arc<CircuitBreakerRegistry>,
    store: Option<Arc<dyn TaskStore>>,
    distributor: Option<Arc<dyn Distributor>>,
    selector: Box<dyn ExecutionSelector>,
    hooks: Hooks,
    slots: ResourceScheduler,
    executions: RwLock<HashMap<ExecutionId, Arc<Mutex<Entry>>>>,
    next_seq: AtomicU64,
    clock: EngineClock,
    events: broadcast::Sender<StatusEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
    shutdown: CancellationToken,
}

impl ExecutionEngine {
    /// Create an engine. Fails if `config` does not validate.
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn WorkflowRunner>,
        registry: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Ok(Self {
            slots: ResourceScheduler::new(config.max_concurrent_executions),
            config,
            runner,
            registry,
            store: None,
            distributor: None,
            selector: Box::new(PrioritySelector::new()),
            hooks: Hooks::new(),
            executions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            clock: EngineClock::new(),
            events,
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
            shutdown: CancellationToken::new(),
        })
    }

    /// Persist every transition to `store`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Choose targets through `distributor`.
    pub fn with_distributor(mut self, distributor: Arc<dyn Distributor>) -> Self {
        self.distributor = Some(distributor);
        self
    }

    /// Set the dispatch ordering strategy.
    pub fn with_selector(mut self, selector: Box<dyn ExecutionSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Append a lifecycle hook for `stage`.
    pub fn with_hook<F>(mut self, stage: HookStage, hook: F) -> Self
    where
        F: Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook: Hook = Arc::new(hook);
        self.hooks.register(stage, hook);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The breaker registry this engine routes calls through.
    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Metrics for every breaker created so far.
    pub fn breaker_metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.registry.list_all()
    }

    /// Current engine time.
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Receive a [`StatusEvent`] for every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Concurrency slots currently held.
    pub fn running_count(&self) -> usize {
        self.slots.running()
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    /// Submit one task.
    pub async fn schedule_task(&self, spec: TaskSpec) -> Result<ExecutionId> {
        let id = ExecutionId::new();
        self.admit(vec![(id, spec)]).await?;
        Ok(id)
    }

    /// Submit several tasks at once. Either all are admitted or none.
    pub async fn schedule_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<ExecutionId>> {
        let nodes: Vec<_> = specs
            .into_iter()
            .map(|spec| (ExecutionId::new(), spec))
            .collect();
        let ids = nodes.iter().map(|(id, _)| *id).collect();
        self.admit(nodes).await?;
        Ok(ids)
    }

    /// Submit a graph of tasks related by task id. Cycles (including
    /// self-dependencies), duplicate task ids and references to tasks
    /// outside the graph reject the whole graph.
    pub async fn schedule_graph(&self, graph: TaskGraph) -> Result<HashMap<TaskId, ExecutionId>> {
        let mut ids: HashMap<TaskId, ExecutionId> = HashMap::with_capacity(graph.nodes.len());
        let mut nodes = Vec::with_capacity(graph.nodes.len());

        for node in &graph.nodes {
            let id = ExecutionId::new();
            if ids.insert(node.spec.task_id.clone(), id).is_some() {
                return Err(EngineError::DuplicateTask(node.spec.task_id.clone()));
            }
            nodes.push(id);
        }

        let mut specs = Vec::with_capacity(nodes.len());
        for (id, node) in nodes.into_iter().zip(graph.nodes) {
            let mut spec = node.spec;
            for dep in &node.depends_on {
                match ids.get(dep) {
                    Some(dep_id) => spec.dependencies.push(*dep_id),
                    None => {
                        return Err(EngineError::UnknownDependency {
                            task_id: spec.task_id.clone(),
                            dependency: dep.to_string(),
                        })
                    }
                }
            }
            specs.push((id, spec));
        }

        self.admit(specs).await?;
        info!(tasks = ids.len(), "graph scheduled");
        Ok(ids)
    }

    /// Validate and insert new executions under the map's write lock, so
    /// nothing becomes visible unless everything is admitted.
    async fn admit(&self, nodes: Vec<(ExecutionId, TaskSpec)>) -> Result<()> {
        let now = self.clock.now();
        let mut executions = self.executions.write().await;

        let batch: HashSet<ExecutionId> = nodes.iter().map(|(id, _)| *id).collect();
        let mut graph = DependencyGraph::new();
        for (id, spec) in &nodes {
            if let Some(dep) = spec
                .dependencies
                .iter()
                .find(|dep| !batch.contains(*dep) && !executions.contains_key(*dep))
            {
                return Err(EngineError::UnknownDependency {
                    task_id: spec.task_id.clone(),
                    dependency: dep.to_string(),
                });
            }
            graph.add_node(*id, spec.dependencies.iter().copied());
        }

        if let Err(cycle) = graph.topological_order() {
            let labels: HashMap<ExecutionId, &TaskId> =
                nodes.iter().map(|(id, spec)| (*id, &spec.task_id)).collect();
            let members: Vec<String> = cycle
                .members
                .iter()
                .map(|id| labels.get(id).map_or_else(|| id.to_string(), |t| t.to_string()))
                .collect();
            warn!(?members, "rejected submission with a dependency cycle");
            return Err(EngineError::DependencyCycle { members });
        }

        // Hold each new entry locked until its PENDING event is out.
        let mut created: Vec<OwnedMutexGuard<Entry>> = Vec::with_capacity(nodes.len());
        for (id, spec) in nodes {
            let execution = Execution::from_spec(id, spec, self.config.default_timeout, now);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(Mutex::new(Entry::new(execution, seq)));
            created.push(Arc::clone(&entry).lock_owned().await);
            executions.insert(id, entry);
        }
        drop(executions);

        for entry in &created {
            debug!(
                execution_id = %entry.execution.execution_id,
                task_id = %entry.execution.task_id,
                priority = ?entry.execution.priority,
                "execution submitted"
            );
            self.publish(&entry.execution).await;
        }
        Ok(())
    }

    /// Re-admit executions loaded from a store. Executions caught in flight
    /// are failed as interrupted and follow the retry path. Returns how
    /// many were added; ids already known are skipped.
    pub async fn restore(&self, mut snapshots: Vec<Execution>) -> Result<usize> {
        snapshots.sort_by_key(|e| e.created_at);

        let mut restored: Vec<OwnedMutexGuard<Entry>> = Vec::new();
        {
            let mut executions = self.executions.write().await;
            for execution in snapshots {
                let id = execution.execution_id;
                if executions.contains_key(&id) {
                    continue;
                }
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(Mutex::new(Entry::new(execution, seq)));
                restored.push(Arc::clone(&entry).lock_owned().await);
                executions.insert(id, entry);
            }
        }

        let count = restored.len();
        for mut entry in restored {
            let status = entry.execution.status;
            if status.holds_slot() {
                warn!(
                    execution_id = %entry.execution.execution_id,
                    %status,
                    "execution was in flight when the engine stopped"
                );
                self.fail(&mut entry, ExecutionError::interrupted(), ExecutionStatus::Failed)
                    .await?;
            } else if status == ExecutionStatus::Retrying {
                self.transition(&mut entry, ExecutionStatus::Scheduled).await?;
            }
        }

        info!(count, "restored executions");
        Ok(count)
    }

    /// [`ExecutionEngine::restore`] everything the configured store holds.
    pub async fn restore_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let snapshots = store.load_all().await?;
        self.restore(snapshots).await
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    async fn entry(&self, id: ExecutionId) -> Result<Arc<Mutex<Entry>>> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    async fn entries(&self) -> Vec<Arc<Mutex<Entry>>> {
        self.executions.read().await.values().cloned().collect()
    }

    /// Latest snapshot of one execution.
    pub async fn get_execution(&self, id: ExecutionId) -> Result<Execution> {
        let handle = self.entry(id).await?;
        let entry = handle.lock().await;
        Ok(entry.execution.clone())
    }

    /// Executions matching `filter`, in submission order.
    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Vec<Execution> {
        let mut matched = Vec::new();
        for handle in self.entries().await {
            let entry = handle.lock().await;
            if filter.matches(&entry.execution) {
                matched.push((entry.seq, entry.execution.clone()));
            }
        }
        matched.sort_by_key(|(seq, _)| *seq);

        matched
            .into_iter()
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(|(_, execution)| execution)
            .collect()
    }

    /// Totals by status and priority.
    pub async fn get_stats(&self) -> ExecutionStats {
        let mut stats = ExecutionStats {
            slots_in_use: self.slots.running(),
            ..Default::default()
        };
        for handle in self.entries().await {
            let entry = handle.lock().await;
            stats.total += 1;
            *stats.by_status.entry(entry.execution.status).or_default() += 1;
            *stats.by_priority.entry(entry.execution.priority).or_default() += 1;
        }
        stats
    }

    /// Whether every known execution has reached a final status.
    pub async fn is_settled(&self) -> bool {
        for handle in self.entries().await {
            if !handle.lock().await.execution.is_terminal() {
                return false;
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Control
    // ---------------------------------------------------------------------

    /// Cancel an execution. Returns `Ok(false)`, changing nothing, when it
    /// already reached a final status.
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<bool> {
        let handle = self.entry(id).await?;
        let mut entry = handle.lock().await;

        if entry.execution.is_terminal() {
            debug!(execution_id = %id, status = %entry.execution.status, "cancel ignored");
            return Ok(false);
        }

        entry.held_outcome = None;
        // The runner may never answer; hand the breaker call back now.
        if let Some(call) = entry.breaker_call.take() {
            self.breaker(&entry.execution.breaker).release(call.admission);
        }
        entry.execution.set_error(ExecutionError::cancelled());
        self.transition(&mut entry, ExecutionStatus::Cancelled).await?;
        info!(execution_id = %id, task_id = %entry.execution.task_id, "execution cancelled");
        self.run_hooks(HookStage::PostExecution, &entry.execution, None);
        Ok(true)
    }

    /// Suspend a RUNNING execution. Its slot is kept and its timeout clock
    /// stops until it is resumed.
    pub async fn pause_execution(&self, id: ExecutionId) -> Result<()> {
        let handle = self.entry(id).await?;
        let mut entry = handle.lock().await;

        let ran = entry.running_time(self.clock.now());
        self.transition(&mut entry, ExecutionStatus::Paused).await?;
        entry.running_before = ran;
        entry.running_since = None;
        info!(execution_id = %id, ran = ?ran, "execution paused");
        Ok(())
    }

    /// Resume a PAUSED execution. A result that arrived while paused is
    /// applied now.
    pub async fn resume_execution(&self, id: ExecutionId) -> Result<()> {
        let handle = self.entry(id).await?;
        let mut entry = handle.lock().await;

        self.transition(&mut entry, ExecutionStatus::Running).await?;
        entry.running_since = Some(self.clock.now());
        info!(execution_id = %id, "execution resumed");

        if let Some(outcome) = entry.held_outcome.take() {
            self.finish(&mut entry, outcome).await?;
        }
        Ok(())
    }

    /// Spawn the control loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await })
    }

    /// Run the control loop until [`ExecutionEngine::shutdown`].
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            max_concurrent = self.config.max_concurrent_executions,
            tick = ?self.config.tick_interval,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.is_idle() {
                        debug!(?report, "tick");
                    }
                }
                completion = self.next_completion() => {
                    if let Some(completion) = completion {
                        self.apply_completion(completion).await;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    /// Stop the control loop and cancel in-flight runner calls.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    /// Whether shutdown was requested.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ---------------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------------

    /// Run one scheduling pass.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for completion in self.drain_completions().await {
            report.completions += 1;
            self.apply_completion(completion).await;
        }

        self.sweep_timeouts(&mut report).await;

        let mut candidates = self.due_candidates().await;
        self.selector.order(&mut candidates);

        for candidate in candidates {
            if let Err(e) = self.try_dispatch(candidate.execution_id, &mut report).await {
                error!(execution_id = %candidate.execution_id, "dispatch failed: {}", e);
            }
        }

        report
    }

    async fn next_completion(&self) -> Option<Completion> {
        self.completions_rx.lock().await.recv().await
    }

    async fn drain_completions(&self) -> Vec<Completion> {
        // Held by the control loop; it applies completions itself.
        let Ok(mut rx) = self.completions_rx.try_lock() else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        while let Ok(completion) = rx.try_recv() {
            drained.push(completion);
        }
        drained
    }

    async fn sweep_timeouts(&self, report: &mut TickReport) {
        let now = self.clock.now();
        for handle in self.entries().await {
            let mut entry = handle.lock().await;
            if entry.execution.status != ExecutionStatus::Running
                || entry.running_time(now) < entry.execution.timeout
            {
                continue;
            }

            if let Some(call) = entry.breaker_call.take() {
                self.breaker(&entry.execution.breaker)
                    .settle(call.admission, false);
            }

            let timeout = entry.execution.timeout;
            warn!(
                execution_id = %entry.execution.execution_id,
                task_id = %entry.execution.task_id,
                timeout = ?timeout,
                "execution timed out"
            );
            report.timed_out += 1;
            if let Err(e) = self
                .fail(&mut entry, ExecutionError::timeout(timeout), ExecutionStatus::Timeout)
                .await
            {
                error!(execution_id = %entry.execution.execution_id, "timeout handling failed: {}", e);
            }
        }
    }

    async fn due_candidates(&self) -> Vec<Candidate> {
        let now = self.clock.now();
        let mut candidates = Vec::new();
        for handle in self.entries().await {
            let entry = handle.lock().await;
            let execution = &entry.execution;
            let waiting = matches!(
                execution.status,
                ExecutionStatus::Pending | ExecutionStatus::Scheduled
            );
            if waiting && execution.scheduled_time <= now {
                candidates.push(Candidate {
                    execution_id: execution.execution_id,
                    priority: execution.priority,
                    seq: entry.seq,
                });
            }
        }
        candidates
    }

    async fn dependency_state(&self, dependencies: &BTreeSet<ExecutionId>) -> DependencyState {
        let mut state = DependencyState::Ready;
        for dep in dependencies {
            let Ok(handle) = self.entry(*dep).await else {
                return DependencyState::Failed(*dep);
            };
            let status = handle.lock().await.execution.status;
            match status {
                ExecutionStatus::Completed => {}
                ExecutionStatus::Failed | ExecutionStatus::Timeout | ExecutionStatus::Cancelled => {
                    return DependencyState::Failed(*dep)
                }
                _ => state = DependencyState::Waiting,
            }
        }
        state
    }

    async fn try_dispatch(&self, id: ExecutionId, report: &mut TickReport) -> Result<()> {
        let handle = self.entry(id).await?;

        // Dependencies are read before taking this execution's lock so that
        // at most one execution lock is held at a time.
        let (status, dependencies) = {
            let entry = handle.lock().await;
            (entry.execution.status, entry.execution.dependencies.clone())
        };
        let deps = match status {
            ExecutionStatus::Pending => self.dependency_state(&dependencies).await,
            _ => DependencyState::Ready,
        };

        let mut entry = handle.lock().await;
        let now = self.clock.now();
        if entry.execution.status != status || entry.execution.scheduled_time > now {
            return Ok(());
        }

        match deps {
            DependencyState::Waiting => return Ok(()),
            DependencyState::Failed(dep) => {
                report.dependency_failed += 1;
                warn!(execution_id = %id, dependency = %dep, "dependency did not complete");
                return self
                    .fail(
                        &mut entry,
                        ExecutionError::dependency_failed(dep),
                        ExecutionStatus::Failed,
                    )
                    .await;
            }
            DependencyState::Ready => {}
        }

        if status == ExecutionStatus::Pending {
            self.transition(&mut entry, ExecutionStatus::Scheduled).await?;
            report.promoted += 1;
        }

        let Some(permit) = self.slots.try_acquire() else {
            report.deferred_concurrency += 1;
            return Ok(());
        };
        entry.permit = Some(permit);
        self.transition(&mut entry, ExecutionStatus::Preparing).await?;

        if let Some(distributor) = &self.distributor {
            if !entry.execution.required_capabilities.is_empty() {
                match distributor
                    .select_target(&entry.execution.required_capabilities)
                    .await
                {
                    Some(target) => {
                        debug!(execution_id = %id, %target, "target selected");
                        entry.execution.target = Some(target);
                    }
                    None => {
                        let error = ExecutionError::no_target(&entry.execution.required_capabilities);
                        return self.fail(&mut entry, error, ExecutionStatus::Failed).await;
                    }
                }
            }
        }

        let breaker = self.breaker(&entry.execution.breaker);
        let Some(admission) = breaker.try_admit() else {
            report.breaker_rejected += 1;
            debug!(execution_id = %id, breaker = breaker.name(), "rejected by circuit breaker");
            let error = ExecutionError::circuit_open(breaker.name());
            return self.fail(&mut entry, error, ExecutionStatus::Failed).await;
        };

        entry.dispatch += 1;
        entry.breaker_call = Some(BreakerCall {
            dispatch: entry.dispatch,
            admission,
        });
        self.transition(&mut entry, ExecutionStatus::Running).await?;
        entry.running_since = Some(self.clock.now());
        entry.running_before = Duration::ZERO;
        entry.held_outcome = None;

        let cancel = self.shutdown.child_token();
        entry.cancel = Some(cancel.clone());

        self.run_hooks(HookStage::PreExecution, &entry.execution, None);
        self.spawn_runner(&entry.execution, entry.dispatch, cancel);
        report.dispatched += 1;

        info!(
            execution_id = %id,
            task_id = %entry.execution.task_id,
            workflow_type = %entry.execution.workflow_type,
            attempt = entry.execution.retry_count,
            "execution dispatched"
        );
        Ok(())
    }

    fn spawn_runner(&self, execution: &Execution, dispatch: u64, cancel: CancellationToken) {
        let runner = Arc::clone(&self.runner);
        let completions = self.completions_tx.clone();
        let execution_id = execution.execution_id;
        let workflow_type = execution.workflow_type.clone();
        let parameters = execution.parameters.clone();
        let ctx = RunContext {
            execution_id,
            task_id: execution.task_id.clone(),
            attempt: execution.retry_count,
            target: execution.target.clone(),
            cancel,
        };

        tokio::spawn(async move {
            let outcome = match runner.invoke(&workflow_type, &parameters, ctx).await {
                Ok(value) => Ok(value),
                Err(RunnerError::Classified(error)) => Err(error),
                Err(RunnerError::Unclassified(error)) => Err(runner.classify(&error)),
            };
            // The receiver only goes away with the engine.
            let _ = completions.send(Completion {
                execution_id,
                dispatch,
                outcome,
            });
        });
    }

    async fn apply_completion(&self, completion: Completion) {
        let Ok(handle) = self.entry(completion.execution_id).await else {
            return;
        };
        let mut entry = handle.lock().await;

        let call = match entry.breaker_call {
            Some(call) if call.dispatch == completion.dispatch => entry.breaker_call.take(),
            _ => None,
        };
        if let Some(call) = call {
            let breaker = self.breaker(&entry.execution.breaker);
            match &completion.outcome {
                // Stopped by us, says nothing about the resource.
                Err(error) if error.kind == ErrorKind::Cancelled => breaker.release(call.admission),
                outcome => breaker.settle(call.admission, outcome.is_ok()),
            }
        }

        let status = entry.execution.status;
        let current = completion.dispatch == entry.dispatch
            && matches!(status, ExecutionStatus::Running | ExecutionStatus::Paused);
        if !current {
            debug!(
                execution_id = %completion.execution_id,
                %status,
                "discarding orphaned runner result"
            );
            self.run_hooks(
                HookStage::Orphaned,
                &entry.execution,
                Some(&completion.outcome),
            );
            return;
        }

        if status == ExecutionStatus::Paused {
            entry.held_outcome = Some(completion.outcome);
            return;
        }

        if let Err(e) = self.finish(&mut entry, completion.outcome).await {
            error!(execution_id = %completion.execution_id, "failed to apply result: {}", e);
        }
    }

    // ---------------------------------------------------------------------
    // State changes
    // ---------------------------------------------------------------------

    fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.registry.get(name, self.config.breaker_config(name))
    }

    fn run_hooks(&self, stage: HookStage, execution: &Execution, outcome: Option<&Outcome>) {
        self.hooks.run(&HookContext {
            stage,
            execution,
            outcome,
        });
    }

    /// Apply one transition, release what the new status no longer holds,
    /// then publish it.
    async fn transition(&self, entry: &mut Entry, to: ExecutionStatus) -> Result<()> {
        let from = entry.execution.status;
        entry.execution.transition(to, self.clock.now())?;

        if from.holds_slot() && !to.holds_slot() {
            entry.permit = None;
            entry.running_since = None;
            if let Some(cancel) = entry.cancel.take() {
                cancel.cancel();
            }
        }

        debug!(
            execution_id = %entry.execution.execution_id,
            %from,
            %to,
            "status changed"
        );
        self.publish(&entry.execution).await;
        Ok(())
    }

    async fn publish(&self, execution: &Execution) {
        if let Some(event) = StatusEvent::latest(execution) {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }

        if let Some(store) = &self.store {
            let limit = self.config.persist_timeout;
            match tokio::time::timeout(limit, store.persist(execution)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    execution_id = %execution.execution_id,
                    "failed to persist execution: {}",
                    e
                ),
                Err(_) => warn!(
                    execution_id = %execution.execution_id,
                    timeout = ?limit,
                    "store did not answer, snapshot dropped"
                ),
            }
        }
    }

    async fn finish(&self, entry: &mut Entry, outcome: Outcome) -> Result<()> {
        match outcome {
            Ok(value) => {
                entry.execution.set_result(value);
                self.transition(entry, ExecutionStatus::Completed).await?;
                info!(
                    execution_id = %entry.execution.execution_id,
                    task_id = %entry.execution.task_id,
                    retries = entry.execution.retry_count,
                    "execution completed"
                );
                self.run_hooks(HookStage::PostExecution, &entry.execution, None);
                Ok(())
            }
            Err(error) => self.fail(entry, error, ExecutionStatus::Failed).await,
        }
    }

    /// Record `error`, enter `failed` (FAILED or TIMEOUT), then either move
    /// straight on to the next attempt or stay there for good.
    ///
    /// Breaker rejections are retried whenever the execution has a retry
    /// strategy, no sooner than the breaker allows, and do not count
    /// against `max_retries`.
    async fn fail(
        &self,
        entry: &mut Entry,
        error: ExecutionError,
        failed: ExecutionStatus,
    ) -> Result<()> {
        let now = self.clock.now();
        let policy = entry
            .execution
            .retry_policy(self.config.max_retry_delay, self.config.retry_jitter);
        let attempt = entry.execution.retry_count;
        let rejected = error.kind == ErrorKind::CircuitOpen;

        let delay = if rejected {
            (policy.strategy != RetryStrategy::None).then(|| {
                let wait = self
                    .breaker(&entry.execution.breaker)
                    .retry_after()
                    .unwrap_or(self.config.tick_interval);
                policy.delay_for(attempt).unwrap_or_default().max(wait)
            })
        } else if policy.should_retry(&error, attempt) {
            policy.delay_for(attempt)
        } else {
            None
        };

        let message = error.to_string();
        entry.execution.set_error(error);
        self.transition(entry, failed).await?;

        match delay {
            Some(delay) => {
                if !rejected {
                    entry.execution.retry_count += 1;
                }
                entry.execution.scheduled_time = EngineClock::after(now, delay);
                self.transition(entry, ExecutionStatus::Retrying).await?;
                self.transition(entry, ExecutionStatus::Scheduled).await?;
                info!(
                    execution_id = %entry.execution.execution_id,
                    retry_count = entry.execution.retry_count,
                    delay = ?delay,
                    "retry scheduled after: {}",
                    message
                );
            }
            None => {
                warn!(
                    execution_id = %entry.execution.execution_id,
                    task_id = %entry.execution.task_id,
                    status = %failed,
                    "execution failed: {}",
                    message
                );
            }
        }

        self.run_hooks(HookStage::PostExecution, &entry.execution, None);
        Ok(())
    }
}
