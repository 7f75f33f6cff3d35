// src/engine/scheduler.rs

//! Pure scheduling core.
//!
//! [`Scheduler`] owns every task and service state of one run and decides
//! what happens next. It consumes [`RuntimeEvent`]s and returns a
//! [`SchedulerStep`]: commands for the async shell plus the state changes to
//! publish. It has no channels, no Tokio types and performs no IO, so every
//! ordering rule can be unit tested directly.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::dag::{WorkGraph, WorkNode};
use crate::engine::events::{RunEvent, RuntimeEvent, TaskOutcome, TaskPhase};
use crate::engine::state::{ServiceState, TaskState};
use crate::errors::SchedulerError;
use crate::types::{NodeId, TaskKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Maximum number of tasks in flight at once (at least 1).
    pub concurrency: usize,
    /// Keep running after the graph settles and re-run tasks whose sources
    /// change.
    pub watch: bool,
}

/// Work the async shell must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Execute a task (the task is already `starting`).
    Dispatch(NodeId),
    /// Stop an in-flight execution; it reports back as `canceled`.
    CancelTask(NodeId),
    StartService(NodeId),
    StopService(NodeId),
    /// Subscribe to changes of the task's sources.
    Watch(NodeId),
    Unwatch(NodeId),
    /// Nothing is left to do.
    Finish,
}

/// Result of one core step.
#[derive(Debug, Default)]
pub struct SchedulerStep {
    pub commands: Vec<CoreCommand>,
    pub events: Vec<RunEvent>,
}

/// Final state of every task and service that took part in a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tasks: BTreeMap<TaskKey, TaskState>,
    pub services: BTreeMap<TaskKey, ServiceState>,
    pub selected: Vec<TaskKey>,
}

impl RunSummary {
    /// Every selected task completed.
    pub fn success(&self) -> bool {
        self.selected
            .iter()
            .all(|key| self.tasks.get(key).is_some_and(TaskState::is_completed))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&TaskKey, &TaskState)> {
        self.tasks.iter().filter(|(_, s)| s.is_failure())
    }

    pub fn canceled(&self) -> impl Iterator<Item = &TaskKey> {
        self.tasks
            .iter()
            .filter(|(_, s)| matches!(s, TaskState::Canceled))
            .map(|(k, _)| k)
    }
}

#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<WorkGraph>,
    options: SchedulerOptions,
    selected: Vec<NodeId>,
    /// Participating tasks in dependency order.
    order: Vec<NodeId>,
    tasks: HashMap<NodeId, TaskState>,
    services: BTreeMap<NodeId, ServiceState>,
    /// Participating dependents per task.
    dependents: HashMap<NodeId, Vec<NodeId>>,
    /// Eligible tasks in the order they became eligible.
    ready: VecDeque<NodeId>,
    queued: HashSet<NodeId>,
    in_flight: usize,
    watched: HashSet<NodeId>,
    /// Sources changed while in flight: re-run once settled.
    dirty: HashSet<NodeId>,
    /// Settled by [`Scheduler::force_settle`]; late reports are dropped.
    forced: HashSet<NodeId>,
    canceled: bool,
    finished: bool,
}

impl Scheduler {
    /// Prepare a run of `selected` and everything it depends on or needs.
    pub fn new(graph: Arc<WorkGraph>, selected: Vec<NodeId>, options: SchedulerOptions) -> Self {
        let options = SchedulerOptions {
            concurrency: options.concurrency.max(1),
            ..options
        };

        let mut tasks = HashMap::new();
        let mut services = BTreeMap::new();
        let mut stack: Vec<NodeId> = selected.clone();
        while let Some(id) = stack.pop() {
            if tasks.contains_key(&id) || services.contains_key(&id) {
                continue;
            }
            if let Some(node) = graph.node(&id) {
                tasks.insert(id.clone(), TaskState::Pending);
                stack.extend(node.deps.iter().cloned());
                stack.extend(node.needs.iter().cloned());
            } else if let Some(service) = graph.service(&id) {
                services.insert(id.clone(), ServiceState::Pending);
                stack.extend(service.deps.iter().cloned());
                stack.extend(service.needs.iter().cloned());
            }
        }

        let order: Vec<NodeId> = graph
            .topological_order()
            .into_iter()
            .filter(|id| tasks.contains_key(id))
            .collect();

        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in &order {
            if let Some(node) = graph.node(id) {
                for dep in &node.deps {
                    dependents.entry(dep.clone()).or_default().push(id.clone());
                }
            }
        }

        debug!(
            tasks = tasks.len(),
            services = services.len(),
            concurrency = options.concurrency,
            watch = options.watch,
            "scheduler prepared"
        );

        Self {
            graph,
            options,
            selected,
            order,
            tasks,
            services,
            dependents,
            ready: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: 0,
            watched: HashSet::new(),
            dirty: HashSet::new(),
            forced: HashSet::new(),
            canceled: false,
            finished: false,
        }
    }

    pub fn graph(&self) -> &Arc<WorkGraph> {
        &self.graph
    }

    pub fn task_state(&self, id: &str) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    pub fn service_state(&self, id: &str) -> Option<&ServiceState> {
        self.services.get(id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// First step of a run: start what is eligible right away.
    pub fn start(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        self.evaluate(&mut step);
        step
    }

    /// Apply one event. Errors are programming errors in the reporting
    /// side (double resolution, impossible transitions).
    pub fn handle(&mut self, event: RuntimeEvent) -> Result<SchedulerStep, SchedulerError> {
        let mut step = SchedulerStep::default();

        match event {
            RuntimeEvent::TaskProgress { node, phase } => {
                if self.forced.contains(&node) {
                    debug!(task = %node, "dropping progress for a force-settled task");
                    return Ok(step);
                }
                let next = match phase {
                    TaskPhase::Ready => TaskState::Ready,
                    TaskPhase::Running => TaskState::Running,
                };
                self.transition(&node, next, &mut step)?;
            }
            RuntimeEvent::TaskFinished { node, outcome } => {
                self.finish_task(&node, outcome, &mut step)?;
            }
            RuntimeEvent::ServiceReady { service } => match self.services.get(&service) {
                Some(ServiceState::Starting) => {
                    info!(service = %self.service_key(&service), "service ready");
                    self.set_service(&service, ServiceState::Ready, &mut step);
                }
                Some(state) => {
                    debug!(service = %service, state = state.name(), "ignoring late readiness");
                }
                None => return Err(SchedulerError::UnknownNode(service)),
            },
            RuntimeEvent::ServiceEnded { service, failure } => match self.services.get(&service) {
                Some(state) if state.is_end() => {
                    debug!(service = %service, "service already ended");
                }
                Some(_) => {
                    self.set_service(&service, ServiceState::End { failure: failure.clone() }, &mut step);
                    if failure.is_some() {
                        self.cancel_in_flight_needers(&service, &mut step);
                    }
                }
                None => return Err(SchedulerError::UnknownNode(service)),
            },
            RuntimeEvent::SourceChanged { node, path } => {
                self.source_changed(&node, &path.display().to_string(), &mut step);
            }
        }

        self.evaluate(&mut step);
        Ok(step)
    }

    /// Stop dispatching, cancel every in-flight execution, stop services and
    /// detach watchers. Pending tasks are settled `canceled` immediately;
    /// in-flight ones once their executor reports back.
    pub fn cancel_all(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.canceled {
            return step;
        }
        info!("cancelling run");
        self.canceled = true;
        self.ready.clear();
        self.queued.clear();
        self.dirty.clear();

        for id in self.order.clone() {
            match self.tasks.get(&id) {
                Some(TaskState::Pending) => self.set_task(&id, TaskState::Canceled, &mut step),
                Some(state) if state.is_in_flight() => {
                    step.commands.push(CoreCommand::CancelTask(id.clone()));
                }
                _ => {}
            }
        }

        self.stop_services(|_| true, &mut step);

        let mut watched: Vec<NodeId> = self.watched.drain().collect();
        watched.sort();
        step.commands
            .extend(watched.into_iter().map(CoreCommand::Unwatch));

        self.evaluate(&mut step);
        step
    }

    /// Settle every in-flight task as `canceled` without waiting for its
    /// executor. Used once the cancellation grace period ran out.
    pub fn force_settle(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        for id in self.order.clone() {
            if self.tasks.get(&id).is_some_and(TaskState::is_in_flight) {
                self.forced.insert(id.clone());
                self.set_task(&id, TaskState::Canceled, &mut step);
            }
        }
        self.in_flight = 0;
        self.stop_services(|_| true, &mut step);
        self.evaluate(&mut step);
        step
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for (id, state) in &self.tasks {
            if let Some(node) = self.graph.node(id) {
                summary.tasks.insert(node.key.clone(), state.clone());
            }
        }
        for (id, state) in &self.services {
            summary.services.insert(self.service_key(id), state.clone());
        }
        summary.selected = self
            .selected
            .iter()
            .filter_map(|id| self.graph.node(id).map(|n| n.key.clone()))
            .collect();
        summary
    }

    fn finish_task(
        &mut self,
        id: &NodeId,
        outcome: TaskOutcome,
        step: &mut SchedulerStep,
    ) -> Result<(), SchedulerError> {
        let current = self
            .tasks
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownNode(id.clone()))?;

        if current.is_terminal() {
            if self.forced.remove(id) {
                debug!(task = %id, "dropping result of a force-settled task");
                return Ok(());
            }
            return Err(SchedulerError::AlreadyResolved {
                node: self.task_key(id),
                state: current.name().to_string(),
            });
        }
        if !current.is_in_flight() {
            return Err(SchedulerError::InvalidTransition {
                node: self.task_key(id),
                from: current.name().to_string(),
                to: outcome.into_state().name().to_string(),
            });
        }

        let state = outcome.into_state();
        self.transition(id, state.clone(), step)?;
        self.in_flight = self.in_flight.saturating_sub(1);

        match &state {
            TaskState::Completed { cached, .. } => {
                info!(task = %self.task_key(id), cached, "task completed")
            }
            TaskState::Canceled => info!(task = %self.task_key(id), "task canceled"),
            other => info!(task = %self.task_key(id), state = %other, "task failed"),
        }

        if self.canceled {
            return Ok(());
        }

        if self.options.watch {
            let has_src = self.graph.node(id).is_some_and(|n| !n.src.is_empty());
            if has_src && self.watched.insert(id.clone()) {
                step.commands.push(CoreCommand::Watch(id.clone()));
            }
        }

        if self.dirty.remove(id) {
            debug!(task = %id, "sources changed while running; re-queueing");
            self.reset(id, step);
        }
        Ok(())
    }

    fn source_changed(&mut self, id: &NodeId, path: &str, step: &mut SchedulerStep) {
        if !self.options.watch || self.canceled {
            return;
        }
        let Some(state) = self.tasks.get(id) else {
            debug!(task = %id, "change for a node outside this run");
            return;
        };

        if state.is_terminal() {
            info!(task = %self.task_key(id), path, "source changed; re-running");
            self.reset(id, step);
        } else if state.is_in_flight() {
            self.dirty.insert(id.clone());
        }
    }

    /// Put `id` and its settled dependents back to `pending`. In-flight
    /// dependents are re-run once they finish.
    fn reset(&mut self, id: &NodeId, step: &mut SchedulerStep) {
        let mut stack = vec![id.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            match self.tasks.get(&current) {
                Some(state) if state.is_terminal() => {
                    self.set_task(&current, TaskState::Pending, step);
                }
                Some(state) if state.is_in_flight() => {
                    self.dirty.insert(current.clone());
                }
                _ => {}
            }
            if let Some(deps) = self.dependents.get(&current) {
                stack.extend(deps.iter().cloned());
            }
        }
    }

    fn transition(
        &mut self,
        id: &NodeId,
        next: TaskState,
        step: &mut SchedulerStep,
    ) -> Result<(), SchedulerError> {
        let current = self
            .tasks
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownNode(id.clone()))?;
        if !current.can_transition_to(&next) {
            return Err(SchedulerError::InvalidTransition {
                node: self.task_key(id),
                from: current.name().to_string(),
                to: next.name().to_string(),
            });
        }
        self.set_task(id, next, step);
        Ok(())
    }

    /// Bring the run forward: settle what can no longer run, start needed
    /// services, dispatch eligible tasks and detect the end of the run.
    fn evaluate(&mut self, step: &mut SchedulerStep) {
        self.settle_blocked(step);

        if !self.canceled {
            self.start_services(step);

            if !self.options.watch {
                let keep = self.services_in_use();
                self.stop_services(|id| !keep.contains(id), step);
            }

            for id in &self.order {
                if self.tasks.get(id) == Some(&TaskState::Pending)
                    && !self.queued.contains(id)
                    && self.is_eligible(id)
                {
                    self.queued.insert(id.clone());
                    self.ready.push_back(id.clone());
                }
            }

            while self.in_flight < self.options.concurrency {
                let Some(id) = self.ready.pop_front() else {
                    break;
                };
                self.queued.remove(&id);
                if self.tasks.get(&id) != Some(&TaskState::Pending) || !self.is_eligible(&id) {
                    continue;
                }
                self.set_task(&id, TaskState::Starting, step);
                self.in_flight += 1;
                step.commands.push(CoreCommand::Dispatch(id));
            }
        }

        if !self.finished
            && (self.canceled || !self.options.watch)
            && self.in_flight == 0
            && self.tasks.values().all(TaskState::is_terminal)
            && !self.services.values().any(ServiceState::is_running)
        {
            info!(canceled = self.canceled, "run finished");
            self.finished = true;
            step.commands.push(CoreCommand::Finish);
        }
    }

    /// Cancel pending tasks behind a failed dependency or an ended service,
    /// and end pending services whose prerequisites can no longer be met.
    /// Repeats until nothing changes, so cancellation is transitive.
    fn settle_blocked(&mut self, step: &mut SchedulerStep) {
        loop {
            let mut changed = false;

            for id in self.order.clone() {
                if self.tasks.get(&id) != Some(&TaskState::Pending) {
                    continue;
                }
                let Some(node) = self.graph.node(&id).cloned() else {
                    continue;
                };
                if let Some(reason) = self.blocked_reason(&node.deps, &node.needs) {
                    debug!(task = %node.key, reason, "canceling dependent");
                    self.set_task(&id, TaskState::Canceled, step);
                    changed = true;
                }
            }

            let pending: Vec<NodeId> = self
                .services
                .iter()
                .filter(|(_, s)| **s == ServiceState::Pending)
                .map(|(id, _)| id.clone())
                .collect();
            for id in pending {
                let Some(service) = self.graph.service(&id).cloned() else {
                    continue;
                };
                if let Some(reason) = self.blocked_reason(&service.deps, &service.needs) {
                    self.set_service(
                        &id,
                        ServiceState::End {
                            failure: Some(reason),
                        },
                        step,
                    );
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Why a pending unit with these prerequisites can never start.
    fn blocked_reason(&self, deps: &[NodeId], needs: &[NodeId]) -> Option<String> {
        for dep in deps {
            match self.tasks.get(dep) {
                Some(state) if state.is_failure() || *state == TaskState::Canceled => {
                    return Some(format!("dependency {} {}", self.task_key(dep), state.name()));
                }
                _ => {}
            }
        }
        for need in needs {
            if let Some(ServiceState::End { failure }) = self.services.get(need) {
                let why = failure.as_deref().unwrap_or("stopped");
                return Some(format!("service {} ended: {why}", self.service_key(need)));
            }
        }
        None
    }

    fn is_eligible(&self, id: &str) -> bool {
        let Some(node) = self.graph.node(id) else {
            return false;
        };
        node.deps
            .iter()
            .all(|d| self.tasks.get(d).is_some_and(TaskState::is_completed))
            && node
                .needs
                .iter()
                .all(|n| self.services.get(n) == Some(&ServiceState::Ready))
    }

    /// Services some unfinished task still relies on, directly or through
    /// another service.
    fn services_in_use(&self) -> HashSet<NodeId> {
        let roots = self
            .tasks
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .filter_map(|(id, _)| self.graph.node(id))
            .flat_map(|n| n.needs.iter().cloned());
        self.service_closure(roots)
    }

    /// Services that should be running now: needed by a task that is in
    /// flight or waiting only on services.
    fn services_requested(&self) -> HashSet<NodeId> {
        let roots = self
            .tasks
            .iter()
            .filter_map(|(id, s)| {
                let node = self.graph.node(id)?;
                let waiting = *s == TaskState::Pending
                    && node
                        .deps
                        .iter()
                        .all(|d| self.tasks.get(d).is_some_and(TaskState::is_completed));
                (waiting || s.is_in_flight()).then_some(node)
            })
            .flat_map(|n| n.needs.iter().cloned());
        self.service_closure(roots)
    }

    fn service_closure(&self, roots: impl Iterator<Item = NodeId>) -> HashSet<NodeId> {
        let mut out = HashSet::new();
        let mut stack: Vec<NodeId> = roots.collect();
        while let Some(id) = stack.pop() {
            if !out.insert(id.clone()) {
                continue;
            }
            if let Some(service) = self.graph.service(&id) {
                stack.extend(service.needs.iter().cloned());
            }
        }
        out
    }

    fn start_services(&mut self, step: &mut SchedulerStep) {
        let requested = self.services_requested();
        let startable: Vec<NodeId> = self
            .services
            .iter()
            .filter(|(id, s)| **s == ServiceState::Pending && requested.contains(*id))
            .map(|(id, _)| id.clone())
            .filter(|id| {
                self.graph.service(id).is_some_and(|svc| {
                    svc.deps
                        .iter()
                        .all(|d| self.tasks.get(d).is_some_and(TaskState::is_completed))
                        && svc
                            .needs
                            .iter()
                            .all(|n| self.services.get(n) == Some(&ServiceState::Ready))
                })
            })
            .collect();

        for id in startable {
            info!(service = %self.service_key(&id), "starting service");
            self.set_service(&id, ServiceState::Starting, step);
            step.commands.push(CoreCommand::StartService(id));
        }
    }

    fn stop_services(&mut self, filter: impl Fn(&NodeId) -> bool, step: &mut SchedulerStep) {
        let running: Vec<NodeId> = self
            .services
            .iter()
            .filter(|(id, s)| s.is_running() && filter(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in running {
            info!(service = %self.service_key(&id), "stopping service");
            step.commands.push(CoreCommand::StopService(id.clone()));
            self.set_service(&id, ServiceState::End { failure: None }, step);
        }
    }

    fn cancel_in_flight_needers(&mut self, service: &NodeId, step: &mut SchedulerStep) {
        for id in &self.order {
            let in_flight = self.tasks.get(id).is_some_and(TaskState::is_in_flight);
            let needs = self
                .graph
                .node(id)
                .is_some_and(|n| n.needs.contains(service));
            if in_flight && needs {
                step.commands.push(CoreCommand::CancelTask(id.clone()));
            }
        }
    }

    fn set_task(&mut self, id: &NodeId, state: TaskState, step: &mut SchedulerStep) {
        self.tasks.insert(id.clone(), state.clone());
        step.events.push(RunEvent::TaskState {
            node: id.clone(),
            key: self.task_key(id),
            state,
        });
    }

    fn set_service(&mut self, id: &NodeId, state: ServiceState, step: &mut SchedulerStep) {
        self.services.insert(id.clone(), state.clone());
        step.events.push(RunEvent::ServiceState {
            service: id.clone(),
            key: self.service_key(id),
            state,
        });
    }

    fn task_key(&self, id: &str) -> TaskKey {
        self.graph
            .node(id)
            .map(|n: &Arc<WorkNode>| n.key.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn service_key(&self, id: &str) -> TaskKey {
        self.graph
            .service(id)
            .map(|s| s.key.clone())
            .unwrap_or_else(|| id.to_string())
    }
}
