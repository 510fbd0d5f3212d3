// Workflow Executor - Drives a run through its automation graph

use chrono::{DateTime, Utc};
use kontor_shared::{AutomationRun, ExecutionLogEntry, NodeLogStatus, RunContext, RunStatus};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::ActionRegistry;
use super::engine::{EngineError, EngineResult};
use super::graph::{GraphError, NodeIndex, NodeStep, WorkflowGraph};
use super::store::{AutomationStore, RunOutcome, RunStore};

/// How a traversal segment ended.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed,
    Waiting { node_id: String, resume_at: DateTime<Utc> },
    Cancelled,
    Failed(String),
}

/// What executing a single node produced.
struct NodeEffect {
    output: Value,
    status: NodeLogStatus,
    branch: Option<bool>,
    resume_at: Option<DateTime<Utc>>,
}

impl NodeEffect {
    fn completed(output: Value) -> Self {
        Self {
            output,
            status: NodeLogStatus::Completed,
            branch: None,
            resume_at: None,
        }
    }
}

pub struct AutomationExecutor {
    automations: Arc<dyn AutomationStore>,
    runs: Arc<dyn RunStore>,
    actions: ActionRegistry,
}

impl AutomationExecutor {
    pub fn new(automations: Arc<dyn AutomationStore>, runs: Arc<dyn RunStore>, actions: ActionRegistry) -> Self {
        Self {
            automations,
            runs,
            actions,
        }
    }

    /// Runs a `pending` run from its trigger node until it finishes or parks on a wait node.
    pub async fn execute_run(&self, run_id: Uuid) -> EngineResult<RunStatus> {
        let run = self.runs.get(run_id).await?.ok_or(EngineError::RunNotFound(run_id))?;

        if !self.runs.mark_running(run_id, Utc::now()).await? {
            debug!("Run {} is no longer pending ({}), not starting it", run_id, run.status);
            return self.current_status(run_id).await;
        }

        info!("Starting run {} of automation {}", run.id, run.automation_id);

        let Some(automation) = self.automations.get(run.automation_id).await? else {
            let reason = format!("automation {} no longer exists", run.automation_id);
            return self.conclude(&run, Outcome::Failed(reason)).await;
        };

        let graph = WorkflowGraph::build(&automation);
        let outcome = match graph.trigger() {
            Ok(trigger) => self.traverse(&graph, &run, vec![trigger]).await,
            Err(e) => Ok(Outcome::Failed(e.to_string())),
        };

        self.settle(&run, outcome).await
    }

    /// Continues a `waiting` run after its wait node. `None` when another caller already claimed it.
    pub async fn resume_run(&self, run_id: Uuid) -> EngineResult<Option<RunStatus>> {
        let Some(claimed) = self.runs.claim_waiting(run_id).await? else {
            debug!("Run {} is not waiting, skipping resume", run_id);
            return Ok(None);
        };
        let run = claimed.run;

        info!("Resuming run {} of automation {}", run.id, run.automation_id);

        let Some(automation) = self.automations.get(run.automation_id).await? else {
            let reason = format!("automation {} no longer exists", run.automation_id);
            return self.conclude(&run, Outcome::Failed(reason)).await.map(Some);
        };

        let graph = WorkflowGraph::build(&automation);
        let wait_node = claimed
            .wait_node_id
            .as_deref()
            .and_then(|id| graph.resolve(id))
            .ok_or_else(|| GraphError::UnknownNode(claimed.wait_node_id.clone().unwrap_or_default()));

        let outcome = match wait_node.and_then(|idx| graph.successors(idx, None)) {
            Ok(children) => self.traverse(&graph, &run, children).await,
            Err(e) => Ok(Outcome::Failed(e.to_string())),
        };

        self.settle(&run, outcome).await.map(Some)
    }

    async fn current_status(&self, run_id: Uuid) -> EngineResult<RunStatus> {
        self.runs
            .status(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Finalizes a traversal, or fails the run if the traversal itself hit a store error.
    async fn settle(&self, run: &AutomationRun, outcome: EngineResult<Outcome>) -> EngineResult<RunStatus> {
        match outcome {
            Ok(outcome) => self.conclude(run, outcome).await,
            Err(e) => {
                error!("Run {} aborted: {}", run.id, e);
                let now = Utc::now();
                match self.runs.finish(run.id, RunStatus::Failed, Some(&e.to_string()), now).await {
                    Ok(true) => {
                        self.record_stats(run, RunStatus::Failed, Some(e.to_string()), now).await;
                    }
                    Ok(false) => {}
                    Err(mark_err) => error!("Could not mark run {} failed: {}", run.id, mark_err),
                }
                Err(e)
            }
        }
    }

    async fn conclude(&self, run: &AutomationRun, outcome: Outcome) -> EngineResult<RunStatus> {
        let now = Utc::now();

        let (status, error, applied) = match outcome {
            Outcome::Waiting { node_id, resume_at } => {
                if self.runs.suspend(run.id, &node_id, resume_at).await? {
                    info!("Run {} waiting at node '{}' until {}", run.id, node_id, resume_at);
                    return Ok(RunStatus::Waiting);
                }
                (RunStatus::Waiting, None, false)
            }
            Outcome::Completed => {
                let applied = self.runs.finish(run.id, RunStatus::Completed, None, now).await?;
                (RunStatus::Completed, None, applied)
            }
            Outcome::Failed(reason) => {
                let applied = self.runs.finish(run.id, RunStatus::Failed, Some(&reason), now).await?;
                (RunStatus::Failed, Some(reason), applied)
            }
            Outcome::Cancelled => (RunStatus::Cancelled, None, false),
        };

        if applied {
            match &error {
                Some(reason) => warn!("Run {} of automation {} failed: {}", run.id, run.automation_id, reason),
                None => info!("Run {} of automation {} completed", run.id, run.automation_id),
            }
            self.record_stats(run, status, error, now).await;
            return Ok(status);
        }

        // The status moved under us; the only writer that can do that mid-run is a cancel.
        let current = self.current_status(run.id).await?;
        if current == RunStatus::Cancelled {
            info!("Run {} of automation {} was cancelled", run.id, run.automation_id);
            self.record_stats(run, RunStatus::Cancelled, None, now).await;
        }
        Ok(current)
    }

    async fn record_stats(&self, run: &AutomationRun, status: RunStatus, error: Option<String>, at: DateTime<Utc>) {
        let outcome = RunOutcome {
            status,
            error,
            finished_at: at,
        };
        if let Err(e) = self.automations.record_outcome(run.automation_id, &outcome).await {
            error!("Failed to update stats for automation {}: {}", run.automation_id, e);
        }
    }

    /// Depth-first walk from `roots`, persisting after every node.
    async fn traverse(
        &self,
        graph: &WorkflowGraph<'_>,
        run: &AutomationRun,
        roots: Vec<NodeIndex>,
    ) -> EngineResult<Outcome> {
        let mut context = run.context.clone();
        let mut stack: Vec<NodeIndex> = roots.into_iter().rev().collect();
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut parked: Option<(String, DateTime<Utc>)> = None;

        while let Some(idx) = stack.pop() {
            if self.runs.status(run.id).await? == Some(RunStatus::Cancelled) {
                return Ok(Outcome::Cancelled);
            }

            let node = graph.node(idx);
            if !visited.insert(idx) {
                warn!("Run {}: node '{}' already executed in this pass, skipping", run.id, node.id);
                continue;
            }

            let started_at = Utc::now();
            let timer = Instant::now();
            let input = context.to_value();

            let effect = match NodeStep::parse(node) {
                Ok(step) => self.run_node(node.id.as_str(), step, &context, run, parked.is_some()).await,
                Err(e) => Err(e.to_string()),
            };

            let mut entry = ExecutionLogEntry {
                node_id: node.id.clone(),
                kind: node.kind,
                action_type: node.action_type().map(str::to_string),
                label: node.name.clone(),
                started_at,
                completed_at: Utc::now(),
                status: NodeLogStatus::Completed,
                input,
                output: None,
                error: None,
                duration_ms: i64::try_from(timer.elapsed().as_millis()).unwrap_or(i64::MAX),
            };

            let effect = match effect {
                Ok(effect) => effect,
                Err(reason) => {
                    entry.status = NodeLogStatus::Failed;
                    entry.error = Some(reason.clone());
                    self.runs.record_step(run.id, &entry, &context).await?;
                    return Ok(Outcome::Failed(format!("node '{}' failed: {}", node.id, reason)));
                }
            };

            entry.status = effect.status;
            entry.output = Some(effect.output.clone());
            context.insert_node_output(&node.id, effect.output);
            self.runs.record_step(run.id, &entry, &context).await?;

            debug!("Run {}: node '{}' ({}) {:?}", run.id, node.id, node.kind.as_str(), entry.status);

            if let Some(resume_at) = effect.resume_at {
                parked = Some((node.id.clone(), resume_at));
                continue;
            }

            match graph.successors(idx, effect.branch) {
                Ok(children) => stack.extend(children.into_iter().rev()),
                Err(e) => return Ok(Outcome::Failed(e.to_string())),
            }
        }

        Ok(match parked {
            Some((node_id, resume_at)) => Outcome::Waiting { node_id, resume_at },
            None => Outcome::Completed,
        })
    }

    async fn run_node(
        &self,
        node_id: &str,
        step: NodeStep,
        context: &RunContext,
        run: &AutomationRun,
        already_parked: bool,
    ) -> Result<NodeEffect, String> {
        match step {
            NodeStep::Trigger => Ok(NodeEffect::completed(json!({ "triggered": true }))),
            NodeStep::Action(request) => {
                let output = self
                    .actions
                    .execute(&request, context, run.tenant_id)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut effect = NodeEffect::completed(output);
                if request.is_unknown() {
                    effect.status = NodeLogStatus::Skipped;
                }
                Ok(effect)
            }
            NodeStep::Condition(condition) => {
                let result = condition.evaluate(context);
                debug!("Run {}: condition '{}' on '{}' -> {}", run.id, node_id, condition.field, result);
                Ok(NodeEffect {
                    output: json!({ "conditionResult": result }),
                    status: NodeLogStatus::Completed,
                    branch: Some(result),
                    resume_at: None,
                })
            }
            NodeStep::Wait(wait) => {
                if already_parked {
                    return Err("a run can only wait on one node at a time".to_string());
                }
                let resume_at = wait.resume_at(Utc::now())?;
                Ok(NodeEffect {
                    output: json!({ "resumeAt": resume_at.to_rfc3339() }),
                    status: NodeLogStatus::Waiting,
                    branch: None,
                    resume_at: Some(resume_at),
                })
            }
            NodeStep::Unknown => {
                warn!("Run {}: skipping node '{}' of unsupported kind", run.id, node_id);
                Ok(NodeEffect {
                    output: json!({ "skipped": true, "reason": "unsupported node kind" }),
                    status: NodeLogStatus::Skipped,
                    branch: None,
                    resume_at: None,
                })
            }
        }
    }
}
