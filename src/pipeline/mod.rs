//! Dependency-aware pipeline engine
//!
//! Stages move Pending → Ready → Running → {Completed | Failed}. Every ready
//! independent stage is dispatched at once; a sequential stage runs alone.
//! A bounded worker pool limits concurrent capability invocations.
//!
//! On failure the run is cancelled cooperatively: nothing new is dispatched,
//! in-flight stages finish and their output is dropped. Retry is never
//! attempted here.

pub mod graph;

pub use graph::{ArgBinding, ArgSource, ConcurrencyClass, ReportLayout, StageGraph, StageNode};

use crate::capability::{CapabilityRegistry, CapabilityRequest};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, OrchestrationError};
use crate::models::{AdvisoryReport, StageObservation, StageStatus};
use crate::report::ReportAggregator;
use crate::Result;
use graph::ResolutionScope;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Initial values available to argument bindings
pub type RunInputs = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// `None` sizes the pool to the graph's widest fan
    pub worker_pool_size: Option<usize>,
    pub per_call_timeout: Option<Duration>,
}

impl From<&OrchestratorConfig> for EngineSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size,
            per_call_timeout: config.per_call_timeout,
        }
    }
}

/// Outputs of a fully successful run, keyed by stage name
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub outputs: BTreeMap<String, Value>,
    /// One entry per stage, in declaration order
    pub observations: Vec<StageObservation>,
}

/// Shared per-run state: the worker pool and the cancellation signal
struct RunContext {
    registry: Arc<CapabilityRegistry>,
    workers: Semaphore,
    cancelled: AtomicBool,
    call_timeout: Option<Duration>,
}

impl RunContext {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits for a worker, then re-checks cancellation before invoking.
    /// The instant is when the call actually started, after any queueing.
    async fn invoke(
        &self,
        request: CapabilityRequest,
        halted: Option<&AtomicBool>,
    ) -> (Result<Value>, Option<Instant>) {
        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let closed = OrchestrationError::Execution("worker pool closed".to_string());
                return (Err(closed), None);
            }
        };

        if self.is_cancelled() || halted.is_some_and(|h| h.load(Ordering::SeqCst)) {
            return (Err(OrchestrationError::Cancelled(request.capability)), None);
        }

        let started = Instant::now();

        let result = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, self.registry.invoke(&request))
                .await
                .unwrap_or_else(|_| {
                    Err(OrchestrationError::CapabilityFailure {
                        capability: request.capability.clone(),
                        cause: format!("timed out after {} ms", limit.as_millis()),
                    })
                }),
            None => self.registry.invoke(&request).await,
        };

        // Signal before the permit is released so queued work sees it.
        if let Err(e) = &result {
            if e.kind() != ErrorKind::InsufficientData {
                self.cancel();
            }
        }
        (result, Some(started))
    }
}

enum StageJob {
    Single(CapabilityRequest),
    PerItem(Vec<CapabilityRequest>),
}

struct StageOutcome {
    index: usize,
    result: Result<Value>,
    invocations: usize,
    elapsed_ms: u64,
}

/// Elapsed time is measured from the first call that got a worker, so time
/// spent queueing for the pool is not charged to the stage.
async fn run_stage(ctx: Arc<RunContext>, index: usize, job: StageJob) -> StageOutcome {
    let (result, invocations, started) = match job {
        StageJob::Single(request) => {
            let (result, started) = ctx.invoke(request, None).await;
            (result, 1, started)
        }
        StageJob::PerItem(requests) => run_items(ctx, requests).await,
    };

    StageOutcome {
        index,
        result,
        invocations,
        elapsed_ms: started.map_or(0, |t| t.elapsed().as_millis() as u64),
    }
}

/// Invoke once per item; output keeps item order. The lowest-index real
/// failure decides the stage result and halts items that have not started.
async fn run_items(
    ctx: Arc<RunContext>,
    requests: Vec<CapabilityRequest>,
) -> (Result<Value>, usize, Option<Instant>) {
    let total = requests.len();
    let halted = Arc::new(AtomicBool::new(false));
    let mut items = JoinSet::new();

    for (position, request) in requests.into_iter().enumerate() {
        let ctx = ctx.clone();
        let halted = halted.clone();
        items.spawn(async move {
            let (result, started) = ctx.invoke(request, Some(halted.as_ref())).await;
            if matches!(&result, Err(e) if !matches!(e, OrchestrationError::Cancelled(_))) {
                halted.store(true, Ordering::SeqCst);
            }
            (position, result, started)
        });
    }

    let mut slots: Vec<Option<Result<Value>>> = (0..total).map(|_| None).collect();
    let mut first_start: Option<Instant> = None;
    while let Some(joined) = items.join_next().await {
        match joined {
            Ok((position, result, started)) => {
                slots[position] = Some(result);
                first_start = match (first_start, started) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            Err(e) => {
                return (
                    Err(OrchestrationError::Execution(format!("item task aborted: {}", e))),
                    total,
                    first_start,
                )
            }
        }
    }

    let started = slots
        .iter()
        .filter(|s| !matches!(s, Some(Err(OrchestrationError::Cancelled(_)))))
        .count();

    let mut values = Vec::with_capacity(total);
    let mut cancelled = None;
    for slot in slots.into_iter().flatten() {
        match slot {
            Ok(value) => values.push(value),
            Err(OrchestrationError::Cancelled(name)) => {
                cancelled.get_or_insert(name);
            }
            Err(e) => return (Err(e), started, first_start),
        }
    }

    match cancelled {
        Some(name) => (Err(OrchestrationError::Cancelled(name)), started, first_start),
        None => (Ok(Value::Array(values)), started, first_start),
    }
}

/// Executes stage graphs against a capability registry
pub struct PipelineEngine {
    registry: Arc<CapabilityRegistry>,
    settings: EngineSettings,
}

impl PipelineEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, settings: EngineSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Execute the graph and assemble its report
    pub async fn run(&self, graph: &StageGraph, inputs: &RunInputs) -> Result<AdvisoryReport> {
        let layout = graph.report.as_ref().ok_or_else(|| {
            OrchestrationError::Configuration("graph declares no report layout".to_string())
        })?;

        let run = self.execute(graph, inputs).await?;
        ReportAggregator::assemble(layout, &run.outputs)
    }

    /// Execute every stage, respecting dependencies (fail-fast, cancel-on-failure)
    pub async fn execute(&self, graph: &StageGraph, inputs: &RunInputs) -> Result<PipelineRun> {
        let (result, run) = self.execute_observed(graph, inputs).await;
        result.map(|()| run)
    }

    /// Like [`execute`](Self::execute), but the per-stage observations (and the
    /// outputs of stages that completed) come back even when the run fails.
    /// A graph that fails validation yields no observations.
    pub async fn execute_observed(&self, graph: &StageGraph, inputs: &RunInputs) -> (Result<()>, PipelineRun) {
        let mut run = PipelineRun {
            outputs: BTreeMap::new(),
            observations: Vec::new(),
        };
        let result = match graph.validate(&self.registry) {
            Ok(()) => self.drive(graph, inputs, &mut run).await,
            Err(e) => Err(e),
        };
        (result, run)
    }

    async fn drive(&self, graph: &StageGraph, inputs: &RunInputs, run: &mut PipelineRun) -> Result<()> {
        let stages = &graph.stages;
        let pool_size = self
            .settings
            .worker_pool_size
            .unwrap_or_else(|| graph.widest_fan())
            .max(1);

        let ctx = Arc::new(RunContext {
            registry: self.registry.clone(),
            workers: Semaphore::new(pool_size),
            cancelled: AtomicBool::new(false),
            call_timeout: self.settings.per_call_timeout,
        });

        info!(stages = stages.len(), pool_size, "Starting pipeline run");

        let PipelineRun {
            outputs,
            observations,
        } = run;
        let mut status = vec![StageStatus::Pending; stages.len()];
        *observations = stages
            .iter()
            .map(|s| StageObservation {
                stage: s.name.clone(),
                capability: s.capability.clone(),
                status: StageStatus::Pending,
                invocations: 0,
                execution_time_ms: 0,
                error: None,
            })
            .collect();
        let dependencies: Vec<Vec<usize>> = stages
            .iter()
            .map(|s| s.depends_on.iter().filter_map(|d| graph.index_of(d)).collect())
            .collect();

        let mut in_flight: JoinSet<StageOutcome> = JoinSet::new();
        let mut running: BTreeSet<usize> = BTreeSet::new();
        let mut failures: Vec<(usize, OrchestrationError)> = Vec::new();
        let mut failure_fan: Option<BTreeSet<usize>> = None;

        loop {
            // -------------------------------------------------
            // 1️⃣ DISPATCH READY STAGES
            // -------------------------------------------------
            let sequential_running = running.iter().any(|i| stages[*i].is_sequential());
            if !ctx.is_cancelled() && !sequential_running {
                for index in 0..stages.len() {
                    if !matches!(status[index], StageStatus::Pending | StageStatus::Ready) {
                        continue;
                    }
                    if !dependencies[index]
                        .iter()
                        .all(|d| status[*d] == StageStatus::Completed)
                    {
                        continue;
                    }

                    status[index] = StageStatus::Ready;
                    let node = &stages[index];
                    if node.is_sequential() && !running.is_empty() {
                        break;
                    }

                    match prepare(node, inputs, outputs) {
                        Ok(job) => {
                            debug!(stage = %node.name, capability = %node.capability, "Dispatching stage");
                            status[index] = StageStatus::Running;
                            running.insert(index);
                            in_flight.spawn(run_stage(ctx.clone(), index, job));
                        }
                        Err(e) => {
                            status[index] = StageStatus::Failed;
                            observations[index].error = Some(e.to_string());
                            record_failure(&ctx, &running, &mut failure_fan, &mut failures, node, index, e);
                            if ctx.is_cancelled() {
                                break;
                            }
                            continue;
                        }
                    }

                    if node.is_sequential() {
                        break;
                    }
                }
            }

            // -------------------------------------------------
            // 2️⃣ COLLECT NEXT COMPLETION
            // -------------------------------------------------
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let outcome = joined
                .map_err(|e| OrchestrationError::Execution(format!("stage task aborted: {}", e)))?;

            let index = outcome.index;
            let node = &stages[index];
            running.remove(&index);
            observations[index].invocations = outcome.invocations;
            observations[index].execution_time_ms = outcome.elapsed_ms;

            match outcome.result {
                Ok(value) if ctx.is_cancelled() => {
                    debug!(stage = %node.name, "Discarding output after cancellation");
                    status[index] = StageStatus::Discarded;
                    drop(value);
                }
                Ok(value) => {
                    debug!(
                        stage = %node.name,
                        elapsed_ms = outcome.elapsed_ms,
                        "Stage completed"
                    );
                    status[index] = StageStatus::Completed;
                    outputs.insert(node.name.clone(), value);
                }
                Err(OrchestrationError::Cancelled(_)) => {
                    status[index] = StageStatus::Cancelled;
                }
                Err(e) => {
                    status[index] = StageStatus::Failed;
                    observations[index].error = Some(e.to_string());
                    record_failure(&ctx, &running, &mut failure_fan, &mut failures, node, index, e);
                }
            }
        }

        // -------------------------------------------------
        // 3️⃣ SETTLE STAGES THAT NEVER RAN
        // -------------------------------------------------
        for (index, state) in status.iter_mut().enumerate() {
            if matches!(state, StageStatus::Pending | StageStatus::Ready) {
                *state = if ctx.is_cancelled() {
                    StageStatus::Cancelled
                } else {
                    StageStatus::Skipped
                };
            }
            observations[index].status = *state;
        }

        if let Some(fan) = failure_fan {
            let (index, cause) = failures
                .into_iter()
                .filter(|(i, _)| fan.contains(i))
                .min_by_key(|(i, _)| *i)
                .ok_or_else(|| OrchestrationError::Execution("failure record lost".to_string()))?;

            let node = &stages[index];
            warn!(
                stage = %node.name,
                kind = %cause.kind(),
                error = %cause,
                "Pipeline failed"
            );
            return Err(OrchestrationError::StageFailed {
                stage: node.name.clone(),
                capability: node.capability.clone(),
                source: Box::new(cause),
            });
        }

        if let Some(stalled) = observations
            .iter()
            .find(|o| o.status != StageStatus::Completed)
        {
            return Err(OrchestrationError::Execution(format!(
                "stage '{}' ended {:?} without a recorded failure",
                stalled.stage, stalled.status
            )));
        }

        info!(stages = stages.len(), "Pipeline run completed");
        Ok(())
    }
}

fn prepare(node: &StageNode, inputs: &RunInputs, outputs: &BTreeMap<String, Value>) -> Result<StageJob> {
    let scope = ResolutionScope {
        inputs,
        outputs,
        item: None,
    };

    let Some(source) = &node.fan_out else {
        return node.build_request(&scope).map(StageJob::Single);
    };

    let items = source.resolve(&scope, &node.capability)?;
    let items = items.as_array().ok_or_else(|| OrchestrationError::ArgumentMismatch {
        capability: node.capability.clone(),
        reason: format!("fan-out source of '{}' is not an array", node.name),
    })?;

    items
        .iter()
        .map(|item| {
            node.build_request(&ResolutionScope {
                inputs,
                outputs,
                item: Some(item),
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(StageJob::PerItem)
}

/// Records a stage failure. The first failure fixes the fan (stages in flight
/// at that moment); the earliest-declared failure within it is reported.
/// Missing data stays contained to its own dependency chain.
fn record_failure(
    ctx: &RunContext,
    running: &BTreeSet<usize>,
    failure_fan: &mut Option<BTreeSet<usize>>,
    failures: &mut Vec<(usize, OrchestrationError)>,
    node: &StageNode,
    index: usize,
    error: OrchestrationError,
) {
    warn!(
        stage = %node.name,
        capability = %node.capability,
        error = %error,
        "Stage failed"
    );

    if failure_fan.is_none() {
        let mut fan = running.clone();
        fan.insert(index);
        *failure_fan = Some(fan);
    }

    if error.kind() != ErrorKind::InsufficientData {
        debug!(stage = %node.name, "Cancelling remaining stages");
        ctx.cancel();
    }

    failures.push((index, error));
}
