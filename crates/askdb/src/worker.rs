//! Worker pool: pulls jobs, rehydrates state, drives the pipeline, and
//! writes the terminal run record.
//!
//! Workers are stateless with respect to run metadata; everything they
//! need is reloaded by id, so any worker can finish any job, including
//! one redelivered after a crash elsewhere.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Job};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::connection::{ConnectionPayload, Engine};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::history::HistoryService;
use crate::llm::ModelClient;
use crate::metrics;
use crate::pipeline::{run_pipeline, AgentBundle, PipelineContext, PipelineState};
use crate::registry::{category, ObjectRegistry, RunScope};
use crate::store::{MetaStore, RunOutcome, RunStatus};

/// Idle poll interval when the queue is quiet.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Everything a worker needs, shared across the pool.
pub struct WorkerDeps {
    pub cfg: Config,
    pub store: Arc<MetaStore>,
    pub registry: Arc<ObjectRegistry>,
    pub cache: Arc<ResponseCache>,
    pub llm: Arc<dyn ModelClient>,
    pub history: Arc<HistoryService>,
    pub broker: Arc<Broker>,
}

/// Spawns `worker_count * worker_concurrency` consumer tasks.
pub fn spawn_workers(deps: Arc<WorkerDeps>) -> Vec<tokio::task::JoinHandle<()>> {
    let slots = deps.cfg.total_slots();
    info!("Starting {} worker slot(s)", slots);
    (0..slots)
        .map(|slot| {
            let deps = deps.clone();
            tokio::spawn(async move {
                let worker_id = format!("worker-{}", slot);
                worker_loop(&worker_id, deps).await;
            })
        })
        .collect()
}

async fn worker_loop(worker_id: &str, deps: Arc<WorkerDeps>) {
    debug!("{} started", worker_id);
    loop {
        match deps.broker.sweep_dead() {
            Ok(dead_runs) => {
                for run_id in dead_runs {
                    let _ = deps.store.runs.finalize_failure(run_id, ErrorKind::InternalError);
                    metrics::inc_run("failure");
                }
            }
            Err(e) => warn!("{}: dead-job sweep failed: {}", worker_id, e),
        }

        let job = match deps.broker.pull(worker_id, deps.cfg.visibility_timeout()) {
            Ok(Some(job)) => job,
            Ok(None) => {
                deps.broker.wait_for_job(IDLE_WAIT).await;
                continue;
            }
            Err(e) => {
                warn!("{}: pull failed: {}", worker_id, e);
                tokio::time::sleep(IDLE_WAIT).await;
                continue;
            }
        };

        if let Err(e) = process_job(worker_id, &deps, &job).await {
            error!("{}: job {} processing error: {}", worker_id, job.id, e);
            let _ = deps.store.runs.finalize_failure(job.payload.run_id, e.kind());
            metrics::inc_run("failure");
        }
        if let Err(e) = deps.broker.ack(job.id) {
            warn!("{}: ack of job {} failed: {}", worker_id, job.id, e);
        }
    }
}

/// Executes one job to a terminal run record. The registry scope
/// guarantees run-scoped objects are released on every exit path.
pub async fn process_job(worker_id: &str, deps: &WorkerDeps, job: &Job) -> CoreResult<()> {
    let run_id = job.payload.run_id;
    let started = Instant::now();

    let Some(run) = deps.store.runs.get(run_id)? else {
        warn!("{}: job {} references missing run {}", worker_id, job.id, run_id);
        return Ok(());
    };
    if run.status.is_terminal() {
        // Redelivery after another worker already finished, or a
        // cancellation that beat the pickup.
        debug!("{}: run {} already terminal ({}), skipping", worker_id, run_id, run.status);
        return Ok(());
    }

    if !deps.store.runs.mark_running(run_id)? {
        return Ok(());
    }
    info!("{}: run {} started (attempt {})", worker_id, run_id, job.attempts);

    let mut scope = RunScope::new(&deps.registry);
    let state = build_state(deps, job, &mut scope).await?;

    let finished = match tokio::time::timeout(deps.cfg.run_budget(), run_pipeline_for(deps, state))
        .await
    {
        Ok(state) => state,
        Err(_) => {
            warn!("{}: run {} exceeded its {}s budget", worker_id, run_id, deps.cfg.run_timeout_seconds);
            deps.store.runs.finalize_failure(run_id, ErrorKind::TimeoutError)?;
            metrics::inc_run("failure");
            metrics::observe_run_duration(started.elapsed().as_secs_f64());
            return Ok(());
        }
    };

    if let Some(kind) = finished.error_kind {
        deps.store.runs.finalize_failure(run_id, kind)?;
        metrics::inc_run("failure");
    } else {
        let outcome = RunOutcome {
            sql_used: finished.sql_query.clone(),
            result_data: finished.formatted_response.clone().unwrap_or_default(),
            execution_ms: finished.execution_ms.unwrap_or(0),
            result_rows_count: finished.result_row_count.unwrap_or(0),
        };
        if deps.store.runs.finalize_success(run_id, &outcome)? {
            metrics::inc_run("success");
        }
    }
    metrics::observe_run_duration(started.elapsed().as_secs_f64());
    info!("{}: run {} finished in {:?}", worker_id, run_id, started.elapsed());
    Ok(())
}

async fn run_pipeline_for(deps: &WorkerDeps, state: PipelineState) -> PipelineState {
    let ctx = PipelineContext {
        store: deps.store.clone(),
        registry: deps.registry.clone(),
        cache: deps.cache.clone(),
        llm: deps.llm.clone(),
    };
    run_pipeline(&ctx, state).await
}

/// Rehydrates the pipeline state: agent + connection from the store,
/// engine and bundle through the registry (opened on first use in this
/// process), history service registered for the run's lifetime.
async fn build_state(
    deps: &WorkerDeps,
    job: &Job,
    scope: &mut RunScope<'_>,
) -> CoreResult<PipelineState> {
    let payload = &job.payload;
    let agent = deps
        .store
        .agents
        .get_agent(payload.agent_id)?
        .ok_or(CoreError::NotFound { category: "agent", id: payload.agent_id.to_string() })?;
    let connection = deps
        .store
        .agents
        .get_connection(agent.connection_id)?
        .ok_or(CoreError::NotFound { category: "connection", id: agent.connection_id.to_string() })?;

    // Engines are process-local, keyed by connection id + version so a
    // mutated connection never resolves to a stale handle.
    let engine_ref = format!("conn-{}:v{}", connection.id, connection.version);
    if !deps.registry.contains(category::ENGINE, &engine_ref) {
        let parsed = ConnectionPayload::parse(connection.kind, &connection.payload)?;
        let engine = Engine::open(
            &parsed,
            std::path::Path::new(&deps.cfg.datasets_dir),
            deps.cfg.connect_timeout(),
        )
        .await?;
        deps.registry.put_with_id(category::ENGINE, &engine_ref, Arc::new(engine));
    }

    let bundle_ref = format!("agent-{}:v{}:conn-v{}", agent.id, agent.schema_version, connection.version);
    if !deps.registry.contains(category::AGENT_BUNDLE, &bundle_ref) {
        deps.registry.put_with_id(
            category::AGENT_BUNDLE,
            &bundle_ref,
            Arc::new(AgentBundle { agent: agent.clone(), engine_ref: engine_ref.clone() }),
        );
    }

    let history_ref = scope.put(category::HISTORY_SERVICE, deps.history.clone());

    let mut state = PipelineState::new(payload.question.clone(), payload.user_id, payload.agent_id);
    state.run_id = Some(payload.run_id);
    state.chat_session_id = payload.chat_session_id;
    state.connection_id = Some(connection.id);
    state.connection_kind = Some(connection.kind);
    state.engine_ref = Some(engine_ref);
    state.agent_bundle_ref = Some(bundle_ref);
    state.history_ref = Some(history_ref);
    Ok(state)
}

/// Blocks until the run reaches a terminal state or the wait budget
/// lapses. Test and tooling helper; the API contract is polling.
pub async fn await_terminal(
    store: &MetaStore,
    run_id: i64,
    budget: Duration,
) -> CoreResult<RunStatus> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let run = store
            .runs
            .get(run_id)?
            .ok_or(CoreError::NotFound { category: "run", id: run_id.to_string() })?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::Timeout(budget));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
