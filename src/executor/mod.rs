use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod events;

pub use events::{EventBus, ExecutionEvent};

use crate::browser::{BrowserDriver, BrowserPool, BrowserProfile, BrowserSession};
use crate::config::{AppConfig, BrowserConfig, ExecutorConfig};
use crate::error::{CrawlError, CrawlResult, ErrorClass};
use crate::frontier::{FrontierQueue, FrontierTask};
use crate::recovery::{AttemptRecord, ErrorSignal, RecoveryAction, RecoveryEngine};
use crate::stats::StatsAggregator;
use crate::storage::{
    ErrorLogRow, Execution, ExecutionStatus, NodeExecutionRecord, PhaseStats, Storage,
};
use crate::workflow::registry::{ActionResult, TaskContext};
use crate::workflow::{NodeRegistry, Phase, Workflow};

/// Drives workflows end to end: validates, seeds the frontier, runs each
/// phase with a bounded worker set, and routes task failures through the
/// recovery engine.
///
/// All state is owned by the executor instance; two executors over
/// different storage files share nothing.
pub struct CrawlExecutor {
    executor_config: ExecutorConfig,
    browser_config: BrowserConfig,
    storage: Storage,
    pool: Arc<BrowserPool>,
    registry: Arc<NodeRegistry>,
    frontier: FrontierQueue,
    recovery: Arc<RecoveryEngine>,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    running: Mutex<HashMap<String, watch::Sender<bool>>>,
}

enum TaskOutcome {
    Completed(ActionResult),
    /// A rule decided the failure is acceptable; the task completes with
    /// the error on record.
    CompletedWithError(CrawlError),
    Failed(CrawlError),
    /// The claim goes back to the frontier for a later attempt.
    Released,
    Stopped,
}

/// A task failure plus whatever page body was loaded when it happened;
/// recovery rules can match on the content signature.
struct TaskFailure {
    error: CrawlError,
    content: Option<String>,
}

/// A task that keeps bouncing between workers without a real attempt
/// (capacity trouble, not a bad URL) eventually fails outright.
const MAX_TASK_CLAIMS: u32 = 5;

impl CrawlExecutor {
    pub async fn new(
        config: &AppConfig,
        storage: Storage,
        driver: Arc<dyn BrowserDriver>,
    ) -> CrawlResult<Arc<Self>> {
        let pool = Arc::new(BrowserPool::new(driver, config.browser.max_sessions));
        let frontier = FrontierQueue::new(
            &storage,
            Duration::from_secs(config.frontier.visibility_timeout_seconds),
        );
        let recovery =
            Arc::new(RecoveryEngine::new(storage.recovery(), config.recovery.clone()).await?);
        let stats = StatsAggregator::new(storage.executions(), &config.stats);

        Ok(Arc::new(Self {
            executor_config: config.executor.clone(),
            browser_config: config.browser.clone(),
            storage,
            pool,
            registry: Arc::new(NodeRegistry::with_builtin_handlers()),
            frontier,
            recovery,
            stats,
            events: EventBus::default(),
            running: Mutex::new(HashMap::new()),
        }))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn recovery_engine(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    pub fn browser_pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    /// Run a workflow to completion. Validation failures surface before
    /// any execution row or frontier task exists.
    pub async fn run(self: &Arc<Self>, workflow: &Workflow) -> CrawlResult<Execution> {
        self.registry.validate_workflow(workflow)?;
        if workflow.start_urls.is_empty() {
            return Err(CrawlError::NoStartUrls);
        }

        let execution_id = Uuid::new_v4().to_string();
        self.storage.executions().create(&execution_id, &workflow.id).await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        self.running.lock().await.insert(execution_id.clone(), stop_tx);
        info!("Execution {} started (workflow: {})", execution_id, workflow.id);
        self.events.emit(ExecutionEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            workflow_id: workflow.id.clone(),
        });

        let (flush_tx, flush_rx) = watch::channel(false);
        let flush_handle = self.stats.spawn_flush_loop(flush_rx);

        // Seed URLs go into the first phase's frontier.
        let seeded = self
            .frontier
            .enqueue_batch(&execution_id, &workflow.phases[0].id, &workflow.start_urls, 0)
            .await?;
        self.stats.record_urls_discovered(&execution_id, seeded as i64);

        let mut stopped = false;
        let mut fatal: Option<CrawlError> = None;
        for phase in &workflow.phases {
            if *stop_rx.borrow() {
                stopped = true;
                break;
            }
            self.events.emit(ExecutionEvent::PhaseStarted {
                execution_id: execution_id.clone(),
                phase_id: phase.id.clone(),
            });
            match self.run_phase(&execution_id, phase, stop_rx.clone()).await {
                Ok(processed) => {
                    self.events.emit(ExecutionEvent::PhaseCompleted {
                        execution_id: execution_id.clone(),
                        phase_id: phase.id.clone(),
                        tasks_processed: processed,
                    });
                }
                Err(e) => {
                    error!("Phase {} aborted: {}", phase.id, e);
                    fatal = Some(e);
                    break;
                }
            }
            if *stop_rx.borrow() {
                stopped = true;
                break;
            }
        }

        // Final flush so terminal counters are durable before the status
        // flips.
        let _ = flush_tx.send(true);
        let _ = flush_handle.await;
        self.stats.retire(&execution_id);
        self.running.lock().await.remove(&execution_id);

        let status = if fatal.is_some() {
            ExecutionStatus::Failed
        } else if stopped {
            ExecutionStatus::Stopped
        } else {
            ExecutionStatus::Completed
        };
        self.storage.executions().complete(&execution_id, status).await?;
        info!("Execution {} finished: {}", execution_id, status);
        self.events.emit(ExecutionEvent::ExecutionFinished {
            execution_id: execution_id.clone(),
            status,
        });

        if let Some(e) = fatal {
            return Err(e);
        }
        self.storage.executions().get(&execution_id).await
    }

    /// Request a cooperative stop. Workers stop claiming new tasks;
    /// whatever is in flight keeps its `processing` state and is left for
    /// lease reclaim.
    pub async fn stop(&self, execution_id: &str) -> CrawlResult<()> {
        let running = self.running.lock().await;
        let sender = running.get(execution_id).ok_or_else(|| CrawlError::ExecutionNotFound {
            execution_id: execution_id.to_string(),
        })?;
        info!("Stop requested for execution {}", execution_id);
        let _ = sender.send(true);
        self.events
            .emit(ExecutionEvent::StopRequested { execution_id: execution_id.to_string() });
        Ok(())
    }

    /// Drain one phase's frontier with at most `workers` concurrent tasks.
    /// The phase is done when no pending or in-flight work remains.
    async fn run_phase(
        self: &Arc<Self>,
        execution_id: &str,
        phase: &Phase,
        stop: watch::Receiver<bool>,
    ) -> CrawlResult<u64> {
        let workers = self.executor_config.workers;
        let worker_slots = Arc::new(Semaphore::new(workers));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let phase = Arc::new(phase.clone());
        let mut processed: u64 = 0;

        loop {
            if *stop.borrow() {
                break;
            }
            let batch = match self.executor_config.max_urls_per_phase {
                Some(cap) if processed >= cap as u64 => {
                    debug!("Phase {} reached its URL cap ({})", phase.id, cap);
                    break;
                }
                Some(cap) => {
                    (cap as u64 - processed).min(self.executor_config.dequeue_batch_size as u64)
                }
                None => self.executor_config.dequeue_batch_size as u64,
            };

            let tasks = self.frontier.dequeue(execution_id, &phase.id, batch as u32).await?;
            if tasks.is_empty() {
                let in_flight = worker_slots.available_permits() < workers;
                if !in_flight
                    && self.frontier.pending_count(execution_id, &phase.id).await? == 0
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(self.executor_config.idle_poll_ms))
                    .await;
                continue;
            }

            for task in tasks {
                processed += 1;
                let permit = worker_slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| CrawlError::internal("worker semaphore closed"))?;
                let this = Arc::clone(self);
                let phase = Arc::clone(&phase);
                let execution_id = execution_id.to_string();
                let stop = stop.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    this.process_task(execution_id, phase, task, stop).await;
                });
            }
        }

        while join_set.join_next().await.is_some() {}
        Ok(processed)
    }

    async fn process_task(
        self: Arc<Self>,
        execution_id: String,
        phase: Arc<Phase>,
        task: FrontierTask,
        stop: watch::Receiver<bool>,
    ) {
        let started = Instant::now();
        let outcome = self.run_task_with_recovery(&execution_id, &phase, &task, &stop).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            TaskOutcome::Completed(result) => {
                self.persist_success(&execution_id, &task, result, duration_ms).await;
            }
            TaskOutcome::CompletedWithError(err) => {
                debug!("Task {} completed with accepted error: {}", task.id, err);
                self.record_task_error(&execution_id, &task, &err).await;
                self.stats.record_url_processed(&execution_id);
                self.stats.record_phase(
                    &execution_id,
                    &task.phase_id,
                    PhaseStats { processed: 1, errors: 1, duration_ms },
                );
                if let Err(e) = self.frontier.complete(&task.id).await {
                    error!("Failed to complete task {}: {}", task.id, e);
                }
                self.events.emit(ExecutionEvent::TaskCompleted {
                    execution_id,
                    task_id: task.id,
                    url: task.url,
                    items: 0,
                });
            }
            TaskOutcome::Failed(err) => {
                warn!("Task {} failed: {}", task.id, err);
                self.record_task_error(&execution_id, &task, &err).await;
                self.stats.record_url_processed(&execution_id);
                self.stats.record_phase(
                    &execution_id,
                    &task.phase_id,
                    PhaseStats { processed: 1, errors: 1, duration_ms },
                );
                if let Err(e) = self.frontier.fail(&task.id, &err.to_string()).await {
                    error!("Failed to mark task {} failed: {}", task.id, e);
                }
                self.events.emit(ExecutionEvent::TaskFailed {
                    execution_id,
                    task_id: task.id,
                    url: task.url,
                    error: err.to_string(),
                });
            }
            TaskOutcome::Released => {
                debug!("Releasing task {} back to the frontier", task.id);
                if let Err(e) = self.frontier.release_for_retry(&task.id).await {
                    error!("Failed to release task {}: {}", task.id, e);
                }
            }
            // The task keeps its `processing` state so a later run can
            // reclaim it after the lease expires.
            TaskOutcome::Stopped => {}
        }
    }

    async fn persist_success(
        &self,
        execution_id: &str,
        task: &FrontierTask,
        result: ActionResult,
        duration_ms: i64,
    ) {
        if !self.executor_config.skip_data_storage && !result.items.is_empty() {
            if let Err(e) = self
                .storage
                .items()
                .store_batch(execution_id, &task.id, &task.phase_id, &result.items)
                .await
            {
                error!("Failed to store items for task {}: {}", task.id, e);
            }
        }

        let mut discovered_new = 0i64;
        for link in &result.discovered {
            let depth = task.depth + 1;
            if let Some(max) = self.executor_config.max_depth {
                if depth as usize > max {
                    debug!("Skipping {} beyond depth limit {}", link.url, max);
                    continue;
                }
            }
            match self
                .frontier
                .enqueue_discovered(execution_id, &link.phase_id, &link.url, depth)
                .await
            {
                Ok(true) => discovered_new += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to enqueue {}: {}", link.url, e),
            }
        }
        if discovered_new > 0 {
            self.stats.record_urls_discovered(execution_id, discovered_new);
        }

        self.stats.record_url_processed(execution_id);
        if !result.items.is_empty() {
            self.stats.record_items_extracted(execution_id, result.items.len() as i64);
        }
        self.stats.record_phase(
            execution_id,
            &task.phase_id,
            PhaseStats { processed: 1, errors: 0, duration_ms },
        );
        for warning in &result.warnings {
            warn!("Task {}: {}", task.id, warning);
        }
        if let Err(e) = self.frontier.complete(&task.id).await {
            error!("Failed to complete task {}: {}", task.id, e);
        }
        self.events.emit(ExecutionEvent::TaskCompleted {
            execution_id: execution_id.to_string(),
            task_id: task.id.clone(),
            url: task.url.clone(),
            items: result.items.len(),
        });
    }

    async fn record_task_error(&self, execution_id: &str, task: &FrontierTask, err: &CrawlError) {
        self.stats.record_task_error(execution_id);
        self.stats
            .record_error_log(ErrorLogRow {
                execution_id: execution_id.to_string(),
                task_id: Some(task.id.clone()),
                category: err.category().to_string(),
                message: err.to_string(),
            })
            .await;
    }

    /// Run one task, retrying per the recovery engine's decisions. The
    /// attempt trail becomes the incident record when retries run out.
    async fn run_task_with_recovery(
        &self,
        execution_id: &str,
        phase: &Phase,
        task: &FrontierTask,
        stop: &watch::Receiver<bool>,
    ) -> TaskOutcome {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_rule: Option<String> = None;
        let mut rotate = false;

        loop {
            if *stop.borrow() {
                return TaskOutcome::Stopped;
            }
            let profile = self.pick_profile(rotate);
            let run = self.run_task_once(execution_id, phase, task, &profile, stop).await;

            let TaskFailure { error: err, content } = match run {
                Ok(result) => {
                    if let Some(rule_id) = last_rule {
                        if let Err(e) = self.recovery.record_outcome(&rule_id, true).await {
                            warn!("Failed to record rule outcome: {}", e);
                        }
                    }
                    return TaskOutcome::Completed(result);
                }
                Err(failure) => failure,
            };

            match err.class() {
                ErrorClass::Recoverable => {
                    let signal = ErrorSignal::from_error(&err, &task.url).with_content(content);
                    let decision = self
                        .recovery
                        .classify(&signal)
                        .unwrap_or_else(|| self.recovery.default_decision());
                    attempts.push(AttemptRecord {
                        rule_id: decision.rule_id.clone(),
                        action: decision.action,
                        error: err.to_string(),
                        at_ms: Utc::now().timestamp_millis(),
                    });

                    match decision.action {
                        RecoveryAction::MarkOptionalFailure => {
                            return TaskOutcome::CompletedWithError(err);
                        }
                        RecoveryAction::Escalate => {
                            self.finish_exhausted(execution_id, task, &signal, &decision.rule_id, attempts)
                                .await;
                            return TaskOutcome::Failed(err);
                        }
                        action => {
                            if attempts.len() as u32 >= decision.max_retries {
                                self.finish_exhausted(
                                    execution_id,
                                    task,
                                    &signal,
                                    &decision.rule_id,
                                    attempts,
                                )
                                .await;
                                return TaskOutcome::Failed(err);
                            }
                            rotate = matches!(
                                action,
                                RecoveryAction::RotateProxy | RecoveryAction::SolveCaptcha
                            );
                            last_rule =
                                (!decision.rule_id.is_empty()).then(|| decision.rule_id.clone());
                            debug!(
                                "Retrying task {} ({}/{}) after {}ms",
                                task.id,
                                attempts.len(),
                                decision.max_retries,
                                decision.retry_delay_ms
                            );
                            tokio::time::sleep(Duration::from_millis(decision.retry_delay_ms))
                                .await;
                        }
                    }
                }
                ErrorClass::ResourceExhaustion => {
                    attempts.push(AttemptRecord {
                        rule_id: String::new(),
                        action: RecoveryAction::RetryAfter,
                        error: err.to_string(),
                        at_ms: Utc::now().timestamp_millis(),
                    });
                    if attempts.len() as u32 >= self.recovery.default_decision().max_retries {
                        // Capacity trouble is the pool's problem, not the
                        // URL's: hand the claim back for a later attempt
                        // unless this task keeps looping through workers.
                        if task.attempts < MAX_TASK_CLAIMS {
                            return TaskOutcome::Released;
                        }
                        return TaskOutcome::Failed(err);
                    }
                    let backoff = err.backoff().unwrap_or_else(|| Duration::from_millis(500));
                    tokio::time::sleep(backoff).await;
                }
                _ => {
                    if matches!(err, CrawlError::Stopped) {
                        return TaskOutcome::Stopped;
                    }
                    return TaskOutcome::Failed(err);
                }
            }
        }
    }

    async fn finish_exhausted(
        &self,
        execution_id: &str,
        task: &FrontierTask,
        signal: &ErrorSignal,
        rule_id: &str,
        attempts: Vec<AttemptRecord>,
    ) {
        if let Err(e) = self.recovery.record_outcome(rule_id, false).await {
            warn!("Failed to record rule outcome: {}", e);
        }
        match self.recovery.open_incident(execution_id, &task.id, signal, attempts).await {
            Ok(incident) => {
                self.events.emit(ExecutionEvent::IncidentOpened {
                    execution_id: execution_id.to_string(),
                    incident_id: incident.id,
                });
            }
            Err(e) => error!("Failed to open incident for task {}: {}", task.id, e),
        }
    }

    async fn run_task_once(
        &self,
        execution_id: &str,
        phase: &Phase,
        task: &FrontierTask,
        profile: &BrowserProfile,
        stop: &watch::Receiver<bool>,
    ) -> Result<ActionResult, TaskFailure> {
        let session = match self
            .pool
            .acquire(profile, Duration::from_secs(self.browser_config.launch_timeout_seconds))
            .await
        {
            Ok(session) => session,
            Err(error) => return Err(TaskFailure { error, content: None }),
        };
        let result = self.run_nodes(execution_id, phase, task, &session, stop).await;
        self.pool.release(session).await;
        result
    }

    /// Run the phase's nodes in order against one fresh page. A failing
    /// optional node degrades to a warning; a failing required node aborts
    /// the task.
    async fn run_nodes(
        &self,
        execution_id: &str,
        phase: &Phase,
        task: &FrontierTask,
        session: &BrowserSession,
        stop: &watch::Receiver<bool>,
    ) -> Result<ActionResult, TaskFailure> {
        let mut page = match session.new_page().await {
            Ok(page) => page,
            Err(error) => return Err(TaskFailure { error, content: None }),
        };
        let mut disconnect = session.disconnect_signal();
        let context = TaskContext {
            execution_id: execution_id.to_string(),
            phase_id: task.phase_id.clone(),
            url: task.url.clone(),
            depth: task.depth,
        };
        let deadline = Duration::from_secs(self.executor_config.node_timeout_seconds);
        let mut merged = ActionResult::default();

        for node in &phase.nodes {
            if *stop.borrow() {
                return Err(TaskFailure { error: CrawlError::Stopped, content: None });
            }
            if session.is_disconnected() {
                return Err(TaskFailure { error: CrawlError::SessionDisconnected, content: None });
            }
            let handler = match self.registry.resolve(node.params.kind()) {
                Ok(handler) => handler,
                Err(error) => return Err(TaskFailure { error, content: None }),
            };
            let node_started = Instant::now();

            let run = tokio::select! {
                run = tokio::time::timeout(deadline, handler.run(page.as_mut(), node, &context)) => {
                    match run {
                        Ok(inner) => inner,
                        Err(_) => Err(CrawlError::NodeDeadline { node_id: node.id.clone() }),
                    }
                }
                _ = disconnect.changed() => Err(CrawlError::SessionDisconnected),
            };
            let duration_ms = node_started.elapsed().as_millis() as i64;

            match run {
                Ok(result) => {
                    self.audit_node(execution_id, task, &node.id, "succeeded", None, duration_ms)
                        .await;
                    merged.merge(result);
                }
                Err(err) if !node.required && err.is_recoverable() => {
                    debug!("Optional node {} failed: {}", node.id, err);
                    self.audit_node(
                        execution_id,
                        task,
                        &node.id,
                        "warning",
                        Some(err.to_string()),
                        duration_ms,
                    )
                    .await;
                    merged.warnings.push(format!("node {}: {}", node.id, err));
                }
                Err(err) => {
                    self.audit_node(
                        execution_id,
                        task,
                        &node.id,
                        "failed",
                        Some(err.to_string()),
                        duration_ms,
                    )
                    .await;
                    // Whatever body is loaded goes along for content-based
                    // rule matching.
                    let content = page.content().await.ok();
                    return Err(TaskFailure { error: err, content });
                }
            }
        }
        Ok(merged)
    }

    async fn audit_node(
        &self,
        execution_id: &str,
        task: &FrontierTask,
        node_id: &str,
        status: &str,
        node_error: Option<String>,
        duration_ms: i64,
    ) {
        let record = NodeExecutionRecord {
            execution_id: execution_id.to_string(),
            task_id: task.id.clone(),
            node_id: node_id.to_string(),
            status: status.to_string(),
            error: node_error,
            duration_ms,
        };
        if let Err(e) = self.storage.node_runs().record(&record).await {
            warn!("Failed to record node execution: {}", e);
        }
    }

    /// Rotated profiles are single-use with fresh fingerprint noise, so a
    /// retry after a challenge never reuses the flagged session identity.
    fn pick_profile(&self, rotate: bool) -> BrowserProfile {
        let mut profile = BrowserProfile::default();
        if let Some(ua) = self.browser_config.user_agents.choose(&mut rand::thread_rng()) {
            profile = profile.with_user_agent(ua.clone());
        }
        if rotate {
            profile = profile.single_use().with_fingerprint_noise();
        }
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserContext, Page, PageResponse};
    use crate::frontier::TaskState;
    use crate::recovery::{IncidentStatus, RecoveryRule};
    use crate::storage::test_support::scratch_storage;
    use async_trait::async_trait;

    /// Driver serving canned HTML per URL; unknown URLs return 404.
    struct MapDriver {
        pages: HashMap<String, String>,
        goto_delay: Duration,
    }

    impl MapDriver {
        fn new(pages: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                pages: pages
                    .iter()
                    .map(|(url, html)| (url.to_string(), html.to_string()))
                    .collect(),
                goto_delay: Duration::ZERO,
            })
        }
    }

    struct MapContext {
        pages: Arc<HashMap<String, String>>,
        goto_delay: Duration,
        disconnected: watch::Receiver<bool>,
        _keepalive: watch::Sender<bool>,
    }

    struct MapPage {
        pages: Arc<HashMap<String, String>>,
        goto_delay: Duration,
        current_url: Option<String>,
        body: Option<String>,
    }

    #[async_trait]
    impl BrowserDriver for MapDriver {
        async fn new_context(
            &self,
            _profile: &BrowserProfile,
        ) -> CrawlResult<Box<dyn BrowserContext>> {
            let (tx, rx) = watch::channel(false);
            Ok(Box::new(MapContext {
                pages: Arc::new(self.pages.clone()),
                goto_delay: self.goto_delay,
                disconnected: rx,
                _keepalive: tx,
            }))
        }
        fn name(&self) -> &'static str {
            "map"
        }
    }

    #[async_trait]
    impl BrowserContext for MapContext {
        async fn new_page(&self) -> CrawlResult<Box<dyn Page>> {
            Ok(Box::new(MapPage {
                pages: self.pages.clone(),
                goto_delay: self.goto_delay,
                current_url: None,
                body: None,
            }))
        }
        async fn close(&mut self) -> CrawlResult<()> {
            Ok(())
        }
        fn disconnected(&self) -> watch::Receiver<bool> {
            self.disconnected.clone()
        }
    }

    #[async_trait]
    impl Page for MapPage {
        async fn goto(&mut self, url: &str) -> CrawlResult<PageResponse> {
            if !self.goto_delay.is_zero() {
                tokio::time::sleep(self.goto_delay).await;
            }
            match self.pages.get(url) {
                Some(body) => {
                    self.current_url = Some(url.to_string());
                    self.body = Some(body.clone());
                    Ok(PageResponse { status: Some(200), final_url: url.to_string() })
                }
                None => Err(CrawlError::HttpStatus { url: url.to_string(), status: 404 }),
            }
        }
        async fn content(&self) -> CrawlResult<String> {
            self.body.clone().ok_or_else(|| CrawlError::internal("no page loaded"))
        }
        async fn click(&mut self, _selector: &str) -> CrawlResult<()> {
            Err(CrawlError::DriverUnsupported { operation: "click".to_string() })
        }
        fn current_url(&self) -> Option<String> {
            self.current_url.clone()
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.executor.workers = 2;
        config.executor.idle_poll_ms = 10;
        config.browser.max_sessions = 2;
        config.stats.flush_interval_ms = 20;
        config.recovery.default_max_retries = 1;
        config.recovery.default_retry_delay_ms = 10;
        config
    }

    async fn executor_with(
        config: AppConfig,
        driver: Arc<dyn BrowserDriver>,
    ) -> (Arc<CrawlExecutor>, Storage, tempfile::TempDir) {
        let (storage, dir) = scratch_storage().await;
        let executor = CrawlExecutor::new(&config, storage.clone(), driver).await.unwrap();
        (executor, storage, dir)
    }

    fn price_workflow(start_url: &str) -> Workflow {
        Workflow::from_yaml(&format!(
            r#"
id: wf-price
name: Price crawl
start_urls:
  - {start_url}
phases:
  - id: listing
    name: Listing
    nodes:
      - id: open
        type: navigate
      - id: price
        type: extract
        fields:
          - name: price
            selector: ".price"
            required: true
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn simple_crawl_extracts_one_item() {
        let driver = MapDriver::new(&[(
            "https://shop.example.com/products",
            r#"<html><body><span class="price">$9.99</span></body></html>"#,
        )]);
        let (executor, storage, _dir) = executor_with(fast_config(), driver).await;

        let execution =
            executor.run(&price_workflow("https://shop.example.com/products")).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.urls_processed, 1);
        assert_eq!(execution.items_extracted, 1);
        assert_eq!(execution.errors, 0);

        let items = storage.items().for_execution(&execution.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["price"], "$9.99");

        let frontier = FrontierQueue::new(&storage, Duration::from_secs(60));
        let stats = frontier.stats(&execution.id).await.unwrap();
        assert_eq!(stats[&("listing".to_string(), TaskState::Completed)], 1);
    }

    #[tokio::test]
    async fn discovery_routes_links_into_next_phase() {
        let driver = MapDriver::new(&[
            (
                "https://shop.example.com/products",
                r#"<html><body><a class="product-link" href="/item/42">x</a></body></html>"#,
            ),
            (
                "https://shop.example.com/item/42",
                r#"<html><body><span class="price">$19.50</span></body></html>"#,
            ),
        ]);
        let (executor, storage, _dir) = executor_with(fast_config(), driver).await;

        let workflow = Workflow::from_yaml(
            r#"
id: wf-two-phase
name: Listing then detail
start_urls:
  - https://shop.example.com/products
phases:
  - id: listing
    name: Listing
    nodes:
      - id: open
        type: navigate
      - id: links
        type: extract
        fields: []
        discover:
          selector: "a.product-link"
          target_phase: detail
  - id: detail
    name: Detail
    nodes:
      - id: open-detail
        type: navigate
      - id: price
        type: extract
        fields:
          - name: price
            selector: ".price"
            required: true
"#,
        )
        .unwrap();

        let execution = executor.run(&workflow).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.urls_processed, 2);
        assert_eq!(execution.urls_discovered, 2);
        assert_eq!(execution.items_extracted, 1);

        let items = storage.items().for_execution(&execution.id).await.unwrap();
        assert_eq!(items[0]["price"], "$19.50");
        // Phases ran in order with their own counters.
        assert_eq!(execution.phase_stats["listing"].processed, 1);
        assert_eq!(execution.phase_stats["detail"].processed, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_open_an_incident() {
        let driver = MapDriver::new(&[(
            "https://shop.example.com/products",
            r#"<html><body><span class="cost">$9.99</span></body></html>"#,
        )]);
        let (executor, storage, _dir) = executor_with(fast_config(), driver).await;

        let mut rule = RecoveryRule::new("no_elements_found", RecoveryAction::RetryAfter, 5);
        rule.max_retries = 2;
        rule.retry_delay_ms = 10;
        executor.recovery_engine().add_rule(rule).await.unwrap();

        let execution =
            executor.run(&price_workflow("https://shop.example.com/products")).await.unwrap();

        // Task failure does not fail the execution.
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.errors, 1);
        assert_eq!(execution.items_extracted, 0);

        let incidents =
            storage.recovery().list_incidents(Some(IncidentStatus::Open)).await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].total_attempts, 2);
        assert!(incidents[0].error_pattern.contains("no_elements_found"));

        let frontier = FrontierQueue::new(&storage, Duration::from_secs(60));
        let stats = frontier.stats(&execution.id).await.unwrap();
        assert_eq!(stats[&("listing".to_string(), TaskState::Failed)], 1);
    }

    #[tokio::test]
    async fn optional_node_failure_degrades_to_warning() {
        let driver = MapDriver::new(&[(
            "https://shop.example.com/products",
            r#"<html><body><span class="price">$9.99</span></body></html>"#,
        )]);
        let (executor, storage, _dir) = executor_with(fast_config(), driver).await;

        let workflow = Workflow::from_yaml(
            r#"
id: wf-optional
name: Optional click
start_urls:
  - https://shop.example.com/products
phases:
  - id: listing
    name: Listing
    nodes:
      - id: open
        type: navigate
      - id: dismiss-banner
        type: click
        selector: ".cookie-accept"
        required: false
      - id: price
        type: extract
        fields:
          - name: price
            selector: ".price"
            required: true
"#,
        )
        .unwrap();

        let execution = executor.run(&workflow).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.items_extracted, 1);
        assert_eq!(execution.errors, 0);

        // The optional node left a warning audit row behind.
        let frontier = FrontierQueue::new(&storage, Duration::from_secs(60));
        let stats = frontier.stats(&execution.id).await.unwrap();
        assert_eq!(stats[&("listing".to_string(), TaskState::Completed)], 1);
    }

    #[tokio::test]
    async fn single_session_pool_still_drains_multiple_urls() {
        let pages: Vec<(String, String)> = (0..3)
            .map(|i| {
                (
                    format!("https://shop.example.com/p{}", i),
                    r#"<html><body><span class="price">$1</span></body></html>"#.to_string(),
                )
            })
            .collect();
        let page_refs: Vec<(&str, &str)> =
            pages.iter().map(|(u, h)| (u.as_str(), h.as_str())).collect();
        let driver = MapDriver::new(&page_refs);

        let mut config = fast_config();
        config.browser.max_sessions = 1;
        config.executor.workers = 2;
        let (executor, _storage, _dir) = executor_with(config, driver).await;

        let mut workflow = price_workflow("https://shop.example.com/p0");
        workflow.start_urls = pages.iter().map(|(u, _)| u.clone()).collect();

        let execution = executor.run(&workflow).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.urls_processed, 3);
        assert_eq!(execution.items_extracted, 3);
    }

    #[tokio::test]
    async fn depth_limit_stops_pagination() {
        let page = |next: &str| {
            format!(
                r#"<html><body><span class="price">$1</span><a class="next" href="{}">next</a></body></html>"#,
                next
            )
        };
        let last = r#"<html><body><span class="price">$1</span></body></html>"#.to_string();
        let pages = [
            ("https://shop.example.com/products?page=1".to_string(), page("?page=2")),
            ("https://shop.example.com/products?page=2".to_string(), page("?page=3")),
            ("https://shop.example.com/products?page=3".to_string(), last),
        ];
        let page_refs: Vec<(&str, &str)> =
            pages.iter().map(|(u, h)| (u.as_str(), h.as_str())).collect();
        let driver = MapDriver::new(&page_refs);

        let mut config = fast_config();
        config.executor.max_depth = Some(1);
        let (executor, _storage, _dir) = executor_with(config, driver).await;

        let workflow = Workflow::from_yaml(
            r#"
id: wf-paginate
name: Paginated listing
start_urls:
  - https://shop.example.com/products?page=1
phases:
  - id: listing
    name: Listing
    nodes:
      - id: open
        type: navigate
      - id: price
        type: extract
        fields:
          - name: price
            selector: ".price"
            required: true
      - id: next
        type: paginate
        next_selector: "a.next"
"#,
        )
        .unwrap();

        let execution = executor.run(&workflow).await.unwrap();
        // Page 1 (depth 0) and page 2 (depth 1); page 3 would be depth 2.
        assert_eq!(execution.urls_processed, 2);
    }

    #[tokio::test]
    async fn skip_data_storage_keeps_counters_but_stores_nothing() {
        let driver = MapDriver::new(&[(
            "https://shop.example.com/products",
            r#"<html><body><span class="price">$9.99</span></body></html>"#,
        )]);
        let mut config = fast_config();
        config.executor.skip_data_storage = true;
        let (executor, storage, _dir) = executor_with(config, driver).await;

        let execution =
            executor.run(&price_workflow("https://shop.example.com/products")).await.unwrap();
        assert_eq!(execution.items_extracted, 1);
        assert_eq!(storage.items().count(&execution.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn url_cap_limits_tasks_per_phase() {
        let page = r#"<html><body><span class="price">$1</span></body></html>"#;
        let pages: Vec<(String, String)> = (0..5)
            .map(|i| (format!("https://shop.example.com/p{}", i), page.to_string()))
            .collect();
        let page_refs: Vec<(&str, &str)> =
            pages.iter().map(|(u, h)| (u.as_str(), h.as_str())).collect();
        let driver = MapDriver::new(&page_refs);

        let mut config = fast_config();
        config.executor.max_urls_per_phase = Some(2);
        let (executor, _storage, _dir) = executor_with(config, driver).await;

        let mut workflow = price_workflow("https://shop.example.com/p0");
        workflow.start_urls = pages.iter().map(|(u, _)| u.clone()).collect();

        let execution = executor.run(&workflow).await.unwrap();
        assert_eq!(execution.urls_processed, 2);
    }

    #[tokio::test]
    async fn stop_ends_the_run_cooperatively() {
        let driver = Arc::new(MapDriver {
            pages: [(
                "https://shop.example.com/products".to_string(),
                r#"<html><body><span class="price">$1</span></body></html>"#.to_string(),
            )]
            .into_iter()
            .collect(),
            goto_delay: Duration::from_millis(200),
        });
        let (executor, _storage, _dir) = executor_with(fast_config(), driver).await;

        let mut events = executor.events().subscribe();
        let runner = {
            let executor = Arc::clone(&executor);
            let workflow = price_workflow("https://shop.example.com/products");
            tokio::spawn(async move { executor.run(&workflow).await })
        };

        let execution_id = loop {
            match events.recv().await.unwrap() {
                ExecutionEvent::ExecutionStarted { execution_id, .. } => break execution_id,
                _ => continue,
            }
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.stop(&execution_id).await.unwrap();

        let execution = runner.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Stopped);
    }

    #[tokio::test]
    async fn content_rule_accepts_challenge_page_failures() {
        let driver = MapDriver::new(&[(
            "https://shop.example.com/products",
            r#"<html><body><div class="g-recaptcha"></div></body></html>"#,
        )]);
        let (executor, storage, _dir) = executor_with(fast_config(), driver).await;

        // The extraction error alone would fail the task; the challenge
        // signature in the page body routes it to mark-optional-failure.
        let mut rule =
            RecoveryRule::new("no_elements_found", RecoveryAction::MarkOptionalFailure, 5);
        rule.conditions.content_contains = Some("g-recaptcha".to_string());
        executor.recovery_engine().add_rule(rule).await.unwrap();

        let execution =
            executor.run(&price_workflow("https://shop.example.com/products")).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.errors, 1);

        let frontier = FrontierQueue::new(&storage, Duration::from_secs(60));
        let stats = frontier.stats(&execution.id).await.unwrap();
        assert_eq!(stats[&("listing".to_string(), TaskState::Completed)], 1);
    }

    /// Driver whose contexts never come up, as when no browser binary is
    /// installed on the host.
    struct DeadDriver;

    #[async_trait]
    impl BrowserDriver for DeadDriver {
        async fn new_context(
            &self,
            _profile: &BrowserProfile,
        ) -> CrawlResult<Box<dyn BrowserContext>> {
            Err(CrawlError::BrowserLaunch { message: "no browser installed".to_string() })
        }
        fn name(&self) -> &'static str {
            "dead"
        }
    }

    #[tokio::test]
    async fn capacity_failures_release_the_claim_before_giving_up() {
        let (executor, storage, _dir) = executor_with(fast_config(), Arc::new(DeadDriver)).await;

        let execution =
            executor.run(&price_workflow("https://shop.example.com/products")).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.errors, 1);

        // The claim was handed back and re-taken until the claim cap, then
        // the task failed with the launch error on record.
        let (attempts, reason): (i64, String) =
            sqlx::query_as("SELECT attempts, fail_reason FROM frontier_tasks")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(attempts as u32, MAX_TASK_CLAIMS);
        assert!(reason.contains("launch"));

        let frontier = FrontierQueue::new(&storage, Duration::from_secs(60));
        let stats = frontier.stats(&execution.id).await.unwrap();
        assert_eq!(stats[&("listing".to_string(), TaskState::Failed)], 1);
    }

    #[tokio::test]
    async fn stop_on_unknown_execution_errors() {
        let driver = MapDriver::new(&[]);
        let (executor, _storage, _dir) = executor_with(fast_config(), driver).await;
        let result = executor.stop("nope").await;
        assert!(matches!(result, Err(CrawlError::ExecutionNotFound { .. })));
    }

    #[tokio::test]
    async fn empty_start_urls_fail_before_any_state_exists() {
        let driver = MapDriver::new(&[]);
        let (executor, storage, _dir) = executor_with(fast_config(), driver).await;

        let mut workflow = price_workflow("https://shop.example.com/products");
        workflow.start_urls.clear();
        let result = executor.run(&workflow).await;
        assert!(matches!(result, Err(CrawlError::NoStartUrls)));

        // Validation rejection leaves no execution row behind.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executions")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
