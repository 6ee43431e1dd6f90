use crate::error::{DispatchError, Result};
use crate::manager::TaskManager;
use dmesh_crypto::verify_truthful_node;
use dmesh_select::{NodeMetric, ScoreTracker};
use dmesh_transport::{with_retry, PubSubTransport, RESULT_TOPIC};
use dmesh_types::{
    now_ns, DispatchParams, ResultEnvelope, Task, TaskId, TaskResult, TaskState, WorkerOutput,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Drives the push -> poll -> verify -> retry loop.
///
/// Task lifecycle: `Created -> Published -> { ResultAccepted |
/// ResultRejected | Retrying | Expired }`; `Retrying` re-enters `Published`
/// under a fresh id with a RetryLink from the old one.
pub struct Executor {
    manager: TaskManager,
    params: DispatchParams,
    transport: Arc<dyn PubSubTransport>,
    scores: ScoreTracker,
    /// Accepted results not yet claimed by a `fetch` caller.
    inbox: Arc<RwLock<HashMap<TaskId, TaskResult>>>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        manager: TaskManager,
        transport: Arc<dyn PubSubTransport>,
        scores: ScoreTracker,
        cancel: CancellationToken,
    ) -> Self {
        let params = manager.params().clone();
        Self {
            manager,
            params,
            transport,
            scores,
            inbox: Arc::new(RwLock::new(HashMap::new())),
            cancel,
        }
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Signal shutdown; every polling and backoff suspension point observes
    /// this and returns early.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Plan, prepare and publish a batch. Capacity scarcity is transient by
    /// contract, so planning is retried with a sleep until the network has
    /// room or shutdown is signalled (returning the tasks published so far,
    /// i.e. none).
    pub async fn push(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let plan = loop {
            match self.manager.plan_batch(&tasks).await {
                Ok(plan) => break plan,
                Err(DispatchError::NoCapacity(msg)) => {
                    warn!(reason = %msg, "No capacity, waiting before replanning");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(Vec::new()),
                        _ = tokio::time::sleep(Duration::from_millis(
                            self.params.fetch_interval_ms,
                        )) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let mut published = Vec::with_capacity(tasks.len());
        for (idx, mut task) in tasks.into_iter().enumerate() {
            self.manager.prepare_task(&mut task);
            self.manager
                .publish_task(
                    &mut task,
                    plan.nodes[idx],
                    plan.filters[idx].clone(),
                    &plan.models[idx],
                    None,
                )
                .await?;
            debug!(task_id = %task.id, state = ?TaskState::Published, "Task state");
            published.push(task);
        }
        Ok(published)
    }

    /// Drain the result topic once, matching messages to locally-stored
    /// tasks. Returns the accepted results and the metrics gathered from
    /// this round; accepted results are also parked in the inbox for
    /// `fetch` callers.
    pub async fn poll(&self) -> Result<(Vec<TaskResult>, Vec<NodeMetric>)> {
        let retries = self.params.transport_retries;
        let delay = Duration::from_millis(self.params.transport_retry_delay_ms);
        let messages = with_retry(retries, delay, || {
            let transport = Arc::clone(&self.transport);
            async move { transport.get_messages(RESULT_TOPIC).await }
        })
        .await?;

        let mut accepted = Vec::new();
        let mut metrics = Vec::new();

        for payload in messages {
            let envelope = match ResultEnvelope::from_payload(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(error = %e, "Undecodable result message dropped");
                    continue;
                }
            };
            let task_id = match TaskId::from_hex(&envelope.task_id) {
                Ok(id) => id,
                Err(_) => {
                    debug!(task_id = %envelope.task_id, "Malformed task id dropped");
                    continue;
                }
            };
            let Some(mut task) = self.manager.load_task(&task_id).await? else {
                trace!(task_id = %task_id, "Result for unknown task dropped");
                continue;
            };
            if task.processed {
                debug!(task_id = %task_id, "Duplicate result dropped");
                continue;
            }
            let Ok(body) = hex::decode(&envelope.body) else {
                debug!(task_id = %task_id, "Non-hex result body dropped");
                continue;
            };

            if envelope.error {
                self.handle_worker_error(&mut task, &body, &mut metrics)
                    .await?;
            } else {
                self.handle_result(&mut task, &body, &envelope, &mut accepted, &mut metrics)
                    .await?;
            }
        }

        Ok((accepted, metrics))
    }

    /// Worker-reported failure: authenticate the error envelope, penalize
    /// the sender, and republish the workflow under a fresh id while the
    /// retry ceiling allows.
    async fn handle_worker_error(
        &self,
        task: &mut Task,
        body: &[u8],
        metrics: &mut Vec<NodeMetric>,
    ) -> Result<()> {
        let (plaintext, address) = match verify_truthful_node(task, body) {
            Ok(verified) => verified,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Unauthenticated error envelope dropped");
                return Ok(());
            }
        };

        task.processed = true;
        self.manager.save_task(task).await?;
        metrics.push(NodeMetric::failure(address));
        info!(
            task_id = %task.id,
            node = %address,
            error = %String::from_utf8_lossy(&plaintext),
            "Worker reported an error"
        );

        if task.retries >= self.params.task_retry_ceiling {
            warn!(task_id = %task.id, retries = task.retries, "Retry ceiling reached, giving up");
            return Ok(());
        }

        match self.manager.republish(task).await {
            Ok(new_task) => {
                debug!(
                    task_id = %task.id,
                    new_task = %new_task.id,
                    state = ?TaskState::Retrying,
                    "Task state"
                );
            }
            Err(DispatchError::NoCapacity(msg)) => {
                warn!(task_id = %task.id, reason = %msg, "No capacity for retry, task abandoned");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Successful result path: deadline gate first (no crypto spent on
    /// expired tasks), then the truthful-node check, then acceptance.
    async fn handle_result(
        &self,
        task: &mut Task,
        body: &[u8],
        envelope: &ResultEnvelope,
        accepted: &mut Vec<TaskResult>,
        metrics: &mut Vec<NodeMetric>,
    ) -> Result<()> {
        if task.is_expired(now_ns(), self.params.return_deadline_ns) {
            debug!(task_id = %task.id, state = ?TaskState::Expired, "Task state");
            return Ok(());
        }

        let (plaintext, address) = match verify_truthful_node(task, body) {
            Ok(verified) => verified,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Result failed authenticity check");
                debug!(task_id = %task.id, state = ?TaskState::ResultRejected, "Task state");
                return Ok(());
            }
        };

        let output: WorkerOutput = match serde_json::from_slice(&plaintext) {
            Ok(output) => output,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Malformed result payload dropped");
                return Ok(());
            }
        };

        metrics.push(NodeMetric::success(address, output.execution_time_ms));
        task.processed = true;
        self.manager.save_task(task).await?;

        let result = TaskResult {
            id: task.id,
            task_input: output.task_input,
            result: output.result,
            model: envelope.model.clone(),
            step_name: task.step_name.clone(),
        };
        debug!(task_id = %task.id, state = ?TaskState::ResultAccepted, "Task state");

        let mut inbox = self.inbox.write().await;
        inbox.insert(task.id, result.clone());
        accepted.push(result);
        Ok(())
    }

    /// Poll repeatedly for the given task ids with exponential backoff
    /// (doubling on empty rounds, capped), up to the fetch retry ceiling.
    /// Retry chains are resolved each round, so a result delivered under a
    /// republished id satisfies the original request. Returns whatever
    /// arrived; callers needing full coverage check for missing ids.
    pub async fn fetch(&self, task_ids: &[TaskId]) -> Result<Vec<TaskResult>> {
        let mut pending: HashSet<TaskId> = task_ids.iter().copied().collect();
        let mut results = Vec::with_capacity(pending.len());
        let mut interval_ms = self.params.fetch_interval_ms;

        for _round in 0..self.params.fetch_retry_ceiling {
            if self.cancel.is_cancelled() {
                break;
            }

            let (_, metrics) = self.poll().await?;
            self.scores.evaluate_nodes(&metrics).await;

            let claimed = self.claim_pending(&mut pending, &mut results).await?;
            if pending.is_empty() {
                break;
            }

            if claimed == 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                }
                interval_ms = (interval_ms * 2).min(self.params.fetch_interval_cap_ms);
            }
        }

        Ok(results)
    }

    /// Publish a batch and fetch its results in one call.
    pub async fn execute(&self, tasks: Vec<Task>) -> Result<Vec<TaskResult>> {
        let published = self.push(tasks).await?;
        let ids: Vec<TaskId> = published.iter().map(|t| t.id).collect();
        self.fetch(&ids).await
    }

    /// Background polling loop for callers that consume the inbox directly.
    /// Runs until shutdown.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Executor polling loop stopped");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(self.params.fetch_interval_ms)) => {
                    match self.poll().await {
                        Ok((_, metrics)) => self.scores.evaluate_nodes(&metrics).await,
                        Err(e) => warn!(error = %e, "Background poll failed"),
                    }
                }
            }
        }
    }

    async fn claim_pending(
        &self,
        pending: &mut HashSet<TaskId>,
        results: &mut Vec<TaskResult>,
    ) -> Result<usize> {
        let mut claimed = 0;
        let mut satisfied = Vec::new();

        for original in pending.iter() {
            let live = self.manager.resolve_retry_chain(original).await?;
            let mut inbox = self.inbox.write().await;
            if let Some(result) = inbox.remove(&live) {
                results.push(result);
                satisfied.push(*original);
                claimed += 1;
            }
        }

        for id in satisfied {
            pending.remove(&id);
        }
        Ok(claimed)
    }
}
