use crate::error::{DispatchError, Result};
use dmesh_crypto::{keccak256, TaskKeypair};
use dmesh_filter::AddressFilter;
use dmesh_select::{NodeSelector, ScoreTracker};
use dmesh_storage::{KvStore, NodeRegistry};
use dmesh_transport::{with_retry, PubSubTransport, TASK_TOPIC};
use dmesh_types::{
    now_ns, Address, DispatchParams, FilterProof, RetryLink, Task, TaskEnvelope, TaskId,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const TASK_KEY_PREFIX: &str = "task:";

pub fn task_key(id: &TaskId) -> String {
    format!("{}{}", TASK_KEY_PREFIX, id.to_hex())
}

/// Final 1:1 task → node assignment for one batch, with the per-node filter
/// and the concrete model picked per dispatch.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub nodes: Vec<Address>,
    pub filters: Vec<FilterProof>,
    pub models: Vec<String>,
}

/// Prepares and publishes tasks: capacity planning, node assignment, filter
/// construction, per-task key generation and envelope publication.
pub struct TaskManager {
    params: DispatchParams,
    store: Arc<dyn KvStore>,
    registry: NodeRegistry,
    transport: Arc<dyn PubSubTransport>,
    scores: ScoreTracker,
    selector: NodeSelector,
}

impl TaskManager {
    pub fn new(
        params: DispatchParams,
        store: Arc<dyn KvStore>,
        registry: NodeRegistry,
        transport: Arc<dyn PubSubTransport>,
        scores: ScoreTracker,
    ) -> Self {
        let selector = NodeSelector::new(params.compute_node_batch_size);
        Self {
            params,
            store,
            registry,
            transport,
            scores,
            selector,
        }
    }

    pub fn params(&self) -> &DispatchParams {
        &self.params
    }

    /// Plan a batch: resolve available nodes for the requested models, check
    /// aggregate capacity, and produce the task → node assignment.
    ///
    /// Selection runs twice: an initial distribution ranks nodes by
    /// `score x frequency`, then the final assignment is resampled only
    /// among the top `task_count` of that ranking. A single high-score node
    /// therefore biases the batch without absorbing all of it.
    pub async fn plan_batch(&self, tasks: &[Task]) -> Result<BatchPlan> {
        let requested: BTreeSet<String> = tasks
            .iter()
            .flat_map(|t| t.models.iter().cloned())
            .collect();

        let mut node_models: HashMap<Address, Vec<String>> = HashMap::new();
        for model in &requested {
            for node in self.registry.get_available_nodes(model).await? {
                node_models.entry(node).or_default().push(model.clone());
            }
        }

        if node_models.is_empty() {
            return Err(DispatchError::NoCapacity(format!(
                "no nodes available for models {:?}",
                requested
            )));
        }
        if node_models.len() * self.params.compute_node_batch_size < tasks.len() {
            return Err(DispatchError::NoCapacity(format!(
                "{} nodes cannot absorb {} tasks",
                node_models.len(),
                tasks.len()
            )));
        }

        let snapshot = self.scores.snapshot().await;
        let table: HashMap<Address, f64> = node_models
            .keys()
            .map(|addr| {
                (
                    *addr,
                    snapshot
                        .get(addr)
                        .copied()
                        .unwrap_or(self.params.default_score),
                )
            })
            .collect();

        let mut rng = rand::thread_rng();
        let assigned = self.assign_nodes(&table, tasks.len(), &mut rng)?;

        let mut filters = Vec::with_capacity(assigned.len());
        let mut models = Vec::with_capacity(assigned.len());
        for node in &assigned {
            filters.push(AddressFilter::for_address(node, self.params.filter_fp_rate).proof());

            let supported = &node_models[node];
            let model = supported
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| supported[0].clone());
            models.push(model);
        }

        debug!(
            tasks = tasks.len(),
            distinct_nodes = table.len(),
            "Batch planned"
        );
        Ok(BatchPlan {
            nodes: assigned,
            filters,
            models,
        })
    }

    fn assign_nodes<R: Rng>(
        &self,
        table: &HashMap<Address, f64>,
        task_count: usize,
        rng: &mut R,
    ) -> Result<Vec<Address>> {
        let initial = self.selector.select_nodes(table, task_count, rng)?;

        let mut frequency: HashMap<Address, usize> = HashMap::new();
        for node in &initial {
            *frequency.entry(*node).or_insert(0) += 1;
        }

        let mut ranked: Vec<(Address, f64)> = frequency
            .iter()
            .map(|(addr, freq)| (*addr, table[addr] * *freq as f64))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

        let shortlist: HashMap<Address, f64> = ranked
            .iter()
            .take(task_count)
            .map(|(addr, _)| (*addr, table[addr]))
            .collect();

        Ok(self.selector.select_nodes(&shortlist, task_count, rng)?)
    }

    /// Assign the task its identity: a fresh random id, the absolute
    /// deadline, and the creation timestamp.
    pub fn prepare_task(&self, task: &mut Task) {
        let mut rng = rand::thread_rng();
        task.id = TaskId::random(&mut rng);
        task.created_ns = now_ns();
        task.deadline_ns = task.created_ns + self.params.task_ttl_ns;
    }

    /// Generate the task keypair, publish the envelope and persist the task.
    /// When `retry_of` is set, a RetryLink from the failed id to this one is
    /// recorded for callers still holding the old id.
    pub async fn publish_task(
        &self,
        task: &mut Task,
        node: Address,
        filter: FilterProof,
        model: &str,
        retry_of: Option<TaskId>,
    ) -> Result<()> {
        let keypair = TaskKeypair::generate(self.params.keygen_attempts)?;
        task.public_key = keypair.public_key_hex();
        task.private_key = keypair.private_key_hex();
        task.nodes = vec![node];
        task.filter = filter;

        let input = dmesh_crypto::encrypt(&task.public_key, &task.workflow.to_bytes())?;
        let peer_id = self
            .registry
            .get_peer_id(&node)
            .await?
            .unwrap_or_else(|| node.to_hex());

        let envelope = TaskEnvelope {
            task_id: task.id.to_hex(),
            filter: task.filter.clone(),
            input: hex::encode(input),
            peer_id,
            deadline_ns: task.deadline_ns,
            dataset_hash: task
                .dataset_id
                .as_deref()
                .map(|id| hex::encode(keccak256(id.as_bytes()))),
            public_key: task.public_key.clone(),
            private_key: task.private_key.clone(),
        };
        let payload = envelope.to_payload()?;

        let retries = self.params.transport_retries;
        let delay = Duration::from_millis(self.params.transport_retry_delay_ms);
        with_retry(retries, delay, || {
            let payload = payload.clone();
            let transport = Arc::clone(&self.transport);
            async move { transport.publish(TASK_TOPIC, &payload).await }
        })
        .await
        .map_err(|e| DispatchError::TaskPublish(e.to_string()))?;

        self.store
            .set(&task_key(&task.id), &serde_json::to_string(task)?)
            .await?;

        if let Some(old_id) = retry_of {
            let link = RetryLink {
                new_task_id: task.id,
            };
            self.store
                .set(&RetryLink::key_for(&old_id), &serde_json::to_string(&link)?)
                .await?;
            info!(old_task = %old_id, new_task = %task.id, "Retry link recorded");
        }

        info!(task_id = %task.id, node = %node, model, "Task published");
        Ok(())
    }

    /// Republish the same workflow as a fresh task after a worker-reported
    /// error. Fails with `NoCapacity` like any other dispatch when the
    /// network has no room.
    pub async fn republish(&self, failed: &Task) -> Result<Task> {
        let mut task = Task::new(failed.workflow.clone(), failed.models.clone());
        task.pipeline_id = failed.pipeline_id;
        task.step_name = failed.step_name.clone();
        task.dataset_id = failed.dataset_id.clone();
        task.retries = failed.retries + 1;

        let plan = self.plan_batch(std::slice::from_ref(&task)).await?;
        self.prepare_task(&mut task);
        self.publish_task(
            &mut task,
            plan.nodes[0],
            plan.filters[0].clone(),
            &plan.models[0],
            Some(failed.id),
        )
        .await?;
        Ok(task)
    }

    pub async fn load_task(&self, id: &TaskId) -> Result<Option<Task>> {
        match self.store.get(&task_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        self.store
            .set(&task_key(&task.id), &serde_json::to_string(task)?)
            .await?;
        Ok(())
    }

    /// Follow the retry chain from `id` to the most recent live task id.
    pub async fn resolve_retry_chain(&self, id: &TaskId) -> Result<TaskId> {
        let mut current = *id;
        // Chains are bounded by the retry ceiling; the hard cap guards
        // against a corrupted link cycle.
        for _ in 0..64 {
            match self.store.get(&RetryLink::key_for(&current)).await? {
                Some(raw) => {
                    let link: RetryLink = serde_json::from_str(&raw)?;
                    current = link.new_task_id;
                }
                None => break,
            }
        }
        if current != *id {
            debug!(old = %id, new = %current, "Resolved retry chain");
        }
        Ok(current)
    }
}
