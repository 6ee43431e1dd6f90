use crate::step::{Step, StepInput, StepOutput};
use crate::{PipelineError, Result};
use dmesh_dispatch::Executor;
use dmesh_storage::{DatasetStore, KvStore};
use dmesh_types::{PipelineId, Task, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The persisted `(state, status, output)` triple, written after every
/// transition so execution can be observed or resumed out-of-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub state: String,
    pub status: PipelineStatus,
    pub output: Value,
    #[serde(default)]
    pub reason: Option<String>,
}

/// An ordered chain of steps with data flowing between them. Steps run
/// strictly sequentially; within a step, each round of inputs is dispatched
/// as one concurrent batch.
pub struct Pipeline {
    id: PipelineId,
    steps: Vec<Step>,
    executor: Arc<Executor>,
    store: Arc<dyn KvStore>,
    datasets: DatasetStore,
    dataset_id: Option<String>,
    status: PipelineStatus,
}

impl Pipeline {
    pub fn new(
        executor: Arc<Executor>,
        store: Arc<dyn KvStore>,
        datasets: DatasetStore,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            id: PipelineId::random(&mut rng),
            steps: Vec::new(),
            executor,
            store,
            datasets,
            dataset_id: None,
            status: PipelineStatus::Pending,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn with_dataset(mut self, dataset_id: &str) -> Self {
        self.dataset_id = Some(dataset_id.to_string());
        self
    }

    pub fn add_step(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn record_key(id: &PipelineId) -> String {
        format!("pipeline:{}", id.to_hex())
    }

    pub async fn load_record(
        store: &Arc<dyn KvStore>,
        id: &PipelineId,
    ) -> Result<Option<PipelineRecord>> {
        match store.get(&Self::record_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Run the chain to completion. A failing step finalizes the pipeline
    /// with the last successfully produced step output instead of losing
    /// all progress; the error is recorded, not raised.
    pub async fn execute(&mut self) -> Result<(PipelineStatus, Value)> {
        if self.steps.is_empty() {
            return Err(PipelineError::Empty);
        }

        self.status = PipelineStatus::Running;
        let first = self.steps[0].name.clone();
        self.persist(format!("step:{}", first), Value::Null, None)
            .await?;
        info!(pipeline_id = %self.id, steps = self.steps.len(), "Pipeline started");

        let mut last_output = Value::Null;

        for idx in 0..self.steps.len() - 1 {
            if let Err(e) = self.run_step(idx).await {
                return self.finalize_failed(idx, e, last_output).await;
            }
            self.resolve_links(idx).await?;

            let next_inputs = {
                let next_keys = self.steps[idx + 1].input_keys.clone();
                let step = &self.steps[idx];
                match step.callback.apply(step, &next_keys) {
                    Ok(inputs) => inputs,
                    Err(e) => return self.finalize_failed(idx, e, last_output).await,
                }
            };

            last_output = json!(self.steps[idx].outputs);
            let next_name = self.steps[idx + 1].name.clone();
            self.steps[idx + 1].inputs = next_inputs;
            self.persist(format!("step:{}", next_name), last_output.clone(), None)
                .await?;
            debug!(pipeline_id = %self.id, step = %next_name, "Pipeline advanced");
        }

        let last_idx = self.steps.len() - 1;
        if let Err(e) = self.run_step(last_idx).await {
            return self.finalize_failed(last_idx, e, last_output).await;
        }
        self.resolve_links(last_idx).await?;

        let final_output = {
            let step = &self.steps[last_idx];
            match step.callback.apply(step, &["output".to_string()]) {
                Ok(values) => collapse_outputs(values),
                Err(e) => return self.finalize_failed(last_idx, e, last_output).await,
            }
        };

        self.status = PipelineStatus::Completed;
        self.persist("completed".to_string(), final_output.clone(), None)
            .await?;
        self.persist_dataset(&final_output).await?;
        info!(pipeline_id = %self.id, "Pipeline completed");
        Ok((PipelineStatus::Completed, final_output))
    }

    /// Delete the persisted record once the output has been consumed.
    pub async fn destroy(self) -> Result<()> {
        self.store.delete(&Self::record_key(&self.id)).await?;
        Ok(())
    }

    /// Dispatch one step: its builder runs once per input record, batched
    /// into rounds no larger than the configured round size; the step
    /// re-enters its round loop until every input has been dispatched.
    async fn run_step(&mut self, idx: usize) -> Result<()> {
        let executor = Arc::clone(&self.executor);
        let round_size = executor.manager().params().step_batch_size;
        let pipeline_id = self.id;
        let dataset_id = self.dataset_id.clone();

        let step = &mut self.steps[idx];
        step.outputs.clear();
        step.tasks.clear();
        step.dispatched.clear();

        info!(
            pipeline_id = %pipeline_id,
            step = %step.name,
            inputs = step.inputs.len(),
            "Step started"
        );

        let inputs = step.inputs.clone();
        for round in inputs.chunks(round_size) {
            let mut batch = Vec::with_capacity(round.len());
            for input in round {
                let workflow = (step.builder)(input);
                let mut task = Task::new(workflow, step.config.models.clone())
                    .with_pipeline(pipeline_id, &step.name);
                if let Some(ds) = &dataset_id {
                    task = task.with_dataset(ds);
                }
                batch.push(task);
            }

            let published = executor.push(batch).await?;
            let ids: Vec<TaskId> = published.iter().map(|t| t.id).collect();
            for (task, input) in published.iter().zip(round) {
                step.dispatched.insert(task.id.to_hex(), input.clone());
            }
            step.tasks.extend(published);

            let results = executor.fetch(&ids).await?;
            for result in results {
                step.outputs.push(StepOutput {
                    task_id: result.id.to_hex(),
                    value: result.result,
                });
            }
        }

        if !step.inputs.is_empty() && step.outputs.is_empty() {
            return Err(PipelineError::StepFailed {
                step: step.name.clone(),
                reason: "no results arrived before the fetch ceiling".into(),
            });
        }
        Ok(())
    }

    /// Swap any retried task ids for their live ids in the step's task list
    /// and correlation map before the transition consumes them.
    async fn resolve_links(&mut self, idx: usize) -> Result<()> {
        let executor = Arc::clone(&self.executor);
        let step = &mut self.steps[idx];

        let mut remapped: HashMap<String, String> = HashMap::new();
        for task in &mut step.tasks {
            let live = executor.manager().resolve_retry_chain(&task.id).await?;
            if live != task.id {
                remapped.insert(task.id.to_hex(), live.to_hex());
                task.id = live;
            }
        }

        if !remapped.is_empty() {
            let dispatched = std::mem::take(&mut step.dispatched);
            step.dispatched = dispatched
                .into_iter()
                .map(|(id, input)| (remapped.get(&id).cloned().unwrap_or(id), input))
                .collect();
            debug!(
                pipeline_id = %self.id,
                step = %step.name,
                relinked = remapped.len(),
                "Retry links resolved"
            );
        }
        Ok(())
    }

    async fn finalize_failed(
        &mut self,
        idx: usize,
        error: PipelineError,
        last_output: Value,
    ) -> Result<(PipelineStatus, Value)> {
        let step_name = self.steps[idx].name.clone();
        warn!(
            pipeline_id = %self.id,
            step = %step_name,
            error = %error,
            "Pipeline failed, finalizing with last good output"
        );

        self.status = PipelineStatus::Failed;
        self.persist(
            format!("failed:{}", step_name),
            last_output.clone(),
            Some(error.to_string()),
        )
        .await?;
        self.persist_dataset(&last_output).await?;
        Ok((PipelineStatus::Failed, last_output))
    }

    async fn persist(&self, state: String, output: Value, reason: Option<String>) -> Result<()> {
        let record = PipelineRecord {
            state,
            status: self.status,
            output,
            reason,
        };
        self.store
            .set(
                &Self::record_key(&self.id),
                &serde_json::to_string(&record)?,
            )
            .await?;
        Ok(())
    }

    async fn persist_dataset(&self, output: &Value) -> Result<()> {
        let Some(dataset_id) = &self.dataset_id else {
            return Ok(());
        };
        self.datasets
            .append(
                dataset_id,
                &json!({
                    "pipeline_id": self.id.to_hex(),
                    "status": self.status,
                    "output": output,
                }),
            )
            .await?;
        Ok(())
    }
}

/// The last callback's products become the pipeline output: a single value
/// collapses, several stay an array.
fn collapse_outputs(values: Vec<StepInput>) -> Value {
    let mut collected: Vec<Value> = values
        .into_iter()
        .map(|input| match input.values.get("output").cloned() {
            Some(value) => value,
            None => Value::Object(input.values),
        })
        .collect();
    if collected.len() == 1 {
        collected.remove(0)
    } else {
        Value::Array(collected)
    }
}
