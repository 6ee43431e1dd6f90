use crate::{PipelineError, Result};
use dmesh_types::{Task, Workflow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One ordered input record for a step: named parameters consumed by the
/// workflow builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub values: serde_json::Map<String, Value>,
}

impl StepInput {
    pub fn single(key: &str, value: Value) -> Self {
        let mut values = serde_json::Map::new();
        values.insert(key.to_string(), value);
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// One output accumulated during a step round, correlated to the task that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub task_id: String,
    pub value: String,
}

/// Model list and execution ceilings forwarded with every task of the step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub models: Vec<String>,
    pub max_time_secs: u64,
    pub max_steps: u32,
    pub max_tokens: u32,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            max_time_secs: 300,
            max_steps: 20,
            max_tokens: 32_768,
        }
    }
}

impl StepConfig {
    pub fn for_models(models: &[&str]) -> Self {
        Self {
            models: models.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }
}

pub type WorkflowBuilder = Arc<dyn Fn(&StepInput) -> Workflow + Send + Sync>;
pub type CustomCallback = Arc<dyn Fn(&Step) -> Result<Vec<StepInput>> + Send + Sync>;

/// How a finished step's outputs become the next step's inputs. A closed
/// set: the fan strategies demand a single declared input key on the next
/// step, anything richer goes through `Custom`.
#[derive(Clone)]
pub enum StepCallback {
    /// One JSON-array output fans out into one input per element.
    Scatter,
    /// One output replicated into `n` identical inputs.
    Broadcast(usize),
    /// All outputs merged into exactly one JSON-array input.
    Aggregate,
    /// 1:1 passthrough.
    Default,
    /// Caller-supplied mapping with full access to the step.
    Custom(CustomCallback),
}

impl fmt::Debug for StepCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scatter => write!(f, "Scatter"),
            Self::Broadcast(n) => write!(f, "Broadcast({})", n),
            Self::Aggregate => write!(f, "Aggregate"),
            Self::Default => write!(f, "Default"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl StepCallback {
    fn label(&self) -> &'static str {
        match self {
            Self::Scatter => "scatter",
            Self::Broadcast(_) => "broadcast",
            Self::Aggregate => "aggregate",
            Self::Default => "default",
            Self::Custom(_) => "custom",
        }
    }

    /// Produce the next step's inputs from this step's accumulated outputs.
    /// `next_keys` are the input keys the next step declares.
    pub fn apply(&self, step: &Step, next_keys: &[String]) -> Result<Vec<StepInput>> {
        let key = match self {
            Self::Custom(callback) => return callback(step),
            Self::Default => next_keys.first().ok_or_else(|| PipelineError::Callback(
                format!("step {} has no next input key", step.name),
            ))?,
            _ => {
                if next_keys.len() != 1 {
                    return Err(PipelineError::InputKeyArity {
                        callback: self.label(),
                        step: step.name.clone(),
                        arity: next_keys.len(),
                    });
                }
                &next_keys[0]
            }
        };

        match self {
            Self::Scatter => {
                let first = step.outputs.first().ok_or_else(|| {
                    PipelineError::Callback(format!("step {} produced no output", step.name))
                })?;
                let items: Vec<Value> = serde_json::from_str(&first.value).map_err(|e| {
                    PipelineError::Callback(format!(
                        "step {} scatter output is not a JSON array: {}",
                        step.name, e
                    ))
                })?;
                Ok(items
                    .into_iter()
                    .map(|item| StepInput::single(key, item))
                    .collect())
            }
            Self::Broadcast(n) => {
                let first = step.outputs.first().ok_or_else(|| {
                    PipelineError::Callback(format!("step {} produced no output", step.name))
                })?;
                Ok((0..*n)
                    .map(|_| StepInput::single(key, Value::String(first.value.clone())))
                    .collect())
            }
            Self::Aggregate => {
                let merged: Vec<Value> = step
                    .outputs
                    .iter()
                    .map(|o| Value::String(o.value.clone()))
                    .collect();
                Ok(vec![StepInput::single(key, Value::Array(merged))])
            }
            Self::Default => Ok(step
                .outputs
                .iter()
                .map(|o| StepInput::single(key, Value::String(o.value.clone())))
                .collect()),
            Self::Custom(_) => unreachable!("handled above"),
        }
    }
}

/// A single batch-dispatch unit within a pipeline: its input records, the
/// workflow builder applied once per record, and the callback strategy that
/// shapes the transition to the next step.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    /// Input keys this step's builder consumes.
    pub input_keys: Vec<String>,
    pub inputs: Vec<StepInput>,
    pub builder: WorkflowBuilder,
    pub config: StepConfig,
    pub callback: StepCallback,
    /// Accumulated outputs for the completed rounds.
    pub outputs: Vec<StepOutput>,
    /// In-flight tasks of the current round.
    pub tasks: Vec<Task>,
    /// Correlation map: live task id -> the input record it carries.
    pub dispatched: HashMap<String, StepInput>,
}

impl Step {
    pub fn new(
        name: &str,
        input_keys: &[&str],
        builder: WorkflowBuilder,
        config: StepConfig,
        callback: StepCallback,
    ) -> Self {
        Self {
            name: name.to_string(),
            input_keys: input_keys.iter().map(|k| k.to_string()).collect(),
            inputs: Vec::new(),
            builder,
            config,
            callback,
            outputs: Vec::new(),
            tasks: Vec::new(),
            dispatched: HashMap::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<StepInput>) -> Self {
        self.inputs = inputs;
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("callback", &self.callback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_with_outputs(outputs: Vec<&str>, callback: StepCallback) -> Step {
        let builder: WorkflowBuilder =
            Arc::new(|input| Workflow::new(json!({ "input": input.values })));
        let mut step = Step::new("s", &["text"], builder, StepConfig::default(), callback);
        step.outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(i, value)| StepOutput {
                task_id: format!("{:032x}", i),
                value: value.to_string(),
            })
            .collect();
        step
    }

    #[test]
    fn test_scatter_fans_out() {
        let step = step_with_outputs(vec![r#"["a","b","c"]"#], StepCallback::Scatter);
        let inputs = step.callback.apply(&step, &["item".to_string()]).unwrap();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0].get("item"), Some(&json!("a")));
        assert_eq!(inputs[2].get("item"), Some(&json!("c")));
    }

    #[test]
    fn test_scatter_rejects_non_array() {
        let step = step_with_outputs(vec!["not json"], StepCallback::Scatter);
        assert!(matches!(
            step.callback.apply(&step, &["item".to_string()]),
            Err(PipelineError::Callback(_))
        ));
    }

    #[test]
    fn test_broadcast_replicates() {
        let step = step_with_outputs(vec!["seed"], StepCallback::Broadcast(4));
        let inputs = step.callback.apply(&step, &["seed".to_string()]).unwrap();
        assert_eq!(inputs.len(), 4);
        assert!(inputs.iter().all(|i| i.get("seed") == Some(&json!("seed"))));
    }

    #[test]
    fn test_aggregate_fans_in() {
        let step = step_with_outputs(vec!["x", "y", "z"], StepCallback::Aggregate);
        let inputs = step.callback.apply(&step, &["all".to_string()]).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].get("all"), Some(&json!(["x", "y", "z"])));
    }

    #[test]
    fn test_default_passthrough() {
        let step = step_with_outputs(vec!["x", "y"], StepCallback::Default);
        let inputs = step.callback.apply(&step, &["v".to_string()]).unwrap();
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn test_fan_strategies_require_single_key() {
        let keys = vec!["a".to_string(), "b".to_string()];
        for callback in [
            StepCallback::Scatter,
            StepCallback::Broadcast(2),
            StepCallback::Aggregate,
        ] {
            let step = step_with_outputs(vec![r#"["a"]"#], callback);
            assert!(matches!(
                step.callback.apply(&step, &keys),
                Err(PipelineError::InputKeyArity { .. })
            ));
        }
    }

    #[test]
    fn test_custom_sees_step_state() {
        let callback = StepCallback::Custom(Arc::new(|step: &Step| {
            Ok(step
                .outputs
                .iter()
                .map(|o| {
                    let mut input = StepInput::single("value", json!(o.value));
                    input
                        .values
                        .insert("source".into(), json!(o.task_id));
                    input
                })
                .collect())
        }));
        let step = step_with_outputs(vec!["x"], callback);
        let inputs = step
            .callback
            .apply(&step, &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].get("source").is_some());
    }
}
