use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const TYPE_KEYS: &[&str] = &["type", "task_type"];
const AGENT_COUNT_KEY: &str = "agent_count";
const DIFFICULTY_METRICS_KEY: &str = "difficulty_metrics";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDefinition {
    pub id: String,
    pub task_type: String,
    pub agent_count: usize,
    /// Every other key of the task record, untouched.
    pub metadata: Map<String, Value>,
}

impl TaskDefinition {
    pub fn from_value(id: &str, value: &Value) -> Result<Self> {
        let record = value
            .as_object()
            .ok_or_else(|| anyhow!("task '{}' must be a JSON object", id))?;
        let task_type = TYPE_KEYS
            .iter()
            .find_map(|key| record.get(*key).and_then(Value::as_str))
            .ok_or_else(|| anyhow!("task '{}' is missing string field 'type'", id))?
            .to_string();
        let agent_count = record
            .get(AGENT_COUNT_KEY)
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                anyhow!(
                    "task '{}' is missing non-negative integer field '{}'",
                    id,
                    AGENT_COUNT_KEY
                )
            })? as usize;
        let metadata = record
            .iter()
            .filter(|(key, _)| !TYPE_KEYS.contains(&key.as_str()) && key.as_str() != AGENT_COUNT_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Self {
            id: id.to_string(),
            task_type,
            agent_count,
            metadata,
        })
    }

    pub fn difficulty_metrics(&self) -> Map<String, Value> {
        self.metadata
            .get(DIFFICULTY_METRICS_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

/// Task definitions in file order. Order matters: it drives the round-robin
/// partitioning of tasks across workers.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<TaskDefinition>,
    by_id: HashMap<String, usize>,
}

impl TaskSet {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read task file {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("task file {} is not valid JSON", path.display()))?;
        Self::from_json(&value).with_context(|| format!("invalid task file {}", path.display()))
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let records = value
            .as_object()
            .ok_or_else(|| anyhow!("task file must be a JSON object keyed by task id"))?;
        let mut definitions = Vec::with_capacity(records.len());
        for (id, record) in records {
            definitions.push(TaskDefinition::from_value(id, record)?);
        }
        Self::from_definitions(definitions)
    }

    pub fn from_definitions(definitions: Vec<TaskDefinition>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(definitions.len());
        for (idx, def) in definitions.iter().enumerate() {
            if by_id.insert(def.id.clone(), idx).is_some() {
                return Err(anyhow!("duplicate task id '{}'", def.id));
            }
        }
        Ok(Self {
            tasks: definitions,
            by_id,
        })
    }

    /// Restricts the set to `ids`, keeping file order. Unknown ids are an error.
    pub fn select(&self, ids: &[String]) -> Result<Self> {
        let unknown: Vec<&str> = ids
            .iter()
            .filter(|id| !self.by_id.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(anyhow!("unknown task ids: {}", unknown.join(", ")));
        }
        let selected = self
            .tasks
            .iter()
            .filter(|def| ids.iter().any(|id| id == &def.id))
            .cloned()
            .collect();
        Self::from_definitions(selected)
    }

    pub fn get(&self, id: &str) -> Option<&TaskDefinition> {
        self.by_id.get(id).map(|idx| &self.tasks[*idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks.iter().map(|def| def.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The task type of the first task; the run is labelled with it.
    pub fn primary_task_type(&self) -> Option<&str> {
        self.tasks.first().map(|def| def.task_type.as_str())
    }
}
