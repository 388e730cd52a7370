use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use simlab_core::{atomic_write_json_pretty, ensure_dir};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_AGENT_NAMES: &[&str] = &[
    "Andy", "Jill", "Bob", "Sally", "Mike", "Laura", "John", "Emma", "Tom", "Kate",
];

/// Hands out agent names `<Name>_<session>`. Once the base names run out the
/// pool cycles, appending the cycle number (`Andy1_<session>`), so a single
/// allocation never repeats a name.
#[derive(Debug, Clone)]
pub struct AgentNamePool {
    names: Vec<String>,
}

impl Default for AgentNamePool {
    fn default() -> Self {
        Self {
            names: DEFAULT_AGENT_NAMES.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl AgentNamePool {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(anyhow!("agent name pool must not be empty"));
        }
        Ok(Self { names })
    }

    pub fn allocate(&self, count: usize, session: &str) -> Vec<String> {
        (0..count)
            .map(|i| {
                let base = &self.names[i % self.names.len()];
                let cycle = i / self.names.len();
                if cycle == 0 {
                    format!("{}_{}", base, session)
                } else {
                    format!("{}{}_{}", base, cycle, session)
                }
            })
            .collect()
    }
}

/// `model` field of a profile for the given API.
pub fn profile_model_value(model: &str, api: &str, url: Option<&str>) -> Value {
    match api {
        "vllm" => json!({"api": api, "model": model, "url": url.unwrap_or_default()}),
        "ollama" => json!({"api": api, "model": model, "embedding": "ollama"}),
        _ => json!(model),
    }
}

/// Writes one profile per agent to `<out_dir>/<name>.json`, derived from the
/// template profile, and returns the written paths in `names` order.
pub fn write_agent_profiles(
    template: &Path,
    names: &[String],
    model: &str,
    api: &str,
    url: Option<&str>,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(template)
        .with_context(|| format!("failed to read template profile {}", template.display()))?;
    let base: Value = serde_json::from_str(&raw)
        .with_context(|| format!("template profile {} is not valid JSON", template.display()))?;
    if !base.is_object() {
        return Err(anyhow!(
            "template profile {} must be a JSON object",
            template.display()
        ));
    }
    ensure_dir(out_dir)?;
    let model_value = profile_model_value(model, api, url);
    let mut paths = Vec::with_capacity(names.len());
    for name in names {
        let mut profile = base.clone();
        if let Some(obj) = profile.as_object_mut() {
            obj.insert("name".to_string(), json!(name));
            obj.insert("model".to_string(), model_value.clone());
        }
        let path = out_dir.join(format!("{}.json", name));
        atomic_write_json_pretty(&path, &profile)?;
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pool_suffixes_session_and_cycles_without_duplicates() {
        let pool = AgentNamePool::default();
        assert_eq!(pool.allocate(2, "0"), vec!["Andy_0", "Jill_0"]);
        let many = pool.allocate(12, "3");
        assert_eq!(many[9], "Kate_3");
        assert_eq!(many[10], "Andy1_3");
        assert_eq!(many[11], "Jill1_3");
        let unique: HashSet<&String> = many.iter().collect();
        assert_eq!(unique.len(), 12);
        assert!(AgentNamePool::new(Vec::new()).is_err());
    }

    #[test]
    fn model_value_depends_on_api() {
        assert_eq!(profile_model_value("gpt-4o", "openai", None), json!("gpt-4o"));
        assert_eq!(
            profile_model_value("qwen", "vllm", Some("http://127.0.0.1:8000/v1")),
            json!({"api": "vllm", "model": "qwen", "url": "http://127.0.0.1:8000/v1"})
        );
        assert_eq!(
            profile_model_value("llama3", "ollama", None),
            json!({"api": "ollama", "model": "llama3", "embedding": "ollama"})
        );
    }

    #[test]
    fn profiles_copy_template_and_override_name_and_model() {
        let root = std::env::temp_dir().join(format!(
            "simlab_profiles_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("root");
        let template = root.join("collab_profile.json");
        fs::write(
            &template,
            r#"{"name": "andy", "model": "x", "modes": {"hunting": false}}"#,
        )
        .expect("template");
        let names = AgentNamePool::default().allocate(2, "1");
        let paths = write_agent_profiles(&template, &names, "llama3", "ollama", None, &root.join("out"))
            .expect("profiles");
        assert_eq!(paths[1], root.join("out").join("Jill_1.json"));
        let jill: Value =
            serde_json::from_slice(&fs::read(&paths[1]).expect("read")).expect("parse");
        assert_eq!(jill["name"], json!("Jill_1"));
        assert_eq!(jill["model"]["embedding"], json!("ollama"));
        assert_eq!(jill["modes"], json!({"hunting": false}));
        let _ = fs::remove_dir_all(root);
    }
}
