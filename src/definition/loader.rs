use crate::behaviors::ActivityBehavior;
use crate::definition::ProcessDefinition;
use crate::definition::builder::ProcessBuilder;
use crate::error::{EngineError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// YAML surface of a process definition file.
#[derive(Debug, Deserialize)]
pub struct ProcessFile {
    pub id: String,
    pub name: Option<String>,
    pub initial: Option<String>,
    pub activities: Vec<ActivitySpec>,
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
}

#[derive(Debug, Deserialize)]
pub struct ActivitySpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub assignments: BTreeMap<String, Value>,
    /// Nested activities; only valid on composite kinds.
    #[serde(default)]
    pub activities: Vec<ActivitySpec>,
    #[serde(default)]
    pub timers: Vec<TimerSpec>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionSpec {
    pub from: String,
    pub to: String,
    pub condition: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimerSpec {
    pub id: String,
    #[serde(default = "default_interrupting")]
    pub interrupting: bool,
    pub duration_ms: u64,
    pub to: Vec<String>,
}

fn default_interrupting() -> bool {
    true
}

pub fn load_process_from_yaml(path: impl AsRef<Path>) -> Result<ProcessDefinition> {
    let content = fs::read_to_string(path)?;
    parse_process(&content)
}

pub fn parse_process(yaml: &str) -> Result<ProcessDefinition> {
    let file: ProcessFile = serde_yaml::from_str(yaml)?;
    let mut builder = ProcessBuilder::new(&file.id);
    if let Some(name) = &file.name {
        builder = builder.name(name);
    }
    if let Some(initial) = &file.initial {
        builder = builder.initial(initial);
    }
    for spec in &file.activities {
        add_activity(&mut builder, None, spec)?;
    }
    for t in &file.transitions {
        builder.insert_flow(&t.from, &t.to, t.condition.clone());
    }
    builder.build()
}

fn add_activity(
    builder: &mut ProcessBuilder,
    parent: Option<usize>,
    spec: &ActivitySpec,
) -> Result<()> {
    let behavior = behavior_for(spec)?;
    let composite = behavior.is_composite();
    if !composite && !spec.activities.is_empty() {
        return Err(EngineError::InvalidModel(format!(
            "activity '{}' of kind '{}' cannot contain nested activities",
            spec.id, spec.kind
        )));
    }
    let idx = builder.insert(parent, &spec.id, behavior);
    for timer in &spec.timers {
        builder.insert_timer(
            &spec.id,
            &timer.id,
            timer.interrupting,
            timer.duration_ms,
            timer.to.clone(),
        );
    }
    for nested in &spec.activities {
        add_activity(builder, Some(idx), nested)?;
    }
    Ok(())
}

fn behavior_for(spec: &ActivitySpec) -> Result<ActivityBehavior> {
    let behavior = match spec.kind.as_str() {
        "task" => ActivityBehavior::Task {
            assignments: spec
                .assignments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        },
        "wait" => ActivityBehavior::Wait,
        "end" => ActivityBehavior::End,
        "exclusive" => ActivityBehavior::Exclusive,
        "parallel" => ActivityBehavior::Parallel,
        "subprocess" => ActivityBehavior::EmbeddedSubprocess,
        "event-subprocess" => ActivityBehavior::EventScopeSubprocess,
        other => {
            return Err(EngineError::InvalidModel(format!(
                "activity '{}': unknown kind '{other}'",
                spec.id
            )));
        }
    };
    if !matches!(behavior, ActivityBehavior::Task { .. }) && !spec.assignments.is_empty() {
        return Err(EngineError::InvalidModel(format!(
            "activity '{}': assignments are only valid on tasks",
            spec.id
        )));
    }
    Ok(behavior)
}
