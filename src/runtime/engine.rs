use crate::definition::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::runtime::events::EngineEvent;
use crate::runtime::instance::{ProcessInstance, now_ms};
use crate::runtime::tree::ExecutionId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Receives the audit events drained after each engine command.
#[async_trait]
pub trait ProcessEventListener: Send + Sync {
    async fn on_event(&self, instance_id: Uuid, event: &EngineEvent);
}

/// Concurrent facade over process definitions and their running instances.
/// Each command locks one instance, runs the synchronous graph walk, then
/// publishes the drained events to the registered listeners.
pub struct ProcessEngine {
    definitions: DashMap<String, Arc<ProcessDefinition>>,
    instances: DashMap<Uuid, Mutex<ProcessInstance>>,
    listeners: Vec<Arc<dyn ProcessEventListener>>,
    shutdown: watch::Sender<bool>,
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEngine {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            listeners: Vec::new(),
            shutdown,
        }
    }

    pub fn register_definition(&self, definition: ProcessDefinition) {
        info!(definition = %definition.id, "registering process definition");
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ProcessEventListener>) {
        self.listeners.push(listener);
    }

    pub fn definition_ids(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.key().clone()).collect()
    }

    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.instances.iter().map(|i| *i.key()).collect()
    }

    pub async fn start_process(
        &self,
        definition_id: &str,
        initial_vars: HashMap<String, Value>,
    ) -> Result<Uuid> {
        let definition = self
            .definitions
            .get(definition_id)
            .map(|d| d.clone())
            .ok_or_else(|| EngineError::UnknownDefinition(definition_id.to_string()))?;
        let mut instance = ProcessInstance::start(definition, initial_vars)?;
        let instance_id = instance.id();
        let events = instance.drain_events();
        self.instances.insert(instance_id, Mutex::new(instance));
        self.publish(instance_id, events).await;
        Ok(instance_id)
    }

    /// Resumes a specific waiting execution.
    pub async fn trigger(
        &self,
        instance_id: Uuid,
        execution: ExecutionId,
        vars: HashMap<String, Value>,
    ) -> Result<()> {
        let events = self.with_instance(instance_id, |instance| {
            instance.trigger(execution, vars)?;
            Ok(instance.drain_events())
        })?;
        self.publish(instance_id, events).await;
        Ok(())
    }

    /// Resumes the single execution waiting at the named activity.
    pub async fn trigger_activity(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        vars: HashMap<String, Value>,
    ) -> Result<ExecutionId> {
        let (execution, events) = self.with_instance(instance_id, |instance| {
            let execution = instance.trigger_activity(activity_id, vars)?;
            Ok((execution, instance.drain_events()))
        })?;
        self.publish(instance_id, events).await;
        Ok(execution)
    }

    pub async fn fire_timer(&self, instance_id: Uuid, timer_id: &str) -> Result<()> {
        let events = self.with_instance(instance_id, |instance| {
            instance.fire_timer(timer_id)?;
            Ok(instance.drain_events())
        })?;
        self.publish(instance_id, events).await;
        Ok(())
    }

    /// Re-runs all preserved event scopes beneath the instance root.
    pub async fn compensate(&self, instance_id: Uuid) -> Result<usize> {
        let (count, events) = self.with_instance(instance_id, |instance| {
            let root = instance.root();
            let count = instance.compensate(root)?;
            Ok((count, instance.drain_events()))
        })?;
        self.publish(instance_id, events).await;
        Ok(count)
    }

    pub fn get_variable(&self, instance_id: Uuid, name: &str) -> Result<Option<Value>> {
        self.with_instance(instance_id, |instance| Ok(instance.variable(name)))
    }

    pub fn is_ended(&self, instance_id: Uuid) -> Result<bool> {
        self.with_instance(instance_id, |instance| Ok(instance.is_ended()))
    }

    pub fn active_activities(&self, instance_id: Uuid) -> Result<Vec<String>> {
        self.with_instance(instance_id, |instance| Ok(instance.active_activities()))
    }

    pub fn waiting_executions(&self, instance_id: Uuid) -> Result<Vec<(ExecutionId, String)>> {
        self.with_instance(instance_id, |instance| Ok(instance.waiting_executions()))
    }

    /// Read-only access to an instance under its lock.
    pub fn inspect<R>(
        &self,
        instance_id: Uuid,
        f: impl FnOnce(&ProcessInstance) -> R,
    ) -> Result<R> {
        self.with_instance(instance_id, |instance| Ok(f(instance)))
    }

    pub fn remove_instance(&self, instance_id: Uuid) -> Result<()> {
        self.instances
            .remove(&instance_id)
            .map(|_| ())
            .ok_or(EngineError::UnknownInstance(instance_id))
    }

    /// Polls timer subscriptions and fires the due ones until [`close`] is
    /// called.
    ///
    /// [`close`]: ProcessEngine::close
    pub async fn run_worker(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_millis(25));
        info!("timer worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (instance_id, timer_id) in self.due_timers() {
                        if let Err(err) = self.fire_timer(instance_id, &timer_id).await {
                            warn!(instance_id = %instance_id, timer = %timer_id, %err, "failed to fire due timer");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("timer worker stopping");
                    break;
                }
            }
        }
    }

    /// Stops all workers spawned from this engine.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    fn due_timers(&self) -> Vec<(Uuid, String)> {
        let now = now_ms();
        let mut due = Vec::new();
        for entry in self.instances.iter() {
            let instance = entry
                .value()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for timer_id in instance.due_timer_ids(now) {
                due.push((*entry.key(), timer_id));
            }
        }
        due
    }

    fn with_instance<R>(
        &self,
        instance_id: Uuid,
        f: impl FnOnce(&mut ProcessInstance) -> Result<R>,
    ) -> Result<R> {
        let entry = self
            .instances
            .get(&instance_id)
            .ok_or(EngineError::UnknownInstance(instance_id))?;
        let mut instance = entry.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut instance)
    }

    async fn publish(&self, instance_id: Uuid, events: Vec<EngineEvent>) {
        for listener in &self.listeners {
            for event in &events {
                listener.on_event(instance_id, event).await;
            }
        }
    }
}
