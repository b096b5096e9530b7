/// Process instance lifecycle
///
/// `InstanceManager` creates and reconstructs instances. Each instance is split
/// in two halves:
/// - `ProcessInstance`: the run loop, sole owner of the mutable token state
/// - `InstanceHandle`: the shared side, readable by queries without blocking
///   the loop (ArcSwap snapshot, recorded history, form inbox, cancel signal)

use crate::error::{EngineError, EngineResult};
use crate::persistence::{EventRecord, InstanceStore};
use crate::runtime::engine::{replay_join_counters, ExecutionState, StepOutcome, TokenEngine};
use crate::workflow::types::ProcessDefinition;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch, RwLock};

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    WaitingForInput,
    Finished,
    /// A connector failed; the failing token is still pending
    Failed,
}

/// Immutable view of an instance published after every step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub model_path: String,
    pub status: InstanceStatus,
    pub variables: Map<String, Value>,
    pub pending: Vec<String>,
    pub join_counters: HashMap<String, u32>,
    /// An event record could not be persisted at some point
    pub durability_gap: bool,
    pub last_error: Option<String>,
}

/// Form submission for a pending user task
#[derive(Debug, Clone, PartialEq)]
pub struct UserFormMessage {
    pub task_id: String,
    pub fields: Map<String, Value>,
}

/// Shared side of a live instance
#[derive(Debug)]
pub struct InstanceHandle {
    pub id: String,
    pub definition: Arc<ProcessDefinition>,
    snapshot: ArcSwap<InstanceSnapshot>,
    history: RwLock<Vec<EventRecord>>,
    inbox: mpsc::UnboundedSender<UserFormMessage>,
    cancel: watch::Sender<bool>,
}

impl InstanceHandle {
    /// Latest published snapshot (lock-free)
    pub fn snapshot(&self) -> Arc<InstanceSnapshot> {
        self.snapshot.load_full()
    }

    pub fn status(&self) -> InstanceStatus {
        self.snapshot.load().status
    }

    /// Recorded steps, oldest first
    pub async fn history(&self) -> Vec<EventRecord> {
        self.history.read().await.clone()
    }

    /// Deliver a form to a pending user task
    ///
    /// Rejected with `NotFound` when the task is not a user task currently
    /// holding a token, or when the run loop is gone.
    pub fn submit_form(&self, task_id: &str, fields: Map<String, Value>) -> EngineResult<()> {
        let snapshot = self.snapshot.load();
        let is_user_task = self
            .definition
            .element(task_id)
            .and_then(|e| e.as_user_task())
            .is_some();

        if !is_user_task || !snapshot.pending.iter().any(|t| t == task_id) {
            return Err(EngineError::NotFound(format!(
                "task '{}' is not waiting for input in instance '{}'",
                task_id, self.id
            )));
        }

        self.inbox
            .send(UserFormMessage {
                task_id: task_id.to_string(),
                fields,
            })
            .map_err(|_| EngineError::NotFound(format!("instance '{}' is not running", self.id)))?;

        tracing::info!("📨 Form queued for task '{}' of instance {}", task_id, self.id);
        Ok(())
    }

    /// Ask the run loop to stop at its next suspension point
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Full instance serialization
    pub async fn to_json(&self) -> Value {
        let snapshot = self.snapshot();
        let events: Vec<Value> = self.history.read().await.iter().map(EventRecord::to_step_json).collect();
        json!({
            "id": snapshot.id,
            "model_path": snapshot.model_path,
            "status": snapshot.status,
            "variables": snapshot.variables,
            "pending": snapshot.pending,
            "durability_gap": snapshot.durability_gap,
            "last_error": snapshot.last_error,
            "events": events,
        })
    }
}

/// Creates instances and rebuilds them from their event logs
pub struct InstanceManager {
    engine: Arc<TokenEngine>,
    store: Arc<dyn InstanceStore>,
    system_variables: Map<String, Value>,
    step_delay: Duration,
}

impl InstanceManager {
    pub fn new(
        engine: Arc<TokenEngine>,
        store: Arc<dyn InstanceStore>,
        system_variables: &HashMap<String, String>,
        step_delay: Duration,
    ) -> Self {
        let system_variables = system_variables
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Self {
            engine,
            store,
            system_variables,
            step_delay,
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// New instance seeded with one token per start event
    ///
    /// System variables are merged first so caller values win. The instance
    /// is registered as running before it is returned; nothing has executed yet.
    pub async fn create_instance(
        &self,
        definition: Arc<ProcessDefinition>,
        initial_variables: Map<String, Value>,
    ) -> EngineResult<ProcessInstance> {
        let id = uuid::Uuid::new_v4().to_string();

        let mut variables = self.system_variables.clone();
        variables.extend(initial_variables);

        self.store
            .register_running(&id, &definition.model_path)
            .await
            .map_err(EngineError::persistence)?;

        let state = ExecutionState::seeded(&definition, variables);
        tracing::info!("🆕 Created instance {} of {} with tokens {:?}", id, definition.model_path, state.pending);

        Ok(self.assemble(id, definition, state, Vec::new(), InstanceStatus::Running))
    }

    /// Rebuild an instance from its ordered event log without side effects
    ///
    /// Variables and pending tokens come from the last record; join counters
    /// are re-counted from the visits in the whole sequence. An empty log
    /// yields the freshly seeded state.
    pub fn run_from_log(
        &self,
        definition: Arc<ProcessDefinition>,
        instance_id: &str,
        records: Vec<EventRecord>,
    ) -> ProcessInstance {
        let mut state = ExecutionState::seeded(&definition, self.system_variables.clone());
        let mut status = InstanceStatus::Running;

        if let Some(last) = records.last() {
            state.variables = last.variables.clone();
            state.pending = last.pending.clone();
            state.join_counters = replay_join_counters(&definition, records.iter().map(|r| r.activity_id.as_str()));

            let ended = definition.element(&last.activity_id).is_some_and(|e| e.is_end());
            if ended && state.pending.is_empty() {
                status = InstanceStatus::Finished;
            }
        }

        tracing::info!(
            "♻️ Rebuilt instance {} from {} records (pending: {:?})",
            instance_id,
            records.len(),
            state.pending
        );

        let last_timestamp = records.last().map(|r| r.timestamp);
        let mut instance = self.assemble(instance_id.to_string(), definition, state, records, status);
        instance.last_timestamp = last_timestamp;
        instance
    }

    fn assemble(
        &self,
        id: String,
        definition: Arc<ProcessDefinition>,
        state: ExecutionState,
        history: Vec<EventRecord>,
        status: InstanceStatus,
    ) -> ProcessInstance {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let snapshot = InstanceSnapshot {
            id: id.clone(),
            model_path: definition.model_path.clone(),
            status,
            variables: state.variables.clone(),
            pending: state.pending.clone(),
            join_counters: state.join_counters.clone(),
            durability_gap: false,
            last_error: None,
        };

        let handle = Arc::new(InstanceHandle {
            id,
            definition: Arc::clone(&definition),
            snapshot: ArcSwap::from_pointee(snapshot),
            history: RwLock::new(history),
            inbox: inbox_tx,
            cancel: cancel_tx,
        });

        ProcessInstance {
            handle,
            definition,
            state,
            status,
            durability_gap: false,
            last_error: None,
            last_timestamp: None,
            held: Vec::new(),
            inbox: inbox_rx,
            cancel: cancel_rx,
            engine: Arc::clone(&self.engine),
            store: Arc::clone(&self.store),
            step_delay: self.step_delay,
        }
    }
}

/// The run loop half of an instance
pub struct ProcessInstance {
    handle: Arc<InstanceHandle>,
    definition: Arc<ProcessDefinition>,
    state: ExecutionState,
    status: InstanceStatus,
    durability_gap: bool,
    last_error: Option<String>,
    last_timestamp: Option<DateTime<Utc>>,
    /// Forms for user tasks whose token is not on top of the stack yet
    held: Vec<UserFormMessage>,
    inbox: mpsc::UnboundedReceiver<UserFormMessage>,
    cancel: watch::Receiver<bool>,
    engine: Arc<TokenEngine>,
    store: Arc<dyn InstanceStore>,
    step_delay: Duration,
}

impl ProcessInstance {
    pub fn handle(&self) -> Arc<InstanceHandle> {
        Arc::clone(&self.handle)
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Step until the instance finishes, fails or is cancelled
    ///
    /// Every processed token is recorded through the store before the next
    /// one runs. A failed append flags a durability gap and execution goes on.
    pub async fn run(mut self) -> EngineResult<InstanceStatus> {
        // A log that already ended may still be registered as running
        if self.status == InstanceStatus::Finished {
            self.finish().await;
            return Ok(self.status);
        }

        self.status = InstanceStatus::Running;
        self.publish();
        tracing::info!("🚀 Running instance {} of {}", self.id(), self.definition.model_path);

        loop {
            if self.is_cancelled() {
                tracing::info!("🛑 Instance {} cancelled", self.id());
                return Ok(self.status);
            }

            let Some(top) = self.state.pending.last().cloned() else {
                self.finish().await;
                return Ok(self.status);
            };

            if self.definition.element(&top).and_then(|e| e.as_user_task()).is_some() {
                match self.wait_for_form(&top).await {
                    Some(fields) => {
                        self.state.variables.extend(fields);
                        self.status = InstanceStatus::Running;
                    }
                    None => {
                        tracing::info!("🛑 Instance {} cancelled while waiting on '{}'", self.id(), top);
                        return Ok(self.status);
                    }
                }
            }

            let outcome = match self.engine.step(&self.definition, &mut self.state).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    self.status = InstanceStatus::Failed;
                    self.last_error = Some(e.to_string());
                    self.publish();
                    tracing::error!("❌ Instance {} failed: {}", self.id(), e);
                    return Err(e);
                }
            };

            self.record(outcome.activity_id()).await;

            if matches!(outcome, StepOutcome::Ended { halted: true, .. }) {
                self.finish().await;
                return Ok(self.status);
            }

            self.publish();

            tokio::task::yield_now().await;
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
        }
    }

    /// Wait for the form of `task_id`; `None` when cancelled
    async fn wait_for_form(&mut self, task_id: &str) -> Option<Map<String, Value>> {
        if let Some(pos) = self.held.iter().position(|m| m.task_id == task_id) {
            return Some(self.held.remove(pos).fields);
        }

        self.status = InstanceStatus::WaitingForInput;
        self.publish();
        tracing::info!("⏳ Instance {} waiting for input on '{}'", self.handle.id, task_id);

        loop {
            tokio::select! {
                message = self.inbox.recv() => {
                    let message = message?;
                    if message.task_id == task_id {
                        return Some(message.fields);
                    }
                    if self.state.pending.iter().any(|t| *t == message.task_id) {
                        tracing::debug!("📥 Holding form for '{}' until its token is reached", message.task_id);
                        self.held.push(message);
                    } else {
                        tracing::warn!("⚠️ Dropping stale form for '{}' in instance {}", message.task_id, self.handle.id);
                    }
                }
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        return None;
                    }
                }
            }
        }
    }

    async fn record(&mut self, activity_id: &str) {
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);

        let record = EventRecord {
            instance_id: self.handle.id.clone(),
            model_path: self.definition.model_path.clone(),
            activity_id: activity_id.to_string(),
            timestamp,
            pending: self.state.pending.clone(),
            variables: self.state.variables.clone(),
        };

        if let Err(e) = self.store.append_event(&record).await {
            self.durability_gap = true;
            tracing::error!("❌ Failed to persist step '{}' of instance {}: {:#}", activity_id, self.handle.id, e);
        }

        self.handle.history.write().await.push(record);
    }

    async fn finish(&mut self) {
        self.status = InstanceStatus::Finished;
        match self.store.mark_finished(&self.handle.id).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("⚠️ Instance {} was not registered as running", self.handle.id),
            Err(e) => {
                self.durability_gap = true;
                tracing::error!("❌ Failed to mark instance {} finished: {:#}", self.handle.id, e);
            }
        }
        self.publish();
        tracing::info!("🎉 Instance {} finished", self.handle.id);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn publish(&self) {
        self.handle.snapshot.store(Arc::new(InstanceSnapshot {
            id: self.handle.id.clone(),
            model_path: self.definition.model_path.clone(),
            status: self.status,
            variables: self.state.variables.clone(),
            pending: self.state.pending.clone(),
            join_counters: self.state.join_counters.clone(),
            durability_gap: self.durability_gap,
            last_error: self.last_error.clone(),
        }));
    }
}
