//! Estado de una corrida del workflow: ciclo de vida de cada tarea,
//! reintentos y propagación de fallas a los nodos dependientes.
//!
//! Lo usan tanto el master (tareas repartidas a workers por HTTP) como el
//! executor local.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::Dag;
use crate::error::DagError;

pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    UpForRetry,
    Success,
    Failed,
    UpstreamFailed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::UpstreamFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Failed,
    Succeeded,
}

impl RunStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub node_id: String,
    pub state: TaskState,
    /// Intento actual, empezando en 0.
    pub attempt: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Qué pasó al registrar una falla.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// La tarea vuelve a encolarse con este número de intento.
    Retry { attempt: u32 },
    /// Sin reintentos: la tarea queda `failed` y estos nodos `upstream_failed`.
    Failed { skipped: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct RunState {
    dag: Dag,
    retries: u32,
    order: Vec<String>,
    tasks: BTreeMap<String, TaskInstance>,
}

impl RunState {
    pub fn new(dag: Dag, retries: u32) -> Result<Self, DagError> {
        dag.validate()?;
        let order = dag.topological_order()?;
        let tasks = dag
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    TaskInstance {
                        node_id: n.id.clone(),
                        state: TaskState::Pending,
                        attempt: 0,
                        last_error: None,
                        started_at: None,
                        finished_at: None,
                    },
                )
            })
            .collect();

        Ok(Self {
            dag,
            retries,
            order,
            tasks,
        })
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn task(&self, node_id: &str) -> Option<&TaskInstance> {
        self.tasks.get(node_id)
    }

    /// Instancias en orden topológico.
    pub fn snapshot(&self) -> Vec<TaskInstance> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    /// Devuelve las tareas listas para correr (pendientes con todas sus
    /// dependencias en `success`, o esperando reintento) y las marca `queued`.
    pub fn take_ready(&mut self) -> Vec<(String, u32)> {
        let mut ready = Vec::new();
        for id in &self.order {
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            let runnable = match task.state {
                TaskState::UpForRetry => true,
                TaskState::Pending => self.dag.upstream_of(id).iter().all(|up| {
                    self.tasks
                        .get(*up)
                        .map(|t| t.state == TaskState::Success)
                        .unwrap_or(false)
                }),
                _ => false,
            };
            if runnable {
                ready.push((id.clone(), task.attempt));
            }
        }

        for (id, _) in &ready {
            if let Some(task) = self.tasks.get_mut(id) {
                task.state = TaskState::Queued;
            }
        }
        ready
    }

    pub fn mark_running(&mut self, node_id: &str) {
        if let Some(task) = self.tasks.get_mut(node_id) {
            task.state = TaskState::Running;
            task.started_at = Some(Utc::now());
        }
    }

    pub fn record_success(&mut self, node_id: &str) {
        if let Some(task) = self.tasks.get_mut(node_id) {
            task.state = TaskState::Success;
            task.last_error = None;
            task.finished_at = Some(Utc::now());
        }
    }

    pub fn record_failure(&mut self, node_id: &str, error: &str) -> FailureOutcome {
        let retries = self.retries;
        let Some(task) = self.tasks.get_mut(node_id) else {
            return FailureOutcome::Failed { skipped: vec![] };
        };

        task.last_error = Some(error.to_string());
        task.finished_at = Some(Utc::now());

        if task.attempt < retries {
            task.attempt += 1;
            task.state = TaskState::UpForRetry;
            return FailureOutcome::Retry {
                attempt: task.attempt,
            };
        }

        task.state = TaskState::Failed;

        let mut skipped = Vec::new();
        for id in self.dag.downstream_closure(node_id) {
            if let Some(t) = self.tasks.get_mut(&id) {
                if !t.state.is_terminal() {
                    t.state = TaskState::UpstreamFailed;
                    t.finished_at = Some(Utc::now());
                    skipped.push(id);
                }
            }
        }
        FailureOutcome::Failed { skipped }
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    pub fn status(&self) -> RunStatus {
        if self.is_finished() {
            if self.tasks.values().all(|t| t.state == TaskState::Success) {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            }
        } else if self.tasks.values().all(|t| t.state == TaskState::Pending) {
            RunStatus::Queued
        } else {
            RunStatus::Running
        }
    }

    pub fn count(&self, state: TaskState) -> u32 {
        self.tasks.values().filter(|t| t.state == state).count() as u32
    }

    /// Reintentos consumidos en toda la corrida.
    pub fn retries_used(&self) -> u32 {
        self.tasks.values().map(|t| t.attempt).sum()
    }
}

/// Resumen de una corrida, tal como lo expone la API del master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub trigger: RunTrigger,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub retries: u32,

    pub tasks: Vec<TaskInstance>,
}

impl RunInfo {
    pub fn new(id: RunId, workflow_id: &str, trigger: RunTrigger, state: &RunState) -> Self {
        let mut info = Self {
            id,
            workflow_id: workflow_id.to_string(),
            status: RunStatus::Queued,
            trigger,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_tasks: state.dag().nodes.len() as u32,
            completed_tasks: 0,
            failed_tasks: 0,
            retries: 0,
            tasks: Vec::new(),
        };
        info.refresh(state);
        info
    }

    /// Recalcula estado, métricas y timestamps a partir del `RunState`.
    pub fn refresh(&mut self, state: &RunState) {
        self.status = state.status();
        self.completed_tasks = state.count(TaskState::Success);
        self.failed_tasks = state.count(TaskState::Failed);
        self.retries = state.retries_used();
        self.tasks = state.snapshot();

        if self.started_at.is_none() && self.status != RunStatus::Queued {
            self.started_at = Some(Utc::now());
        }
        if self.finished_at.is_none() && !self.status.is_active() {
            self.finished_at = Some(Utc::now());
        }
    }
}
