// master/src/state.rs

use ingest_common::{
    DagError, FailureOutcome, RunId, RunInfo, RunState, RunTrigger, Task, TaskId,
    WorkerId, WorkflowDefinition,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{error, info, warn};

/// Una corrida: resumen expuesto por la API + máquina de estados de tareas.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub info: RunInfo,
    pub state: RunState,
}

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<WorkflowDefinition>,
    pub runs: Arc<Mutex<HashMap<RunId, RunRecord>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas pendientes de asignar
    pub tasks_queue: Arc<Mutex<VecDeque<Task>>>,
    // tareas ya asignadas pero no completadas
    pub in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
    pub heartbeat_timeout: Duration,
}

#[derive(Debug)]
pub enum StartRunError {
    /// Ya hay `max_active_runs` corridas activas.
    ActiveRun(RunId),
    InvalidDag(DagError),
}

impl AppState {
    pub fn new(workflow: WorkflowDefinition, heartbeat_timeout: Duration) -> Self {
        Self {
            workflow: Arc::new(workflow),
            runs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            tasks_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            heartbeat_timeout,
        }
    }

    /// Id de alguna corrida todavía activa, si la hay.
    pub fn active_run(&self) -> Option<RunId> {
        let runs = self.runs.lock().unwrap();
        runs.values()
            .find(|r| r.info.status.is_active())
            .map(|r| r.info.id.clone())
    }

    /// Crea una corrida nueva y encola sus tareas raíz.
    pub fn start_run(&self, trigger: RunTrigger) -> Result<RunInfo, StartRunError> {
        let wf = &self.workflow;
        let mut runs = self.runs.lock().unwrap();

        let active: Vec<&RunRecord> = runs
            .values()
            .filter(|r| r.info.status.is_active())
            .collect();
        if active.len() as u32 >= wf.max_active_runs {
            let id = active
                .first()
                .map(|r| r.info.id.clone())
                .unwrap_or_default();
            return Err(StartRunError::ActiveRun(id));
        }

        let state = RunState::new(wf.dag.clone(), wf.default_args.retries)
            .map_err(StartRunError::InvalidDag)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut record = RunRecord {
            info: RunInfo::new(run_id.clone(), &wf.id, trigger, &state),
            state,
        };

        {
            let mut queue = self.tasks_queue.lock().unwrap();
            enqueue_ready(&run_id, &mut record, &mut queue);
        }

        info!(
            run_id = %run_id,
            trigger = ?trigger,
            tasks = record.info.total_tasks,
            "corrida creada"
        );
        let info = record.info.clone();
        runs.insert(run_id, record);
        Ok(info)
    }

    /// Marca en la corrida que un worker tomó la tarea.
    pub fn mark_task_running(&self, task: &Task) {
        let mut runs = self.runs.lock().unwrap();
        if let Some(record) = runs.get_mut(&task.run_id) {
            record.state.mark_running(&task.node_id);
            record.info.refresh(&record.state);
        }
    }

    /// Aplica el resultado de una tarea a su corrida: éxito, reintento o
    /// falla definitiva con propagación. Encola lo que quede listo.
    pub fn record_task_result(&self, task: &Task, result: Result<(), String>) {
        let mut runs = self.runs.lock().unwrap();
        let Some(record) = runs.get_mut(&task.run_id) else {
            warn!(run_id = %task.run_id, task_id = %task.id, "resultado para corrida desconocida");
            return;
        };

        match result {
            Ok(()) => {
                record.state.record_success(&task.node_id);
                info!(
                    run_id = %task.run_id,
                    node_id = %task.node_id,
                    attempt = task.attempt,
                    "tarea ok"
                );
            }
            Err(msg) => match record.state.record_failure(&task.node_id, &msg) {
                FailureOutcome::Retry { attempt } => {
                    warn!(
                        run_id = %task.run_id,
                        node_id = %task.node_id,
                        attempt,
                        "tarea falló, se reintenta: {msg}"
                    );
                }
                FailureOutcome::Failed { skipped } => {
                    error!(
                        run_id = %task.run_id,
                        node_id = %task.node_id,
                        skipped = ?skipped,
                        "tarea falló sin más reintentos: {msg}"
                    );
                }
            },
        }

        {
            let mut queue = self.tasks_queue.lock().unwrap();
            enqueue_ready(&task.run_id, record, &mut queue);
        }

        if !record.info.status.is_active() {
            info!(
                run_id = %task.run_id,
                status = ?record.info.status,
                completed = record.info.completed_tasks,
                failed = record.info.failed_tasks,
                "corrida terminada"
            );
        }
    }
}

/// Pasa a la cola global todo lo que el `RunState` considera listo.
fn enqueue_ready(run_id: &str, record: &mut RunRecord, queue: &mut VecDeque<Task>) {
    for (node_id, attempt) in record.state.take_ready() {
        let Some(node) = record.state.dag().node(&node_id) else {
            continue;
        };
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id,
            attempt,
            stage: node.stage.clone(),
        };
        info!(
            run_id,
            task_id = %task.id,
            node_id = %task.node_id,
            attempt,
            op = task.stage.op_name(),
            "tarea encolada"
        );
        queue.push_back(task);
    }
    record.info.refresh(&record.state);
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: Task,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ingest_common::{
        config::{DatasetSource, UploadSettings},
        ingestion_workflow, IngestConfig, RunStatus, TaskState,
    };
    use std::path::PathBuf;

    pub(crate) fn test_state() -> AppState {
        let cfg = IngestConfig {
            project_id: "proj".into(),
            bucket: "bucket".into(),
            bigquery_dataset: "movielens_25m".into(),
            home: PathBuf::from("/tmp/ingest"),
            dataset: DatasetSource::default(),
            upload: UploadSettings::default(),
            strict_convert: false,
        };
        AppState::new(ingestion_workflow(&cfg), Duration::from_secs(20))
    }

    fn pop(state: &AppState) -> Task {
        state.tasks_queue.lock().unwrap().pop_front().unwrap()
    }

    #[test]
    fn start_run_encola_solo_el_fetch() {
        let state = test_state();
        let info = state.start_run(RunTrigger::Manual).unwrap();

        assert_eq!(info.status, RunStatus::Running);
        let queue = state.tasks_queue.lock().unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].node_id, "fetch_dataset");
        assert_eq!(queue[0].run_id, info.id);
    }

    #[test]
    fn start_run_respeta_max_active_runs() {
        let state = test_state();
        let first = state.start_run(RunTrigger::Manual).unwrap();

        match state.start_run(RunTrigger::Scheduled) {
            Err(StartRunError::ActiveRun(id)) => assert_eq!(id, first.id),
            other => panic!("esperaba ActiveRun, obtuve {other:?}"),
        }
        assert_eq!(state.active_run(), Some(first.id));
    }

    #[test]
    fn resultado_ok_libera_las_tareas_siguientes() {
        let state = test_state();
        state.start_run(RunTrigger::Manual).unwrap();

        let fetch = pop(&state);
        state.mark_task_running(&fetch);
        state.record_task_result(&fetch, Ok(()));
        let unpack = pop(&state);
        assert_eq!(unpack.node_id, "unpack_dataset");

        state.record_task_result(&unpack, Ok(()));
        let converts: Vec<String> = state
            .tasks_queue
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.node_id.clone())
            .collect();
        assert_eq!(
            converts,
            vec!["convert_movies", "convert_tags", "convert_ratings"]
        );
    }

    #[test]
    fn falla_reencola_con_attempt_siguiente_y_despues_falla_la_corrida() {
        let state = test_state();
        let info = state.start_run(RunTrigger::Manual).unwrap();

        let fetch = pop(&state);
        state.record_task_result(&fetch, Err("timeout".into()));
        let retry = pop(&state);
        assert_eq!(retry.node_id, "fetch_dataset");
        assert_eq!(retry.attempt, 1);
        assert_ne!(retry.id, fetch.id);

        state.record_task_result(&retry, Err("timeout".into()));
        assert!(state.tasks_queue.lock().unwrap().is_empty());

        let runs = state.runs.lock().unwrap();
        let record = &runs[&info.id];
        assert_eq!(record.info.status, RunStatus::Failed);
        assert_eq!(record.info.failed_tasks, 1);
        assert_eq!(
            record.state.task("fetch_dataset").unwrap().last_error.as_deref(),
            Some("timeout")
        );
        assert_eq!(
            record.state.task("declare_table_ratings").unwrap().state,
            TaskState::UpstreamFailed
        );
        assert!(record.info.finished_at.is_some());
    }
}
