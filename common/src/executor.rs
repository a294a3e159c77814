use std::{collections::HashMap, sync::Arc};

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{DagError, StageError};
use crate::run::{FailureOutcome, RunInfo, RunState, RunTrigger};
use crate::runner::StageRunner;
use crate::stage::StageOutput;
use crate::workflow::WorkflowDefinition;

/// Ejecuta un workflow completo dentro del proceso. Las tareas listas corren
/// en paralelo (cada cadena por archivo avanza por su cuenta) con la misma
/// política de reintentos y propagación de fallas que el master.
pub struct LocalExecutor {
    runner: Arc<dyn StageRunner>,
}

impl LocalExecutor {
    pub fn new(runner: Arc<dyn StageRunner>) -> Self {
        Self { runner }
    }

    pub async fn execute(&self, workflow: &WorkflowDefinition) -> Result<RunInfo, DagError> {
        let mut state = RunState::new(workflow.dag.clone(), workflow.default_args.retries)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut info = RunInfo::new(run_id.clone(), &workflow.id, RunTrigger::Manual, &state);

        info!(run_id = %run_id, workflow = %workflow.id, "corrida local iniciada");

        let mut in_flight = JoinSet::new();
        let mut spawned = HashMap::new();
        loop {
            for (node_id, attempt) in state.take_ready() {
                let Some(node) = state.dag().node(&node_id) else {
                    continue;
                };
                let stage = node.stage.clone();
                state.mark_running(&node_id);

                info!(run_id = %run_id, node_id = %node_id, attempt, op = stage.op_name(), "ejecutando tarea");
                let runner = self.runner.clone();
                let handle = in_flight.spawn(async move { runner.run(&stage).await });
                spawned.insert(handle.id(), node_id);
            }
            info.refresh(&state);

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };

            let (node_id, result) = match joined {
                Ok((id, result)) => (spawned.remove(&id).unwrap_or_default(), result),
                Err(e) => {
                    let node_id = spawned.remove(&e.id()).unwrap_or_default();
                    (node_id, Err(StageError::Runtime(format!("panic o join error: {e}"))))
                }
            };

            match result {
                Ok(output) => {
                    log_output(&node_id, &output);
                    state.record_success(&node_id);
                }
                Err(e) => match state.record_failure(&node_id, &e.to_string()) {
                    FailureOutcome::Retry { attempt } => {
                        warn!(run_id = %run_id, node_id = %node_id, attempt, "tarea falló, se reintenta: {e}");
                    }
                    FailureOutcome::Failed { skipped } => {
                        error!(
                            run_id = %run_id,
                            node_id = %node_id,
                            skipped = ?skipped,
                            "tarea falló sin más reintentos: {e}"
                        );
                    }
                },
            }
        }

        info.refresh(&state);
        info!(run_id = %run_id, status = ?info.status, "corrida local terminada");
        Ok(info)
    }
}

fn log_output(node_id: &str, output: &StageOutput) {
    match output {
        StageOutput::Fetched { path, bytes } => {
            info!(node_id, path = %path.display(), bytes, "fetch ok")
        }
        StageOutput::Unpacked { dest_dir, entries } => {
            info!(node_id, dest = %dest_dir.display(), entries, "unpack ok")
        }
        StageOutput::Converted(outcome) => info!(node_id, outcome = ?outcome, "convert ok"),
        StageOutput::Uploaded { uri, bytes, parts } => {
            info!(node_id, uri = %uri, bytes, parts, "upload ok")
        }
        StageOutput::Declared { table, .. } => info!(node_id, table = %table, "declare ok"),
    }
}
