use anyhow::{Context, Result};
use ingest_common::{
    runner::StageRunner, StageOutput, Task, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::Client;
use std::{env, sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WORKER_CONCURRENCY: u32 = 3;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub base_url: String,
    pub hostname: String,
    pub max_concurrency: u32,
}

impl WorkerSettings {
    pub fn from_env(base_url: String) -> Result<Self> {
        let max_concurrency = match env::var("WORKER_CONCURRENCY") {
            Ok(v) => v
                .parse::<u32>()
                .with_context(|| format!("WORKER_CONCURRENCY inválido: {v}"))?
                .max(1),
            Err(_) => DEFAULT_WORKER_CONCURRENCY,
        };

        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        Ok(Self {
            base_url,
            hostname,
            max_concurrency,
        })
    }
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide tareas mientras tenga "slots" libres.
/// - Ejecuta cada tarea en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run(settings: WorkerSettings, runner: Arc<dyn StageRunner>) -> Result<()> {
    let client = Client::new();
    let base_url = settings.base_url.clone();

    // Registro de worker (enviando max_concurrency)
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let WorkerRegisterResponse { worker_id } = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname: settings.hostname.clone(),
            max_concurrency: settings.max_concurrency,
        })
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("registro contra {register_url}"))?
        .json::<WorkerRegisterResponse>()
        .await?;

    info!(
        worker_id = %worker_id,
        concurrency = settings.max_concurrency,
        "worker registrado contra {}",
        base_url
    );

    tokio::spawn(heartbeat_loop(
        client.clone(),
        base_url.clone(),
        worker_id.clone(),
    ));

    let sem = Arc::new(Semaphore::new(settings.max_concurrency as usize));

    loop {
        // --------- Control de concurrencia local ---------
        let permit = sem.clone().acquire_owned().await?;

        // Pedimos tarea al master
        let task = match request_task(&client, &base_url, &worker_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!("no se pudo pedir tarea al master: {e:#}");
                drop(permit);
                sleep(IDLE_WAIT).await;
                continue;
            }
        };

        let Some(task) = task else {
            // No hay tarea: devolvemos el permiso y dormimos
            drop(permit);
            debug!(worker_id = %worker_id, "no hay tareas en cola");
            sleep(IDLE_WAIT).await;
            continue;
        };

        info!(
            task_id = %task.id,
            run_id = %task.run_id,
            node_id = %task.node_id,
            attempt = task.attempt,
            op = task.stage.op_name(),
            "tengo tarea"
        );

        let client = client.clone();
        let base_url = base_url.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            let report = execute_task(runner.as_ref(), &task).await;

            // Reportar al master que terminamos
            let complete_url = format!("{}/api/v1/tasks/complete", base_url);
            let sent = client
                .post(&complete_url)
                .json(&report)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = sent {
                error!(task_id = %task.id, "no se pudo reportar la tarea: {e}");
            }

            // Liberar el "slot" de concurrencia al terminar
            drop(permit);
        });
    }
}

async fn request_task(client: &Client, base_url: &str, worker_id: &WorkerId) -> Result<Option<Task>> {
    let assign_url = format!("{}/api/v1/tasks/next", base_url);
    let assignment: TaskAssignmentResponse = client
        .post(&assign_url)
        .json(&TaskAssignmentRequest {
            worker_id: worker_id.clone(),
        })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(assignment.task)
}

/// Corre el stage de la tarea y arma el reporte para el master.
pub async fn execute_task(runner: &dyn StageRunner, task: &Task) -> TaskCompleteRequest {
    match runner.run(&task.stage).await {
        Ok(output) => {
            log_output(task, &output);
            TaskCompleteRequest {
                task_id: task.id.clone(),
                success: true,
                error: None,
            }
        }
        Err(e) => {
            warn!(task_id = %task.id, node_id = %task.node_id, "error procesando tarea: {e}");
            TaskCompleteRequest {
                task_id: task.id.clone(),
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

fn log_output(task: &Task, output: &StageOutput) {
    let node_id = task.node_id.as_str();
    match output {
        StageOutput::Fetched { bytes, .. } => info!(node_id, bytes, "terminé tarea"),
        StageOutput::Unpacked { entries, .. } => info!(node_id, entries, "terminé tarea"),
        StageOutput::Converted(outcome) => info!(node_id, outcome = ?outcome, "terminé tarea"),
        StageOutput::Uploaded { uri, parts, .. } => {
            info!(node_id, uri = %uri, parts, "terminé tarea")
        }
        StageOutput::Declared { table, .. } => info!(node_id, table = %table, "terminé tarea"),
    }
}

/// Heartbeat al master con CPU/MEM.
async fn heartbeat_loop(client: Client, base_url: String, worker_id: WorkerId) {
    let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        let mem_bytes = sys.used_memory();

        let res = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent,
                mem_bytes,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = res {
            warn!(worker_id = %worker_id, "heartbeat falló: {e}");
        }

        sleep(HEARTBEAT_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_common::{
        runner::CloudStageRunner,
        stages::{storage::BucketStore, warehouse::InMemoryWarehouse},
        Stage, UploadSettings,
    };

    fn runner() -> CloudStageRunner {
        CloudStageRunner::new(
            BucketStore::in_memory("bucket"),
            Arc::new(InMemoryWarehouse::new()),
            UploadSettings::default(),
            false,
        )
    }

    fn task(stage: Stage) -> Task {
        Task {
            id: "t1".into(),
            run_id: "r1".into(),
            node_id: "upload_ratings".into(),
            attempt: 0,
            stage,
        }
    }

    #[tokio::test]
    async fn tarea_ok_se_reporta_como_exito() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("ratings.parquet");
        std::fs::write(&local, b"PAR1").unwrap();

        let report = execute_task(
            &runner(),
            &task(Stage::Upload {
                bucket: "bucket".into(),
                object_name: "raw/ratings.parquet".into(),
                local_file: local,
            }),
        )
        .await;

        assert!(report.success);
        assert_eq!(report.task_id, "t1");
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn tarea_fallida_reporta_el_error() {
        let tmp = tempfile::tempdir().unwrap();

        let report = execute_task(
            &runner(),
            &task(Stage::Upload {
                bucket: "bucket".into(),
                object_name: "raw/ratings.parquet".into(),
                local_file: tmp.path().join("ratings.parquet"),
            }),
        )
        .await;

        assert!(!report.success);
        let msg = report.error.unwrap();
        assert!(msg.contains("ratings.parquet"), "{msg}");
    }
}
