use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use ingest_common::{
    RunInfo, RunTrigger, TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest,
    TaskCompleteResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId,
    WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse, WorkflowDefinition,
};
use std::collections::HashMap;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::state::{AppState, InFlight, StartRunError, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/workflow", get(get_workflow))
        .route("/api/v1/runs", post(trigger_run).get(list_runs))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn get_workflow(State(state): State<AppState>) -> Json<WorkflowDefinition> {
    Json(state.workflow.as_ref().clone())
}

// Disparo manual de una corrida
async fn trigger_run(State(state): State<AppState>) -> Result<Json<RunInfo>, StatusCode> {
    match state.start_run(RunTrigger::Manual) {
        Ok(info) => Ok(Json(info)),
        Err(StartRunError::ActiveRun(id)) => {
            warn!(active_run = %id, "disparo rechazado: ya hay una corrida activa");
            Err(StatusCode::CONFLICT)
        }
        Err(StartRunError::InvalidDag(e)) => {
            error!("grafo inválido: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunInfo>> {
    let runs = state.runs.lock().unwrap();
    let mut out: Vec<RunInfo> = runs.values().map(|r| r.info.clone()).collect();
    out.sort_by_key(|r| r.submitted_at);
    Json(out)
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunInfo>, StatusCode> {
    let runs = state.runs.lock().unwrap();

    if let Some(record) = runs.get(&id) {
        Ok(Json(record.info.clone()))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    {
        let mut workers = state.workers.lock().unwrap();
        workers.insert(
            worker_id.clone(),
            WorkerMeta::new(req.hostname.clone(), req.max_concurrency.max(1)),
        );
    }

    info!(
        worker_id = %worker_id,
        hostname = %req.hostname,
        max_concurrency = req.max_concurrency,
        "worker registrado"
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = state.workers.lock().unwrap();
    if let Some(meta) = workers.get_mut(&req.worker_id) {
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = Some(req.cpu_percent);
        meta.last_mem_bytes = Some(req.mem_bytes);
        if meta.dead {
            // volvió después de que el failover lo diera por muerto
            info!(worker_id = %req.worker_id, "worker revivido");
            meta.dead = false;
        }
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Asigna la siguiente tarea en cola (si hay)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, StatusCode> {
    // 1) Capacidad máxima de este worker (max_concurrency)
    let max_for_worker: u32 = {
        let workers = state.workers.lock().unwrap();
        match workers.get(&req.worker_id) {
            Some(meta) if !meta.dead => meta.max_concurrency,
            Some(_) => return Ok(Json(TaskAssignmentResponse { task: None })),
            None => return Err(StatusCode::NOT_FOUND),
        }
    };

    // 2) Cuántas tareas tiene ya este worker en vuelo
    let active_for_worker = {
        let in_flight = state.in_flight.lock().unwrap();
        in_flight
            .values()
            .filter(|entry| entry.worker_id == req.worker_id)
            .count() as u32
    };

    // Si ya está al tope, no le damos más tareas
    if active_for_worker >= max_for_worker {
        debug!(
            worker_id = %req.worker_id,
            "worker pidió tarea pero ya tiene {}/{} en vuelo",
            active_for_worker, max_for_worker
        );
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    // 3) Sacar la siguiente tarea de la cola global
    let task_opt = {
        let mut queue = state.tasks_queue.lock().unwrap();
        queue.pop_front()
    };

    if let Some(ref t) = task_opt {
        info!(
            task_id = %t.id,
            run_id = %t.run_id,
            node_id = %t.node_id,
            attempt = t.attempt,
            worker_id = %req.worker_id,
            "asignando tarea ({}/{} en vuelo -> +1)",
            active_for_worker, max_for_worker,
        );

        // 4) Registrar la tarea en in_flight con timestamp de inicio
        {
            let mut in_flight = state.in_flight.lock().unwrap();
            in_flight.insert(
                t.id.clone(),
                InFlight {
                    task: t.clone(),
                    worker_id: req.worker_id.clone(),
                    started_at: SystemTime::now(),
                },
            );
        }

        // 5) La corrida ve la tarea como running
        state.mark_task_running(t);

        // 6) Métricas del worker: incrementar tareas iniciadas
        {
            let mut workers = state.workers.lock().unwrap();
            if let Some(meta) = workers.get_mut(&req.worker_id) {
                meta.tasks_started += 1;
            }
        }
    }

    Ok(Json(TaskAssignmentResponse { task: task_opt }))
}

// Worker reporta que terminó una tarea
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    // Sacar la tarea de in_flight. Si no está, el failover ya la dio por
    // perdida (o nunca existió).
    let inflight = {
        let mut in_flight = state.in_flight.lock().unwrap();
        in_flight.remove(&req.task_id)
    }
    .ok_or(StatusCode::NOT_FOUND)?;

    // ---- Métricas de worker: duración de la tarea ----
    let duration_ms: u64 = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    {
        let mut workers = state.workers.lock().unwrap();
        if let Some(meta) = workers.get_mut(&inflight.worker_id) {
            meta.total_task_time_ms += duration_ms;
            if req.success {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
    }

    let result = if req.success {
        Ok(())
    } else {
        Err(req
            .error
            .unwrap_or_else(|| "el worker no informó el error".to_string()))
    };
    state.record_task_result(&inflight.task, result);

    Ok(Json(TaskCompleteResponse { ok: true }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar tareas activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    {
        let in_flight = state.in_flight.lock().unwrap();
        for inf in in_flight.values() {
            *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
        }
    }

    let workers = state.workers.lock().unwrap();
    let mut out: Vec<WorkerMetrics> = workers
        .iter()
        .map(|(wid, meta)| {
            let finished = meta.tasks_succeeded + meta.tasks_failed;
            WorkerMetrics {
                worker_id: wid.clone(),
                hostname: meta.hostname.clone(),
                dead: meta.dead,
                max_concurrency: meta.max_concurrency,
                last_heartbeat_secs_ago: now
                    .duration_since(meta.last_heartbeat)
                    .unwrap_or_default()
                    .as_secs(),
                active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
                tasks_started: meta.tasks_started,
                tasks_succeeded: meta.tasks_succeeded,
                tasks_failed: meta.tasks_failed,
                avg_task_ms: (finished > 0)
                    .then(|| meta.total_task_time_ms as f64 / finished as f64),
                last_cpu_percent: meta.last_cpu_percent,
                last_mem_bytes: meta.last_mem_bytes,
            }
        })
        .collect();
    out.sort_by(|a, b| a.hostname.cmp(&b.hostname));

    Json(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use ingest_common::RunStatus;
    use serde::{de::DeserializeOwned, Serialize};
    use tower::ServiceExt;

    async fn call<B: Serialize, T: DeserializeOwned>(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<&B>,
    ) -> (StatusCode, Option<T>) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let req = match body {
            Some(b) => req.body(Body::from(serde_json::to_vec(b).unwrap())),
            None => req.body(Body::empty()),
        }
        .unwrap();

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).ok())
    }

    async fn register(app: &Router, max: u32) -> String {
        let (_, resp): (_, Option<WorkerRegisterResponse>) = call(
            app,
            Method::POST,
            "/api/v1/workers/register",
            Some(&WorkerRegisterRequest {
                hostname: "w1".into(),
                max_concurrency: max,
            }),
        )
        .await;
        resp.unwrap().worker_id
    }

    async fn next_task(app: &Router, worker_id: &str) -> TaskAssignmentResponse {
        let (_, resp) = call(
            app,
            Method::POST,
            "/api/v1/tasks/next",
            Some(&TaskAssignmentRequest {
                worker_id: worker_id.to_string(),
            }),
        )
        .await;
        resp.unwrap()
    }

    async fn complete(app: &Router, task_id: &str, error: Option<&str>) -> StatusCode {
        let (status, _): (_, Option<TaskCompleteResponse>) = call(
            app,
            Method::POST,
            "/api/v1/tasks/complete",
            Some(&TaskCompleteRequest {
                task_id: task_id.to_string(),
                success: error.is_none(),
                error: error.map(str::to_string),
            }),
        )
        .await;
        status
    }

    #[tokio::test]
    async fn trigger_dos_veces_devuelve_conflicto() {
        let app = build_router(test_state());

        let (status, run): (_, Option<RunInfo>) =
            call::<(), _>(&app, Method::POST, "/api/v1/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run.unwrap().total_tasks, 11);

        let (status, _): (_, Option<RunInfo>) =
            call::<(), _>(&app, Method::POST, "/api/v1/runs", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn run_desconocida_es_404() {
        let app = build_router(test_state());
        let (status, _): (_, Option<RunInfo>) =
            call::<(), _>(&app, Method::GET, "/api/v1/runs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn workflow_expone_el_grafo() {
        let app = build_router(test_state());
        let (status, wf): (_, Option<WorkflowDefinition>) =
            call::<(), _>(&app, Method::GET, "/api/v1/workflow", None).await;
        assert_eq!(status, StatusCode::OK);
        let wf = wf.unwrap();
        assert_eq!(wf.id, "movielens_ingestion");
        assert_eq!(wf.dag.nodes.len(), 11);
        assert!(!wf.catchup);
    }

    #[tokio::test]
    async fn worker_desconocido_no_recibe_tareas() {
        let app = build_router(test_state());
        let (status, _): (_, Option<TaskAssignmentResponse>) = call(
            &app,
            Method::POST,
            "/api/v1/tasks/next",
            Some(&TaskAssignmentRequest {
                worker_id: "fantasma".into(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ciclo_completo_de_una_tarea_con_reintento() {
        let state = test_state();
        let app = build_router(state.clone());
        let worker = register(&app, 1).await;
        let (_, run): (_, Option<RunInfo>) =
            call::<(), _>(&app, Method::POST, "/api/v1/runs", None).await;
        let run = run.unwrap();

        let fetch = next_task(&app, &worker).await.task.unwrap();
        assert_eq!(fetch.node_id, "fetch_dataset");

        // con max_concurrency=1 no hay segunda tarea mientras la primera vuela
        assert!(next_task(&app, &worker).await.task.is_none());

        assert_eq!(complete(&app, &fetch.id, Some("503")).await, StatusCode::OK);
        // completar dos veces la misma tarea es 404
        assert_eq!(complete(&app, &fetch.id, None).await, StatusCode::NOT_FOUND);

        let retry = next_task(&app, &worker).await.task.unwrap();
        assert_eq!(retry.node_id, "fetch_dataset");
        assert_eq!(retry.attempt, 1);
        assert_eq!(complete(&app, &retry.id, None).await, StatusCode::OK);

        let unpack = next_task(&app, &worker).await.task.unwrap();
        assert_eq!(unpack.node_id, "unpack_dataset");

        let (_, info): (_, Option<RunInfo>) =
            call::<(), _>(&app, Method::GET, &format!("/api/v1/runs/{}", run.id), None).await;
        let info = info.unwrap();
        assert_eq!(info.status, RunStatus::Running);
        assert_eq!(info.completed_tasks, 1);
        assert_eq!(info.retries, 1);

        let (_, workers): (_, Option<Vec<WorkerMetrics>>) =
            call::<(), _>(&app, Method::GET, "/api/v1/workers", None).await;
        let w = &workers.unwrap()[0];
        assert_eq!(w.tasks_started, 3);
        assert_eq!(w.tasks_succeeded, 1);
        assert_eq!(w.tasks_failed, 1);
        assert_eq!(w.active_tasks, 1);
    }

    #[tokio::test]
    async fn heartbeat_guarda_metricas_del_worker() {
        let state = test_state();
        let app = build_router(state.clone());
        let worker = register(&app, 2).await;

        let (status, _): (_, Option<WorkerHeartbeatResponse>) = call(
            &app,
            Method::POST,
            "/api/v1/workers/heartbeat",
            Some(&WorkerHeartbeatRequest {
                worker_id: worker.clone(),
                cpu_percent: 12.5,
                mem_bytes: 1024,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let workers = state.workers.lock().unwrap();
        assert_eq!(workers[&worker].last_cpu_percent, Some(12.5));
        assert_eq!(workers[&worker].last_mem_bytes, Some(1024));
    }
}
