use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use tokio::time::sleep;
use tracing::warn;

use crate::state::{AppState, InFlight};

pub const FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - da por fallidas sus tareas en vuelo (el reintento lo decide la corrida)
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(Duration::from_secs(FAILOVER_SWEEP_INTERVAL_SECS)).await;
        sweep_once(&state, SystemTime::now());
    }
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. saca de in_flight las tareas de esos workers
/// 3. las registra como fallas en su corrida
pub fn sweep_once(state: &AppState, now: SystemTime) -> usize {
    // 1) Detectar qué workers están muertos
    let mut newly_dead: HashSet<String> = HashSet::new();
    {
        let mut workers = state.workers.lock().unwrap();
        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            // last_heartbeat en el futuro: se ignora
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                continue;
            };
            if elapsed > state.heartbeat_timeout {
                meta.dead = true;
                newly_dead.insert(worker_id.clone());
                warn!(
                    worker_id = %worker_id,
                    "marcando worker como DEAD (sin heartbeat hace {:?})",
                    elapsed
                );
            }
        }
    }

    if newly_dead.is_empty() {
        return 0;
    }

    // 2) Sacar tareas de in_flight que pertenecían a esos workers
    let mut lost: Vec<InFlight> = Vec::new();
    {
        let mut in_flight = state.in_flight.lock().unwrap();
        in_flight.retain(|_, inflight| {
            if newly_dead.contains(&inflight.worker_id) {
                lost.push(inflight.clone());
                false
            } else {
                true
            }
        });
    }

    // 3) Cada tarea perdida cuenta como un intento fallido
    for inflight in &lost {
        warn!(
            task_id = %inflight.task.id,
            run_id = %inflight.task.run_id,
            node_id = %inflight.task.node_id,
            worker_id = %inflight.worker_id,
            "tarea perdida por caída del worker"
        );
        state.record_task_result(
            &inflight.task,
            Err(format!("worker {} perdido", inflight.worker_id)),
        );
    }

    lost.len()
}
