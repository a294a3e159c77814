use std::time::Duration;

use chrono::{DateTime, Utc};
use ingest_common::RunTrigger;
use tokio::time::sleep;
use tracing::{error, info};

use crate::state::{AppState, StartRunError};

pub const SCHEDULER_TICK_SECS: u64 = 30;

/// Dispara corridas según la recurrencia del workflow.
pub async fn run_scheduler_loop(state: AppState) {
    let mut last_check = Utc::now();
    info!(
        schedule = ?state.workflow.schedule,
        next = ?state.workflow.schedule.next_after(last_check),
        "scheduler iniciado"
    );
    loop {
        sleep(Duration::from_secs(SCHEDULER_TICK_SECS)).await;
        let now = Utc::now();
        tick(&state, last_check, now);
        last_check = now;
    }
}

/// Una pasada: si hubo disparos en `(since, now]`, intenta crear una corrida
/// por cada uno. Devuelve cuántas se crearon.
pub fn tick(state: &AppState, since: DateTime<Utc>, now: DateTime<Utc>) -> usize {
    let wf = &state.workflow;
    let mut created = 0;

    for fire_time in wf.schedule.due_fire_times(since, now, wf.catchup) {
        match state.start_run(RunTrigger::Scheduled) {
            Ok(run) => {
                info!(run_id = %run.id, fire_time = %fire_time, "corrida programada disparada");
                created += 1;
            }
            Err(StartRunError::ActiveRun(active)) => {
                info!(
                    fire_time = %fire_time,
                    active_run = %active,
                    "disparo salteado: ya hay una corrida activa"
                );
            }
            Err(StartRunError::InvalidDag(e)) => {
                error!(fire_time = %fire_time, "no se pudo crear la corrida: {e}");
            }
        }
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn sin_disparo_en_el_intervalo_no_crea_nada() {
        let state = test_state();
        assert_eq!(tick(&state, at(2024, 3, 1), at(2024, 9, 1)), 0);
        assert!(state.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn disparos_perdidos_se_colapsan_en_una_corrida() {
        let state = test_state();
        assert_eq!(tick(&state, at(2020, 6, 1), at(2024, 6, 1)), 1);

        let runs = state.runs.lock().unwrap();
        let run = runs.values().next().unwrap();
        assert_eq!(run.info.trigger, RunTrigger::Scheduled);
    }

    #[test]
    fn con_corrida_activa_el_disparo_se_saltea() {
        let state = test_state();
        state.start_run(RunTrigger::Manual).unwrap();

        assert_eq!(tick(&state, at(2024, 12, 31), at(2025, 1, 2)), 0);
        assert_eq!(state.runs.lock().unwrap().len(), 1);
    }
}
