use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Recurrencia del workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// `@yearly`: 1 de enero, 00:00 UTC.
    Yearly,
    /// Sólo corridas disparadas a mano.
    Manual,
}

impl Schedule {
    /// Primer disparo estrictamente posterior a `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Yearly => Utc.with_ymd_and_hms(t.year() + 1, 1, 1, 0, 0, 0).single(),
            Schedule::Manual => None,
        }
    }

    /// Disparos en el intervalo `(since, now]`. Sin catchup sólo se devuelve
    /// el más reciente: los disparos perdidos no se recuperan.
    pub fn due_fire_times(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        catchup: bool,
    ) -> Vec<DateTime<Utc>> {
        let mut due = Vec::new();
        let mut cursor = since;
        while let Some(next) = self.next_after(cursor) {
            if next > now {
                break;
            }
            due.push(next);
            cursor = next;
        }

        if !catchup && due.len() > 1 {
            due.drain(..due.len() - 1);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn jan1(y: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn yearly_next_after_es_el_proximo_1_de_enero() {
        assert_eq!(Schedule::Yearly.next_after(at(2024, 6, 15)), Some(jan1(2025)));
        // justo en el disparo: el siguiente es el del año que viene
        assert_eq!(Schedule::Yearly.next_after(jan1(2025)), Some(jan1(2026)));
        assert_eq!(Schedule::Manual.next_after(at(2024, 6, 15)), None);
    }

    #[test]
    fn due_fire_times_sin_catchup_colapsa_en_uno() {
        let due = Schedule::Yearly.due_fire_times(at(2021, 3, 1), at(2024, 2, 1), false);
        assert_eq!(due, vec![jan1(2024)]);
    }

    #[test]
    fn due_fire_times_con_catchup_devuelve_todos() {
        let due = Schedule::Yearly.due_fire_times(at(2021, 3, 1), at(2024, 2, 1), true);
        assert_eq!(due, vec![jan1(2022), jan1(2023), jan1(2024)]);
    }

    #[test]
    fn due_fire_times_vacio_si_no_toca() {
        assert!(Schedule::Yearly
            .due_fire_times(at(2024, 3, 1), at(2024, 12, 31), false)
            .is_empty());
        assert!(Schedule::Manual
            .due_fire_times(at(2000, 1, 2), at(2024, 12, 31), true)
            .is_empty());
    }
}
