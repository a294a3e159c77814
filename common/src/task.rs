use serde::{Deserialize, Serialize};

use crate::run::RunId;
use crate::stage::Stage;

pub type TaskId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub run_id: RunId,
    pub node_id: String,
    pub attempt: u32,

    /// Qué tiene que ejecutar el worker para este nodo
    pub stage: Stage,
}
