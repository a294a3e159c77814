pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod run;
pub mod runner;
pub mod schedule;
pub mod stage;
pub mod stages;
pub mod task;
pub mod worker;
pub mod workflow;

pub use config::{IngestConfig, UploadSettings};
pub use dag::{Dag, DagNode};
pub use error::{ConfigError, DagError, StageError};
pub use run::{
    FailureOutcome, RunId, RunInfo, RunState, RunStatus, RunTrigger, TaskInstance, TaskState,
};
pub use stage::{Stage, StageOutput};
pub use task::{Task, TaskId};
pub use worker::*;
pub use workflow::{ingestion_workflow, ingestion_workflow_with_uris, WorkflowDefinition};
