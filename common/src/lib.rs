//! Tipos y runtime compartidos por master, worker y cliente.

pub mod behavior;
pub mod conf;
pub mod counters;
pub mod dseq;
pub mod dux;
pub mod engine;
pub mod error;
pub mod format;
pub mod graph;
pub mod job;
pub mod join;
pub mod mux;
pub mod record;
pub mod registry;
pub mod results;
pub mod shuffle;
pub mod step;
pub mod task;
pub mod wordcount;
pub mod worker;

/* --------- Reexports de uso frecuente --------- */

pub use behavior::{Behavior, BehaviorFactory};
pub use conf::{keys, JobConf};
pub use counters::{CounterSnapshot, Counters};
pub use dseq::{DSeq, DSink};
pub use engine::{Engine, JobReport, LocalEngine};
pub use error::{MrError, Result};
pub use graph::{GraphResult, Stage};
pub use job::{JobId, JobInfo, JobStatus, JobSubmission};
pub use record::{Shape, ValueKind};
pub use registry::Role;
pub use results::JobResults;
pub use step::Step;
pub use task::{TaskAttemptId, TaskKind, TaskReport, TaskSpec};
pub use worker::*;
