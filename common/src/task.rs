//! Ejecución de una tarea aislada.
//!
//! Una tarea recibe la configuración del job como texto, la parsea una sola
//! vez, resuelve su slot por nombre de clase y ejecuta el behavior.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::behavior::Behavior;
use crate::conf::JobConf;
use crate::counters::{CounterSnapshot, Counters};
use crate::error::{MrError, Result};
use crate::format::{input_format, output_format, InputSplit, RecordWriter, TaskAttemptContext};
use crate::mux;
use crate::record::{Records, Shape, TaskRecords};
use crate::registry::{self, Role};
use crate::shuffle::{group_sorted, map_output_dir, read_partition, ShuffleWriter};

/// Grupo de contadores propios de cada tarea.
pub const TASK_GROUP: &str = "Task Counters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Map,
    Reduce,
}

impl TaskKind {
    /// Letra usada en nombres de archivo e ids de intento.
    pub fn code(&self) -> char {
        match self {
            TaskKind::Map => 'm',
            TaskKind::Reduce => 'r',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Map => "map",
            TaskKind::Reduce => "reduce",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskAttemptId {
    pub job_id: String,
    pub kind: TaskKind,
    pub partition: usize,
    pub attempt: u32,
}

impl TaskAttemptId {
    pub fn new(job_id: impl Into<String>, kind: TaskKind, partition: usize, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            partition,
            attempt,
        }
    }

    /// Mismo trabajo, siguiente intento.
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

impl fmt::Display for TaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt_{}_{}_{:06}_{}",
            self.job_id,
            self.kind.code(),
            self.partition,
            self.attempt
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInput {
    /// Tarea map: un split del formato de entrada.
    Split(InputSplit),
    /// Tarea reduce: los archivos de su partición, uno por map.
    Shuffle { files: Vec<PathBuf> },
}

/// Todo lo que un proceso de tarea necesita para correr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub attempt: TaskAttemptId,
    /// Configuración del job en texto JSON.
    pub conf: String,
    pub input: TaskInput,
    pub reduces: usize,
    pub shuffle_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub counters: CounterSnapshot,
}

/// Lo que ve un behavior mientras corre.
pub struct TaskContext {
    attempt_ctx: TaskAttemptContext,
    input: Option<TaskRecords>,
    output: Box<dyn RecordWriter>,
}

impl TaskContext {
    pub fn new(
        attempt_ctx: TaskAttemptContext,
        input: TaskRecords,
        output: Box<dyn RecordWriter>,
    ) -> Self {
        Self {
            attempt_ctx,
            input: Some(input),
            output,
        }
    }

    pub fn conf(&self) -> &JobConf {
        &self.attempt_ctx.conf
    }

    pub fn attempt(&self) -> &TaskAttemptId {
        &self.attempt_ctx.attempt
    }

    pub fn counters(&self) -> &Counters {
        &self.attempt_ctx.counters
    }

    pub fn attempt_context(&self) -> &TaskAttemptContext {
        &self.attempt_ctx
    }

    /// Entrada de la tarea tal como llegó (pares o grupos). Sólo se entrega una vez.
    pub fn take_records(&mut self) -> Result<TaskRecords> {
        self.input
            .take()
            .ok_or_else(|| MrError::conf("la entrada de la tarea ya fue consumida"))
    }

    /// Entrada de la tarea presentada con la forma pedida.
    pub fn take_input(&mut self, shape: Shape) -> Result<Records> {
        let input = self.take_records()?;
        shape.shape(input)
    }

    pub fn write(&mut self, key: &Value, value: &Value) -> Result<()> {
        self.output.write(key, value)?;
        let name = format!("{}_output_records", self.attempt().kind.as_str());
        self.counters().counter(TASK_GROUP, &name).increment(1);
        Ok(())
    }

    /// Writer de salida de la tarea; con salida dux permite `as_dux()`.
    pub fn output(&self) -> &dyn RecordWriter {
        self.output.as_ref()
    }

    fn close(&mut self) -> Result<()> {
        self.output.close(&self.attempt_ctx)
    }
}

/// Punto de entrada de todo proceso de tarea.
pub fn run_task(spec: &TaskSpec) -> Result<TaskReport> {
    let conf = JobConf::from_json(&spec.conf)?;
    debug!("tarea {} iniciando", spec.attempt);

    match &spec.input {
        TaskInput::Split(split) => run_map(spec, conf, split),
        TaskInput::Shuffle { files } => run_reduce(spec, conf, files),
    }
}

fn run_map(spec: &TaskSpec, job_conf: JobConf, split: &InputSplit) -> Result<TaskReport> {
    let conf = match &split.branch {
        Some(diff) => mux::branch_conf(&job_conf, diff),
        None => job_conf,
    };
    let counters = Counters::new();
    let ctx = TaskAttemptContext {
        conf,
        attempt: spec.attempt.clone(),
        counters: counters.clone(),
    };

    let pairs = input_format(&ctx.conf)?.read(split, &ctx.conf)?;
    counters
        .counter(TASK_GROUP, "map_input_records")
        .increment(pairs.len() as u64);

    let mapper = bind(&ctx.conf, Role::Map)?;
    let output: Box<dyn RecordWriter> = if spec.reduces == 0 {
        output_format(&ctx.conf)?.record_writer(&ctx)?
    } else {
        let partitioner = match bind(&ctx.conf, Role::Partition)? {
            Some(Behavior::Partition(f)) => Some(f),
            Some(other) => {
                return Err(MrError::conf(format!(
                    "el particionador es un behavior {}",
                    other.kind()
                )))
            }
            None => None,
        };
        let combiner = bind(&ctx.conf, Role::Combine)?;
        Box::new(ShuffleWriter::new(
            map_output_dir(&spec.shuffle_dir, spec.attempt.partition),
            spec.reduces,
            partitioner,
            combiner,
            counters.clone(),
        )?)
    };

    let mut task = TaskContext::new(ctx, TaskRecords::Pairs(pairs), output);
    drive(mapper.unwrap_or_else(identity), &mut task)?;

    Ok(TaskReport {
        counters: counters.snapshot(),
    })
}

fn run_reduce(spec: &TaskSpec, conf: JobConf, files: &[PathBuf]) -> Result<TaskReport> {
    let counters = Counters::new();
    let ctx = TaskAttemptContext {
        conf,
        attempt: spec.attempt.clone(),
        counters: counters.clone(),
    };

    let mut pairs = Vec::new();
    for file in files {
        pairs.extend(read_partition(file)?);
    }
    counters
        .counter(TASK_GROUP, "reduce_input_records")
        .increment(pairs.len() as u64);
    let groups = group_sorted(pairs);
    counters
        .counter(TASK_GROUP, "reduce_input_groups")
        .increment(groups.len() as u64);

    let reducer = bind(&ctx.conf, Role::Reduce)?;
    let output = output_format(&ctx.conf)?.record_writer(&ctx)?;

    let mut task = TaskContext::new(ctx, TaskRecords::Groups(groups), output);
    drive(reducer.unwrap_or_else(identity), &mut task)?;

    Ok(TaskReport {
        counters: counters.snapshot(),
    })
}

fn bind(conf: &JobConf, role: Role) -> Result<Option<Behavior>> {
    registry::class_for(conf, role)?
        .map(|class| class.instantiate(conf))
        .transpose()
}

/// Sin clase configurada, map y reduce reenvían cada par.
fn identity() -> Behavior {
    Behavior::records(Shape::KeyVals, Shape::KeyVals, Ok)
}

/// Corre el behavior y cierra la salida. Si el behavior falla la salida no
/// se confirma: lo escrito queda en el directorio temporal del intento.
fn drive(behavior: Behavior, task: &mut TaskContext) -> Result<()> {
    let outcome = match behavior {
        Behavior::Partition(_) => Err(MrError::conf(
            "un particionador no puede ejecutarse como map o reduce",
        )),
        Behavior::Raw(mut f) => f(task).map_err(MrError::from),
        mut records => task
            .take_records()
            .and_then(|input| records.run_records(input))
            .and_then(|pairs| pairs.iter().try_for_each(|(k, v)| task.write(k, v))),
    };

    if let Err(e) = outcome {
        warn!("tarea {} falló: {}", task.attempt(), e);
        return Err(e);
    }
    task.close()
}
