//! Grafo de etapas: se compila a uno o más jobs y se ejecuta en orden de
//! dependencias.
//!
//! Un job físico cubre `input -> map [-> combine] -> partition -> reduce ->
//! output`. Cuando el grafo pide más que eso (map después de reduce, map
//! después de map, leer una etapa intermedia) se inserta un sumidero JSONL
//! en el staging y el job siguiente lo lee con su secuencia.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::conf::{keys, JobConf};
use crate::dseq::{DSeq, DSink};
use crate::engine::{Engine, JobReport};
use crate::error::{MrError, Result};
use crate::format::output_format;
use crate::job::JobStatus;
use crate::mux;
use crate::record::ValueKind;
use crate::registry::{self, Role};
use crate::step::Step;

static NEXT_STAGE_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone)]
enum Op {
    Input(DSeq),
    Map(Step),
    Combine(Step),
    Partition {
        partitioner: Option<Step>,
        reduces: usize,
    },
    Reduce(Step),
    Output(DSink),
}

impl Op {
    fn kind(&self) -> &'static str {
        match self {
            Op::Input(_) => "input",
            Op::Map(_) => "map",
            Op::Combine(_) => "combine",
            Op::Partition { .. } => "partition",
            Op::Reduce(_) => "reduce",
            Op::Output(_) => "output",
        }
    }
}

struct Node {
    id: usize,
    op: Op,
    parents: Vec<Stage>,
    config: Vec<Step>,
}

/// Nodo del grafo. Es inmutable: cada llamada devuelve un nodo nuevo que
/// apunta a sus padres, así que una misma etapa puede alimentar varias ramas.
#[derive(Clone)]
pub struct Stage {
    node: Arc<Node>,
}

/// Origen del grafo.
pub fn input(dseq: DSeq) -> Stage {
    Stage::new(Op::Input(dseq), Vec::new(), Vec::new())
}

/// Partición que junta varias ramas (join): todas terminan en el mismo
/// shuffle y se compilan a un único job con entrada mux.
pub fn partition(branches: Vec<Stage>, reduces: usize) -> Stage {
    Stage::new(
        Op::Partition {
            partitioner: None,
            reduces,
        },
        branches,
        Vec::new(),
    )
}

impl Stage {
    fn new(op: Op, parents: Vec<Stage>, config: Vec<Step>) -> Self {
        let id = NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            node: Arc::new(Node {
                id,
                op,
                parents,
                config,
            }),
        }
    }

    fn derive(&self, op: Op) -> Stage {
        Stage::new(op, vec![self.clone()], Vec::new())
    }

    pub fn map(&self, behavior_ref: &str, args: Vec<Value>) -> Stage {
        self.derive(Op::Map(registry::step(Role::Map, behavior_ref, args)))
    }

    pub fn combine(&self, behavior_ref: &str, args: Vec<Value>) -> Stage {
        self.derive(Op::Combine(registry::step(Role::Combine, behavior_ref, args)))
    }

    /// Shuffle con el particionador por defecto (hash de la clave).
    pub fn partition(&self, reduces: usize) -> Stage {
        self.derive(Op::Partition {
            partitioner: None,
            reduces,
        })
    }

    pub fn partition_with(&self, behavior_ref: &str, args: Vec<Value>, reduces: usize) -> Stage {
        self.derive(Op::Partition {
            partitioner: Some(registry::step(Role::Partition, behavior_ref, args)),
            reduces,
        })
    }

    pub fn reduce(&self, behavior_ref: &str, args: Vec<Value>) -> Stage {
        self.derive(Op::Reduce(registry::step(Role::Reduce, behavior_ref, args)))
    }

    pub fn output(&self, sink: DSink) -> Stage {
        self.derive(Op::Output(sink))
    }

    /// Misma etapa con un paso de configuración extra para su job.
    pub fn config(&self, step: Step) -> Stage {
        let mut config = self.node.config.clone();
        config.push(step);
        Stage::new(self.node.op.clone(), self.node.parents.clone(), config)
    }

    pub fn id(&self) -> usize {
        self.node.id
    }

    pub fn kind(&self) -> &'static str {
        self.node.op.kind()
    }

    pub fn sink(&self) -> Option<&DSink> {
        match &self.node.op {
            Op::Output(sink) => Some(sink),
            _ => None,
        }
    }

    fn single_parent(&self) -> Result<&Stage> {
        match self.node.parents.as_slice() {
            [parent] => Ok(parent),
            [] => Err(MrError::graph(format!(
                "la etapa {} ({}) no tiene entrada",
                self.id(),
                self.kind()
            ))),
            _ => Err(MrError::graph(format!(
                "la etapa {} ({}) tiene varias entradas",
                self.id(),
                self.kind()
            ))),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.node.id)
            .field("kind", &self.kind())
            .field("parents", &self.node.parents.iter().map(Stage::id).collect::<Vec<_>>())
            .finish()
    }
}

/* =========================
   Compilación
   ========================= */

/// Un job físico ya configurado.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub name: String,
    pub conf: JobConf,
    /// Índices de los jobs que tienen que terminar antes.
    pub deps: Vec<usize>,
    /// Su salida es un intermedio que se borra al terminar el grafo.
    pub intermediate: bool,
    pub sink: DSink,
    /// Última etapa que ejecuta (map o reduce).
    pub stage: String,
}

#[derive(Debug)]
pub struct CompiledGraph {
    name: String,
    staging: PathBuf,
    jobs: Vec<JobPlan>,
    terminals: Vec<usize>,
}

/// Lo que dejó cada sumidero terminal.
#[derive(Debug, Clone)]
pub struct SinkResult {
    pub job: String,
    pub dseq: DSeq,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GraphResult {
    /// Un resultado por etapa `output` pedida, en el mismo orden.
    pub outputs: Vec<SinkResult>,
    /// Reportes de los jobs en el orden en que corrieron.
    pub reports: Vec<JobReport>,
}

/// Entrada de una rama ya resuelta.
struct Branch {
    step: Step,
    config: Vec<Step>,
    dep: Option<usize>,
}

struct Compiler<'a> {
    name: &'a str,
    staging: &'a Path,
    jobs: Vec<JobPlan>,
    built: HashMap<usize, usize>,
}

impl<'a> Compiler<'a> {
    fn output_job(&mut self, stage: &Stage) -> Result<usize> {
        if let Some(&idx) = self.built.get(&stage.id()) {
            return Ok(idx);
        }
        let Op::Output(sink) = &stage.node.op else {
            return Err(MrError::graph(format!(
                "el grafo tiene que terminar en output, no en {} ({})",
                stage.kind(),
                stage.id()
            )));
        };
        let upstream = stage.single_parent()?;
        let idx = self.job(upstream, sink.clone(), stage.node.config.clone(), false)?;
        self.built.insert(stage.id(), idx);
        Ok(idx)
    }

    /// Job que deja la etapa escrita en algún lado, y la secuencia para leerla.
    fn materialize(&mut self, stage: &Stage) -> Result<(usize, DSeq)> {
        if let Some(sink) = stage.sink() {
            let idx = self.output_job(stage)?;
            return Ok((idx, sink.dseq().clone()));
        }
        if let Some(&idx) = self.built.get(&stage.id()) {
            return Ok((idx, self.jobs[idx].sink.dseq().clone()));
        }

        let location = self
            .staging
            .join(self.name)
            .join(format!("stage-{:05}", stage.id()));
        debug!("intermedio para la etapa {} en {}", stage.id(), location.display());
        let sink = DSink::jsonl(ValueKind::Any, ValueKind::Any, &location);
        let idx = self.job(stage, sink.clone(), Vec::new(), true)?;
        self.built.insert(stage.id(), idx);
        Ok((idx, sink.dseq().clone()))
    }

    /// Entrada de una rama: su secuencia y, si hay, su único mapper.
    fn branch(&mut self, stage: &Stage) -> Result<Branch> {
        match &stage.node.op {
            Op::Input(dseq) => Ok(Branch {
                step: dseq.step().clone(),
                config: stage.node.config.clone(),
                dep: None,
            }),
            Op::Map(map_step) => {
                let upstream = stage.single_parent()?;
                let mut config = Vec::new();
                let (input_step, dep) = match &upstream.node.op {
                    Op::Input(dseq) => {
                        config.extend(upstream.node.config.iter().cloned());
                        (dseq.step().clone(), None)
                    }
                    // map después de map, de reduce o de un output: otro job
                    _ => {
                        let (idx, dseq) = self.materialize(upstream)?;
                        (dseq.step().clone(), Some(idx))
                    }
                };
                config.extend(stage.node.config.iter().cloned());
                Ok(Branch {
                    step: input_step.then(map_step.clone()),
                    config,
                    dep,
                })
            }
            _ => {
                let (idx, dseq) = self.materialize(stage)?;
                Ok(Branch {
                    step: dseq.step().clone(),
                    config: Vec::new(),
                    dep: Some(idx),
                })
            }
        }
    }

    fn job(&mut self, end: &Stage, sink: DSink, extra: Vec<Step>, intermediate: bool) -> Result<usize> {
        let mut config: Vec<Step> = Vec::new();
        let mut cur = end;

        let reduce = match &cur.node.op {
            Op::Reduce(step) => {
                let step = step.clone();
                config.extend(cur.node.config.iter().cloned());
                cur = cur.single_parent()?;
                Some(step)
            }
            _ => None,
        };

        let mut partitioner = None;
        let (reduces, heads): (usize, Vec<Stage>) = match &cur.node.op {
            Op::Partition {
                partitioner: p,
                reduces,
            } => {
                config.extend(cur.node.config.iter().cloned());
                partitioner = p.clone();
                if cur.node.parents.is_empty() {
                    return Err(MrError::graph(format!("partition {} sin ramas", cur.id())));
                }
                ((*reduces).max(1), cur.node.parents.clone())
            }
            // reduce sin partition explícito: una sola partición
            _ if reduce.is_some() => (1, vec![cur.clone()]),
            _ => (0, vec![cur.clone()]),
        };

        let mut combine: Option<Step> = None;
        let mut inputs = Vec::with_capacity(heads.len());
        let mut deps = Vec::new();
        for head in &heads {
            let mut head = head;
            if let Op::Combine(step) = &head.node.op {
                if reduces == 0 {
                    return Err(MrError::graph(format!(
                        "combine {} sin partition después",
                        head.id()
                    )));
                }
                if combine.is_some() {
                    return Err(MrError::graph("un job admite un solo combiner"));
                }
                config.extend(head.node.config.iter().cloned());
                combine = Some(step.clone());
                head = head.single_parent()?;
            }

            let branch = self.branch(head)?;
            config.extend(branch.config);
            if let Some(dep) = branch.dep {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
            inputs.push(branch.step);
        }

        let name = format!("{}-{:02}", self.name, self.jobs.len());
        let mut steps = vec![
            Step::set(keys::JOB_NAME, name.clone()),
            Step::set(keys::NUM_REDUCES, reduces.to_string()),
        ];
        if inputs.len() == 1 {
            steps.extend(inputs);
        } else {
            steps.push(mux::mux_step(inputs));
        }
        steps.extend(combine);
        steps.extend(partitioner);
        steps.extend(reduce);
        steps.push(sink.step().clone());
        steps.extend(config);
        steps.extend(extra);

        // los slots se reservan acá: pasarse de capacidad falla antes de enviar nada
        let conf = Step::compose(steps).apply(JobConf::new())?;
        let stage = if reduces > 0 { "reduce" } else { "map" };
        debug!("job {} compilado ({} deps)", name, deps.len());

        self.jobs.push(JobPlan {
            name,
            conf,
            deps,
            intermediate,
            sink,
            stage: stage.to_string(),
        });
        Ok(self.jobs.len() - 1)
    }
}

/// Compila las etapas `output` a jobs. Los intermedios van bajo `staging`.
pub fn compile(outputs: &[Stage], staging: &Path) -> Result<CompiledGraph> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let name = format!("graph-{}", &id[..8]);
    compile_named(&name, outputs, staging)
}

pub fn compile_named(name: &str, outputs: &[Stage], staging: &Path) -> Result<CompiledGraph> {
    if outputs.is_empty() {
        return Err(MrError::graph("grafo sin salidas"));
    }

    let mut compiler = Compiler {
        name,
        staging,
        jobs: Vec::new(),
        built: HashMap::new(),
    };
    let mut terminals = Vec::with_capacity(outputs.len());
    for out in outputs {
        terminals.push(compiler.output_job(out)?);
    }

    info!("grafo {}: {} jobs", name, compiler.jobs.len());
    Ok(CompiledGraph {
        name: name.to_string(),
        staging: staging.to_path_buf(),
        jobs: compiler.jobs,
        terminals,
    })
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jobs(&self) -> &[JobPlan] {
        &self.jobs
    }

    /// Orden topológico (Kahn) de los jobs.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        let n = self.jobs.len();
        let mut pending = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, job) in self.jobs.iter().enumerate() {
            for &dep in &job.deps {
                if dep >= n {
                    return Err(MrError::graph(format!(
                        "el job {} depende de un job inexistente ({dep})",
                        job.name
                    )));
                }
                pending[idx] += 1;
                dependents[dep].push(idx);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for &next in &dependents[idx] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != n {
            return Err(MrError::graph("dependencia circular entre jobs"));
        }
        Ok(order)
    }

    /// Envía los jobs de a uno en orden de dependencias. El primer job que
    /// falla corta el grafo: no se envía nada más.
    pub async fn execute(&self, engine: &dyn Engine) -> Result<GraphResult> {
        let order = self.execution_order()?;
        let mut done = vec![false; self.jobs.len()];
        let mut reports = Vec::with_capacity(order.len());

        for idx in order {
            let plan = &self.jobs[idx];
            if let Some(dep) = plan.deps.iter().find(|&&d| !done[d]) {
                return Err(MrError::graph(format!(
                    "{} listo antes que su dependencia {}",
                    plan.name, self.jobs[*dep].name
                )));
            }

            info!("grafo {}: enviando job {}", self.name, plan.name);
            let report = match engine.submit(&plan.conf).await {
                Ok(report) if report.status == JobStatus::Succeeded => report,
                Ok(report) => {
                    return Err(self.job_failed(
                        plan,
                        MrError::Engine(format!("terminó en estado {:?}", report.status)),
                    ))
                }
                Err(e) => {
                    warn!("grafo {}: el job {} falló: {}", self.name, plan.name, e);
                    return Err(self.job_failed(plan, e));
                }
            };
            done[idx] = true;
            reports.push(report);
        }

        self.cleanup_intermediates();

        let mut outputs = Vec::with_capacity(self.terminals.len());
        for &idx in &self.terminals {
            let plan = &self.jobs[idx];
            let paths = output_format(&plan.conf)?.output_paths(&plan.conf)?;
            outputs.push(SinkResult {
                job: plan.name.clone(),
                dseq: plan.sink.dseq().clone(),
                paths,
            });
        }
        Ok(GraphResult { outputs, reports })
    }

    fn job_failed(&self, plan: &JobPlan, source: MrError) -> MrError {
        let stage = source.stage().unwrap_or(&plan.stage).to_string();
        MrError::JobFailed {
            job: plan.name.clone(),
            stage,
            source: Box::new(source),
        }
    }

    fn cleanup_intermediates(&self) {
        for plan in self.jobs.iter().filter(|p| p.intermediate) {
            for location in plan.sink.dseq().locations() {
                if let Err(e) = fs::remove_dir_all(location) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("no se pudo borrar el intermedio {}: {}", location.display(), e);
                    }
                }
            }
        }
        let _ = fs::remove_dir(self.staging.join(&self.name));
    }
}

/// Compila y ejecuta.
pub async fn run(engine: &dyn Engine, outputs: &[Stage], staging: &Path) -> Result<GraphResult> {
    compile(outputs, staging)?.execute(engine).await
}
