//! Interfaz de envío de jobs y engine local en proceso.
//!
//! El engine local sigue el mismo esquema que el cluster: una tarea map por
//! split, un shuffle a disco, una tarea reduce por partición. Cada tarea
//! recibe la configuración como texto y la vuelve a parsear.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::conf::{keys, JobConf};
use crate::counters::{CounterSnapshot, Counters};
use crate::error::{MrError, Result};
use crate::format::{input_format, output_format};
use crate::job::{JobId, JobStatus};
use crate::shuffle::partition_inputs;
use crate::task::{run_task, TaskAttemptId, TaskInput, TaskKind, TaskSpec};

/// Resultado de un job terminado.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub counters: CounterSnapshot,
    pub output_paths: Vec<PathBuf>,
}

/// Algo capaz de ejecutar un job descrito por su configuración.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Ejecuta el job hasta el final. Un job fallido es `Err`.
    async fn submit(&self, conf: &JobConf) -> Result<JobReport>;
}

pub fn job_name(conf: &JobConf) -> String {
    conf.get_or(keys::JOB_NAME, "job").to_string()
}

pub fn num_reduces(conf: &JobConf) -> Result<usize> {
    conf.get_usize(keys::NUM_REDUCES, 0)
}

/// Carpeta de shuffle de un job dentro del staging.
pub fn shuffle_dir(staging: &Path, job_id: &str) -> PathBuf {
    staging.join(job_id).join("shuffle")
}

/// Una tarea map por split de entrada.
pub fn plan_map_tasks(
    job_id: &str,
    conf: &JobConf,
    conf_text: &str,
    shuffle: &Path,
) -> Result<Vec<TaskSpec>> {
    let reduces = num_reduces(conf)?;
    let splits = input_format(conf)?.splits(conf)?;
    debug!("job {}: {} splits", job_id, splits.len());

    Ok(splits
        .into_iter()
        .enumerate()
        .map(|(i, split)| TaskSpec {
            attempt: TaskAttemptId::new(job_id, TaskKind::Map, i, 0),
            conf: conf_text.to_string(),
            input: TaskInput::Split(split),
            reduces,
            shuffle_dir: shuffle.to_path_buf(),
        })
        .collect())
}

/// Una tarea reduce por partición. Se planifica cuando ya terminaron todos
/// los maps, porque lee lo que ellos dejaron en el shuffle.
pub fn plan_reduce_tasks(
    job_id: &str,
    conf_text: &str,
    reduces: usize,
    shuffle: &Path,
) -> Result<Vec<TaskSpec>> {
    (0..reduces)
        .map(|r| {
            Ok(TaskSpec {
                attempt: TaskAttemptId::new(job_id, TaskKind::Reduce, r, 0),
                conf: conf_text.to_string(),
                input: TaskInput::Shuffle {
                    files: partition_inputs(shuffle, r)?,
                },
                reduces,
                shuffle_dir: shuffle.to_path_buf(),
            })
        })
        .collect()
}

pub fn task_failed(attempt: &TaskAttemptId, reason: impl ToString) -> MrError {
    MrError::TaskFailed {
        stage: attempt.kind.as_str().to_string(),
        task: attempt.to_string(),
        reason: reason.to_string(),
    }
}

/* =========================
   Engine local
   ========================= */

const DEFAULT_STAGING_DIR: &str = "mr-staging";

pub struct LocalEngine {
    staging_dir: PathBuf,
    concurrency: usize,
}

impl LocalEngine {
    pub fn new(staging_dir: impl Into<PathBuf>, concurrency: usize) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Staging desde MR_STAGING_DIR y paralelismo desde MR_LOCAL_CONCURRENCY.
    pub fn from_env() -> Self {
        let staging = std::env::var("MR_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join(DEFAULT_STAGING_DIR));
        let concurrency = std::env::var("MR_LOCAL_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2)
            });
        Self::new(staging, concurrency)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Corre todas las tareas de una fase; si alguna falla, la fase falla
    /// con el primer error (las demás igual terminan).
    async fn run_phase(&self, specs: Vec<TaskSpec>, counters: &Counters) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(specs.len());

        for spec in specs {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| MrError::Engine(e.to_string()))?;
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = run_task(&spec);
                (spec.attempt, result)
            }));
        }

        let mut first_err = None;
        for handle in handles {
            let err = match handle.await {
                Ok((_, Ok(report))) => {
                    counters.merge(&report.counters);
                    continue;
                }
                Ok((attempt, Err(e))) => {
                    warn!("tarea {} falló: {}", attempt, e);
                    task_failed(&attempt, e)
                }
                Err(e) => MrError::Engine(format!("tarea abortada: {e}")),
            };
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_job(&self, job_id: &str, conf: &JobConf, counters: &Counters) -> Result<()> {
        let conf_text = conf.to_json()?;
        let reduces = num_reduces(conf)?;
        let shuffle = shuffle_dir(&self.staging_dir, job_id);

        let maps = plan_map_tasks(job_id, conf, &conf_text, &shuffle)?;
        info!("job {}: {} tareas map", job_id, maps.len());
        self.run_phase(maps, counters).await?;

        if reduces > 0 {
            let reducers = plan_reduce_tasks(job_id, &conf_text, reduces, &shuffle)?;
            info!("job {}: {} tareas reduce", job_id, reducers.len());
            self.run_phase(reducers, counters).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for LocalEngine {
    async fn submit(&self, conf: &JobConf) -> Result<JobReport> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let name = job_name(conf);
        let format = output_format(conf)?;
        format.check_output_specs(conf)?;

        info!("job {} ({}) enviado al engine local", name, job_id);
        let counters = Counters::new();
        let result = self.run_job(&job_id, conf, &counters).await;

        let job_staging = self.staging_dir.join(&job_id);
        if let Err(e) = fs::remove_dir_all(&job_staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("no se pudo borrar {}: {}", job_staging.display(), e);
            }
        }
        result?;

        format.commit_job(conf)?;
        info!("job {} ({}) terminado", name, job_id);
        Ok(JobReport {
            job_id,
            name,
            status: JobStatus::Succeeded,
            counters: counters.snapshot(),
            output_paths: format.output_paths(conf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, Role};
    use crate::task::TASK_GROUP;
    use serde_json::json;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("mr_engine_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn wordcount_conf(tmp: &Path, reduces: usize) -> JobConf {
        let input = tmp.join("in");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("a.txt"), "uno dos\ndos tres\n").unwrap();
        fs::write(input.join("b.txt"), "tres tres\n").unwrap();

        let conf = JobConf::new()
            .with(keys::JOB_NAME, "wordcount")
            .with(keys::INPUT_FORMAT, "text")
            .with(keys::INPUT_DIR, input.to_string_lossy())
            .with(keys::OUTPUT_FORMAT, "jsonl")
            .with(keys::OUTPUT_DIR, tmp.join("out").to_string_lossy())
            .with(keys::NUM_REDUCES, reduces.to_string());
        registry::step(Role::Map, "wordcount.tokenize", vec![])
            .then(registry::step(Role::Combine, "wordcount.sum", vec![]))
            .then(registry::step(Role::Reduce, "wordcount.sum", vec![]))
            .apply(conf)
            .unwrap()
    }

    #[test]
    fn plan_map_tasks_una_por_archivo() {
        let tmp = temp_dir("plan");
        let conf = wordcount_conf(&tmp, 2);
        let text = conf.to_json().unwrap();
        let shuffle = shuffle_dir(&tmp, "j1");

        let maps = plan_map_tasks("j1", &conf, &text, &shuffle).unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1].attempt.partition, 1);
        assert!(maps.iter().all(|t| t.reduces == 2));

        let reducers = plan_reduce_tasks("j1", &text, 2, &shuffle).unwrap();
        assert_eq!(reducers.len(), 2);
        assert_eq!(reducers[0].input, TaskInput::Shuffle { files: vec![] });
    }

    #[tokio::test]
    async fn local_engine_corre_map_y_reduce() {
        let tmp = temp_dir("local");
        let conf = wordcount_conf(&tmp, 2);
        let engine = LocalEngine::new(tmp.join("staging"), 2);

        let report = engine.submit(&conf).await.unwrap();
        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.output_paths, vec![tmp.join("out")]);
        assert_eq!(report.counters[TASK_GROUP]["map_input_records"], 3);
        assert_eq!(report.counters[TASK_GROUP]["reduce_output_records"], 3);

        let mut counts = Vec::new();
        for part in ["part-r-00000.jsonl", "part-r-00001.jsonl"] {
            let content = fs::read_to_string(tmp.join("out").join(part)).unwrap();
            for line in content.lines() {
                counts.push(serde_json::from_str::<serde_json::Value>(line).unwrap());
            }
        }
        counts.sort_by_key(|v| v[0].as_str().unwrap_or("").to_string());
        assert_eq!(counts, vec![json!(["dos", 2]), json!(["tres", 3]), json!(["uno", 1])]);

        assert!(!tmp.join("out").join("_temporary").exists());
        assert!(fs::read_dir(tmp.join("staging")).unwrap().next().is_none());

        // la misma salida otra vez se rechaza antes de correr
        assert!(engine.submit(&conf).await.is_err());
    }

    #[tokio::test]
    async fn tarea_fallida_hace_fallar_el_job() {
        let tmp = temp_dir("failing");
        let conf = wordcount_conf(&tmp, 0).with(keys::INPUT_FORMAT, "jsonl");
        let engine = LocalEngine::new(tmp.join("staging"), 2);

        let err = engine.submit(&conf).await.unwrap_err();
        assert!(matches!(err, MrError::TaskFailed { ref stage, .. } if stage == "map"));
    }
}
