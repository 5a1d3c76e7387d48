//! Ciclo de vida de un job en el master: fase map, fase reduce, reintentos.
//!
//! Las tareas reduce se encolan recién cuando todas las map del job
//! terminaron bien, porque leen lo que éstas dejaron en el shuffle.

use chrono::Utc;
use std::{fs, time::SystemTime};
use tracing::{info, warn};

use common::engine::{job_name, num_reduces, plan_map_tasks, plan_reduce_tasks, shuffle_dir, task_failed};
use common::format::output_format;
use common::{
    Counters, JobInfo, JobStatus, JobSubmission, MrError, TaskAttemptId, TaskKind, TaskReport,
    TaskSpec, WorkerId,
};

use crate::state::{lock, AppState, InFlight, JobEntry};
use crate::MAX_TASK_ATTEMPTS;

/// Valida la salida, planifica los maps y deja el job en cola.
pub fn submit_job(state: &AppState, submission: JobSubmission) -> Result<JobInfo, MrError> {
    let conf = submission.conf;
    let format = output_format(&conf)?;
    format.check_output_specs(&conf)?;

    let job_id = uuid::Uuid::new_v4().to_string();
    let name = if submission.name.is_empty() {
        job_name(&conf)
    } else {
        submission.name
    };
    let reduces = num_reduces(&conf)?;
    let conf_text = conf.to_json()?;
    let shuffle = shuffle_dir(&state.staging_dir, &job_id);
    let maps = plan_map_tasks(&job_id, &conf, &conf_text, &shuffle)?;

    let info = JobInfo {
        id: job_id.clone(),
        name,
        status: JobStatus::Accepted,
        phase: Some(TaskKind::Map),
        reduces,
        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
        total_tasks: (maps.len() + reduces) as u32,
        completed_tasks: 0,
        failed_tasks: 0,
        retries: 0,
        counters: Default::default(),
        output_paths: Vec::new(),
        error: None,
    };
    info!(
        "job {} ({}) aceptado: {} maps, {} reduces",
        job_id,
        info.name,
        maps.len(),
        reduces
    );

    let mut entry = JobEntry {
        info,
        conf,
        conf_text,
        shuffle_dir: shuffle,
        remaining: maps.len(),
        counters: Counters::new(),
    };

    // sin splits no hay nada que esperar en la fase map
    let mut to_enqueue = maps;
    if entry.remaining == 0 {
        to_enqueue = advance_phase(state, &mut entry);
    }

    let info = entry.info.clone();
    {
        let mut jobs = lock(&state.jobs);
        jobs.insert(job_id, entry);
    }
    enqueue(state, to_enqueue);
    Ok(info)
}

fn enqueue(state: &AppState, tasks: Vec<TaskSpec>) {
    if tasks.is_empty() {
        return;
    }
    let mut queue = lock(&state.tasks_queue);
    queue.extend(tasks);
}

/// Cierra la fase actual del job: devuelve las tareas de la fase siguiente,
/// o ninguna si el job terminó (bien o mal).
fn advance_phase(state: &AppState, entry: &mut JobEntry) -> Vec<TaskSpec> {
    let job_id = entry.info.id.clone();

    if entry.info.phase == Some(TaskKind::Map) && entry.info.reduces > 0 {
        match plan_reduce_tasks(&job_id, &entry.conf_text, entry.info.reduces, &entry.shuffle_dir) {
            Ok(reducers) => {
                info!("job {}: maps listos, encolando {} reduces", job_id, reducers.len());
                entry.info.phase = Some(TaskKind::Reduce);
                entry.remaining = reducers.len();
                return reducers;
            }
            Err(e) => {
                fail_job(state, entry, e.to_string());
                return Vec::new();
            }
        }
    }

    let committed = output_format(&entry.conf).and_then(|format| {
        format.commit_job(&entry.conf)?;
        format.output_paths(&entry.conf)
    });
    match committed {
        Ok(paths) => {
            entry.info.status = JobStatus::Succeeded;
            entry.info.phase = None;
            entry.info.output_paths = paths;
            entry.info.finished_at = Some(Utc::now());
            info!("job {} ({}) terminado", job_id, entry.info.name);
        }
        Err(e) => fail_job(state, entry, format!("commit de la salida: {e}")),
    }
    remove_job_staging(state, &job_id);
    Vec::new()
}

fn fail_job(state: &AppState, entry: &mut JobEntry, error: String) {
    warn!("job {} falló: {}", entry.info.id, error);
    entry.info.status = JobStatus::Failed;
    entry.info.finished_at = Some(Utc::now());
    entry.info.error = Some(error);
    remove_job_staging(state, &entry.info.id);
}

fn remove_job_staging(state: &AppState, job_id: &str) {
    let dir = state.staging_dir.join(job_id);
    if let Err(e) = fs::remove_dir_all(&dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("no se pudo borrar {}: {}", dir.display(), e);
        }
    }
}

/// Saca la siguiente tarea de la cola respetando el tope del worker.
pub fn assign_next(state: &AppState, worker_id: &WorkerId) -> Option<TaskSpec> {
    let active_for_worker: usize = {
        let in_flight = lock(&state.in_flight);
        in_flight
            .values()
            .filter(|entry| &entry.worker_id == worker_id)
            .count()
    };

    let max_for_worker: u32 = {
        let workers = lock(&state.workers);
        workers.get(worker_id).map(|m| m.max_concurrency).unwrap_or(1)
    };

    if active_for_worker as u32 >= max_for_worker {
        info!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            worker_id, active_for_worker, max_for_worker
        );
        return None;
    }

    let task = {
        let mut queue = lock(&state.tasks_queue);
        queue.pop_front()
    }?;

    info!(
        "asignando {} al worker {} ({}/{} en vuelo -> +1)",
        task.attempt, worker_id, active_for_worker, max_for_worker
    );

    {
        let mut in_flight = lock(&state.in_flight);
        in_flight.insert(
            task.attempt.to_string(),
            InFlight {
                task: task.clone(),
                worker_id: worker_id.clone(),
                started_at: SystemTime::now(),
            },
        );
    }

    {
        let mut jobs = lock(&state.jobs);
        if let Some(entry) = jobs.get_mut(&task.attempt.job_id) {
            if entry.info.status == JobStatus::Accepted {
                entry.info.status = JobStatus::Running;
                entry.info.started_at.get_or_insert_with(Utc::now);
            }
        }
    }

    {
        let mut workers = lock(&state.workers);
        if let Some(meta) = workers.get_mut(worker_id) {
            meta.tasks_started += 1;
        }
    }

    Some(task)
}

/// Resultado de un intento reportado por un worker. `false` si el intento
/// no estaba en vuelo (por ejemplo ya se reencoló por worker muerto).
pub fn complete(
    state: &AppState,
    attempt: &TaskAttemptId,
    report: Option<TaskReport>,
    error: Option<String>,
) -> bool {
    let inflight = {
        let mut in_flight = lock(&state.in_flight);
        in_flight.remove(&attempt.to_string())
    };
    let Some(inflight) = inflight else {
        return false;
    };

    let duration_ms: u64 = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let succeeded = report.is_some() && error.is_none();

    {
        let mut workers = lock(&state.workers);
        if let Some(meta) = workers.get_mut(&inflight.worker_id) {
            meta.total_task_time_ms += duration_ms;
            if succeeded {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
    }

    match report {
        Some(report) if succeeded => task_succeeded(state, &inflight.task, report),
        _ => {
            let reason = error.unwrap_or_else(|| "la tarea no devolvió reporte".to_string());
            task_failed_attempt(state, inflight.task, reason);
        }
    }
    true
}

fn task_succeeded(state: &AppState, task: &TaskSpec, report: TaskReport) {
    let next = {
        let mut jobs = lock(&state.jobs);
        let Some(entry) = jobs.get_mut(&task.attempt.job_id) else {
            return;
        };
        if entry.info.status.is_finished() {
            // intento tardío de un job que ya terminó
            return;
        }

        entry.counters.merge(&report.counters);
        entry.info.counters = entry.counters.snapshot();
        entry.info.completed_tasks += 1;
        entry.remaining = entry.remaining.saturating_sub(1);

        if entry.remaining > 0 {
            return;
        }
        advance_phase(state, entry)
    };
    enqueue(state, next);
}

/// Reencola el intento siguiente o, si ya no quedan, hace fallar el job.
pub fn task_failed_attempt(state: &AppState, task: TaskSpec, reason: String) {
    let job_id = task.attempt.job_id.clone();
    let mut jobs = lock(&state.jobs);
    let Some(entry) = jobs.get_mut(&job_id) else {
        return;
    };
    if entry.info.status.is_finished() {
        return;
    }

    if task.attempt.attempt + 1 < MAX_TASK_ATTEMPTS {
        warn!("{} falló ({}), reintentando", task.attempt, reason);
        entry.info.retries += 1;
        let retry = TaskSpec {
            attempt: task.attempt.retry(),
            ..task
        };
        drop(jobs);
        enqueue(state, vec![retry]);
        return;
    }

    entry.info.failed_tasks += 1;
    let error = task_failed(&task.attempt, reason).to_string();
    fail_job(state, entry, error);
    drop(jobs);

    // lo que quedaba del job en cola ya no sirve
    let mut queue = lock(&state.tasks_queue);
    queue.retain(|t| t.attempt.job_id != job_id);
}
