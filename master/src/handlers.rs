use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    JobInfo, JobResults, JobSubmission, MrError, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, TaskCompleteResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerId, WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::scheduler;
use crate::state::{lock, AppState, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cuerpo de error de la API.
#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

struct HttpError(StatusCode, String);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.0, Json(ApiError { error: self.1 })).into_response()
    }
}

impl From<MrError> for HttpError {
    fn from(err: MrError) -> Self {
        let status = match err {
            MrError::Io(_) | MrError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        HttpError(status, err.to_string())
    }
}

fn not_found(what: &str, id: &str) -> HttpError {
    HttpError(StatusCode::NOT_FOUND, format!("{what} {id} no existe"))
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Recibe un job ya compilado y encola sus maps
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobSubmission>,
) -> Result<Json<JobInfo>, HttpError> {
    match scheduler::submit_job(&state, req) {
        Ok(info) => Ok(Json(info)),
        Err(e) => {
            warn!("job rechazado: {}", e);
            Err(e.into())
        }
    }
}

// Devuelve el estado de un job
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, HttpError> {
    let jobs = lock(&state.jobs);
    jobs.get(&id)
        .map(|entry| Json(entry.info.clone()))
        .ok_or_else(|| not_found("job", &id))
}

// Lista archivos de salida de un job terminado
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResults>, HttpError> {
    let info = {
        let jobs = lock(&state.jobs);
        jobs.get(&id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| not_found("job", &id))?
    };

    if !info.status.is_finished() {
        return Err(HttpError(
            StatusCode::CONFLICT,
            format!("el job {id} todavía no terminó"),
        ));
    }

    let results = JobResults::collect(&info.id, info.output_paths)?;
    Ok(Json(results))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    {
        let mut workers = lock(&state.workers);
        workers.insert(
            worker_id.clone(),
            WorkerMeta::new(req.hostname, req.max_concurrency),
        );
    }

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, req.max_concurrency
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker con su CPU y memoria
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, HttpError> {
    let mut workers = lock(&state.workers);
    let meta = workers
        .get_mut(&req.worker_id)
        .ok_or_else(|| not_found("worker", &req.worker_id))?;

    meta.last_heartbeat = SystemTime::now();
    meta.last_cpu_percent = Some(req.cpu_percent);
    meta.last_mem_bytes = Some(req.mem_bytes);
    if meta.dead {
        info!("worker {} volvió a dar señales", req.worker_id);
        meta.dead = false;
    }
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Asigna la siguiente tarea en cola (si hay)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Json<TaskAssignmentResponse> {
    let task = scheduler::assign_next(&state, &req.worker_id);
    if task.is_none() {
        debug!("worker {} pidió tarea pero no hay en cola", req.worker_id);
    }
    Json(TaskAssignmentResponse { task })
}

// Worker reporta que terminó (o no) un intento
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, HttpError> {
    if let Some(error) = &req.error {
        warn!("{} falló en el worker {}: {}", req.attempt, req.worker_id, error);
    }

    if scheduler::complete(&state, &req.attempt, req.report, req.error) {
        Ok(Json(TaskCompleteResponse { ok: true }))
    } else {
        Err(not_found("intento", &req.attempt.to_string()))
    }
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar tareas activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    {
        let in_flight = lock(&state.in_flight);
        for inf in in_flight.values() {
            *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
        }
    }

    let workers = lock(&state.workers);
    let mut out = Vec::new();

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let avg_ms = if meta.tasks_succeeded > 0 {
            Some(meta.total_task_time_ms as f64 / meta.tasks_succeeded as f64)
        } else {
            None
        };

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
            tasks_started: meta.tasks_started,
            tasks_succeeded: meta.tasks_succeeded,
            tasks_failed: meta.tasks_failed,
            avg_task_ms: avg_ms,
            last_cpu_percent: meta.last_cpu_percent,
            last_mem_bytes: meta.last_mem_bytes,
        });
    }
    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    Json(out)
}
