// master/src/state.rs

use common::{Counters, JobConf, JobId, JobInfo, TaskSpec, WorkerId};
use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas pendientes de asignar
    pub tasks_queue: Arc<Mutex<VecDeque<TaskSpec>>>,
    // tareas ya asignadas pero no completadas, por id de intento
    pub in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    // shuffles de los jobs en curso
    pub staging_dir: PathBuf,
}

impl AppState {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            tasks_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            staging_dir: staging_dir.into(),
        }
    }
}

/// Un mutex envenenado no deja el estado a medias: cada sección crítica
/// es una sola actualización de mapa o cola.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Un job tal como lo sigue el master.
pub struct JobEntry {
    pub info: JobInfo,
    pub conf: JobConf,
    /// La configuración ya serializada que viaja en cada TaskSpec
    pub conf_text: String,
    pub shuffle_dir: PathBuf,
    /// Tareas de la fase actual que todavía no terminaron bien
    pub remaining: usize,
    pub counters: Counters,
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: TaskSpec,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}
