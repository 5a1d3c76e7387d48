use anyhow::Result;
use common::task::run_task;
use common::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskReport, TaskSpec,
    WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::Client;
use std::{env, sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;

/// Configuración del proceso, desde variables de entorno.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub base_url: String,
    pub max_concurrency: u32,
}

impl WorkerConfig {
    /// MASTER_BASE_URL (o MASTER_URL) y WORKER_CONCURRENCY.
    pub fn from_env() -> Self {
        let base_url = env::var("MASTER_BASE_URL")
            .or_else(|_| env::var("MASTER_URL"))
            .unwrap_or_else(|_| "http://master:8080".to_string());
        let max_concurrency = env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY);
        Self {
            base_url,
            max_concurrency,
        }
    }
}

/// Corre un intento en un hilo de bloqueo y arma el reporte para el master.
pub async fn execute(worker_id: WorkerId, task: TaskSpec) -> TaskCompleteRequest {
    let attempt = task.attempt.clone();
    let handle = tokio::task::spawn_blocking(move || run_task(&task));

    let (report, error): (Option<TaskReport>, Option<String>) = match handle.await {
        Ok(Ok(report)) => {
            info!("terminé {} correctamente", attempt);
            (Some(report), None)
        }
        Ok(Err(e)) => {
            warn!("error procesando {}: {}", attempt, e);
            (None, Some(e.to_string()))
        }
        Err(e) => {
            warn!("panic o join error en {}: {:?}", attempt, e);
            (None, Some(format!("la tarea abortó: {e}")))
        }
    };

    TaskCompleteRequest {
        worker_id,
        attempt,
        report,
        error,
    }
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide tareas mientras tenga permisos libres.
/// - Ejecuta cada tarea en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run(config: WorkerConfig) -> Result<()> {
    let client = Client::new();
    let base_url = config.base_url.clone();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency: config.max_concurrency,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id, config.max_concurrency, base_url
    );

    let sem = Arc::new(Semaphore::new(config.max_concurrency as usize));

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // used_memory devuelve KB -> lo pasamos a bytes
        let mem_bytes = sys.used_memory() * 1024;

        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
        if let Err(e) = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent,
                mem_bytes,
            })
            .send()
            .await
        {
            warn!("heartbeat fallido: {}", e);
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let assign_url = format!("{}/api/v1/tasks/next", base_url);
        let assignment: TaskAssignmentResponse = match client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
        {
            Ok(res) => res.json().await?,
            Err(e) => {
                warn!("no se pudo pedir tarea al master: {}", e);
                drop(permit);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let Some(task) = assignment.task else {
            // No hay tarea: devolvemos el permiso y dormimos
            drop(permit);
            debug!("worker {} pidió tarea pero no hay", worker_id);
            sleep(Duration::from_secs(2)).await;
            continue;
        };

        info!("tengo {} ({} reduces)", task.attempt, task.reduces);

        let client_cloned = client.clone();
        let complete_url = format!("{}/api/v1/tasks/complete", base_url);
        let worker_id_cloned = worker_id.clone();

        tokio::spawn(async move {
            let done = execute(worker_id_cloned, task).await;

            if let Err(e) = client_cloned.post(&complete_url).json(&done).send().await {
                warn!("no se pudo reportar {}: {}", done.attempt, e);
            }

            // Liberar el permiso de concurrencia al terminar
            drop(permit);
        });
    }
}
