use crate::scheduler;
use crate::state::{lock, AppState, InFlight};
use crate::WORKER_DEAD_TIMEOUT;
use std::{
    collections::HashSet,
    time::{Duration, SystemTime},
};
use tracing::{info, warn};

pub async fn monitor_workers(state: AppState) {
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        sweep_once(&state, SystemTime::now());
    }
}

/// Marca como muertos los workers sin heartbeat y les saca sus tareas en
/// vuelo, que vuelven a la cola como un intento nuevo.
pub fn sweep_once(state: &AppState, now: SystemTime) -> usize {
    let mut dead_workers: HashSet<String> = HashSet::new();
    {
        let mut workers = lock(&state.workers);
        for (id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
                if elapsed > WORKER_DEAD_TIMEOUT {
                    meta.dead = true;
                    warn!("marcando worker {} como muerto (sin heartbeat hace {:?})", id, elapsed);
                    dead_workers.insert(id.clone());
                }
            }
        }
    }

    if dead_workers.is_empty() {
        return 0;
    }

    let mut orphaned: Vec<InFlight> = Vec::new();
    {
        let mut in_flight = lock(&state.in_flight);
        in_flight.retain(|_attempt, inflight| {
            if dead_workers.contains(&inflight.worker_id) {
                orphaned.push(inflight.clone());
                false
            } else {
                true
            }
        });
    }

    let count = orphaned.len();
    for inflight in orphaned {
        info!(
            "{} quedó huérfana por la caída del worker {}",
            inflight.task.attempt, inflight.worker_id
        );
        scheduler::task_failed_attempt(
            state,
            inflight.task,
            format!("el worker {} dejó de responder", inflight.worker_id),
        );
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkerMeta;
    use common::task::TaskInput;
    use common::{TaskAttemptId, TaskKind, TaskSpec};
    use std::path::PathBuf;

    fn task(job: &str) -> TaskSpec {
        TaskSpec {
            attempt: TaskAttemptId::new(job, TaskKind::Map, 0, 0),
            conf: "{}".to_string(),
            input: TaskInput::Shuffle { files: vec![] },
            reduces: 0,
            shuffle_dir: PathBuf::from("/tmp/nada"),
        }
    }

    #[test]
    fn worker_sin_heartbeat_pierde_sus_tareas() {
        let state = AppState::new(std::env::temp_dir().join("mr_monitor_tests"));
        let mut meta = WorkerMeta::new("host".to_string(), 2);
        meta.last_heartbeat = SystemTime::now() - Duration::from_secs(60);
        lock(&state.workers).insert("w1".to_string(), meta);
        lock(&state.workers).insert("w2".to_string(), WorkerMeta::new("host".to_string(), 2));

        for (worker, job) in [("w1", "j1"), ("w2", "j2")] {
            let t = task(job);
            lock(&state.in_flight).insert(
                t.attempt.to_string(),
                InFlight {
                    task: t,
                    worker_id: worker.to_string(),
                    started_at: SystemTime::now(),
                },
            );
        }

        assert_eq!(sweep_once(&state, SystemTime::now()), 1);
        assert!(lock(&state.workers)["w1"].dead);
        assert!(!lock(&state.workers)["w2"].dead);

        let in_flight = lock(&state.in_flight);
        assert_eq!(in_flight.len(), 1);
        assert!(in_flight.values().all(|i| i.worker_id == "w2"));

        // una segunda pasada no vuelve a contar al mismo worker
        drop(in_flight);
        assert_eq!(sweep_once(&state, SystemTime::now()), 0);
    }
}
