//! Engine que manda cada job al master y espera a que termine.

use async_trait::async_trait;
use common::{
    Engine, JobConf, JobInfo, JobReport, JobResults, JobStatus, JobSubmission, MrError,
    WorkerMetrics,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::{env, time::Duration};
use tracing::{debug, info};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
pub fn master_base_url() -> String {
    env::var("MASTER_URL")
        .or_else(|_| env::var("MASTER_BASE_URL"))
        .unwrap_or_else(|_| "http://localhost:8080".to_string())
}

pub struct RemoteEngine {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

fn http_err(err: reqwest::Error) -> MrError {
    MrError::Engine(format!("HTTP: {err}"))
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> common::Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(MrError::Engine(format!("el master respondió {status}: {body}")));
    }
    resp.json().await.map_err(http_err)
}

impl RemoteEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn from_env() -> Self {
        Self::new(master_base_url())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_job(&self, submission: &JobSubmission) -> common::Result<JobInfo> {
        let url = format!("{}/api/v1/jobs", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(submission)
            .send()
            .await
            .map_err(http_err)?;
        read_json(resp).await
    }

    pub async fn job(&self, id: &str) -> common::Result<JobInfo> {
        let url = format!("{}/api/v1/jobs/{id}", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(http_err)?;
        read_json(resp).await
    }

    pub async fn results(&self, id: &str) -> common::Result<JobResults> {
        let url = format!("{}/api/v1/jobs/{id}/results", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(http_err)?;
        read_json(resp).await
    }

    pub async fn workers(&self) -> common::Result<Vec<WorkerMetrics>> {
        let url = format!("{}/api/v1/workers", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(http_err)?;
        read_json(resp).await
    }
}

/// Reporte de un job que el master dio por terminado.
pub fn report_from(info: JobInfo) -> common::Result<JobReport> {
    match info.status {
        JobStatus::Succeeded => Ok(JobReport {
            job_id: info.id,
            name: info.name,
            status: info.status,
            counters: info.counters,
            output_paths: info.output_paths,
        }),
        JobStatus::Failed => Err(MrError::TaskFailed {
            stage: info
                .phase
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "job".to_string()),
            task: info.id,
            reason: info.error.unwrap_or_else(|| "sin detalle".to_string()),
        }),
        other => Err(MrError::Engine(format!(
            "el job {} todavía está en {:?}",
            info.id, other
        ))),
    }
}

#[async_trait]
impl Engine for RemoteEngine {
    async fn submit(&self, conf: &JobConf) -> common::Result<JobReport> {
        let submission = JobSubmission {
            name: common::engine::job_name(conf),
            conf: conf.clone(),
        };
        let created = self.create_job(&submission).await?;
        info!("job {} enviado al master como {}", submission.name, created.id);

        let mut info = created;
        while !info.status.is_finished() {
            tokio::time::sleep(self.poll_interval).await;
            info = self.job(&info.id).await?;
            debug!(
                "job {}: {:?} {}/{} tareas",
                info.id, info.status, info.completed_tasks, info.total_tasks
            );
        }
        report_from(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::TaskKind;

    fn info(status: JobStatus) -> JobInfo {
        JobInfo {
            id: "j1".to_string(),
            name: "wc".to_string(),
            status,
            phase: Some(TaskKind::Reduce),
            reduces: 1,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_tasks: 2,
            completed_tasks: 1,
            failed_tasks: 1,
            retries: 2,
            counters: Default::default(),
            output_paths: vec!["/tmp/out".into()],
            error: Some("explotó".to_string()),
        }
    }

    #[test]
    fn job_exitoso_da_reporte() {
        let report = report_from(info(JobStatus::Succeeded)).unwrap();
        assert_eq!(report.job_id, "j1");
        assert_eq!(report.output_paths, vec![std::path::PathBuf::from("/tmp/out")]);
    }

    #[test]
    fn job_fallido_conserva_la_etapa() {
        let err = report_from(info(JobStatus::Failed)).unwrap_err();
        assert_eq!(err.stage(), Some("reduce"));
        assert!(err.to_string().contains("explotó"));
    }

    #[test]
    fn job_en_curso_no_es_reporte() {
        assert!(matches!(
            report_from(info(JobStatus::Running)),
            Err(MrError::Engine(_))
        ));
    }
}
