use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::error::Result;
use crate::job::JobId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    /// Ubicaciones que reportó el formato de salida del job
    pub output_paths: Vec<PathBuf>,
    /// Archivos visibles dentro de esas ubicaciones
    pub files: Vec<PathBuf>,
}

impl JobResults {
    /// Lista los archivos de salida, salteando `_temporary`, marcas y ocultos.
    pub fn collect(job_id: &str, output_paths: Vec<PathBuf>) -> Result<Self> {
        let mut files = Vec::new();
        for path in &output_paths {
            if path.is_file() {
                files.push(path.clone());
                continue;
            }
            if !path.is_dir() {
                continue;
            }
            let mut in_dir: Vec<PathBuf> = fs::read_dir(path)?
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    let visible = p
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| !n.starts_with('_') && !n.starts_with('.'))
                        .unwrap_or(false);
                    visible && p.is_file()
                })
                .collect();
            in_dir.sort();
            files.extend(in_dir);
        }

        Ok(Self {
            job_id: job_id.to_string(),
            output_paths,
            files,
        })
    }
}
