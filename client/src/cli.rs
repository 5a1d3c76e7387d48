use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::graph::{self, GraphResult, Stage};
use common::{Engine, LocalEngine};
use std::{env, path::PathBuf};

use crate::remote::RemoteEngine;

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI para armar grafos de jobs y hablar con el master")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Conteo de palabras sobre archivos, directorios o patrones
    Wordcount {
        #[arg(value_name = "ENTRADA", required = true)]
        inputs: Vec<String>,

        /// Directorio de salida (no tiene que existir)
        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value_t = 2)]
        reduces: usize,

        /// Corre en este proceso en vez de mandarlo al master
        #[arg(long)]
        local: bool,
    },

    /// Join entre dos CSV por una columna
    Join {
        #[arg(value_name = "VENTAS_CSV")]
        left: PathBuf,

        #[arg(value_name = "CATALOGO_CSV")]
        right: PathBuf,

        /// Nombre de la columna clave
        #[arg(long, default_value = "product_id")]
        key: String,

        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value_t = 1)]
        reduces: usize,

        #[arg(long)]
        local: bool,
    },

    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// Lista los archivos de salida de un job
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    Workers,
}

/// Staging de los intermedios del grafo. Con el master tiene que ser un
/// directorio que vean también los workers.
fn staging_dir() -> PathBuf {
    env::var("MR_STAGING_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("mr-staging"))
}

async fn run_graph(output: Stage, local: bool) -> Result<GraphResult> {
    let staging = staging_dir();
    let engine: Box<dyn Engine> = if local {
        Box::new(LocalEngine::from_env())
    } else {
        Box::new(RemoteEngine::from_env())
    };
    let result = graph::run(engine.as_ref(), &[output], &staging)
        .await
        .context("el grafo falló")?;
    Ok(result)
}

fn print_graph_result(result: &GraphResult) {
    for report in &result.reports {
        println!("Job {} ({}): {:?}", report.name, report.job_id, report.status);
        for (group, counters) in &report.counters {
            println!("  {group}");
            for (name, value) in counters {
                println!("    {name:<28} {value}");
            }
        }
    }
    for sink in &result.outputs {
        println!("Salida de {}:", sink.job);
        for path in &sink.paths {
            println!("  - {}", path.display());
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Wordcount {
            inputs,
            output,
            reduces,
            local,
        } => {
            let output = output.to_string_lossy().to_string();
            let stage = common::wordcount::wordcount_graph(&inputs, &output, reduces);
            let result = run_graph(stage, local).await?;
            print_graph_result(&result);
        }

        Commands::Join {
            left,
            right,
            key,
            output,
            reduces,
            local,
        } => {
            println!("Join entre CSVs:");
            println!("  left : {}", left.display());
            println!("  right: {}", right.display());
            println!("  key  : {}", key);

            let stage = common::join::join_graph(&left, &right, &key, &output, reduces);
            let result = run_graph(stage, local).await?;
            print_graph_result(&result);
        }

        Commands::Status { id } => {
            let remote = RemoteEngine::from_env();
            let job = remote.job(&id).await?;
            println!("Job:");
            println!("  id: {}", job.id);
            println!("  nombre: {}", job.name);
            println!("  estado: {:?}", job.status);
            if let Some(phase) = job.phase {
                println!("  fase: {}", phase.as_str());
            }

            // métricas de tareas
            println!(
                "  tareas: total={}, completadas={}, fallidas={}, reintentos={}",
                job.total_tasks, job.completed_tasks, job.failed_tasks, job.retries
            );

            // progreso calculado localmente
            let done = job.completed_tasks + job.failed_tasks;
            if job.total_tasks > 0 {
                let pct = (done as f64 / job.total_tasks as f64) * 100.0;
                println!("  progreso: {:.1}%", pct);
            } else {
                println!("  progreso: (sin tareas)");
            }

            println!("  submitted_at: {}", job.submitted_at);
            if let Some(ref started) = job.started_at {
                println!("  iniciado: {}", started);
            }
            if let Some(ref done) = job.finished_at {
                println!("  finalizado: {}", done);
            }
            if let Some(ref error) = job.error {
                println!("  error: {}", error);
            }
        }

        Commands::Results { id } => {
            let remote = RemoteEngine::from_env();
            let results = remote.results(&id).await?;
            println!("Resultados para job {}:", results.job_id);
            for dir in &results.output_paths {
                println!("  salida: {}", dir.display());
            }
            if results.files.is_empty() {
                println!("  (sin archivos de salida)");
            } else {
                println!("  archivos:");
                for f in results.files {
                    println!("    - {}", f.display());
                }
            }
        }

        Commands::Workers => {
            let remote = RemoteEngine::from_env();
            let workers = remote
                .workers()
                .await
                .with_context(|| format!("consultando workers en {}", remote.base_url()))?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  concurrency    : max={}, activas={}",
                    w.max_concurrency, w.active_tasks
                );
                println!(
                    "  tareas         : started={}, ok={}, failed={}",
                    w.tasks_started, w.tasks_succeeded, w.tasks_failed
                );
                match w.avg_task_ms {
                    Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
                    None => println!("  avg_task_ms    : (sin datos)"),
                }
                match w.last_cpu_percent {
                    Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                    None => println!("  cpu_percent    : (sin datos)"),
                }
                match w.last_mem_bytes {
                    Some(mem) => println!("  mem_bytes      : {}", mem),
                    None => println!("  mem_bytes      : (sin datos)"),
                }
                println!();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wordcount_parsea_entradas_y_flags() {
        let cli = Cli::try_parse_from([
            "client", "wordcount", "a.txt", "docs/", "--output", "/tmp/out", "--local",
        ])
        .unwrap();
        match cli.command {
            Commands::Wordcount {
                inputs,
                reduces,
                local,
                ..
            } => {
                assert_eq!(inputs, vec!["a.txt", "docs/"]);
                assert_eq!(reduces, 2);
                assert!(local);
            }
            other => panic!("comando inesperado: {other:?}"),
        }
    }

    #[test]
    fn wordcount_sin_entradas_es_error() {
        assert!(Cli::try_parse_from(["client", "wordcount", "--output", "/tmp/out"]).is_err());
    }

    #[test]
    fn join_usa_product_id_por_defecto() {
        let cli = Cli::try_parse_from([
            "client", "join", "v.csv", "c.csv", "--output", "/tmp/j",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Join { ref key, .. } if key == "product_id"));
    }
}
