//! Errores de la librería: compilación de grafos, slots, formatos y tareas.

use std::fmt;
use thiserror::Error;

use crate::registry::Role;

pub type Result<T> = std::result::Result<T, MrError>;

#[derive(Error, Debug)]
pub enum MrError {
    /// Se pidió un slot más allá de la tabla pre-generada.
    #[error("sin capacidad para el slot {role}.{index} (capacidad {capacity})")]
    SlotCapacity {
        role: Role,
        index: usize,
        capacity: usize,
    },

    #[error("clase de slot desconocida: {0}")]
    UnknownClass(String),

    #[error("behavior no registrado: {0}")]
    UnknownBehavior(String),

    /// No se pudo reconstruir el behavior de un slot al arrancar la tarea.
    #[error("error enlazando {role}.{index}: {reason}")]
    Bind {
        role: Role,
        index: usize,
        reason: String,
    },

    #[error("configuración inválida: {0}")]
    Conf(String),

    #[error("salida dux desconocida: {0}")]
    UnknownOutput(String),

    #[error("salida dux duplicada: {0}")]
    DuplicateOutput(String),

    #[error("escritura después de cerrar la salida")]
    WriterClosed,

    #[error("tipo inválido: se esperaba {expected}, llegó {found}")]
    Type { expected: String, found: String },

    #[error("formato: {0}")]
    Format(String),

    #[error("la tarea {task} falló en la etapa {stage}: {reason}")]
    TaskFailed {
        stage: String,
        task: String,
        reason: String,
    },

    #[error("el job '{job}' falló en la etapa {stage}: {source}")]
    JobFailed {
        job: String,
        stage: String,
        #[source]
        source: Box<MrError>,
    },

    #[error("grafo inválido: {0}")]
    Graph(String),

    #[error("engine: {0}")]
    Engine(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    /// Error devuelto por código de usuario (factories y behaviors).
    #[error("behavior: {0}")]
    Behavior(#[from] anyhow::Error),
}

impl MrError {
    pub fn conf<E: fmt::Display>(err: E) -> Self {
        Self::Conf(err.to_string())
    }

    pub fn format<E: fmt::Display>(err: E) -> Self {
        Self::Format(err.to_string())
    }

    pub fn graph<E: fmt::Display>(err: E) -> Self {
        Self::Graph(err.to_string())
    }

    /// Etapa a la que pertenece el error, si la hay (map, reduce, ...).
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::TaskFailed { stage, .. } | Self::JobFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
