use serde::{Deserialize, Serialize};
use std::{any::Any, io};
use thiserror::Error;

use crate::map_status::MapOutputId;

/// Fase de la tarea en la que ocurrió un fallo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    Deserialize,
    Write,
}

/// Errores del codec de closures (bytes <-> payload).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload mal formado: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no se pudo resolver el payload: {0}")]
    Resolve(#[from] ResolveError),
}

/// Fallos al resolver nombres contra el registro de funciones
/// (equivalente a un classpath que no tiene la clase pedida).
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("función {kind} desconocida: {name}")]
    UnknownFunction { kind: &'static str, name: String },

    #[error("write processor desconocido: {0}")]
    UnknownWriteProcessor(String),

    #[error("descriptor de shuffle inválido: {0}")]
    InvalidDependency(String),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast {0} no registrado")]
    NotFound(u64),

    #[error("error leyendo broadcast {id}: {source}")]
    Io {
        id: u64,
        #[source]
        source: io::Error,
    },
}

/// Errores que puede devolver un `ShuffleWriteProcessor`.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O escribiendo map output {map_id} (reduce {reduce_id:?}): {source}")]
    Io {
        map_id: MapOutputId,
        reduce_id: Option<u32>,
        #[source]
        source: io::Error,
    },

    #[error("no se pudo serializar un registro del map output {map_id}: {source}")]
    Encode {
        map_id: MapOutputId,
        #[source]
        source: serde_json::Error,
    },

    #[error("registro sin forma [clave, valor] en map output {map_id}: {record}")]
    NotAPair { map_id: MapOutputId, record: String },

    #[error("la computación del dataset falló: {0:#}")]
    Compute(#[source] anyhow::Error),

    #[error("escritura interrumpida")]
    Interrupted,
}

impl WriteError {
    pub fn io(map_id: MapOutputId, reduce_id: Option<u32>, source: io::Error) -> Self {
        WriteError::Io {
            map_id,
            reduce_id,
            source,
        }
    }

    /// Un panic de código de usuario cuenta como fallo de cómputo.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic sin mensaje".to_string()
        };
        WriteError::Compute(anyhow::anyhow!("panic en código de usuario: {msg}"))
    }
}

/// Resultado fallido de `ShuffleMapTask::run`.
///
/// `Cancelled` no es un fallo: el scheduler lo distingue para no
/// descontarlo del presupuesto de reintentos.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("ShuffleMapTask({stage_id}, {partition}) falló en fase {phase:?}: {cause:#}")]
    Execution {
        stage_id: u32,
        partition: u32,
        phase: TaskPhase,
        #[source]
        cause: anyhow::Error,
    },

    #[error("ShuffleMapTask({stage_id}, {partition}) cancelada")]
    Cancelled { stage_id: u32, partition: u32 },

    #[error("descripción de tarea inválida: {0}")]
    InvalidDescription(String),
}

impl TaskError {
    pub fn phase(&self) -> Option<TaskPhase> {
        match self {
            TaskError::Execution { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }
}
