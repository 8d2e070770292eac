//! Escritura del lado map de un shuffle.

pub mod blocks;
mod local;
mod spill;

pub use local::{LocalShuffleWriteProcessor, DEFAULT_MAX_IN_MEM_KEYS};

use crate::context::TaskContext;
use crate::dependency::ShuffleDependency;
use crate::error::WriteError;
use crate::map_status::{MapOutputId, MapStatus};
use crate::rdd::PartitionComputation;

/// Estrategia de escritura de un shuffle: recorre la partición, reparte los
/// registros en un bloque por partición de reduce, los persiste y devuelve el
/// `MapStatus` con el tamaño de cada bloque.
///
/// Se puede invocar en paralelo desde tareas distintas del mismo executor
/// siempre que cada una use un `map_id` distinto: las implementaciones no
/// comparten estado mutable entre invocaciones.
pub trait ShuffleWriteProcessor: Send + Sync {
    fn write(
        &self,
        rdd: &dyn PartitionComputation,
        dep: &ShuffleDependency,
        map_id: MapOutputId,
        ctx: &mut TaskContext,
        partition: u32,
    ) -> Result<MapStatus, WriteError>;
}
