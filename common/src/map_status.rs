use serde::{Deserialize, Serialize};
use std::fmt;

/// Identificador del output de un map task dentro de un shuffle.
pub type MapOutputId = u64;

/// Dónde quedaron escritos los bloques de un map task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorLocation {
    pub executor_id: String,
    pub host: String,
}

impl ExecutorLocation {
    pub fn new(executor_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for ExecutorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.executor_id, self.host)
    }
}

/// Resultado de un map task exitoso: ubicación + tamaño en bytes de cada
/// bloque, uno por partición de reduce. Un 0 significa "no hay nada que pedir".
///
/// Inmutable una vez construido: los campos sólo se exponen por referencia.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStatus {
    location: ExecutorLocation,
    map_id: MapOutputId,
    block_sizes: Vec<u64>,
}

impl MapStatus {
    pub fn new(location: ExecutorLocation, map_id: MapOutputId, block_sizes: Vec<u64>) -> Self {
        Self {
            location,
            map_id,
            block_sizes,
        }
    }

    pub fn location(&self) -> &ExecutorLocation {
        &self.location
    }

    pub fn map_id(&self) -> MapOutputId {
        self.map_id
    }

    pub fn block_sizes(&self) -> &[u64] {
        &self.block_sizes
    }

    pub fn num_reduce_partitions(&self) -> usize {
        self.block_sizes.len()
    }

    /// Tamaño del bloque para `reduce_id`; fuera de rango devuelve 0.
    pub fn size_for_block(&self, reduce_id: u32) -> u64 {
        self.block_sizes
            .get(reduce_id as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Particiones de reduce que realmente tienen datos.
    pub fn non_empty_blocks(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.block_sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size > 0)
            .map(|(reduce_id, size)| (reduce_id as u32, *size))
    }

    pub fn total_bytes(&self) -> u64 {
        self.block_sizes.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> MapStatus {
        MapStatus::new(ExecutorLocation::new("exec-1", "host1"), 7, vec![10, 0, 3])
    }

    #[test]
    fn non_empty_blocks_salta_los_ceros() {
        let st = status();
        let blocks: Vec<(u32, u64)> = st.non_empty_blocks().collect();
        assert_eq!(blocks, vec![(0, 10), (2, 3)]);
        assert_eq!(st.total_bytes(), 13);
    }

    #[test]
    fn size_for_block_fuera_de_rango_es_cero() {
        let st = status();
        assert_eq!(st.size_for_block(2), 3);
        assert_eq!(st.size_for_block(9), 0);
        assert_eq!(st.num_reduce_partitions(), 3);
    }

    #[test]
    fn location_display() {
        assert_eq!(status().location().to_string(), "exec-1@host1");
    }
}
