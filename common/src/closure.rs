use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::dependency::{ShuffleDependency, ShuffleDependencySpec};
use crate::error::CodecError;
use crate::rdd::{PartitionComputation, RddSpec};
use crate::registry::FunctionRegistry;

/// Lo que el driver serializa una vez por stage y reparte por broadcast:
/// el dataset a computar y la dependencia de shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosurePayloadSpec {
    pub rdd: RddSpec,
    pub dependency: ShuffleDependencySpec,
}

/// Codec de closures (bytes <-> descripción).
pub trait ClosureCodec: Send + Sync {
    fn encode(&self, payload: &ClosurePayloadSpec) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<ClosurePayloadSpec, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonClosureCodec;

impl ClosureCodec for JsonClosureCodec {
    fn encode(&self, payload: &ClosurePayloadSpec) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<ClosurePayloadSpec, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload ya deserializado y resuelto. Cada tarea tiene su propia copia;
/// el blob original sigue siendo del broadcast.
pub struct ClosurePayload {
    pub rdd: Arc<dyn PartitionComputation>,
    pub dependency: ShuffleDependency,
}

impl ClosurePayload {
    pub fn deserialize(
        bytes: &[u8],
        codec: &dyn ClosureCodec,
        registry: &FunctionRegistry,
    ) -> Result<Self, CodecError> {
        let spec = codec.decode(bytes)?;
        let rdd = spec.rdd.resolve(registry)?;
        let dependency = spec.dependency.resolve(registry)?;
        Ok(Self {
            rdd: Arc::new(rdd),
            dependency,
        })
    }
}
