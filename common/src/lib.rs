//! Lado map del shuffle: la tarea que computa una partición y reparte su
//! salida en buckets por reducer, más todo lo que necesita para correr
//! dentro de un executor.

pub mod broadcast;
pub mod closure;
pub mod context;
pub mod dependency;
pub mod error;
pub mod map_status;
pub mod metrics;
pub mod rdd;
pub mod registry;
pub mod shuffle;
pub mod task;

pub use broadcast::{BroadcastFetcher, BroadcastHandle, LocalBroadcastManager};
pub use closure::{ClosureCodec, ClosurePayload, ClosurePayloadSpec, JsonClosureCodec};
pub use context::{TaskContext, TaskEnv};
pub use dependency::{ShuffleDependency, ShuffleDependencySpec};
pub use error::{TaskError, TaskPhase, WriteError};
pub use map_status::{ExecutorLocation, MapOutputId, MapStatus};
pub use metrics::{CpuClock, NoCpuClock, TaskMetricsSnapshot, ThreadCpuClock};
pub use rdd::{RddSpec, Record, SourceSpec};
pub use registry::FunctionRegistry;
pub use shuffle::{LocalShuffleWriteProcessor, ShuffleWriteProcessor};
pub use task::{MapOutputAddressing, ShuffleMapTask, TaskDescription, TaskIdentity};
