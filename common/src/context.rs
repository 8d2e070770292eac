use std::{collections::HashMap, fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastFetcher;
use crate::closure::ClosureCodec;
use crate::map_status::ExecutorLocation;
use crate::metrics::{CpuClock, TaskMetrics};
use crate::registry::FunctionRegistry;
use crate::task::TaskIdentity;

/// Servicios del executor que comparten todas las tareas.
#[derive(Clone)]
pub struct TaskEnv {
    pub broadcast: Arc<dyn BroadcastFetcher>,
    pub codec: Arc<dyn ClosureCodec>,
    /// Contra esto se resuelven los nombres del payload.
    pub registry: Arc<FunctionRegistry>,
    pub cpu_clock: Arc<dyn CpuClock>,
}

impl fmt::Debug for TaskEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnv")
            .field("registry", &self.registry)
            .field("cpu_time_supported", &self.cpu_clock.is_supported())
            .finish()
    }
}

/// Estado de una ejecución concreta de una tarea.
#[derive(Debug)]
pub struct TaskContext {
    identity: TaskIdentity,
    location: ExecutorLocation,
    local_properties: HashMap<String, String>,
    is_barrier: bool,
    cancel: CancellationToken,
    metrics: TaskMetrics,
}

impl TaskContext {
    pub fn new(identity: TaskIdentity, location: ExecutorLocation) -> Self {
        Self {
            identity,
            location,
            local_properties: HashMap::new(),
            is_barrier: false,
            cancel: CancellationToken::new(),
            metrics: TaskMetrics::default(),
        }
    }

    pub fn with_local_properties(mut self, props: HashMap<String, String>) -> Self {
        self.local_properties = props;
        self
    }

    pub fn with_barrier(mut self, is_barrier: bool) -> Self {
        self.is_barrier = is_barrier;
        self
    }

    /// Usa un token de cancelación que controla el host.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn task_attempt_id(&self) -> u64 {
        self.identity.task_attempt_id
    }

    pub fn location(&self) -> &ExecutorLocation {
        &self.location
    }

    pub fn local_property(&self, key: &str) -> Option<&str> {
        self.local_properties.get(key).map(String::as_str)
    }

    pub fn is_barrier(&self) -> bool {
        self.is_barrier
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut TaskMetrics {
        &mut self.metrics
    }
}
