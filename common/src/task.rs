use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastHandle;
use crate::closure::ClosurePayload;
use crate::context::{TaskContext, TaskEnv};
use crate::error::{TaskError, TaskPhase, WriteError};
use crate::map_status::{ExecutorLocation, MapOutputId, MapStatus};
use crate::metrics::{PhaseTimer, TaskMetrics, TaskMetricsSnapshot};

/// Identifica un intento de una partición dentro de un intento de stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub stage_id: u32,
    pub stage_attempt_id: u32,
    pub partition: u32,
    pub num_partitions: u32,
    /// Único en toda la vida del job; lo asigna el scheduler.
    pub task_attempt_id: u64,
}

/// Lo que manda el scheduler para lanzar una tarea de shuffle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescription {
    pub stage_id: u32,
    pub stage_attempt_id: u32,
    pub task_attempt_id: u64,
    pub broadcast: BroadcastHandle,
    pub partition: u32,
    pub num_partitions: u32,
    #[serde(default)]
    pub locality_hints: Vec<String>,
    /// Se pasan tal cual al contexto de la tarea.
    #[serde(default)]
    pub local_properties: HashMap<String, String>,
    /// JSON de un `TaskMetricsSnapshot` con el que arrancan las métricas.
    #[serde(default)]
    pub serialized_base_metrics: Option<Vec<u8>>,
    #[serde(default)]
    pub job_id: Option<u64>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_attempt_id: Option<String>,
    #[serde(default)]
    pub is_barrier: bool,
}

/* =========================
   Direccionamiento del map output
   ========================= */

/// Cómo se identifica el output de un map task dentro del shuffle.
///
/// - `Legacy`: el id es el índice de partición. Supone que nunca hay dos
///   intentos vivos de la misma partición a la vez; eso lo tiene que
///   garantizar quien llama, acá no se puede verificar.
/// - `Modern` (por defecto): el id es el `task_attempt_id`, así intentos
///   especulativos o re-ejecutados no se pisan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapOutputAddressing {
    Legacy,
    #[default]
    Modern,
}

impl MapOutputAddressing {
    pub fn from_legacy_flag(use_legacy_fetch_protocol: bool) -> Self {
        if use_legacy_fetch_protocol {
            MapOutputAddressing::Legacy
        } else {
            MapOutputAddressing::Modern
        }
    }

    pub fn resolve(&self, identity: &TaskIdentity) -> ResolvedMapOutputId {
        match self {
            MapOutputAddressing::Legacy => ResolvedMapOutputId::Legacy(identity.partition as u64),
            MapOutputAddressing::Modern => ResolvedMapOutputId::Modern(identity.task_attempt_id),
        }
    }
}

/// Id ya resuelto; se calcula una sola vez por ejecución.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMapOutputId {
    Legacy(MapOutputId),
    Modern(MapOutputId),
}

impl ResolvedMapOutputId {
    pub fn id(&self) -> MapOutputId {
        match self {
            ResolvedMapOutputId::Legacy(id) | ResolvedMapOutputId::Modern(id) => *id,
        }
    }
}

/* =========================
   ShuffleMapTask
   ========================= */

/// Tarea del lado map de un shuffle: deserializa el closure, resuelve su map
/// output id y delega la escritura en el write processor de la dependencia.
/// No toca los datos por sí misma.
#[derive(Debug, Clone)]
pub struct ShuffleMapTask {
    desc: TaskDescription,
    preferred_locs: Vec<String>,
    addressing: MapOutputAddressing,
}

impl ShuffleMapTask {
    /// `addressing` sale del flag de configuración del proceso, leído una vez
    /// al construir la tarea.
    pub fn new(desc: TaskDescription, addressing: MapOutputAddressing) -> Result<Self, TaskError> {
        if desc.partition >= desc.num_partitions {
            return Err(TaskError::InvalidDescription(format!(
                "partición {} fuera de rango para un stage de {} particiones",
                desc.partition, desc.num_partitions
            )));
        }

        let mut preferred_locs: Vec<String> = Vec::with_capacity(desc.locality_hints.len());
        for loc in &desc.locality_hints {
            if !preferred_locs.contains(loc) {
                preferred_locs.push(loc.clone());
            }
        }

        Ok(Self {
            desc,
            preferred_locs,
            addressing,
        })
    }

    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity {
            stage_id: self.desc.stage_id,
            stage_attempt_id: self.desc.stage_attempt_id,
            partition: self.desc.partition,
            num_partitions: self.desc.num_partitions,
            task_attempt_id: self.desc.task_attempt_id,
        }
    }

    pub fn description(&self) -> &TaskDescription {
        &self.desc
    }

    pub fn addressing(&self) -> MapOutputAddressing {
        self.addressing
    }

    /// Preferencias de ubicación sin duplicados, en orden de aparición.
    pub fn preferred_locations(&self) -> &[String] {
        &self.preferred_locs
    }

    /// Contexto para ejecutar esta tarea en `location`.
    pub fn new_context(&self, location: ExecutorLocation, cancel: CancellationToken) -> TaskContext {
        TaskContext::new(self.identity(), location)
            .with_local_properties(self.desc.local_properties.clone())
            .with_barrier(self.desc.is_barrier)
            .with_cancellation(cancel)
    }

    /// Ejecuta la tarea y devuelve el `MapStatus` del write processor.
    ///
    /// Si el contexto se cancela, devuelve `TaskError::Cancelled` y nunca un
    /// status. No reintenta nada.
    pub fn run(&self, env: &TaskEnv, ctx: &mut TaskContext) -> Result<MapStatus, TaskError> {
        let started = Instant::now();
        let result = self.run_attempt(env, ctx);
        ctx.metrics_mut()
            .set_run_wall_time(started.elapsed().as_nanos() as u64);
        result
    }

    fn run_attempt(&self, env: &TaskEnv, ctx: &mut TaskContext) -> Result<MapStatus, TaskError> {
        if ctx.is_interrupted() {
            return Err(self.cancelled());
        }

        info!(
            "arrancando {} (attempt {}, stage attempt {}, job {:?}, app {:?}/{:?})",
            self,
            self.desc.task_attempt_id,
            self.desc.stage_attempt_id,
            self.desc.job_id,
            self.desc.app_id,
            self.desc.app_attempt_id
        );

        if !env.cpu_clock.is_supported() {
            debug!("{}: el host no mide tiempo de CPU, se reporta 0", self);
        }

        let timer = PhaseTimer::start(env.cpu_clock.as_ref());
        let payload = self.deserialize_payload(env, ctx);
        let timing = timer.stop();
        ctx.metrics_mut().record_deserialize(timing);

        let payload = payload.map_err(|cause| {
            warn!("{}: no se pudo deserializar el closure: {:#}", self, cause);
            self.failed(TaskPhase::Deserialize, cause)
        })?;
        debug!(
            "{}: closure deserializado en {} ns (cpu {} ns)",
            self, timing.wall_ns, timing.cpu_ns
        );

        let resolved = self.addressing.resolve(&self.identity());
        debug!("{}: map output id {:?}", self, resolved);

        let dep = &payload.dependency;
        let status = panic::catch_unwind(AssertUnwindSafe(|| {
            dep.write_processor.write(
                payload.rdd.as_ref(),
                dep,
                resolved.id(),
                ctx,
                self.desc.partition,
            )
        }))
        .unwrap_or_else(|p| Err(WriteError::from_panic(p)))
        .map_err(|e| match e {
            WriteError::Interrupted => self.cancelled(),
            other => {
                warn!("{}: falló la escritura del shuffle: {}", self, other);
                self.failed(TaskPhase::Write, other.into())
            }
        })?;

        if ctx.is_interrupted() {
            return Err(self.cancelled());
        }

        Ok(status)
    }

    fn deserialize_payload(
        &self,
        env: &TaskEnv,
        ctx: &mut TaskContext,
    ) -> anyhow::Result<ClosurePayload> {
        if let Some(raw) = &self.desc.serialized_base_metrics {
            let base: TaskMetricsSnapshot =
                serde_json::from_slice(raw).context("métricas base inválidas")?;
            *ctx.metrics_mut() = TaskMetrics::from_base(base);
        }

        let blob = env.broadcast.fetch(self.desc.broadcast)?;
        let payload = ClosurePayload::deserialize(&blob, env.codec.as_ref(), &env.registry)?;
        Ok(payload)
    }

    fn failed(&self, phase: TaskPhase, cause: anyhow::Error) -> TaskError {
        TaskError::Execution {
            stage_id: self.desc.stage_id,
            partition: self.desc.partition,
            phase,
            cause,
        }
    }

    fn cancelled(&self) -> TaskError {
        info!("{} cancelada", self);
        TaskError::Cancelled {
            stage_id: self.desc.stage_id,
            partition: self.desc.partition,
        }
    }
}

impl fmt::Display for ShuffleMapTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ShuffleMapTask({}, {})",
            self.desc.stage_id, self.desc.partition
        )
    }
}
