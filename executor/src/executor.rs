use chrono::{DateTime, Utc};
use common::{
    BroadcastHandle, ExecutorLocation, MapOutputAddressing, MapStatus, ShuffleMapTask,
    TaskDescription, TaskEnv, TaskMetricsSnapshot, TaskPhase,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/* =========================
   Resultados de tareas
   ========================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    Success { map_status: MapStatus },
    Failed {
        /// `None` si la tarea ni siquiera llegó a correr.
        phase: Option<TaskPhase>,
        message: String,
    },
    /// Cancelada a pedido; no cuenta como fallo.
    Killed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_attempt_id: u64,
    pub stage_id: u32,
    pub partition: u32,
    pub result: TaskResult,
    pub metrics: TaskMetricsSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Lo necesario para lanzar todas las particiones de un stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage_id: u32,
    pub stage_attempt_id: u32,
    pub broadcast: BroadcastHandle,
    pub num_partitions: u32,
    pub job_id: Option<u64>,
    pub app_id: Option<String>,
    pub local_properties: HashMap<String, String>,
}

impl StageSpec {
    pub fn new(stage_id: u32, broadcast: BroadcastHandle, num_partitions: u32) -> Self {
        Self {
            stage_id,
            stage_attempt_id: 0,
            broadcast,
            num_partitions,
            job_id: None,
            app_id: None,
            local_properties: HashMap::new(),
        }
    }
}

/* =========================
   Executor
   ========================= */

/// Corre `ShuffleMapTask`s en hilos de bloqueo, hasta `concurrency` a la vez.
#[derive(Clone)]
pub struct Executor {
    location: ExecutorLocation,
    env: TaskEnv,
    addressing: MapOutputAddressing,
    slots: Arc<Semaphore>,
    next_attempt_id: Arc<AtomicU64>,
    running: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl Executor {
    pub fn new(
        location: ExecutorLocation,
        env: TaskEnv,
        addressing: MapOutputAddressing,
        concurrency: usize,
    ) -> Self {
        Self {
            location,
            env,
            addressing,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            next_attempt_id: Arc::new(AtomicU64::new(0)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ids de intento crecientes, nunca repetidos dentro del proceso.
    pub fn next_attempt_id(&self) -> u64 {
        self.next_attempt_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn describe_task(&self, stage: &StageSpec, partition: u32) -> TaskDescription {
        TaskDescription {
            stage_id: stage.stage_id,
            stage_attempt_id: stage.stage_attempt_id,
            task_attempt_id: self.next_attempt_id(),
            broadcast: stage.broadcast,
            partition,
            num_partitions: stage.num_partitions,
            locality_hints: vec![self.location.host.clone()],
            local_properties: stage.local_properties.clone(),
            serialized_base_metrics: None,
            job_id: stage.job_id,
            app_id: stage.app_id.clone(),
            app_attempt_id: None,
            is_barrier: false,
        }
    }

    /// Intentos lanzados que todavía no terminaron (incluye los que esperan slot).
    pub fn running_tasks(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.running.lock().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Pide la cancelación de un intento. Devuelve `false` si no está corriendo.
    pub fn kill_task(&self, task_attempt_id: u64) -> bool {
        match self.running.lock().unwrap().get(&task_attempt_id) {
            Some(token) => {
                info!("cancelando intento {}", task_attempt_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancela todos los intentos vivos y devuelve cuántos eran.
    pub fn kill_all(&self) -> usize {
        let running = self.running_tasks();
        for id in &running {
            self.kill_task(*id);
        }
        running.len()
    }

    pub async fn launch_task(&self, desc: TaskDescription) -> TaskOutcome {
        let started_at = Utc::now();
        let attempt = desc.task_attempt_id;
        let stage_id = desc.stage_id;
        let partition = desc.partition;

        let outcome = |result: TaskResult, metrics: TaskMetricsSnapshot| TaskOutcome {
            task_attempt_id: attempt,
            stage_id,
            partition,
            result,
            metrics,
            started_at,
            finished_at: Utc::now(),
        };

        let task = match ShuffleMapTask::new(desc, self.addressing) {
            Ok(t) => t,
            Err(e) => {
                warn!("intento {} rechazado: {}", attempt, e);
                return outcome(
                    TaskResult::Failed {
                        phase: e.phase(),
                        message: e.to_string(),
                    },
                    TaskMetricsSnapshot::default(),
                );
            }
        };

        let token = CancellationToken::new();
        self.running.lock().unwrap().insert(attempt, token.clone());

        let (result, metrics) = self.run_in_slot(task, token).await;

        self.running.lock().unwrap().remove(&attempt);
        outcome(result, metrics)
    }

    async fn run_in_slot(
        &self,
        task: ShuffleMapTask,
        token: CancellationToken,
    ) -> (TaskResult, TaskMetricsSnapshot) {
        let attempt = task.identity().task_attempt_id;

        // Un kill mientras espera slot la saca de la cola sin correrla
        let permit = tokio::select! {
            p = self.slots.clone().acquire_owned() => p,
            _ = token.cancelled() => {
                info!("intento {} cancelado antes de conseguir slot", attempt);
                return (TaskResult::Killed, TaskMetricsSnapshot::default());
            }
        };
        let permit = match permit {
            Ok(p) => p,
            Err(e) => {
                return (
                    TaskResult::Failed {
                        phase: None,
                        message: format!("executor cerrado: {e}"),
                    },
                    TaskMetricsSnapshot::default(),
                );
            }
        };

        let env = self.env.clone();
        let location = self.location.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut ctx = task.new_context(location, token);
            let result = task.run(&env, &mut ctx);
            (result, ctx.metrics().snapshot())
        });

        let joined = handle.await;
        drop(permit);

        match joined {
            Ok((Ok(map_status), metrics)) => {
                info!(
                    "intento {} terminó: {} bloques no vacíos, {} bytes",
                    attempt,
                    map_status.non_empty_blocks().count(),
                    map_status.total_bytes()
                );
                (TaskResult::Success { map_status }, metrics)
            }
            Ok((Err(e), metrics)) if e.is_cancelled() => {
                info!("intento {} cancelado", attempt);
                (TaskResult::Killed, metrics)
            }
            Ok((Err(e), metrics)) => {
                warn!("error en intento {}: {}", attempt, e);
                (
                    TaskResult::Failed {
                        phase: e.phase(),
                        message: e.to_string(),
                    },
                    metrics,
                )
            }
            Err(e) => {
                warn!("panic o join error en intento {}: {:?}", attempt, e);
                (
                    TaskResult::Failed {
                        phase: None,
                        message: format!("join error: {e}"),
                    },
                    TaskMetricsSnapshot::default(),
                )
            }
        }
    }

    /// Lanza una tarea por partición y espera a todas.
    /// El orden del resultado sigue al de las particiones.
    pub async fn run_stage(&self, stage: &StageSpec) -> Vec<TaskOutcome> {
        info!(
            "stage {} (intento {}): lanzando {} tareas",
            stage.stage_id, stage.stage_attempt_id, stage.num_partitions
        );

        let mut handles = Vec::with_capacity(stage.num_partitions as usize);
        for partition in 0..stage.num_partitions {
            let desc = self.describe_task(stage, partition);
            let exec = self.clone();
            handles.push(tokio::spawn(async move { exec.launch_task(desc).await }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for h in handles {
            match h.await {
                Ok(o) => outcomes.push(o),
                Err(e) => warn!("tarea del stage {} perdida: {:?}", stage.stage_id, e),
            }
        }
        outcomes
    }
}
