use serde::{Deserialize, Serialize};
use std::time::Instant;

/* =========================
   Reloj de CPU del host
   ========================= */

/// Capacidad de medir tiempo de CPU del hilo actual.
/// Si el host no la soporta, `now_ns` devuelve `None` y los campos de CPU
/// quedan en 0.
pub trait CpuClock: Send + Sync {
    fn now_ns(&self) -> Option<u64>;

    fn is_supported(&self) -> bool {
        self.now_ns().is_some()
    }
}

/// Tiempo de CPU por hilo vía `clock_gettime(CLOCK_THREAD_CPUTIME_ID)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadCpuClock;

impl CpuClock for ThreadCpuClock {
    fn now_ns(&self) -> Option<u64> {
        thread_cpu_time_ns()
    }
}

/// Host sin reloj de CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCpuClock;

impl CpuClock for NoCpuClock {
    fn now_ns(&self) -> Option<u64> {
        None
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
))]
fn thread_cpu_time_ns() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` es un timespec válido que vive durante toda la llamada.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn thread_cpu_time_ns() -> Option<u64> {
    None
}

/// Tiempos medidos para una fase de la tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTiming {
    pub wall_ns: u64,
    pub cpu_ns: u64,
    pub cpu_supported: bool,
}

/// Cronómetro de pared + CPU para una fase.
pub struct PhaseTimer<'a> {
    clock: &'a dyn CpuClock,
    wall_start: Instant,
    cpu_start: Option<u64>,
}

impl<'a> PhaseTimer<'a> {
    pub fn start(clock: &'a dyn CpuClock) -> Self {
        Self {
            clock,
            wall_start: Instant::now(),
            cpu_start: clock.now_ns(),
        }
    }

    pub fn stop(self) -> PhaseTiming {
        let wall_ns = self.wall_start.elapsed().as_nanos() as u64;
        match (self.cpu_start, self.clock.now_ns()) {
            (Some(start), Some(end)) => PhaseTiming {
                wall_ns,
                cpu_ns: end.saturating_sub(start),
                cpu_supported: true,
            },
            _ => PhaseTiming {
                wall_ns,
                cpu_ns: 0,
                cpu_supported: false,
            },
        }
    }
}

/* =========================
   Métricas de la tarea
   ========================= */

/// Métricas que reporta el write processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleWriteMetrics {
    pub bytes_written: u64,
    pub records_written: u64,
    pub write_time_ns: u64,
}

impl ShuffleWriteMetrics {
    pub fn inc_bytes_written(&mut self, n: u64) {
        self.bytes_written += n;
    }

    pub fn inc_records_written(&mut self, n: u64) {
        self.records_written += n;
    }

    pub fn inc_write_time(&mut self, ns: u64) {
        self.write_time_ns += ns;
    }
}

/// Foto congelada de las métricas, la que se reporta al terminar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetricsSnapshot {
    pub deserialize_wall_time_ns: u64,
    /// 0 cuando el host no mide CPU; ver `cpu_time_supported`.
    pub deserialize_cpu_time_ns: u64,
    pub cpu_time_supported: bool,
    pub run_wall_time_ns: u64,
    pub shuffle_write: ShuffleWriteMetrics,
}

/// Métricas mutables durante la única ejecución de una tarea.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    deserialize_wall_time_ns: u64,
    deserialize_cpu_time_ns: u64,
    cpu_time_supported: bool,
    run_wall_time_ns: u64,
    shuffle_write: ShuffleWriteMetrics,
}

impl TaskMetrics {
    /// Parte de las métricas base que manda el scheduler.
    pub fn from_base(base: TaskMetricsSnapshot) -> Self {
        Self {
            deserialize_wall_time_ns: base.deserialize_wall_time_ns,
            deserialize_cpu_time_ns: base.deserialize_cpu_time_ns,
            cpu_time_supported: base.cpu_time_supported,
            run_wall_time_ns: base.run_wall_time_ns,
            shuffle_write: base.shuffle_write,
        }
    }

    pub fn record_deserialize(&mut self, timing: PhaseTiming) {
        self.deserialize_wall_time_ns = timing.wall_ns;
        self.deserialize_cpu_time_ns = timing.cpu_ns;
        self.cpu_time_supported = timing.cpu_supported;
    }

    pub fn set_run_wall_time(&mut self, ns: u64) {
        self.run_wall_time_ns = ns;
    }

    pub fn shuffle_write_mut(&mut self) -> &mut ShuffleWriteMetrics {
        &mut self.shuffle_write
    }

    pub fn snapshot(&self) -> TaskMetricsSnapshot {
        TaskMetricsSnapshot {
            deserialize_wall_time_ns: self.deserialize_wall_time_ns,
            deserialize_cpu_time_ns: self.deserialize_cpu_time_ns,
            cpu_time_supported: self.cpu_time_supported,
            run_wall_time_ns: self.run_wall_time_ns,
            shuffle_write: self.shuffle_write.clone(),
        }
    }
}
