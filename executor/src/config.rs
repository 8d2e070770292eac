use common::{map_status::ExecutorLocation, shuffle::DEFAULT_MAX_IN_MEM_KEYS, MapOutputAddressing};
use std::{env, path::PathBuf};
use uuid::Uuid;

const DEFAULT_WORKER_CONCURRENCY: usize = 2;
const DEFAULT_NUM_REDUCERS: u32 = 2;
const DEFAULT_INPUT_GLOB: &str = "/data/input/*.txt";

/// Configuración del executor. Se lee una sola vez al arrancar y se pasa
/// explícitamente; nada la vuelve a leer durante una tarea.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub executor_id: String,
    pub host: String,
    pub shuffle_dir: PathBuf,
    pub broadcast_dir: Option<PathBuf>,
    pub concurrency: usize,
    pub addressing: MapOutputAddressing,
    pub max_in_mem_keys: usize,
    pub input_glob: String,
    pub num_reducers: u32,
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con otra fuente de variables (tests).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let executor_id = get("EXECUTOR_ID").unwrap_or_else(|| Uuid::new_v4().to_string());

        let host = get("EXECUTOR_HOST").unwrap_or_else(|| {
            hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        });

        let shuffle_dir = get("SHUFFLE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("shuffle"));

        let broadcast_dir = get("BROADCAST_DIR").map(PathBuf::from);

        let concurrency = get("WORKER_CONCURRENCY")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

        let use_legacy = get("SHUFFLE_USE_OLD_FETCH_PROTOCOL")
            .map(|s| parse_flag(&s))
            .unwrap_or(false);

        let max_in_mem_keys = get("MAX_IN_MEM_KEYS")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_IN_MEM_KEYS);

        let input_glob = get("INPUT_GLOB").unwrap_or_else(|| DEFAULT_INPUT_GLOB.to_string());

        let num_reducers = get("NUM_REDUCERS")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_NUM_REDUCERS);

        Self {
            executor_id,
            host,
            shuffle_dir,
            broadcast_dir,
            concurrency,
            addressing: MapOutputAddressing::from_legacy_flag(use_legacy),
            max_in_mem_keys,
            input_glob,
            num_reducers,
        }
    }

    pub fn location(&self) -> ExecutorLocation {
        ExecutorLocation::new(self.executor_id.clone(), self.host.clone())
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
