mod config;
mod executor;

use anyhow::{Context, Result};
use common::{
    ClosureCodec, ClosurePayloadSpec, FunctionRegistry, JsonClosureCodec, LocalBroadcastManager,
    LocalShuffleWriteProcessor, RddSpec, ShuffleDependencySpec, SourceSpec, TaskEnv,
    ThreadCpuClock,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ExecutorConfig;
use crate::executor::{Executor, StageSpec, TaskResult};

/// Stage de WordCount: una partición por archivo, palabras -> (palabra, 1),
/// sumadas del lado map y repartidas por hash.
fn wordcount_payload(paths: Vec<String>, num_reducers: u32) -> ClosurePayloadSpec {
    ClosurePayloadSpec {
        rdd: RddSpec::new(SourceSpec::TextFile { paths })
            .flat_map("split_words")
            .filter("non_empty")
            .map("pair_with_one"),
        dependency: ShuffleDependencySpec {
            aggregator: Some("sum".to_string()),
            map_side_combine: true,
            ..ShuffleDependencySpec::hash(0, num_reducers)
        },
    }
}

fn input_files(pattern: &str) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("patrón inválido: {pattern}"))? {
        match entry {
            Ok(p) if p.is_file() => paths.push(p.to_string_lossy().to_string()),
            Ok(_) => {}
            Err(e) => warn!("no se pudo leer {}: {}", e.path().display(), e),
        }
    }
    paths.sort();
    Ok(paths)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("executor=debug,common=info")),
        )
        .init();

    let cfg = ExecutorConfig::from_env();
    info!(
        "executor {} en {} (slots={}, direccionamiento={:?}, shuffle_dir={})",
        cfg.executor_id,
        cfg.host,
        cfg.concurrency,
        cfg.addressing,
        cfg.shuffle_dir.display()
    );

    let broadcast = Arc::new(match &cfg.broadcast_dir {
        Some(dir) => LocalBroadcastManager::with_dir(dir.clone()),
        None => LocalBroadcastManager::new(),
    });

    let mut registry = FunctionRegistry::with_builtins();
    registry.register_write_processor(
        "local",
        Arc::new(
            LocalShuffleWriteProcessor::new(cfg.shuffle_dir.clone())
                .with_max_in_mem_keys(cfg.max_in_mem_keys),
        ),
    );

    let env = TaskEnv {
        broadcast: broadcast.clone(),
        codec: Arc::new(JsonClosureCodec),
        registry: Arc::new(registry),
        cpu_clock: Arc::new(ThreadCpuClock),
    };
    let executor = Executor::new(cfg.location(), env, cfg.addressing, cfg.concurrency);

    let paths = input_files(&cfg.input_glob)?;
    if paths.is_empty() {
        warn!("no hay archivos que coincidan con {}", cfg.input_glob);
        return Ok(());
    }
    info!("{} archivos de entrada, {} reducers", paths.len(), cfg.num_reducers);

    let num_partitions = paths.len() as u32;
    let blob = JsonClosureCodec.encode(&wordcount_payload(paths, cfg.num_reducers))?;
    let handle = broadcast.register(blob);

    // Ctrl-C cancela lo que esté corriendo; las tareas reportan Killed
    let killer = executor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let n = killer.kill_all();
            warn!("ctrl-c: {} intentos cancelados", n);
        }
    });

    let stage = StageSpec::new(0, handle, num_partitions);
    let outcomes = executor.run_stage(&stage).await;

    let failed = outcomes
        .iter()
        .filter(|o| !matches!(o.result, TaskResult::Success { .. }))
        .count();
    if failed > 0 {
        warn!("{} de {} tareas no terminaron bien", failed, outcomes.len());
    }

    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}
