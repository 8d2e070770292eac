use anyhow::{anyhow, bail};
use serde_json::{json, Value};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::dependency::{Aggregator, CollectAggregator, CountAggregator, SumAggregator};
use crate::error::ResolveError;
use crate::rdd::Record;
use crate::shuffle::ShuffleWriteProcessor;

pub type MapFn = Arc<dyn Fn(&Record) -> anyhow::Result<Record> + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(&Record) -> anyhow::Result<Vec<Record>> + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&Record) -> anyhow::Result<bool> + Send + Sync>;

/// Registro de funciones con nombre contra el que se resuelven los payloads.
///
/// Cumple el papel del classloader: un payload que nombra algo que no está
/// registrado no se puede deserializar.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    maps: HashMap<String, MapFn>,
    flat_maps: HashMap<String, FlatMapFn>,
    filters: HashMap<String, FilterFn>,
    aggregators: HashMap<String, Arc<dyn Aggregator>>,
    write_processors: HashMap<String, Arc<dyn ShuffleWriteProcessor>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("maps", &sorted_keys(&self.maps))
            .field("flat_maps", &sorted_keys(&self.flat_maps))
            .field("filters", &sorted_keys(&self.filters))
            .field("aggregators", &sorted_keys(&self.aggregators))
            .field("write_processors", &sorted_keys(&self.write_processors))
            .finish()
    }
}

fn sorted_keys<V>(m: &HashMap<String, V>) -> Vec<&str> {
    let mut keys: Vec<&str> = m.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con las funciones de WordCount y los agregadores básicos.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_map("text_field", text_field);
        reg.register_map("to_lower", to_lower);
        reg.register_map("pair_with_one", pair_with_one);
        reg.register_flat_map("split_words", split_words);
        reg.register_filter("non_empty", non_empty);
        reg.register_aggregator("sum", Arc::new(SumAggregator));
        reg.register_aggregator("count", Arc::new(CountAggregator));
        reg.register_aggregator("collect", Arc::new(CollectAggregator));
        reg
    }

    pub fn register_map<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    {
        self.maps.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_flat_map<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Record) -> anyhow::Result<Vec<Record>> + Send + Sync + 'static,
    {
        self.flat_maps.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_filter<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Record) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_aggregator(&mut self, name: &str, agg: Arc<dyn Aggregator>) {
        self.aggregators.insert(name.to_string(), agg);
    }

    pub fn register_write_processor(&mut self, name: &str, p: Arc<dyn ShuffleWriteProcessor>) {
        self.write_processors.insert(name.to_string(), p);
    }

    pub fn map_fn(&self, name: &str) -> Result<MapFn, ResolveError> {
        self.maps
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("map", name))
    }

    pub fn flat_map_fn(&self, name: &str) -> Result<FlatMapFn, ResolveError> {
        self.flat_maps
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("flat_map", name))
    }

    pub fn filter_fn(&self, name: &str) -> Result<FilterFn, ResolveError> {
        self.filters
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("filter", name))
    }

    pub fn aggregator(&self, name: &str) -> Result<Arc<dyn Aggregator>, ResolveError> {
        self.aggregators
            .get(name)
            .cloned()
            .ok_or_else(|| unknown("aggregator", name))
    }

    pub fn write_processor(&self, name: &str) -> Result<Arc<dyn ShuffleWriteProcessor>, ResolveError> {
        self.write_processors
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownWriteProcessor(name.to_string()))
    }
}

fn unknown(kind: &'static str, name: &str) -> ResolveError {
    ResolveError::UnknownFunction {
        kind,
        name: name.to_string(),
    }
}

/* =========================
   Funciones incluidas (WordCount)
   ========================= */

/// map: objeto {"text": ...} -> el texto como string.
fn text_field(rec: &Record) -> anyhow::Result<Record> {
    rec.get("text")
        .and_then(|v| v.as_str())
        .map(|s| Value::String(s.to_string()))
        .ok_or_else(|| anyhow!("registro sin campo \"text\": {}", rec))
}

fn to_lower(rec: &Record) -> anyhow::Result<Record> {
    match rec.as_str() {
        Some(s) => Ok(Value::String(s.to_lowercase())),
        None => bail!("to_lower espera un string, recibió {}", rec),
    }
}

/// map: x -> [x, 1]
fn pair_with_one(rec: &Record) -> anyhow::Result<Record> {
    Ok(json!([rec, 1_u64]))
}

/// flat_map: línea -> palabras normalizadas (alfanumérico y '_', en minúscula).
fn split_words(rec: &Record) -> anyhow::Result<Vec<Record>> {
    let text = match rec {
        Value::String(s) => s.as_str(),
        other => other.get("text").and_then(|v| v.as_str()).unwrap_or(""),
    };

    let words = text
        .split_whitespace()
        .map(|raw| {
            raw.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .map(Value::String)
        .collect();

    Ok(words)
}

/// filter: strings no vacíos; en pares mira la clave.
fn non_empty(rec: &Record) -> anyhow::Result<bool> {
    let target = match rec {
        Value::Array(items) if items.len() == 2 => &items[0],
        other => other,
    };
    Ok(match target {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}
