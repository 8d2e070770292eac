use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    cmp::Ordering,
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::error::ResolveError;
use crate::registry::FunctionRegistry;
use crate::shuffle::ShuffleWriteProcessor;

/* =========================
   Particionador
   ========================= */

pub trait Partitioner: Send + Sync + fmt::Debug {
    fn num_partitions(&self) -> u32;

    /// Partición de reduce para una clave; siempre en `[0, num_partitions)`.
    fn partition_for(&self, key: &Value) -> u32;
}

/// hash(clave) % num_partitions.
///
/// Usa `DefaultHasher::new()` (SipHash con claves fijas): el resultado es el
/// mismo entre procesos y ejecuciones compilados con la misma toolchain, pero
/// la biblioteca estándar no lo garantiza entre versiones de Rust. Map y
/// reduce de un mismo shuffle tienen que salir del mismo build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPartitioner {
    num_partitions: u32,
}

impl HashPartitioner {
    pub fn new(num_partitions: u32) -> Result<Self, ResolveError> {
        if num_partitions == 0 {
            return Err(ResolveError::InvalidDependency(
                "el particionador necesita al menos 1 partición".to_string(),
            ));
        }
        Ok(Self { num_partitions })
    }
}

impl Partitioner for HashPartitioner {
    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    fn partition_for(&self, key: &Value) -> u32 {
        let mut h = DefaultHasher::new();
        match key {
            Value::String(s) => s.hash(&mut h),
            other => other.to_string().hash(&mut h),
        }
        (h.finish() % self.num_partitions as u64) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionerSpec {
    Hash { num_partitions: u32 },
}

impl PartitionerSpec {
    fn resolve(&self) -> Result<Arc<dyn Partitioner>, ResolveError> {
        match self {
            PartitionerSpec::Hash { num_partitions } => {
                Ok(Arc::new(HashPartitioner::new(*num_partitions)?))
            }
        }
    }
}

/* =========================
   Agregadores
   ========================= */

/// Combinación de valores por clave (create / merge_value / merge_combiners).
pub trait Aggregator: Send + Sync {
    fn create_combiner(&self, value: Value) -> anyhow::Result<Value>;

    fn merge_value(&self, combiner: Value, value: Value) -> anyhow::Result<Value>;

    fn merge_combiners(&self, a: Value, b: Value) -> anyhow::Result<Value>;
}

fn add_numbers(a: &Value, b: &Value) -> anyhow::Result<Value> {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(json!(sum));
        }
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(json!(sum));
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(json!(x + y)),
        _ => bail!("sum espera números, recibió {} y {}", a, b),
    }
}

/// Suma numérica (el reduce_by_key de WordCount).
#[derive(Debug, Clone, Copy, Default)]
pub struct SumAggregator;

impl Aggregator for SumAggregator {
    fn create_combiner(&self, value: Value) -> anyhow::Result<Value> {
        if !value.is_number() {
            bail!("sum espera números, recibió {}", value);
        }
        Ok(value)
    }

    fn merge_value(&self, combiner: Value, value: Value) -> anyhow::Result<Value> {
        add_numbers(&combiner, &value)
    }

    fn merge_combiners(&self, a: Value, b: Value) -> anyhow::Result<Value> {
        add_numbers(&a, &b)
    }
}

/// Cuenta valores por clave.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountAggregator;

impl Aggregator for CountAggregator {
    fn create_combiner(&self, _value: Value) -> anyhow::Result<Value> {
        Ok(json!(1_u64))
    }

    fn merge_value(&self, combiner: Value, _value: Value) -> anyhow::Result<Value> {
        add_numbers(&combiner, &json!(1_u64))
    }

    fn merge_combiners(&self, a: Value, b: Value) -> anyhow::Result<Value> {
        add_numbers(&a, &b)
    }
}

/// Junta todos los valores de una clave en un array.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectAggregator;

impl Aggregator for CollectAggregator {
    fn create_combiner(&self, value: Value) -> anyhow::Result<Value> {
        Ok(Value::Array(vec![value]))
    }

    fn merge_value(&self, combiner: Value, value: Value) -> anyhow::Result<Value> {
        match combiner {
            Value::Array(mut items) => {
                items.push(value);
                Ok(Value::Array(items))
            }
            other => bail!("combiner de collect inválido: {}", other),
        }
    }

    fn merge_combiners(&self, a: Value, b: Value) -> anyhow::Result<Value> {
        match (a, b) {
            (Value::Array(mut left), Value::Array(right)) => {
                left.extend(right);
                Ok(Value::Array(left))
            }
            (a, b) => bail!("combiners de collect inválidos: {} / {}", a, b),
        }
    }
}

/* =========================
   Orden de claves
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOrdering {
    Ascending,
    Descending,
}

impl KeyOrdering {
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ord = compare_keys(a, b);
        match self {
            KeyOrdering::Ascending => ord,
            KeyOrdering::Descending => ord.reverse(),
        }
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Orden total sobre claves JSON: null < bool < número < string < array < objeto.
pub fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => {
                let fx = x.as_f64().unwrap_or(f64::NAN);
                let fy = y.as_f64().unwrap_or(f64::NAN);
                fx.total_cmp(&fy)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y.iter()) {
                let ord = compare_keys(i, j);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ if type_rank(a) == type_rank(b) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/* =========================
   Dependencia de shuffle
   ========================= */

fn default_write_processor() -> String {
    "local".to_string()
}

/// Descriptor serializable de la dependencia de shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleDependencySpec {
    pub shuffle_id: u32,
    pub partitioner: PartitionerSpec,
    #[serde(default)]
    pub aggregator: Option<String>,
    #[serde(default)]
    pub key_ordering: Option<KeyOrdering>,
    #[serde(default)]
    pub map_side_combine: bool,
    /// Nombre del write processor registrado en el executor.
    #[serde(default = "default_write_processor")]
    pub write_processor: String,
}

impl ShuffleDependencySpec {
    pub fn hash(shuffle_id: u32, num_partitions: u32) -> Self {
        Self {
            shuffle_id,
            partitioner: PartitionerSpec::Hash { num_partitions },
            aggregator: None,
            key_ordering: None,
            map_side_combine: false,
            write_processor: default_write_processor(),
        }
    }

    pub fn resolve(self, registry: &FunctionRegistry) -> Result<ShuffleDependency, ResolveError> {
        let partitioner = self.partitioner.resolve()?;
        let aggregator = self
            .aggregator
            .as_deref()
            .map(|name| registry.aggregator(name))
            .transpose()?;

        if self.map_side_combine && aggregator.is_none() {
            return Err(ResolveError::InvalidDependency(
                "map_side_combine requiere un aggregator".to_string(),
            ));
        }

        let write_processor = registry.write_processor(&self.write_processor)?;

        Ok(ShuffleDependency {
            shuffle_id: self.shuffle_id,
            partitioner,
            aggregator,
            key_ordering: self.key_ordering,
            map_side_combine: self.map_side_combine,
            write_processor,
        })
    }
}

/// Dependencia ya resuelta. El write processor queda fijado acá y es el
/// mismo para todas las tareas del shuffle.
#[derive(Clone)]
pub struct ShuffleDependency {
    pub shuffle_id: u32,
    pub partitioner: Arc<dyn Partitioner>,
    pub aggregator: Option<Arc<dyn Aggregator>>,
    pub key_ordering: Option<KeyOrdering>,
    pub map_side_combine: bool,
    pub write_processor: Arc<dyn ShuffleWriteProcessor>,
}

impl ShuffleDependency {
    pub fn num_reduce_partitions(&self) -> u32 {
        self.partitioner.num_partitions()
    }

    /// Aggregator a usar del lado map, si corresponde combinar.
    pub fn map_side_aggregator(&self) -> Option<&Arc<dyn Aggregator>> {
        if self.map_side_combine {
            self.aggregator.as_ref()
        } else {
            None
        }
    }
}

impl fmt::Debug for ShuffleDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuffleDependency")
            .field("shuffle_id", &self.shuffle_id)
            .field("partitioner", &self.partitioner)
            .field("has_aggregator", &self.aggregator.is_some())
            .field("key_ordering", &self.key_ordering)
            .field("map_side_combine", &self.map_side_combine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_partitioner_retorna_id_en_rango() {
        let p = HashPartitioner::new(10).unwrap();
        for key in [json!("a"), json!("xyz"), json!(42), json!(["k", 1]), Value::Null] {
            assert!(p.partition_for(&key) < 10);
        }
    }

    #[test]
    fn hash_partitioner_es_determinista() {
        let p = HashPartitioner::new(7).unwrap();
        assert_eq!(p.partition_for(&json!("hola")), p.partition_for(&json!("hola")));
    }

    #[test]
    fn particionadores_resueltos_por_separado_coinciden() {
        // dos resoluciones independientes del mismo descriptor, como en dos tareas
        let spec: PartitionerSpec =
            serde_json::from_value(json!({"kind": "hash", "num_partitions": 5})).unwrap();
        let a = spec.resolve().unwrap();
        let b = spec.clone().resolve().unwrap();
        for i in 0..200 {
            for key in [json!(format!("palabra{i}")), json!(i), json!([i, "x"])] {
                assert_eq!(a.partition_for(&key), b.partition_for(&key));
            }
        }
    }

    #[test]
    fn hash_partitioner_rechaza_cero_particiones() {
        assert!(HashPartitioner::new(0).is_err());
    }

    #[test]
    fn sum_suma_enteros_y_flotantes() {
        let s = SumAggregator;
        let c = s.create_combiner(json!(2)).unwrap();
        let c = s.merge_value(c, json!(3)).unwrap();
        assert_eq!(c, json!(5));
        assert_eq!(s.merge_combiners(json!(1.5), json!(1)).unwrap(), json!(2.5));
        assert!(s.create_combiner(json!("x")).is_err());
    }

    #[test]
    fn count_y_collect() {
        let c = CountAggregator;
        let acc = c.create_combiner(json!("a")).unwrap();
        let acc = c.merge_value(acc, json!("b")).unwrap();
        assert_eq!(c.merge_combiners(acc, json!(3)).unwrap(), json!(5));

        let col = CollectAggregator;
        let acc = col.create_combiner(json!(1)).unwrap();
        let acc = col.merge_value(acc, json!(2)).unwrap();
        assert_eq!(
            col.merge_combiners(acc, json!([3])).unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn compare_keys_orden_por_tipo_y_valor() {
        let mut keys = vec![json!("b"), json!(10), Value::Null, json!("a"), json!(2), json!(true)];
        keys.sort_by(compare_keys);
        assert_eq!(
            keys,
            vec![Value::Null, json!(true), json!(2), json!(10), json!("a"), json!("b")]
        );
        assert_eq!(
            KeyOrdering::Descending.compare(&json!("a"), &json!("b")),
            Ordering::Greater
        );
    }

    #[test]
    fn map_side_combine_sin_aggregator_es_invalido() {
        let reg = FunctionRegistry::with_builtins();
        let mut spec = ShuffleDependencySpec::hash(0, 2);
        spec.map_side_combine = true;
        assert!(matches!(
            spec.resolve(&reg),
            Err(ResolveError::InvalidDependency(_))
        ));
    }

    #[test]
    fn spec_por_defecto_usa_write_processor_local() {
        let spec: ShuffleDependencySpec = serde_json::from_value(json!({
            "shuffle_id": 3,
            "partitioner": {"kind": "hash", "num_partitions": 4}
        }))
        .unwrap();
        assert_eq!(spec.write_processor, "local");
        assert!(!spec.map_side_combine);
        assert_eq!(spec, ShuffleDependencySpec::hash(3, 4));
    }
}
