use serde_json::{json, Value};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::blocks;
use super::spill::SpillingCombiner;
use super::ShuffleWriteProcessor;
use crate::context::TaskContext;
use crate::dependency::{compare_keys, ShuffleDependency};
use crate::error::WriteError;
use crate::map_status::{MapOutputId, MapStatus};
use crate::rdd::{PartitionComputation, Record, RecordIter};

pub const DEFAULT_MAX_IN_MEM_KEYS: usize = 100_000;

/// Write processor que deja los bloques en disco local, un archivo JSONL por
/// partición de reduce bajo `<root>/shuffle_<id>/map_<map_id>/`.
///
/// Escribe primero en un directorio temporal propio del intento y lo renombra
/// al final; si el intento falla o se cancela, nada queda publicado con ese
/// map id.
#[derive(Debug, Clone)]
pub struct LocalShuffleWriteProcessor {
    root: PathBuf,
    max_in_mem_keys: usize,
}

impl LocalShuffleWriteProcessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_in_mem_keys: DEFAULT_MAX_IN_MEM_KEYS,
        }
    }

    pub fn with_max_in_mem_keys(mut self, n: usize) -> Self {
        self.max_in_mem_keys = n;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ShuffleWriteProcessor for LocalShuffleWriteProcessor {
    fn write(
        &self,
        rdd: &dyn PartitionComputation,
        dep: &ShuffleDependency,
        map_id: MapOutputId,
        ctx: &mut TaskContext,
        partition: u32,
    ) -> Result<MapStatus, WriteError> {
        let started = Instant::now();

        let final_dir = blocks::map_output_dir(&self.root, dep.shuffle_id, map_id);
        let tmp_dir = blocks::shuffle_dir(&self.root, dep.shuffle_id)
            .join(format!("map_{}.inprogress-{}", map_id, Uuid::new_v4()));
        fs::create_dir_all(&tmp_dir).map_err(|e| WriteError::io(map_id, None, e))?;

        // El código de usuario corre dentro de compute y de la iteración
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let records = rdd.compute(partition).map_err(WriteError::Compute)?;
            self.write_blocks(records, dep, map_id, ctx, &tmp_dir)
        }))
        .unwrap_or_else(|payload| Err(WriteError::from_panic(payload)))
        .and_then(|written| {
            if ctx.is_interrupted() {
                return Err(WriteError::Interrupted);
            }
            commit(&tmp_dir, &final_dir, map_id)?;
            Ok(written)
        });

        let written = match result {
            Ok(w) => w,
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                return Err(e);
            }
        };

        let metrics = ctx.metrics_mut().shuffle_write_mut();
        metrics.inc_bytes_written(written.sizes.iter().sum());
        metrics.inc_records_written(written.records);
        metrics.inc_write_time(started.elapsed().as_nanos() as u64);

        info!(
            "shuffle {} map output {}: {} bloques, {} registros, {} bytes en {}",
            dep.shuffle_id,
            map_id,
            written.sizes.len(),
            written.records,
            written.sizes.iter().sum::<u64>(),
            final_dir.display()
        );

        Ok(MapStatus::new(ctx.location().clone(), map_id, written.sizes))
    }
}

impl LocalShuffleWriteProcessor {
    fn write_blocks(
        &self,
        records: RecordIter,
        dep: &ShuffleDependency,
        map_id: MapOutputId,
        ctx: &TaskContext,
        dir: &Path,
    ) -> Result<Written, WriteError> {
        let mut out = BucketWriters::create(dir, dep.num_reduce_partitions(), map_id)?;

        if let Some(agg) = dep.map_side_aggregator() {
            debug!("map output {}: escritura con combine del lado map", map_id);
            let mut combiner =
                SpillingCombiner::new(dir.join("_spill"), self.max_in_mem_keys, agg.clone(), map_id);
            for rec in records {
                check_interrupted(ctx)?;
                let (k, v) = split_pair(rec.map_err(WriteError::Compute)?, map_id)?;
                combiner.insert(k, v)?;
            }
            let mut entries = combiner.finish()?;
            let ordering = dep.key_ordering;
            entries.sort_by(|a, b| match ordering {
                Some(o) => o.compare(&a.0, &b.0),
                None => compare_keys(&a.0, &b.0),
            });
            for (k, c) in entries {
                let reduce_id = dep.partitioner.partition_for(&k);
                out.write(reduce_id, &json!([k, c]))?;
            }
        } else if let Some(ordering) = dep.key_ordering {
            debug!("map output {}: escritura ordenada por clave", map_id);
            let mut buckets: Vec<Vec<(Value, Value)>> =
                vec![Vec::new(); dep.num_reduce_partitions() as usize];
            for rec in records {
                check_interrupted(ctx)?;
                let (k, v) = split_pair(rec.map_err(WriteError::Compute)?, map_id)?;
                let reduce_id = dep.partitioner.partition_for(&k) as usize;
                buckets[reduce_id].push((k, v));
            }
            for (reduce_id, mut bucket) in buckets.into_iter().enumerate() {
                bucket.sort_by(|a, b| ordering.compare(&a.0, &b.0));
                for (k, v) in bucket {
                    out.write(reduce_id as u32, &json!([k, v]))?;
                }
            }
        } else {
            for rec in records {
                check_interrupted(ctx)?;
                let rec = rec.map_err(WriteError::Compute)?;
                let reduce_id = dep.partitioner.partition_for(pair_key(&rec, map_id)?);
                out.write(reduce_id, &rec)?;
            }
        }

        out.finish()
    }
}

fn check_interrupted(ctx: &TaskContext) -> Result<(), WriteError> {
    if ctx.is_interrupted() {
        Err(WriteError::Interrupted)
    } else {
        Ok(())
    }
}

fn pair_key(rec: &Record, map_id: MapOutputId) -> Result<&Value, WriteError> {
    match rec {
        Value::Array(items) if items.len() == 2 => Ok(&items[0]),
        other => Err(WriteError::NotAPair {
            map_id,
            record: other.to_string(),
        }),
    }
}

fn split_pair(rec: Record, map_id: MapOutputId) -> Result<(Value, Value), WriteError> {
    match rec {
        Value::Array(mut items) if items.len() == 2 => {
            let v = items.pop().unwrap_or(Value::Null);
            let k = items.pop().unwrap_or(Value::Null);
            Ok((k, v))
        }
        other => Err(WriteError::NotAPair {
            map_id,
            record: other.to_string(),
        }),
    }
}

/// Reemplaza (si existía) la salida publicada de este map id.
fn commit(tmp_dir: &Path, final_dir: &Path, map_id: MapOutputId) -> Result<(), WriteError> {
    if final_dir.exists() {
        fs::remove_dir_all(final_dir).map_err(|e| WriteError::io(map_id, None, e))?;
    }
    fs::rename(tmp_dir, final_dir).map_err(|e| WriteError::io(map_id, None, e))
}

struct Written {
    sizes: Vec<u64>,
    records: u64,
}

/// Un writer por partición de reduce + bytes escritos en cada uno.
struct BucketWriters {
    writers: Vec<BufWriter<File>>,
    sizes: Vec<u64>,
    records: u64,
    map_id: MapOutputId,
}

impl BucketWriters {
    fn create(dir: &Path, num_reducers: u32, map_id: MapOutputId) -> Result<Self, WriteError> {
        let mut writers = Vec::with_capacity(num_reducers as usize);
        for reduce_id in 0..num_reducers {
            let path = dir.join(format!("part-{}.jsonl", reduce_id));
            let file = File::create(&path).map_err(|e| WriteError::io(map_id, Some(reduce_id), e))?;
            writers.push(BufWriter::new(file));
        }
        Ok(Self {
            writers,
            sizes: vec![0; num_reducers as usize],
            records: 0,
            map_id,
        })
    }

    fn write(&mut self, reduce_id: u32, rec: &Record) -> Result<(), WriteError> {
        let mut line = serde_json::to_vec(rec).map_err(|source| WriteError::Encode {
            map_id: self.map_id,
            source,
        })?;
        line.push(b'\n');

        let idx = reduce_id as usize;
        self.writers[idx]
            .write_all(&line)
            .map_err(|e| WriteError::io(self.map_id, Some(reduce_id), e))?;
        self.sizes[idx] += line.len() as u64;
        self.records += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<Written, WriteError> {
        for (reduce_id, w) in self.writers.iter_mut().enumerate() {
            w.flush()
                .map_err(|e| WriteError::io(self.map_id, Some(reduce_id as u32), e))?;
        }
        Ok(Written {
            sizes: self.sizes,
            records: self.records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContext;
    use crate::dependency::{KeyOrdering, ShuffleDependencySpec};
    use crate::map_status::ExecutorLocation;
    use crate::rdd::{RddSpec, SourceSpec};
    use crate::registry::FunctionRegistry;
    use crate::task::TaskIdentity;
    use std::{env, sync::Arc};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("local_writer_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn ctx() -> TaskContext {
        TaskContext::new(
            TaskIdentity {
                stage_id: 0,
                stage_attempt_id: 0,
                partition: 0,
                num_partitions: 1,
                task_attempt_id: 9,
            },
            ExecutorLocation::new("exec-1", "localhost"),
        )
    }

    fn setup(
        root: &Path,
        records: Vec<Value>,
        dep: ShuffleDependencySpec,
        max_keys: usize,
    ) -> (Box<dyn PartitionComputation>, ShuffleDependency) {
        let mut reg = FunctionRegistry::with_builtins();
        reg.register_write_processor(
            "local",
            Arc::new(LocalShuffleWriteProcessor::new(root).with_max_in_mem_keys(max_keys)),
        );
        let rdd = RddSpec::new(SourceSpec::Parallelize {
            slices: vec![records],
        })
        .resolve(&reg)
        .unwrap();
        (Box::new(rdd), dep.resolve(&reg).unwrap())
    }

    fn read_all(root: &Path, shuffle_id: u32, map_id: u64, n: u32) -> Vec<Vec<Value>> {
        (0..n)
            .map(|r| blocks::read_block(&blocks::block_path(root, shuffle_id, map_id, r)).unwrap())
            .collect()
    }

    #[test]
    fn streaming_reparte_por_hash_y_mide_bytes() {
        let root = temp_dir("streaming");
        let input: Vec<Value> = ["a", "b", "c", "a"].iter().map(|w| json!([w, 1])).collect();
        let expected_bytes: u64 = input
            .iter()
            .map(|r| serde_json::to_vec(r).unwrap().len() as u64 + 1)
            .sum();
        let (rdd, dep) = setup(&root, input, ShuffleDependencySpec::hash(1, 3), 100);

        let mut c = ctx();
        let st = dep
            .write_processor
            .write(rdd.as_ref(), &dep, 5, &mut c, 0)
            .unwrap();

        assert_eq!(st.block_sizes().len(), 3);
        assert_eq!(st.total_bytes(), expected_bytes);
        assert_eq!(st.map_id(), 5);

        let blocks = read_all(&root, 1, 5, 3);
        for (reduce_id, block) in blocks.iter().enumerate() {
            for rec in block {
                assert_eq!(dep.partitioner.partition_for(&rec[0]) as usize, reduce_id);
            }
            if block.is_empty() {
                assert_eq!(st.size_for_block(reduce_id as u32), 0);
            }
        }

        let snap = c.metrics().snapshot();
        assert_eq!(snap.shuffle_write.records_written, 4);
        assert_eq!(snap.shuffle_write.bytes_written, expected_bytes);
    }

    #[test]
    fn combine_del_lado_map_con_spill() {
        let root = temp_dir("combine");
        let input: Vec<Value> = ["a", "b", "a", "c", "a", "b"]
            .iter()
            .map(|w| json!([w, 1]))
            .collect();
        let mut spec = ShuffleDependencySpec::hash(2, 1);
        spec.aggregator = Some("sum".into());
        spec.map_side_combine = true;
        let (rdd, dep) = setup(&root, input, spec, 1);

        let mut c = ctx();
        dep.write_processor
            .write(rdd.as_ref(), &dep, 0, &mut c, 0)
            .unwrap();

        let block = &read_all(&root, 2, 0, 1)[0];
        assert_eq!(block, &vec![json!(["a", 3]), json!(["b", 2]), json!(["c", 1])]);
        // los spills no quedan publicados
        assert!(!blocks::map_output_dir(&root, 2, 0).join("_spill").exists());
    }

    #[test]
    fn orden_descendente_dentro_de_cada_bloque() {
        let root = temp_dir("sorted");
        let input: Vec<Value> = [3, 1, 2].iter().map(|n| json!([n, "x"])).collect();
        let mut spec = ShuffleDependencySpec::hash(3, 1);
        spec.key_ordering = Some(KeyOrdering::Descending);
        let (rdd, dep) = setup(&root, input, spec, 100);

        dep.write_processor
            .write(rdd.as_ref(), &dep, 0, &mut ctx(), 0)
            .unwrap();

        let block = &read_all(&root, 3, 0, 1)[0];
        assert_eq!(block, &vec![json!([3, "x"]), json!([2, "x"]), json!([1, "x"])]);
    }

    #[test]
    fn registro_que_no_es_par_falla_y_no_publica() {
        let root = temp_dir("not_pair");
        let (rdd, dep) = setup(&root, vec![json!("suelto")], ShuffleDependencySpec::hash(4, 2), 100);

        let err = dep
            .write_processor
            .write(rdd.as_ref(), &dep, 1, &mut ctx(), 0)
            .unwrap_err();
        assert!(matches!(err, WriteError::NotAPair { map_id: 1, .. }));
        assert!(!blocks::map_output_dir(&root, 4, 1).exists());
        // el directorio temporal se limpió
        let leftovers = fs::read_dir(blocks::shuffle_dir(&root, 4)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn interrupcion_antes_de_escribir_no_publica() {
        let root = temp_dir("interrupted");
        let (rdd, dep) = setup(&root, vec![json!(["a", 1])], ShuffleDependencySpec::hash(5, 2), 100);

        let mut c = ctx();
        c.cancellation_token().cancel();
        let err = dep
            .write_processor
            .write(rdd.as_ref(), &dep, 0, &mut c, 0)
            .unwrap_err();
        assert!(matches!(err, WriteError::Interrupted));
        assert!(!blocks::map_output_dir(&root, 5, 0).exists());
    }

    #[test]
    fn particion_vacia_produce_bloques_de_tamano_cero() {
        let root = temp_dir("empty");
        let (rdd, dep) = setup(&root, vec![], ShuffleDependencySpec::hash(6, 4), 100);

        let st = dep
            .write_processor
            .write(rdd.as_ref(), &dep, 2, &mut ctx(), 0)
            .unwrap();
        assert_eq!(st.block_sizes(), &[0, 0, 0, 0]);
        assert_eq!(st.non_empty_blocks().count(), 0);
    }

    #[test]
    fn panic_en_funcion_de_usuario_es_error_de_computo_y_limpia() {
        let root = temp_dir("panic");
        let mut reg = FunctionRegistry::with_builtins();
        reg.register_write_processor("local", Arc::new(LocalShuffleWriteProcessor::new(&root)));
        reg.register_map("explota", |rec| {
            if rec == &json!("c") {
                panic!("la función de usuario explotó");
            }
            Ok(json!([rec, 1]))
        });
        let rdd = RddSpec::new(SourceSpec::Parallelize {
            slices: vec![vec![json!("a"), json!("b"), json!("c")]],
        })
        .map("explota")
        .resolve(&reg)
        .unwrap();
        let dep = ShuffleDependencySpec::hash(7, 2).resolve(&reg).unwrap();

        let err = dep
            .write_processor
            .write(&rdd, &dep, 3, &mut ctx(), 0)
            .unwrap_err();
        match err {
            WriteError::Compute(cause) => assert!(cause.to_string().contains("explotó")),
            other => panic!("esperaba Compute, vino {:?}", other),
        }
        assert!(!blocks::map_output_dir(&root, 7, 3).exists());
        let leftovers = fs::read_dir(blocks::shuffle_dir(&root, 7)).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
