use serde_json::{json, Value};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use crate::dependency::Aggregator;
use crate::error::WriteError;
use crate::map_status::MapOutputId;

/// Combinador clave→combiner del lado map, con spill a disco cuando el mapa
/// en memoria llega a `threshold` claves.
///
/// Las claves se indexan por su texto JSON canónico.
pub(crate) struct SpillingCombiner {
    map: HashMap<String, (Value, Value)>,
    spill_files: Vec<PathBuf>,
    dir: PathBuf,
    threshold: usize,
    aggregator: Arc<dyn Aggregator>,
    map_id: MapOutputId,
}

impl SpillingCombiner {
    pub(crate) fn new(
        dir: PathBuf,
        threshold: usize,
        aggregator: Arc<dyn Aggregator>,
        map_id: MapOutputId,
    ) -> Self {
        Self {
            map: HashMap::new(),
            spill_files: Vec::new(),
            dir,
            threshold: threshold.max(1),
            aggregator,
            map_id,
        }
    }

    pub(crate) fn insert(&mut self, key: Value, value: Value) -> Result<(), WriteError> {
        let slot = key.to_string();
        let combined = match self.map.remove(&slot) {
            Some((_, c)) => self.aggregator.merge_value(c, value),
            None => self.aggregator.create_combiner(value),
        }
        .map_err(WriteError::Compute)?;
        self.map.insert(slot, (key, combined));

        if self.map.len() >= self.threshold {
            self.spill()?;
        }
        Ok(())
    }

    fn io_err(&self, e: io::Error) -> WriteError {
        WriteError::io(self.map_id, None, e)
    }

    fn spill(&mut self) -> Result<(), WriteError> {
        if self.map.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).map_err(|e| self.io_err(e))?;
        let path = self
            .dir
            .join(format!("spill-{}.jsonl", self.spill_files.len() + 1));
        let mut writer = BufWriter::new(File::create(&path).map_err(|e| self.io_err(e))?);

        let keys = self.map.len();
        for (_, (k, c)) in self.map.drain() {
            serde_json::to_writer(&mut writer, &json!([k, c])).map_err(|source| {
                WriteError::Encode {
                    map_id: self.map_id,
                    source,
                }
            })?;
            writer.write_all(b"\n").map_err(|e| WriteError::io(self.map_id, None, e))?;
        }
        writer.flush().map_err(|e| self.io_err(e))?;

        debug!(
            "map output {}: spill de {} claves en {}",
            self.map_id,
            keys,
            path.display()
        );
        self.spill_files.push(path);
        Ok(())
    }

    fn merge_spill(
        &self,
        path: &Path,
        acc: &mut HashMap<String, (Value, Value)>,
    ) -> Result<(), WriteError> {
        let file = File::open(path).map_err(|e| self.io_err(e))?;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: Value = serde_json::from_str(&line).map_err(|e| {
                self.io_err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("error al parsear spill {}: {e}", path.display()),
                ))
            })?;
            let Value::Array(mut pair) = entry else {
                return Err(self.io_err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entrada de spill inválida en {}", path.display()),
                )));
            };
            let (Some(c), Some(k)) = (pair.pop(), pair.pop()) else {
                return Err(self.io_err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entrada de spill incompleta en {}", path.display()),
                )));
            };

            let slot = k.to_string();
            let merged = match acc.remove(&slot) {
                Some((_, prev)) => self
                    .aggregator
                    .merge_combiners(prev, c)
                    .map_err(WriteError::Compute)?,
                None => c,
            };
            acc.insert(slot, (k, merged));
        }
        Ok(())
    }

    /// Junta memoria + spills y devuelve todos los pares (clave, combiner).
    /// Borra los archivos de spill.
    pub(crate) fn finish(mut self) -> Result<Vec<(Value, Value)>, WriteError> {
        let mut acc = std::mem::take(&mut self.map);

        for path in &self.spill_files {
            self.merge_spill(path, &mut acc)?;
        }

        if !self.spill_files.is_empty() {
            let _ = fs::remove_dir_all(&self.dir);
        }

        Ok(acc.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{compare_keys, SumAggregator};
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("spill_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn spilling_combiner_spillea_y_finaliza_correctamente() {
        let tmp = temp_dir("spill");
        let dir = tmp.join("spill_dir");

        // threshold = 2 => al insertar la segunda clave se hace spill
        let mut comb = SpillingCombiner::new(dir.clone(), 2, Arc::new(SumAggregator), 0);
        comb.insert(json!("a"), json!(1)).unwrap(); // mapa: {a:1}
        comb.insert(json!("b"), json!(1)).unwrap(); // spill; se limpia
        comb.insert(json!("a"), json!(2)).unwrap(); // mapa: {a:2}

        let mut out = comb.finish().unwrap();
        out.sort_by(|x, y| compare_keys(&x.0, &y.0));
        assert_eq!(out, vec![(json!("a"), json!(3)), (json!("b"), json!(1))]);
        assert!(!dir.exists());
    }

    #[test]
    fn sin_spill_no_crea_directorio() {
        let tmp = temp_dir("no_spill");
        let dir = tmp.join("spill_dir");

        let mut comb = SpillingCombiner::new(dir.clone(), 100, Arc::new(SumAggregator), 0);
        comb.insert(json!("x"), json!(1)).unwrap();
        comb.insert(json!("x"), json!(1)).unwrap();

        assert_eq!(comb.finish().unwrap(), vec![(json!("x"), json!(2))]);
        assert!(!dir.exists());
    }

    #[test]
    fn error_del_aggregator_es_error_de_computo() {
        let tmp = temp_dir("agg_err");
        let mut comb = SpillingCombiner::new(tmp, 10, Arc::new(SumAggregator), 0);
        let err = comb.insert(json!("x"), json!("no numero")).unwrap_err();
        assert!(matches!(err, WriteError::Compute(_)));
    }
}
