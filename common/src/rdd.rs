use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs::File,
    io::{BufRead, BufReader},
};

use crate::error::ResolveError;
use crate::registry::{FilterFn, FlatMapFn, FunctionRegistry, MapFn};

/// Tipo genérico de registro (fila de datos).
/// Usamos JSON para poder representar texto, CSV, JSONL, pares, etc.
/// Un par clave/valor es un array de 2 elementos `[clave, valor]`.
pub type Record = Value;

/// Secuencia perezosa de una partición: se consume una sola vez.
pub type RecordIter = Box<dyn Iterator<Item = anyhow::Result<Record>>>;

/// Contrato mínimo del dataset: saber cuántas particiones tiene y poder
/// recorrer cada una.
pub trait PartitionComputation: Send + Sync {
    fn num_partitions(&self) -> u32;

    fn compute(&self, partition: u32) -> anyhow::Result<RecordIter>;
}

/* =========================
   Descripción serializable
   ========================= */

/// Origen de los datos. Cada partición es un slice o un archivo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Parallelize { slices: Vec<Vec<Record>> },
    TextFile { paths: Vec<String> },
    Csv { paths: Vec<String> },
    JsonLines { paths: Vec<String> },
}

impl SourceSpec {
    fn num_partitions(&self) -> usize {
        match self {
            SourceSpec::Parallelize { slices } => slices.len(),
            SourceSpec::TextFile { paths }
            | SourceSpec::Csv { paths }
            | SourceSpec::JsonLines { paths } => paths.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpSpec {
    Map {
        #[serde(rename = "fn")]
        fn_name: String,
    },
    FlatMap {
        #[serde(rename = "fn")]
        fn_name: String,
    },
    Filter {
        #[serde(rename = "fn")]
        fn_name: String,
    },
}

/// Dataset tal como viaja dentro del closure: origen + operadores por nombre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RddSpec {
    pub source: SourceSpec,
    #[serde(default)]
    pub ops: Vec<OpSpec>,
}

impl RddSpec {
    pub fn new(source: SourceSpec) -> Self {
        Self {
            source,
            ops: Vec::new(),
        }
    }

    pub fn map(mut self, fn_name: &str) -> Self {
        self.ops.push(OpSpec::Map {
            fn_name: fn_name.to_string(),
        });
        self
    }

    pub fn flat_map(mut self, fn_name: &str) -> Self {
        self.ops.push(OpSpec::FlatMap {
            fn_name: fn_name.to_string(),
        });
        self
    }

    pub fn filter(mut self, fn_name: &str) -> Self {
        self.ops.push(OpSpec::Filter {
            fn_name: fn_name.to_string(),
        });
        self
    }

    /// Resuelve los nombres de funciones contra el registro.
    pub fn resolve(self, registry: &FunctionRegistry) -> Result<Pipeline, ResolveError> {
        let ops = self
            .ops
            .into_iter()
            .map(|op| match op {
                OpSpec::Map { fn_name } => registry.map_fn(&fn_name).map(Op::Map),
                OpSpec::FlatMap { fn_name } => registry.flat_map_fn(&fn_name).map(Op::FlatMap),
                OpSpec::Filter { fn_name } => registry.filter_fn(&fn_name).map(Op::Filter),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Pipeline {
            source: self.source,
            ops,
        })
    }
}

/* =========================
   Pipeline resuelto
   ========================= */

enum Op {
    Map(MapFn),
    FlatMap(FlatMapFn),
    Filter(FilterFn),
}

/// Dataset ya resuelto, listo para recorrer particiones.
pub struct Pipeline {
    source: SourceSpec,
    ops: Vec<Op>,
}

impl Pipeline {
    fn source_iter(&self, partition: u32) -> anyhow::Result<RecordIter> {
        let idx = partition as usize;
        if idx >= self.source.num_partitions() {
            bail!(
                "partición {} fuera de rango (el dataset tiene {})",
                partition,
                self.source.num_partitions()
            );
        }

        match &self.source {
            SourceSpec::Parallelize { slices } => {
                Ok(Box::new(slices[idx].clone().into_iter().map(Ok)))
            }
            SourceSpec::TextFile { paths } => text_lines(&paths[idx]),
            SourceSpec::Csv { paths } => csv_records(&paths[idx]),
            SourceSpec::JsonLines { paths } => jsonl_records(&paths[idx]),
        }
    }
}

impl PartitionComputation for Pipeline {
    fn num_partitions(&self) -> u32 {
        self.source.num_partitions() as u32
    }

    fn compute(&self, partition: u32) -> anyhow::Result<RecordIter> {
        let mut iter = self.source_iter(partition)?;

        for op in &self.ops {
            iter = match op {
                Op::Map(f) => {
                    let f = f.clone();
                    Box::new(iter.map(move |r| r.and_then(|rec| f(&rec))))
                }
                Op::Filter(f) => {
                    let f = f.clone();
                    Box::new(iter.filter_map(move |r| match r {
                        Ok(rec) => match f(&rec) {
                            Ok(true) => Some(Ok(rec)),
                            Ok(false) => None,
                            Err(e) => Some(Err(e)),
                        },
                        Err(e) => Some(Err(e)),
                    }))
                }
                Op::FlatMap(f) => {
                    let f = f.clone();
                    Box::new(iter.flat_map(move |r| -> RecordIter {
                        match r.and_then(|rec| f(&rec)) {
                            Ok(out) => Box::new(out.into_iter().map(Ok)),
                            Err(e) => Box::new(std::iter::once(Err(e))),
                        }
                    }))
                }
            };
        }

        Ok(iter)
    }
}

/* =========================
   Lectura de archivos
   ========================= */

fn open(path: &str) -> anyhow::Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("no se pudo abrir {}", path))?;
    Ok(BufReader::new(file))
}

/// Una línea = un registro string.
fn text_lines(path: &str) -> anyhow::Result<RecordIter> {
    let reader = open(path)?;
    let path = path.to_string();
    Ok(Box::new(reader.lines().map(move |line| {
        line.map(Value::String)
            .with_context(|| format!("error leyendo {}", path))
    })))
}

/// Primera fila = encabezados; cada fila es un objeto de strings.
fn csv_records(path: &str) -> anyhow::Result<RecordIter> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("no se pudo abrir {}", path))?;

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("encabezados inválidos en {}", path))?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    Ok(Box::new(reader.into_records().map(move |row| -> anyhow::Result<Record> {
        let row = row?;
        let mut obj = serde_json::Map::new();
        for (idx, h) in headers.iter().enumerate() {
            let val = row.get(idx).unwrap_or("").trim();
            obj.insert(h.clone(), Value::String(val.to_string()));
        }
        Ok(Value::Object(obj))
    })))
}

/// Un valor JSON por línea; las líneas en blanco se ignoran.
fn jsonl_records(path: &str) -> anyhow::Result<RecordIter> {
    let reader = open(path)?;
    let path = path.to_string();
    let parse = move |line: std::io::Result<String>| -> Option<anyhow::Result<Record>> {
        let line = match line {
            Ok(l) => l,
            Err(e) => return Some(Err(anyhow::Error::from(e))),
        };
        if line.trim().is_empty() {
            return None;
        }
        Some(
            serde_json::from_str(&line)
                .with_context(|| format!("JSON inválido en {}: {}", path, line)),
        )
    };
    Ok(Box::new(reader.lines().filter_map(parse)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{env, fs, io::Write, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("rdd_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn collect(p: &Pipeline, partition: u32) -> anyhow::Result<Vec<Record>> {
        p.compute(partition)?.collect()
    }

    #[test]
    fn parallelize_con_operadores_encadenados() {
        let reg = FunctionRegistry::with_builtins();
        let pipeline = RddSpec::new(SourceSpec::Parallelize {
            slices: vec![vec![json!("Hola mundo"), json!("  ")], vec![json!("otro")]],
        })
        .flat_map("split_words")
        .filter("non_empty")
        .map("pair_with_one")
        .resolve(&reg)
        .unwrap();

        assert_eq!(pipeline.num_partitions(), 2);
        assert_eq!(
            collect(&pipeline, 0).unwrap(),
            vec![json!(["hola", 1]), json!(["mundo", 1])]
        );
        assert_eq!(collect(&pipeline, 1).unwrap(), vec![json!(["otro", 1])]);
    }

    #[test]
    fn particion_fuera_de_rango_es_error() {
        let reg = FunctionRegistry::with_builtins();
        let pipeline = RddSpec::new(SourceSpec::Parallelize { slices: vec![vec![]] })
            .resolve(&reg)
            .unwrap();
        assert!(pipeline.compute(1).is_err());
    }

    #[test]
    fn error_de_funcion_de_usuario_se_propaga_en_el_iterador() {
        let reg = FunctionRegistry::with_builtins();
        let pipeline = RddSpec::new(SourceSpec::Parallelize {
            slices: vec![vec![json!({"text": "a"}), json!({"sin_texto": 1})]],
        })
        .map("text_field")
        .resolve(&reg)
        .unwrap();

        let out: Vec<anyhow::Result<Record>> = pipeline.compute(0).unwrap().collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
    }

    #[test]
    fn funcion_desconocida_no_resuelve() {
        let reg = FunctionRegistry::with_builtins();
        let res = RddSpec::new(SourceSpec::Parallelize { slices: vec![] })
            .map("no_existe")
            .resolve(&reg);
        assert!(matches!(res, Err(ResolveError::UnknownFunction { .. })));
    }

    #[test]
    fn text_file_una_linea_por_registro() {
        let tmp = temp_dir("text");
        let path = tmp.join("in.txt");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "linea uno").unwrap();
        writeln!(f, "linea dos").unwrap();

        let reg = FunctionRegistry::with_builtins();
        let pipeline = RddSpec::new(SourceSpec::TextFile {
            paths: vec![path.to_string_lossy().to_string()],
        })
        .resolve(&reg)
        .unwrap();

        assert_eq!(
            collect(&pipeline, 0).unwrap(),
            vec![json!("linea uno"), json!("linea dos")]
        );
    }

    #[test]
    fn csv_lee_encabezados_y_valores() {
        let tmp = temp_dir("csv");
        let path = tmp.join("data.csv");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "nombre,text").unwrap();
        writeln!(f, "Ana, Hola Ana ").unwrap();
        writeln!(f, "Bob,chau").unwrap();

        let reg = FunctionRegistry::with_builtins();
        let pipeline = RddSpec::new(SourceSpec::Csv {
            paths: vec![path.to_string_lossy().to_string()],
        })
        .map("text_field")
        .resolve(&reg)
        .unwrap();

        assert_eq!(
            collect(&pipeline, 0).unwrap(),
            vec![json!("Hola Ana"), json!("chau")]
        );
    }

    #[test]
    fn jsonl_ignora_lineas_vacias() {
        let tmp = temp_dir("jsonl");
        let path = tmp.join("data.jsonl");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "{}", r#"{"x":1}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{}", r#"{"x":2, "y":"ok"}"#).unwrap();

        let reg = FunctionRegistry::with_builtins();
        let pipeline = RddSpec::new(SourceSpec::JsonLines {
            paths: vec![path.to_string_lossy().to_string()],
        })
        .resolve(&reg)
        .unwrap();

        let recs = collect(&pipeline, 0).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1]["y"], json!("ok"));
    }

    #[test]
    fn archivo_inexistente_falla_al_computar() {
        let reg = FunctionRegistry::with_builtins();
        let pipeline = RddSpec::new(SourceSpec::TextFile {
            paths: vec!["/no/existe/nunca.txt".to_string()],
        })
        .resolve(&reg)
        .unwrap();
        assert!(pipeline.compute(0).is_err());
    }

    #[test]
    fn rdd_spec_viaja_como_json() {
        let spec = RddSpec::new(SourceSpec::TextFile {
            paths: vec!["a.txt".into()],
        })
        .flat_map("split_words");
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["source"]["kind"], json!("text_file"));
        assert_eq!(v["ops"][0], json!({"op": "flat_map", "fn": "split_words"}));
    }
}
