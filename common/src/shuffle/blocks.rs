use serde_json::Value;
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use crate::map_status::MapOutputId;
use crate::rdd::Record;

/// `<root>/shuffle_<id>/`
pub fn shuffle_dir(root: &Path, shuffle_id: u32) -> PathBuf {
    root.join(format!("shuffle_{}", shuffle_id))
}

/// `<root>/shuffle_<id>/map_<map_id>/`: todo lo que escribe un map task.
pub fn map_output_dir(root: &Path, shuffle_id: u32, map_id: MapOutputId) -> PathBuf {
    shuffle_dir(root, shuffle_id).join(format!("map_{}", map_id))
}

/// Archivo JSONL de un bloque (map_id, reduce_id).
pub fn block_path(root: &Path, shuffle_id: u32, map_id: MapOutputId, reduce_id: u32) -> PathBuf {
    map_output_dir(root, shuffle_id, map_id).join(format!("part-{}.jsonl", reduce_id))
}

/// Lee un bloque completo (un registro JSON por línea).
pub fn read_block(path: &Path) -> io::Result<Vec<Record>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: Value = serde_json::from_str(&line)?;
        out.push(rec);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{env, fs, io::Write};

    #[test]
    fn layout_de_bloques() {
        let p = block_path(Path::new("/data/shuffle"), 3, 17, 1);
        assert_eq!(p, PathBuf::from("/data/shuffle/shuffle_3/map_17/part-1.jsonl"));
    }

    #[test]
    fn read_block_lee_un_registro_por_linea() {
        let dir = env::temp_dir().join("blocks_tests");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("part-0.jsonl");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "{}", r#"["a",1]"#).unwrap();
        writeln!(f, "{}", r#"["b",2]"#).unwrap();

        let recs = read_block(&path).unwrap();
        assert_eq!(recs, vec![json!(["a", 1]), json!(["b", 2])]);
    }
}
