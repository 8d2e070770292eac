use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::debug;

use crate::error::BroadcastError;

/// Referencia a un blob que el driver registró una sola vez.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastHandle {
    pub id: u64,
}

/// Capacidad de obtener el blob de un broadcast.
/// Debe ser idempotente; el host puede cachear el resultado.
pub trait BroadcastFetcher: Send + Sync {
    fn fetch(&self, handle: BroadcastHandle) -> Result<Arc<[u8]>, BroadcastError>;
}

/// Broadcast local del executor: caché en memoria por id de handle y,
/// opcionalmente, carga perezosa desde `<dir>/broadcast_<id>.bin`.
#[derive(Debug, Default)]
pub struct LocalBroadcastManager {
    dir: Option<PathBuf>,
    next_id: AtomicU64,
    cache: Mutex<HashMap<u64, Arc<[u8]>>>,
}

impl LocalBroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Registra un blob y devuelve su handle.
    pub fn register(&self, bytes: Vec<u8>) -> BroadcastHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(id, Arc::from(bytes));
        BroadcastHandle { id }
    }

    pub fn blob_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("broadcast_{}.bin", id))
    }

    fn load_from_dir(&self, id: u64) -> Result<Option<Arc<[u8]>>, BroadcastError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = Self::blob_path(dir, id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|source| BroadcastError::Io { id, source })?;
        debug!("broadcast {} cargado desde {}", id, path.display());
        Ok(Some(Arc::from(bytes)))
    }
}

impl BroadcastFetcher for LocalBroadcastManager {
    fn fetch(&self, handle: BroadcastHandle) -> Result<Arc<[u8]>, BroadcastError> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(blob) = cache.get(&handle.id) {
                return Ok(blob.clone());
            }
        }

        // La lectura de disco se hace sin el lock; si dos tareas cargan a la
        // vez, gana la primera que inserta.
        let blob = self
            .load_from_dir(handle.id)?
            .ok_or(BroadcastError::NotFound(handle.id))?;

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(handle.id).or_insert(blob).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("broadcast_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn register_y_fetch_comparten_el_mismo_blob() {
        let bm = LocalBroadcastManager::new();
        let h = bm.register(b"hola".to_vec());

        let a = bm.fetch(h).unwrap();
        let b = bm.fetch(h).unwrap();
        assert_eq!(&a[..], b"hola");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn handles_distintos_por_registro() {
        let bm = LocalBroadcastManager::new();
        let h1 = bm.register(vec![1]);
        let h2 = bm.register(vec![2]);
        assert_ne!(h1, h2);
        assert_eq!(&bm.fetch(h2).unwrap()[..], &[2]);
    }

    #[test]
    fn fetch_de_handle_desconocido_falla() {
        let bm = LocalBroadcastManager::new();
        let err = bm.fetch(BroadcastHandle { id: 42 }).unwrap_err();
        assert!(matches!(err, BroadcastError::NotFound(42)));
    }

    #[test]
    fn carga_perezosa_desde_directorio() {
        let dir = temp_dir("lazy");
        fs::write(LocalBroadcastManager::blob_path(&dir, 3), b"blob").unwrap();

        let bm = LocalBroadcastManager::with_dir(&dir);
        let first = bm.fetch(BroadcastHandle { id: 3 }).unwrap();
        assert_eq!(&first[..], b"blob");

        // ya está en caché aunque el archivo desaparezca
        fs::remove_file(LocalBroadcastManager::blob_path(&dir, 3)).unwrap();
        let second = bm.fetch(BroadcastHandle { id: 3 }).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
