//! Engine sharing and compiled module caching for the wasm interpreter.
//!
//! Compiling an interpreter module is far more expensive than instantiating
//! it, so compiled modules are cached per engine and canonical path and
//! shared by every registry created from the same file.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;
use wasmtime::{Engine, Module};

use crate::error::{Result, SandboxError};

/// A wasmtime engine shared across registries.
///
/// Fuel consumption is always enabled; an unmetered execution simply gets
/// an effectively unlimited tank.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for SharedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEngine")
            .field("engine", &"<wasmtime::Engine>")
            .finish()
    }
}

impl SharedEngine {
    /// Create an engine with the configuration the wasm interpreter needs.
    pub fn new() -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.consume_fuel(true);
        Self::from_config(&config)
    }

    /// Create an engine from a custom configuration. Fuel consumption must
    /// be enabled for step budgets to work.
    pub fn from_config(config: &wasmtime::Config) -> Result<Self> {
        let engine = Engine::new(config)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to create engine: {}", e)))?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn arc(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }
}

impl std::ops::Deref for SharedEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

static DEFAULT_ENGINE: Mutex<Option<SharedEngine>> = Mutex::new(None);

/// The process-wide engine used by [`WasmInterpreter::new`](crate::interpreter::WasmInterpreter::new).
pub fn default_engine() -> Result<SharedEngine> {
    let mut slot = DEFAULT_ENGINE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(engine) = slot.as_ref() {
        return Ok(engine.clone());
    }
    let engine = SharedEngine::new()?;
    *slot = Some(engine.clone());
    Ok(engine)
}

/// Cache key: engine identity plus canonical module path.
#[derive(Clone)]
struct CacheKey {
    engine: Arc<Engine>,
    path: PathBuf,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.engine) as usize).hash(state);
        self.path.hash(state);
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine) && self.path == other.path
    }
}

impl Eq for CacheKey {}

/// A thread-safe cache of compiled modules.
#[derive(Default)]
pub struct ModuleCache {
    cache: RwLock<HashMap<CacheKey, Module>>,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache").field("len", &self.len()).finish()
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SandboxError::InterpreterNotFound(path.display().to_string())
        } else {
            SandboxError::Io(e)
        }
    })
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached module or compile it.
    ///
    /// The path is canonicalized first, so relative paths and symlinks to
    /// the same file share one entry.
    pub fn get_or_compile(&self, engine: &SharedEngine, path: impl AsRef<Path>) -> Result<Module> {
        let key = CacheKey {
            engine: engine.arc(),
            path: canonicalize(path.as_ref())?,
        };

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(module) = cache.get(&key) {
                return Ok(module.clone());
            }
        }

        let wasm_bytes = std::fs::read(&key.path)?;
        let module = Module::new(engine.engine(), &wasm_bytes).map_err(|e| {
            SandboxError::ModuleLoad(anyhow::anyhow!("failed to compile module: {}", e))
        })?;
        debug!(path = %key.path.display(), bytes = wasm_bytes.len(), "module compiled");

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have compiled the same file meanwhile.
        Ok(cache.entry(key).or_insert(module).clone())
    }

    /// Check if a module is cached for `engine`.
    pub fn contains(&self, engine: &SharedEngine, path: impl AsRef<Path>) -> bool {
        let Ok(path) = canonicalize(path.as_ref()) else {
            return false;
        };
        let key = CacheKey {
            engine: engine.arc(),
            path,
        };
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    /// Drop every cached module compiled from `path`, for any engine.
    ///
    /// Returns `true` if something was removed.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        let Ok(path) = canonicalize(path.as_ref()) else {
            return false;
        };
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let before = cache.len();
        cache.retain(|key, _| key.path != path);
        cache.len() != before
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static GLOBAL_CACHE: std::sync::LazyLock<ModuleCache> = std::sync::LazyLock::new(ModuleCache::new);

/// The process-wide module cache.
pub fn global_cache() -> &'static ModuleCache {
    &GLOBAL_CACHE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_cache_new() {
        let cache = ModuleCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_missing_module_is_reported() {
        let engine = SharedEngine::new().unwrap();
        let err = ModuleCache::new()
            .get_or_compile(&engine, "does/not/exist.wasm")
            .unwrap_err();
        assert!(matches!(err, SandboxError::InterpreterNotFound(_)));
    }

    #[test]
    fn test_cache_is_keyed_by_engine() {
        let dir = std::env::temp_dir().join(format!("pybox-cache-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.wasm");
        std::fs::write(&path, "(module)").unwrap();

        let cache = ModuleCache::new();
        let first = SharedEngine::new().unwrap();
        let second = SharedEngine::new().unwrap();
        cache.get_or_compile(&first, &path).unwrap();
        cache.get_or_compile(&first, &path).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&first, &path));
        assert!(!cache.contains(&second, &path));

        cache.get_or_compile(&second, &path).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.remove(&path));
        assert!(cache.is_empty());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_default_engine_is_shared() {
        let a = default_engine().unwrap();
        let b = default_engine().unwrap();
        assert!(Arc::ptr_eq(&a.arc(), &b.arc()));
    }
}
