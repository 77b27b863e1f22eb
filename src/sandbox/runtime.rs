//! Engine ownership, epoch ticker and compiled-module cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, ExternType, Module};

use super::executor::ModuleInstance;
use super::SandboxError;
use crate::config::{SandboxConfig, MAX_OUTPUT_BYTES};

const REQUIRED_FUNCS: [&str; 3] = ["alloc", "dealloc", "evaluate"];
const FEEDBACK_FUNC: &str = "handle_feedback";

/// What a validated module exports beyond the required set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleExports {
    pub handle_feedback: bool,
}

/// Background thread advancing the engine epoch.
///
/// Each store sets its deadline in ticks of this thread, so the tick period
/// is the resolution of every call timeout.
struct EpochTicker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, tick: Duration, name: String) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::Builder::new().name(name).spawn(move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(tick);
                engine.increment_epoch();
            }
        })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Shared wasmtime engine plus a content-hash keyed module cache.
pub struct SandboxRuntime {
    engine: Engine,
    config: SandboxConfig,
    modules: RwLock<HashMap<String, Module>>,
    _ticker: EpochTicker,
}

impl SandboxRuntime {
    /// Create the engine and start its epoch ticker (`{prefix}-epoch`).
    pub fn new(config: SandboxConfig, prefix: &str) -> Result<Self, SandboxError> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        let engine =
            Engine::new(&wasm_config).map_err(|e| SandboxError::Compile(format!("{e:#}")))?;

        let ticker = EpochTicker::spawn(
            engine.clone(),
            Duration::from_millis(config.epoch_tick_ms.max(1)),
            format!("{prefix}-epoch"),
        )
        .map_err(|e| SandboxError::Instantiate(format!("epoch ticker: {e}")))?;

        if config.max_output_bytes > MAX_OUTPUT_BYTES {
            warn!(
                configured = config.max_output_bytes,
                limit = MAX_OUTPUT_BYTES,
                "max_output_bytes above the frame ceiling; capping"
            );
        }
        info!(
            timeout_ms = config.timeout_ms,
            epoch_tick_ms = config.epoch_tick_ms,
            max_output_bytes = config.output_limit(),
            "sandbox runtime started"
        );

        Ok(Self {
            engine,
            config,
            modules: RwLock::new(HashMap::new()),
            _ticker: ticker,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compiled module for `hash`, compiling `binary` on first request.
    ///
    /// Concurrent first requests for one hash compile once; losers of the
    /// race take the winner's module.
    pub fn compile_module(&self, hash: &str, binary: &[u8]) -> Result<Module, SandboxError> {
        // Fast path: read lock
        if let Some(module) = self.modules.read().get(hash) {
            debug!(hash, "module cache hit");
            return Ok(module.clone());
        }

        // Slow path: write lock, recheck before compiling
        let mut modules = self.modules.write();
        if let Some(module) = modules.get(hash) {
            return Ok(module.clone());
        }

        debug!(hash, bytes = binary.len(), "compiling module");
        let module = Module::new(&self.engine, binary)
            .map_err(|e| SandboxError::Compile(format!("{e:#}")))?;
        modules.insert(hash.to_string(), module.clone());
        Ok(module)
    }

    /// Compile `binary` without caching and check the guest contract.
    pub fn validate_module(&self, binary: &[u8]) -> Result<ModuleExports, SandboxError> {
        let module = Module::new(&self.engine, binary)
            .map_err(|e| SandboxError::Compile(format!("{e:#}")))?;
        inspect_exports(&module)
    }

    /// Evict the module for `hash`. Returns whether it was cached.
    pub fn remove_from_cache(&self, hash: &str) -> bool {
        let removed = self.modules.write().remove(hash).is_some();
        if removed {
            debug!(hash, "evicted module");
        }
        removed
    }

    pub fn cached_modules(&self) -> usize {
        self.modules.read().len()
    }

    /// Create a fresh instance of `module` bound to this runtime's limits.
    pub fn instantiate(&self, module: &Module) -> Result<ModuleInstance, SandboxError> {
        ModuleInstance::new(&self.engine, module, &self.config)
    }
}

fn inspect_exports(module: &Module) -> Result<ModuleExports, SandboxError> {
    let mut funcs = Vec::new();
    let mut has_memory = false;
    for export in module.exports() {
        match export.ty() {
            ExternType::Func(_) => funcs.push(export.name()),
            ExternType::Memory(_) if export.name() == "memory" => has_memory = true,
            _ => {}
        }
    }

    if !has_memory {
        return Err(SandboxError::MissingExport("memory"));
    }
    for name in REQUIRED_FUNCS {
        if !funcs.contains(&name) {
            return Err(SandboxError::MissingExport(name));
        }
    }
    Ok(ModuleExports {
        handle_feedback: funcs.contains(&FEEDBACK_FUNC),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "alloc") (param i32) (result i32) i32.const 8)
          (func (export "dealloc") (param i32 i32))
          (func (export "evaluate") (param i32 i32) (result i32) i32.const 0))
    "#;

    const WITH_FEEDBACK: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "alloc") (param i32) (result i32) i32.const 8)
          (func (export "dealloc") (param i32 i32))
          (func (export "evaluate") (param i32 i32) (result i32) i32.const 0)
          (func (export "handle_feedback") (param i32 i32) (result i32) i32.const 0))
    "#;

    fn runtime() -> SandboxRuntime {
        SandboxRuntime::new(SandboxConfig::default(), "test").unwrap()
    }

    #[test]
    fn test_validate_required_exports() {
        let rt = runtime();
        assert_eq!(
            rt.validate_module(MINIMAL.as_bytes()).unwrap(),
            ModuleExports { handle_feedback: false }
        );
        assert!(rt.validate_module(WITH_FEEDBACK.as_bytes()).unwrap().handle_feedback);
        // Validation never populates the cache.
        assert_eq!(rt.cached_modules(), 0);
    }

    #[test]
    fn test_validate_rejects_missing_memory() {
        let rt = runtime();
        let wat = r#"(module
            (func (export "alloc") (param i32) (result i32) i32.const 8)
            (func (export "dealloc") (param i32 i32))
            (func (export "evaluate") (param i32 i32) (result i32) i32.const 0))"#;
        assert!(matches!(
            rt.validate_module(wat.as_bytes()),
            Err(SandboxError::MissingExport("memory"))
        ));
    }

    #[test]
    fn test_validate_rejects_missing_evaluate() {
        let rt = runtime();
        let wat = r#"(module
            (memory (export "memory") 1)
            (func (export "alloc") (param i32) (result i32) i32.const 8)
            (func (export "dealloc") (param i32 i32)))"#;
        assert!(matches!(
            rt.validate_module(wat.as_bytes()),
            Err(SandboxError::MissingExport("evaluate"))
        ));
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let rt = runtime();
        assert!(matches!(
            rt.validate_module(b"\0asm\x02garbage"),
            Err(SandboxError::Compile(_))
        ));
    }

    #[test]
    fn test_compile_is_cached_per_hash() {
        let rt = runtime();
        let hash = crate::sandbox::content_hash(MINIMAL.as_bytes());
        rt.compile_module(&hash, MINIMAL.as_bytes()).unwrap();
        rt.compile_module(&hash, MINIMAL.as_bytes()).unwrap();
        assert_eq!(rt.cached_modules(), 1);

        assert!(rt.remove_from_cache(&hash));
        assert!(!rt.remove_from_cache(&hash));
        assert_eq!(rt.cached_modules(), 0);
    }

    #[test]
    fn test_concurrent_compile_single_entry() {
        let rt = Arc::new(runtime());
        let hash = crate::sandbox::content_hash(MINIMAL.as_bytes());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rt = rt.clone();
                let hash = hash.clone();
                thread::spawn(move || {
                    rt.compile_module(&hash, MINIMAL.as_bytes()).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rt.cached_modules(), 1);
    }

    #[test]
    fn test_instantiate_cached_module() {
        let rt = runtime();
        let module = rt.compile_module("h", WITH_FEEDBACK.as_bytes()).unwrap();
        let instance = rt.instantiate(&module).unwrap();
        assert!(instance.has_feedback_handler());
    }
}
