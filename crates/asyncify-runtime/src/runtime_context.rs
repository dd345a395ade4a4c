use wasmtime::{Config, Engine, Linker};

use crate::config::WasmConfig;
use crate::error::RuntimeError;
use crate::host::{self, HostState};

/// Shared Wasmtime engine and linker.
///
/// Built once per `AsyncifyEngine` and reused across instance rebuilds and
/// version reloads. The linker carries the `asyncify` host imports.
pub struct RuntimeContext {
    pub engine: Engine,
    pub linker: Linker<HostState>,
}

impl RuntimeContext {
    pub fn new(wasm: &WasmConfig) -> Result<Self, RuntimeError> {
        let mut config = Config::new();
        if let Some(bytes) = wasm.memory_reservation {
            config.memory_reservation(bytes);
        }
        if let Some(bytes) = wasm.memory_reservation_for_growth {
            config.memory_reservation_for_growth(bytes);
        }
        if let Some(bytes) = wasm.memory_guard_size {
            config.memory_guard_size(bytes);
        }

        let engine = Engine::new(&config).map_err(|e| RuntimeError::Config(format!("wasmtime engine: {e:#}")))?;
        let mut linker: Linker<HostState> = Linker::new(&engine);
        host::add_to_linker(&mut linker)?;

        tracing::debug!("RuntimeContext initialized (core modules + asyncify imports)");

        Ok(Self { engine, linker })
    }
}
