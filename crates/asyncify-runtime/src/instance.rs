//! One instantiated guest module and the call façade in front of it.

use std::sync::Arc;

use tokio::runtime::Handle;
use wasmtime::{AsContextMut, Instance, Module, Store};

use crate::error::{RuntimeError, TaskError};
use crate::host::HostState;
use crate::memory::{GuestExports, WaFuture};
use crate::runtime_context::RuntimeContext;
use crate::tasks::TaskManager;

/// A live guest instance with its own task scope.
///
/// Not `Sync`; callers serialize access (the engine keeps it behind an async
/// mutex) so exactly one frame owns the store at a time.
pub struct AsyncifyInstance {
    store: Store<HostState>,
    instance: Instance,
    exports: GuestExports,
    tasks: Arc<TaskManager>,
    version: String,
    pub(crate) initialized: bool,
}

impl AsyncifyInstance {
    pub fn new(
        context: &RuntimeContext,
        module: &Module,
        version: impl Into<String>,
        runtime: Handle,
        guest_logging: bool,
    ) -> Result<Self, RuntimeError> {
        let version = version.into();
        let tasks = Arc::new(TaskManager::new(runtime.clone()));
        let mut store = Store::new(
            &context.engine,
            HostState::new(Arc::clone(&tasks), runtime, guest_logging),
        );
        let instance = context
            .linker
            .instantiate(&mut store, module)
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{version}: {e:#}")))?;
        let exports = GuestExports::from_instance(&mut store, &instance)?;
        store.data_mut().exports = Some(exports.clone());

        tracing::debug!(version = %version, "Guest instance ready");
        Ok(Self {
            store,
            instance,
            exports,
            tasks,
            version,
            initialized: false,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// Send serialized request bytes through the guest's `call` export and
    /// return the bytes it produced, awaiting any chain it left behind.
    pub async fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let exports = self.exports.clone();
        let out = exports.allocate(&mut self.store, WaFuture::SIZE as u32)?;
        let input = match exports.allocate_copy(&mut self.store, request) {
            Ok(input) => input,
            Err(e) => {
                exports.release(&mut self.store, out);
                return Err(e);
            }
        };

        let mut out_owned_by_unit = false;
        let outcome = self
            .dispatch(&exports, out, input, request.len() as u32, &mut out_owned_by_unit)
            .await;
        if !out_owned_by_unit {
            exports.release(&mut self.store, out);
        }
        exports.release(&mut self.store, input);
        outcome
    }

    /// `out_owned_by_unit` is set when a unit of work was registered under
    /// `out`; that unit releases the buffer itself.
    async fn dispatch(
        &mut self,
        exports: &GuestExports,
        out: u32,
        input: u32,
        len: u32,
        out_owned_by_unit: &mut bool,
    ) -> Result<Vec<u8>, RuntimeError> {
        exports
            .call
            .call(&mut self.store, (out as i32, input as i32, len as i32))
            .map_err(RuntimeError::from_guest)?;
        *out_owned_by_unit = self.tasks.contains(out);
        if self.tasks.is_cancelled() {
            return Err(TaskError::Cancelled.into());
        }

        let record = exports.load_future(&self.store, out)?;
        if record.is_awaitable() {
            tracing::trace!(key = format_args!("{:#x}", record.index), "awaiting guest chain");
            let pending = self.tasks.subscribe(record.index)?;
            let token = self.tasks.token();
            let reentry = self.store.data().reentry.clone();
            let wait = async move {
                tokio::select! {
                    outcome = pending.wait() => outcome,
                    _ = token.cancelled() => Err(TaskError::Cancelled),
                }
            };
            return Ok(reentry.drive(self.store.as_context_mut(), wait).await?);
        }

        let bytes = exports.read_bytes(&self.store, record.data, record.len)?;
        exports.release(&mut self.store, record.data);
        Ok(bytes)
    }

    /// Read an exported `i32` global, for diagnostics.
    pub fn global_i32(&mut self, name: &str) -> Option<i32> {
        self.instance
            .get_global(&mut self.store, name)
            .and_then(|global| global.get(&mut self.store).i32())
    }

    /// Cancel every outstanding unit of work of this instance.
    pub fn release(&self) {
        self.tasks.release_all();
    }
}

impl Drop for AsyncifyInstance {
    fn drop(&mut self) {
        self.tasks.release_all();
    }
}
