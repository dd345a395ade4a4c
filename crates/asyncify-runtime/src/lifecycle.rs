use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use wasmtime::Module;

use crate::config::{EngineConfig, FlowOptions, UpdatePolicy};
use crate::envelope::{Command, ContentType, ENGINE_CALL_ID_GET_VERSION, ENGINE_CALL_ID_INITIALIZE, Reply};
use crate::error::{LifecycleError, LifecycleErrorKind, RuntimeError};
use crate::instance::AsyncifyInstance;
use crate::logging;
use crate::preferences::{SELECTED_VERSION_KEY, SharedPreference};
use crate::runtime_context::RuntimeContext;
use crate::state::EngineState;
use crate::storage::{self, BundleStorage, EngineVersion};
use crate::tasks::TaskManager;

/// Embedder hooks consulted by the engine.
///
/// Every method has a default, so an embedder only overrides what it owns.
pub trait EngineDelegate: Send + Sync {
    /// Request options stamped on outgoing commands. `None` uses `[flow]`
    /// from the engine config.
    fn flow_options(&self) -> Option<FlowOptions> {
        None
    }

    /// `None` uses `[update]` from the engine config.
    fn update_policy(&self) -> Option<UpdatePolicy> {
        None
    }

    /// Store for the selected module version. Updates fail without one.
    fn preferences(&self) -> Option<Arc<dyn SharedPreference>> {
        None
    }

    fn state_changed(&self, _state: &EngineState) {}
}

/// Delegate that defers everything to the engine config.
pub struct ConfigDelegate;

impl EngineDelegate for ConfigDelegate {}

struct Loaded {
    module: Module,
    instance: AsyncifyInstance,
}

/// Owner of one guest instance and its task scope.
///
/// # Threading
///
/// `AsyncifyEngine` is `Send + Sync` and is typically wrapped in `Arc`.
/// Calls are serialized by an async mutex around the instance; `release()`
/// cancels outstanding work without waiting for that mutex first.
pub struct AsyncifyEngine {
    config: EngineConfig,
    delegate: Arc<dyn EngineDelegate>,
    runtime: RuntimeContext,
    storage: BundleStorage,
    handle: Handle,
    guest_logging: bool,
    loaded: tokio::sync::Mutex<Option<Loaded>>,
    /// Task scope of the live instance, reachable without the instance lock.
    tasks: Mutex<Option<Arc<TaskManager>>>,
    state: watch::Sender<EngineState>,
    premium: AtomicBool,
    last_update: Mutex<Option<Instant>>,
    /// module name → serialized module options
    module_options: DashMap<String, String>,
}

impl AsyncifyEngine {
    /// Must be called from inside a tokio runtime; units of work are spawned
    /// on it.
    pub fn new(config: EngineConfig, delegate: Arc<dyn EngineDelegate>) -> Result<Self, RuntimeError> {
        let handle = Handle::try_current().map_err(|e| RuntimeError::NoRuntime(e.to_string()))?;
        let runtime = RuntimeContext::new(&config.wasm)?;
        let storage = BundleStorage::new(config.update.bundle_dir.clone());
        let (state, _) = watch::channel(EngineState::Stopped);
        Ok(Self {
            config,
            delegate,
            runtime,
            storage,
            handle,
            guest_logging: logging::guest_logging_enabled(),
            loaded: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(None),
            state,
            premium: AtomicBool::new(false),
            last_update: Mutex::new(None),
            module_options: DashMap::new(),
        })
    }

    pub fn storage(&self) -> &BundleStorage {
        &self.storage
    }

    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Resolve, compile and instantiate the module, then report `Running`.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.push_state(EngineState::Starting);
        let started = async {
            let (version, module) = self.resolve_module()?;
            self.install_module(module, &version).await?;
            Ok::<_, RuntimeError>(version)
        }
        .await;
        self.settle(started)
    }

    /// Selected installed version if there is one, else the configured module.
    fn resolve_module(&self) -> Result<(String, Module), RuntimeError> {
        if let Some(prefs) = self.delegate.preferences()
            && let Some(selected) = prefs.get(SELECTED_VERSION_KEY)
        {
            if self.storage.exists(&selected) {
                tracing::info!(version = %selected, "Starting selected module version");
                let module = self.storage.load_or_compile(&selected, &self.runtime.engine)?;
                return Ok((selected, module));
            }
            tracing::warn!(version = %selected, "Selected version is not installed, using configured module");
        }

        let path = self.config.module.as_deref().ok_or_else(|| {
            RuntimeError::Config("no module configured and no installed version selected".into())
        })?;
        tracing::info!(path = %path.display(), "Starting configured module");
        let module = storage::compile_file(path, &self.runtime.engine)?;
        Ok((EngineVersion::EMBEDDED_ID.to_string(), module))
    }

    /// Instantiate `module` and make it the live instance, dropping (and
    /// cancelling the work of) the previous one.
    async fn install_module(&self, module: Module, version: &str) -> Result<(), RuntimeError> {
        let instance = AsyncifyInstance::new(
            &self.runtime,
            &module,
            version,
            self.handle.clone(),
            self.guest_logging,
        )?;
        self.track_tasks(instance.tasks());
        let mut loaded = self.loaded.lock().await;
        if let Some(previous) = loaded.replace(Loaded { module, instance }) {
            tracing::debug!(version = previous.instance.version(), "Previous instance dropped");
        }
        Ok(())
    }

    fn track_tasks(&self, tasks: &Arc<TaskManager>) {
        let mut current = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        *current = Some(Arc::clone(tasks));
    }

    /// Number of units of work still registered on the live instance.
    pub fn pending_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |tasks| tasks.len())
    }

    /// Invoke the guest with serialized request bytes.
    ///
    /// A guest trap rebuilds the instance from the same module before the
    /// error is returned, so the next call starts clean.
    pub async fn call(&self, request: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let mut guard = self.loaded.lock().await;
        let loaded = guard
            .as_mut()
            .ok_or_else(|| LifecycleError::new(LifecycleErrorKind::RequiredRecreateEngine))?;

        if self.config.initialize && !loaded.instance.initialized {
            loaded.instance.initialized = true;
            let init = self
                .stamp(Command::bare(ENGINE_CALL_ID_INITIALIZE), ContentType::Json)
                .to_bytes()?;
            tracing::debug!(version = loaded.instance.version(), "Initializing guest");
            self.call_loaded(loaded, &init).await?;
        }
        self.call_loaded(loaded, request).await
    }

    async fn call_loaded(&self, loaded: &mut Loaded, request: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        let result = loaded.instance.call(request).await;
        if let Err(e) = &result
            && e.is_trap()
        {
            let version = loaded.instance.version().to_string();
            tracing::warn!(version = %version, "Guest trapped, rebuilding instance: {e}");
            match AsyncifyInstance::new(
                &self.runtime,
                &loaded.module,
                version.as_str(),
                self.handle.clone(),
                self.guest_logging,
            ) {
                Ok(fresh) => {
                    self.track_tasks(fresh.tasks());
                    loaded.instance = fresh;
                }
                Err(rebuild) => tracing::error!(version = %version, "Instance rebuild failed: {rebuild}"),
            }
        }
        result
    }

    /// Raw bytes of the guest's version answer.
    pub async fn version(&self) -> Result<Vec<u8>, RuntimeError> {
        let request = self
            .stamp(Command::bare(ENGINE_CALL_ID_GET_VERSION), ContentType::Json)
            .to_bytes()?;
        self.call(&request).await
    }

    /// The guest's version answer, decoded. `url` is filled with the module
    /// location when the guest leaves it empty.
    pub async fn engine_version(&self) -> Result<EngineVersion, RuntimeError> {
        let bytes = self.version().await?;
        let mut version: EngineVersion = Reply::from_bytes(ContentType::Json, bytes)?.decode()?;
        if version.url.is_empty() {
            version.url = match &self.config.module {
                Some(path) if version.is_embedded() => path.display().to_string(),
                _ => self.storage.wasm_path(&version.id).display().to_string(),
            };
        }
        Ok(version)
    }

    /// Call with a JSON content type and decode the payload.
    pub async fn call_json<T: DeserializeOwned>(&self, command: Command) -> Result<T, RuntimeError> {
        let request = self.stamp(command, ContentType::Json).to_bytes()?;
        let bytes = self.call(&request).await?;
        Reply::from_bytes(ContentType::Json, bytes)?.decode()
    }

    /// Call with a gRPC content type; the reply body is returned as is.
    pub async fn call_grpc(&self, command: Command) -> Result<Vec<u8>, RuntimeError> {
        let request = self.stamp(command, ContentType::Grpc).to_bytes()?;
        let bytes = self.call(&request).await?;
        Reply::from_bytes(ContentType::Grpc, bytes)?.into_bytes()
    }

    /// Fill the options every command carries.
    fn stamp(&self, mut command: Command, content_type: ContentType) -> Command {
        let flow = self
            .delegate
            .flow_options()
            .unwrap_or_else(|| self.config.flow.clone());
        command.options.apply_flow(&flow);
        command.options.content_type = content_type;
        command.options.premium = self.premium.load(Ordering::Relaxed);
        command.options.extra = self
            .module_options
            .iter()
            .map(|entry| (entry.key().clone(), Value::String(entry.value().clone())))
            .collect();
        command
    }

    pub fn set_premium(&self, premium: bool) {
        self.premium.store(premium, Ordering::Relaxed);
    }

    pub fn premium(&self) -> bool {
        self.premium.load(Ordering::Relaxed)
    }

    /// Set the serialized options sent to guest module `module`.
    pub fn set_module_options(&self, module: impl Into<String>, options: impl Into<String>) {
        self.module_options.insert(module.into(), options.into());
    }

    pub fn clear_module_options(&self, module: &str) {
        self.module_options.remove(module);
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        self.delegate
            .update_policy()
            .unwrap_or_else(|| self.config.update.policy())
    }

    /// Swap the live instance for the module at `path`.
    pub async fn reload(&self, version: &str, path: &Path) -> Result<(), RuntimeError> {
        self.push_state(EngineState::Reload {
            version: version.to_string(),
        });
        let reloaded = async {
            let module = storage::compile_file(path, &self.runtime.engine)?;
            self.install_module(module, version).await?;
            Ok::<_, RuntimeError>(version.to_string())
        }
        .await;
        self.settle(reloaded)
    }

    /// Install `version` from `source`, select it and reload onto it.
    ///
    /// Updates are spaced by the policy's check interval; an attempt inside
    /// the interval of the previous one is refused.
    pub async fn update(&self, version: &EngineVersion, source: &Path) -> Result<(), RuntimeError> {
        let policy = self.update_policy();
        if !policy.enabled {
            return Err(RuntimeError::Config("module updates are disabled".into()));
        }
        let prefs = self
            .delegate
            .preferences()
            .ok_or_else(|| LifecycleError::new(LifecycleErrorKind::MissingSharedPreference))?;
        {
            let mut last = self.last_update.lock().unwrap_or_else(PoisonError::into_inner);
            if !policy.is_due(*last) {
                return Err(RuntimeError::Config(format!(
                    "module update attempted within the {}s check interval",
                    policy.check_interval.as_secs()
                )));
            }
            *last = Some(Instant::now());
        }

        self.push_state(EngineState::Updating { progress: 0.0 });
        let updated = async {
            self.storage
                .install(version, source, |progress| {
                    self.push_state(EngineState::Updating { progress })
                })
                .await?;
            prefs.set(SELECTED_VERSION_KEY, version.id.clone());
            tracing::info!(version = %version.id, backend = prefs.backend_name(), "Selected module version");

            self.push_state(EngineState::Reload {
                version: version.id.clone(),
            });
            let module = self.storage.load_or_compile(&version.id, &self.runtime.engine)?;
            self.install_module(module, &version.id).await?;
            Ok::<_, RuntimeError>(version.id.clone())
        }
        .await;
        self.settle(updated)
    }

    /// Delete an installed version, clearing the selection when it pointed there.
    pub fn remove_version(&self, version_id: &str) -> Result<(), RuntimeError> {
        if let Some(prefs) = self.delegate.preferences()
            && prefs.get(SELECTED_VERSION_KEY).as_deref() == Some(version_id)
        {
            prefs.remove(SELECTED_VERSION_KEY);
        }
        self.storage.remove(version_id)
    }

    /// Cancel all outstanding work, drop the instance and report `Stopped`.
    /// Idempotent.
    ///
    /// Teardown follows what the engine owns, not the published state, which
    /// an embedded engine may have overwritten through [`Self::report_raw`].
    pub async fn release(&self) {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
        if tasks.is_none() && self.loaded.lock().await.is_none() {
            if self.state() != EngineState::Stopped {
                self.push_state(EngineState::Stopped);
            }
            return;
        }
        if !self.state().is_terminal() {
            self.push_state(EngineState::Releasing);
        }

        if let Some(tasks) = tasks {
            tasks.release_all();
        }
        let loaded = self.loaded.lock().await.take();
        drop(loaded);

        if self.state() != EngineState::Stopped {
            self.push_state(EngineState::Stopped);
        }
        tracing::info!("Engine released");
    }

    /// Apply a state reported by an embedded engine as raw JSON. Unreadable
    /// input is reported as `Failed`.
    pub fn report_raw(&self, raw: &[u8]) -> EngineState {
        let state = EngineState::from_raw(raw);
        self.push_state(state.clone());
        state
    }

    /// Read an exported `i32` global of the live instance.
    pub async fn inspect_global(&self, name: &str) -> Option<i32> {
        let mut loaded = self.loaded.lock().await;
        loaded.as_mut()?.instance.global_i32(name)
    }

    fn settle(&self, outcome: Result<String, RuntimeError>) -> Result<(), RuntimeError> {
        match outcome {
            Ok(version) => {
                self.push_state(EngineState::Running { version });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Engine transition failed: {e}");
                self.push_state(EngineState::Failed { error: e.to_string() });
                Err(e)
            }
        }
    }

    fn push_state(&self, next: EngineState) {
        let previous = self.state.borrow().clone();
        if !previous.allows(&next) {
            tracing::warn!(from = previous.name(), to = next.name(), "Unexpected engine state transition");
        }
        match &next {
            EngineState::Updating { progress } => tracing::trace!(progress, "Engine updating"),
            other => tracing::debug!(state = other.name(), "Engine state"),
        }
        self.delegate.state_changed(&next);
        self.state.send_replace(next);
    }
}

impl Drop for AsyncifyEngine {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            tasks.release_all();
        }
    }
}
