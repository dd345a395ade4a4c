//! Embedded WASM host for guests built against the asyncify calling
//! convention.
//!
//! A guest sees synchronous host calls (`get`, `get_async`); behind them the
//! host schedules units of work on tokio and re-enters the guest through its
//! `callback` export when results are ready. [`AsyncifyEngine`] is the single
//! entry point embedders use.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use asyncify_runtime::{AsyncifyEngine, Command, ConfigDelegate, EngineConfig};
//!
//! # async fn run() -> Result<(), asyncify_runtime::RuntimeError> {
//! let config = EngineConfig::for_module("/path/to/music.wasm");
//! let engine = AsyncifyEngine::new(config, Arc::new(ConfigDelegate))?;
//! engine.start().await?;
//!
//! let details: serde_json::Value = engine
//!     .call_json(Command::bare("MUSIC_CALL_ID_GET_DETAILS"))
//!     .await?;
//!
//! engine.release().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod envelope;
pub mod error;
pub mod host;
pub mod instance;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod preferences;
pub mod reentry;
pub mod runtime_context;
pub mod state;
pub mod storage;
pub mod tasks;

pub use backoff::{backoff, backoff_duration};
pub use config::{EngineConfig, FlowOptions, UpdatePolicy};
pub use envelope::{Command, ContentType, Event, EventError, Reply, to_call_id};
pub use error::{LifecycleError, LifecycleErrorKind, RuntimeError, TaskError};
pub use lifecycle::{AsyncifyEngine, ConfigDelegate, EngineDelegate};
pub use memory::WaFuture;
pub use preferences::{MemoryPreferences, SharedPreference};
pub use state::EngineState;
pub use storage::{BundleStorage, EngineVersion};
