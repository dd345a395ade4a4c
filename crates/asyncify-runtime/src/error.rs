use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Compilation failed: {0}")]
    CompilationFailed(String),

    #[error("Instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Missing guest export: {0}")]
    MissingExport(String),

    #[error("Invalid guest memory access: {0}")]
    Memory(String),

    #[error("Guest trapped: {0}")]
    Trap(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Guest returned error {code}: {reason}")]
    Protocol { code: i32, reason: String },

    #[error("Blocking bridge requires a multi-threaded tokio runtime")]
    BlockingUnsupported,

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// True when the error came from a cancelled unit of work or a torn-down
    /// task scope.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Task(TaskError::Cancelled))
    }

    /// True when the guest trapped and its instance can no longer be trusted.
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            RuntimeError::Trap(_) | RuntimeError::Task(TaskError::Trap(_))
        )
    }

    /// Classify an error coming back out of a guest invocation.
    ///
    /// Host imports return our own errors through wasmtime's `anyhow` channel,
    /// so those are unwrapped first; anything carrying a `wasmtime::Trap` is a
    /// trap, the rest is an invocation failure.
    pub(crate) fn from_guest(err: anyhow::Error) -> Self {
        match err.downcast::<RuntimeError>() {
            Ok(inner) => inner,
            Err(err) => match err.downcast::<TaskError>() {
                Ok(task) => RuntimeError::Task(task),
                Err(err) if err.downcast_ref::<wasmtime::Trap>().is_some() => {
                    RuntimeError::Trap(format!("{err:#}"))
                }
                Err(err) => RuntimeError::InvocationFailed(format!("{err:#}")),
            },
        }
    }
}

/// Failure of a registered unit of work.
///
/// Cloneable because one outcome may be observed by whichever caller awaits
/// the key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("no task registered under key {0:#x}")]
    NotFound(u32),

    #[error("guest failure in task: {0}")]
    Guest(String),

    #[error("guest trapped in task: {0}")]
    Trap(String),
}

impl From<RuntimeError> for TaskError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Task(task) => task,
            RuntimeError::Trap(msg) => TaskError::Trap(msg),
            other => TaskError::Guest(other.to_string()),
        }
    }
}

/// Lifecycle failures surfaced to engine owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleErrorKind {
    RequiredRecreateEngine,
    MaximumRetryExceeded,
    MissingSharedPreference,
}

impl LifecycleErrorKind {
    /// Stable numeric code shared with native callers.
    pub fn code(self) -> i32 {
        match self {
            LifecycleErrorKind::RequiredRecreateEngine => 50000,
            LifecycleErrorKind::MaximumRetryExceeded => 50001,
            LifecycleErrorKind::MissingSharedPreference => 50002,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            LifecycleErrorKind::RequiredRecreateEngine => "recreate the engine to use.",
            LifecycleErrorKind::MaximumRetryExceeded => "maximum retry count exceeded",
            LifecycleErrorKind::MissingSharedPreference => "missing shared preference",
        }
    }
}

impl fmt::Display for LifecycleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Debug, Error)]
#[error("{kind} (code {code})", code = .kind.code())]
pub struct LifecycleError {
    pub kind: LifecycleErrorKind,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl LifecycleError {
    pub fn new(kind: LifecycleErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn with_cause(
        kind: LifecycleErrorKind,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            kind,
            cause: Some(cause.into()),
        }
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

impl From<LifecycleErrorKind> for LifecycleError {
    fn from(kind: LifecycleErrorKind) -> Self {
        Self::new(kind)
    }
}
