use serde::{Deserialize, Serialize};

/// Observable lifecycle of an engine.
///
/// ```text
/// stopped -> starting -> [updating]* -> running | failed
/// running -> [updating]* -> reload -> running
/// any non-terminal state -> releasing -> stopped
/// failed -> stopped
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Stopped,
    Starting,
    Updating { progress: f64 },
    Reload { version: String },
    Running { version: String },
    Releasing,
    Failed { error: String },
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Updating { .. } => "updating",
            EngineState::Reload { .. } => "reload",
            EngineState::Running { .. } => "running",
            EngineState::Releasing => "releasing",
            EngineState::Failed { .. } => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Running { .. })
    }

    /// Stopped and failed engines have nothing left to release.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed { .. })
    }

    /// Whether moving from `self` to `next` is a lifecycle edge.
    pub fn allows(&self, next: &EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (_, Releasing) => !self.is_terminal() && !matches!(self, Releasing),
            (Releasing | Failed { .. }, Stopped) => true,
            (Stopped | Failed { .. }, Starting) => true,
            (Starting | Updating { .. }, Updating { .. }) => true,
            (Starting | Updating { .. } | Reload { .. }, Running { .. }) => true,
            (Starting | Updating { .. } | Reload { .. } | Running { .. }, Failed { .. }) => true,
            (Running { .. }, Updating { .. }) => true,
            (Running { .. } | Updating { .. }, Reload { .. }) => true,
            _ => false,
        }
    }

    /// Translate a state reported as raw JSON by an embedded engine.
    ///
    /// Anything unreadable becomes `Failed` carrying the decode error.
    pub fn from_raw(raw: &[u8]) -> EngineState {
        serde_json::from_slice(raw).unwrap_or_else(|e| EngineState::Failed {
            error: format!("unrecognized engine state: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> EngineState {
        EngineState::Running {
            version: "1.0.0".into(),
        }
    }

    #[test]
    fn serializes_tagged() {
        let json = serde_json::to_value(running()).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running", "version": "1.0.0"}));
        let json = serde_json::to_value(EngineState::Releasing).unwrap();
        assert_eq!(json, serde_json::json!({"state": "releasing"}));
    }

    #[test]
    fn raw_states_translate_or_fail() {
        assert_eq!(
            EngineState::from_raw(br#"{"state":"updating","progress":0.5}"#),
            EngineState::Updating { progress: 0.5 }
        );
        match EngineState::from_raw(br#"{"state":"hibernating"}"#) {
            EngineState::Failed { error } => assert!(error.contains("unrecognized engine state")),
            other => panic!("expected failed, got {other:?}"),
        }
        assert!(matches!(EngineState::from_raw(b"\xff"), EngineState::Failed { .. }));
    }

    #[test]
    fn lifecycle_edges() {
        let stopped = EngineState::Stopped;
        let starting = EngineState::Starting;
        let updating = EngineState::Updating { progress: 0.1 };
        let reload = EngineState::Reload {
            version: "1.1.0".into(),
        };
        let failed = EngineState::Failed { error: "x".into() };

        assert!(stopped.allows(&starting));
        assert!(starting.allows(&updating));
        assert!(updating.allows(&updating));
        assert!(updating.allows(&running()));
        assert!(starting.allows(&failed));
        assert!(running().allows(&reload));
        assert!(reload.allows(&running()));
        assert!(running().allows(&updating));
        assert!(updating.allows(&reload));
        assert!(running().allows(&EngineState::Releasing));
        assert!(EngineState::Releasing.allows(&stopped));

        assert!(!stopped.allows(&running()));
        assert!(!stopped.allows(&EngineState::Releasing));
        assert!(!failed.allows(&EngineState::Releasing));
        assert!(!EngineState::Releasing.allows(&EngineState::Releasing));
        assert!(!reload.allows(&starting));
    }
}
