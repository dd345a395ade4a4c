use dashmap::DashMap;

/// Key under which the selected module version id is persisted.
pub const SELECTED_VERSION_KEY: &str = "selected_version";

/// Key/value pass-through to whatever preference store the embedder owns.
///
/// Values are opaque strings; the engine only stores the selected version.
pub trait SharedPreference: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    fn remove(&self, key: &str);

    /// Backend name for logging.
    fn backend_name(&self) -> &str {
        "unnamed"
    }
}

/// Process-local preferences, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: DashMap<String, String>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedPreference for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.remove(key);
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_preferences_round_trip() {
        let prefs = MemoryPreferences::new();
        assert_eq!(prefs.get(SELECTED_VERSION_KEY), None);
        prefs.set(SELECTED_VERSION_KEY, "1.2.0".into());
        assert_eq!(prefs.get(SELECTED_VERSION_KEY).as_deref(), Some("1.2.0"));
        prefs.remove(SELECTED_VERSION_KEY);
        assert_eq!(prefs.get(SELECTED_VERSION_KEY), None);
        assert_eq!(prefs.backend_name(), "memory");
    }
}
