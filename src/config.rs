//! Minimal configuration registry consumed by the scheduler and I/O managers for tunables such
//! as thread count and the IOCP error-tolerance window.
//!
//! This is intentionally thin: the full variable-registry/validation/persistence machinery is an
//! opaque external collaborator. Only the lookup surface the core actually consumes is modeled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// A dynamically-typed configuration value.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    Int(i64),
    String(String),
}

type ChangeCallback = Box<dyn Fn(&ConfigValue) + Send + Sync>;

/// Source of named configuration values.
///
/// Implementations must validate names against `[a-z][a-z0-9]*(\.[a-z0-9]+)*`; the provided
/// implementations (`StaticConfig`, `EnvConfig`) enforce this in their setters.
pub trait ConfigSource: Send + Sync {
    fn get_int(&self, name: &str) -> Option<i64>;
    fn get_string(&self, name: &str) -> Option<String>;
    fn on_change(&self, name: &str, callback: ChangeCallback);
}

fn is_valid_name(name: &str) -> bool {
    let mut parts = name.split('.');
    let valid_segment = |segment: &str| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    };
    parts.next().is_some_and(valid_segment) && parts.all(valid_segment)
}

/// An in-memory configuration source, primarily useful for tests and as a fallback.
#[derive(Default)]
pub struct StaticConfig {
    values: RwLock<HashMap<String, ConfigValue>>,
    callbacks: Mutex<HashMap<String, Vec<ChangeCallback>>>,
}

impl StaticConfig {
    pub fn new() -> StaticConfig {
        StaticConfig::default()
    }

    pub fn set(&self, name: &str, value: ConfigValue) {
        assert!(is_valid_name(name), "invalid config name: {}", name);
        self.values.write().expect("config lock poisoned").insert(name.to_owned(), value.clone());
        if let Some(callbacks) = self.callbacks.lock().expect("config lock poisoned").get(name) {
            for callback in callbacks {
                callback(&value);
            }
        }
    }
}

impl ConfigSource for StaticConfig {
    fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.read().expect("config lock poisoned").get(name) {
            Some(ConfigValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    fn get_string(&self, name: &str) -> Option<String> {
        match self.values.read().expect("config lock poisoned").get(name) {
            Some(ConfigValue::String(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn on_change(&self, name: &str, callback: ChangeCallback) {
        self.callbacks
            .lock()
            .expect("config lock poisoned")
            .entry(name.to_owned())
            .or_default()
            .push(callback);
    }
}

/// Reads `WEAVE_<NAME_WITH_UNDERSCORES>` environment variables, falling back to a wrapped
/// [`StaticConfig`] for values that aren't set in the environment or that change at runtime.
pub struct EnvConfig {
    fallback: Arc<StaticConfig>,
}

impl EnvConfig {
    pub fn new() -> EnvConfig {
        EnvConfig { fallback: Arc::new(StaticConfig::new()) }
    }

    fn env_key(name: &str) -> String {
        format!("WEAVE_{}", name.to_ascii_uppercase().replace('.', "_"))
    }
}

impl Default for EnvConfig {
    fn default() -> EnvConfig {
        EnvConfig::new()
    }
}

impl ConfigSource for EnvConfig {
    fn get_int(&self, name: &str) -> Option<i64> {
        std::env::var(Self::env_key(name))
            .ok()
            .and_then(|value| value.parse().ok())
            .or_else(|| self.fallback.get_int(name))
    }

    fn get_string(&self, name: &str) -> Option<String> {
        std::env::var(Self::env_key(name)).ok().or_else(|| self.fallback.get_string(name))
    }

    fn on_change(&self, name: &str, callback: ChangeCallback) {
        self.fallback.on_change(name, callback);
    }
}

/// Resolves a `weave.*.threads`-style setting into an absolute worker-thread count.
///
/// Positive values are an absolute thread count; negative values are a multiplier of the
/// detected hardware parallelism (e.g. `-2` means "twice the available cores").
pub fn resolve_thread_count(configured: i64) -> usize {
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if configured > 0 {
        configured as usize
    } else if configured < 0 {
        (available as i64 * -configured).max(1) as usize
    } else {
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_names() {
        assert!(is_valid_name("weave.scheduler.threads"));
        assert!(is_valid_name("threads"));
        assert!(!is_valid_name("Weave.threads"));
        assert!(!is_valid_name(".threads"));
        assert!(!is_valid_name("weave..threads"));
    }

    #[test]
    fn static_config_round_trips() {
        let config = StaticConfig::new();
        config.set("weave.scheduler.threads", ConfigValue::Int(4));
        assert_eq!(config.get_int("weave.scheduler.threads"), Some(4));
        assert_eq!(config.get_int("weave.missing"), None);
    }

    #[test]
    fn on_change_fires_for_future_updates() {
        let config = StaticConfig::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        config.on_change("weave.x", Box::new(move |value| {
            if let ConfigValue::Int(value) = value {
                seen_clone.lock().unwrap().push(*value);
            }
        }));
        config.set("weave.x", ConfigValue::Int(1));
        config.set("weave.x", ConfigValue::Int(2));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn resolves_thread_count() {
        assert_eq!(resolve_thread_count(4), 4);
        assert!(resolve_thread_count(-1) >= 1);
    }
}
