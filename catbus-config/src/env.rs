// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Environment variable loader
///
/// Keys are upper-cased and joined to the prefix with `_`, so
/// `EnvLoader::with_prefix("RABBITMQ").load_var("host")` reads
/// `RABBITMQ_HOST`.
#[derive(Debug, Clone, Default)]
pub struct EnvLoader {
    prefix: Option<String>,
    overrides: Option<HashMap<String, String>>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            overrides: None,
        }
    }

    /// Create a loader for a prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::new(Some(prefix.into()))
    }

    /// Create a loader that reads from a fixed map instead of the process
    /// environment. Keys in the map are full variable names.
    pub fn from_map(prefix: Option<String>, vars: HashMap<String, String>) -> Self {
        Self {
            prefix,
            overrides: Some(vars),
        }
    }

    /// Full variable name for a key
    pub fn full_key(&self, key: &str) -> String {
        match self.prefix {
            Some(ref prefix) => format!("{}_{}", prefix, key.to_uppercase()),
            None => key.to_uppercase(),
        }
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = self.full_key(key);

        let value = match self.overrides {
            Some(ref vars) => vars.get(&full_key).cloned(),
            None => env::var(&full_key).ok(),
        };

        value.ok_or(ConfigError::KeyNotFound(full_key))
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }

    /// Load and parse a variable, falling back to `default` when it is unset.
    ///
    /// A value that is present but does not parse is an error rather than a
    /// silent fallback.
    pub fn load_parsed_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.load_var(key) {
            Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
                key: self.full_key(key),
                value: raw.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(prefix: &str, vars: &[(&str, &str)]) -> EnvLoader {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvLoader::from_map(Some(prefix.to_string()), map)
    }

    #[test]
    fn test_env_loader_with_default() {
        let loader = EnvLoader::new(None);
        let value = loader.load_var_or("NONEXISTENT_VAR_12345", "default");

        assert_eq!(value, "default");
    }

    #[test]
    fn test_env_loader_missing_var() {
        let loader = EnvLoader::with_prefix("CATBUS_TEST");
        let result = loader.load_var("MISSING_VAR_67890");

        assert!(matches!(
            result,
            Err(ConfigError::KeyNotFound(ref key)) if key == "CATBUS_TEST_MISSING_VAR_67890"
        ));
    }

    #[test]
    fn test_prefix_joins_with_underscore() {
        let loader = loader("RABBITMQ", &[("RABBITMQ_HOST", "broker")]);
        assert_eq!(loader.full_key("host"), "RABBITMQ_HOST");
        assert_eq!(loader.load_var("host").unwrap(), "broker");
    }

    #[test]
    fn test_load_parsed_or() {
        let loader = loader("RABBITMQ", &[("RABBITMQ_PORT", " 5673 ")]);
        assert_eq!(loader.load_parsed_or("port", 5672u16).unwrap(), 5673);
        assert_eq!(loader.load_parsed_or("prefetch", 10u16).unwrap(), 10);
    }

    #[test]
    fn test_load_parsed_rejects_garbage() {
        let loader = loader("RABBITMQ", &[("RABBITMQ_PORT", "amqp")]);
        let err = loader.load_parsed_or("port", 5672u16).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "RABBITMQ_PORT"));
    }
}
