//! Flag bindings gating optional resources.
//!
//! Precedence, lowest first: document `flags:` defaults, `CONVERGE_FLAG_<NAME>`
//! environment variables, then `--flag name=value` arguments.

use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ConfigError;

/// Prefix of environment variables overriding flags.
pub const FLAG_ENV_PREFIX: &str = "CONVERGE_FLAG_";

/// Resolved flag values for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagBindings {
    values: BTreeMap<String, bool>,
}

impl FlagBindings {
    /// Creates bindings from document defaults.
    #[must_use]
    pub fn from_defaults(defaults: &BTreeMap<String, bool>) -> Self {
        Self {
            values: defaults.clone(),
        }
    }

    /// Returns a flag value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        self.values.get(name).copied()
    }

    /// Returns true if the flag is bound.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Sets a flag value.
    pub fn set(&mut self, name: impl Into<String>, value: bool) {
        self.values.insert(name.into(), value);
    }

    /// Iterates over all bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Applies `CONVERGE_FLAG_<NAME>` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFlag` if a value is not a boolean.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_vars(std::env::vars())
    }

    /// Applies overrides from `(key, value)` pairs shaped like environment
    /// variables. Keys without the flag prefix are ignored; names are lowercased.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFlag` if a value is not a boolean.
    pub fn apply_env_vars<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(FLAG_ENV_PREFIX) else {
                continue;
            };
            let name = name.to_ascii_lowercase();
            let parsed = parse_bool(&value).ok_or_else(|| ConfigError::InvalidFlag {
                binding: format!("{key}={value}"),
                reason: String::from("expected a boolean"),
            })?;
            debug!("Overriding flag {} from environment", name);
            self.values.insert(name, parsed);
        }
        Ok(())
    }

    /// Applies `name=value` CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFlag` for a malformed binding.
    pub fn apply_cli(&mut self, bindings: &[String]) -> Result<(), ConfigError> {
        for binding in bindings {
            let (name, value) = binding.split_once('=').ok_or_else(|| ConfigError::InvalidFlag {
                binding: binding.clone(),
                reason: String::from("expected name=value"),
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidFlag {
                    binding: binding.clone(),
                    reason: String::from("empty flag name"),
                });
            }
            let parsed = parse_bool(value).ok_or_else(|| ConfigError::InvalidFlag {
                binding: binding.clone(),
                reason: String::from("expected a boolean"),
            })?;
            debug!("Overriding flag {} from command line", name);
            self.values.insert(name.to_string(), parsed);
        }
        Ok(())
    }
}

impl FromIterator<(String, bool)> for FlagBindings {
    fn from_iter<T: IntoIterator<Item = (String, bool)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> BTreeMap<String, bool> {
        BTreeMap::from([
            (String::from("create_cluster"), true),
            (String::from("enable_addons"), false),
        ])
    }

    #[test]
    fn test_precedence() {
        let mut flags = FlagBindings::from_defaults(&defaults());

        flags
            .apply_env_vars([
                (String::from("CONVERGE_FLAG_CREATE_CLUSTER"), String::from("false")),
                (String::from("CONVERGE_FLAG_ENABLE_ADDONS"), String::from("yes")),
                (String::from("HOME"), String::from("/root")),
            ])
            .unwrap();
        assert_eq!(flags.get("create_cluster"), Some(false));
        assert_eq!(flags.get("enable_addons"), Some(true));

        flags.apply_cli(&[String::from("create_cluster=true")]).unwrap();
        assert_eq!(flags.get("create_cluster"), Some(true));
        assert_eq!(flags.get("home"), None);
    }

    #[test]
    fn test_invalid_bindings() {
        let mut flags = FlagBindings::default();

        assert!(matches!(
            flags.apply_cli(&[String::from("create_cluster")]),
            Err(ConfigError::InvalidFlag { .. })
        ));
        assert!(matches!(
            flags.apply_cli(&[String::from("create_cluster=maybe")]),
            Err(ConfigError::InvalidFlag { .. })
        ));
        assert!(matches!(
            flags.apply_cli(&[String::from("=true")]),
            Err(ConfigError::InvalidFlag { .. })
        ));
    }
}
