// Startup safety checks
// Flags environment variables that look like overrides but match no declared flag,
// and masks secret-like values before the configuration is logged.

use crate::config::{FlagRegistry, ResolvedConfig};
use crate::logger::Logger;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub const SECRET_MASK: &str = "%%%_SECRET_MASKED_%%%";

pub fn is_secret_key(key: &str) -> bool {
    key.to_lowercase().contains("secret")
}

pub struct EnvironmentAuditor<'a> {
    registry: &'a FlagRegistry,
    prefix: String,
}

impl<'a> EnvironmentAuditor<'a> {
    pub fn new(registry: &'a FlagRegistry) -> Self {
        EnvironmentAuditor {
            registry,
            prefix: registry.env_prefix(),
        }
    }

    /// Names inside the service namespace that no declared flag maps to, sorted.
    pub fn unknown_vars<'e, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'e str>,
    {
        let mut unknown: Vec<String> = names
            .into_iter()
            .filter(|name| name.starts_with(&self.prefix))
            .filter(|name| !self.registry.is_known_env_key(name))
            .map(str::to_string)
            .collect();
        unknown.sort();
        unknown.dedup();
        unknown
    }

    /// Logs one warning per unknown variable. Never fails.
    pub fn audit(&self, env: &HashMap<String, String>, logger: &Logger) -> Vec<String> {
        let unknown = self.unknown_vars(env.keys().map(String::as_str));

        logger.in_scope(|| {
            for name in &unknown {
                tracing::warn!(env_name = %name, "Unknown environment variable detected");
            }
        });

        unknown
    }
}

/// Redacted view of the resolved configuration used for the startup log.
///
/// Secret-like keys are always present and masked; other keys appear only when
/// they were set through the environment or an explicit flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConfigSnapshot(BTreeMap<String, String>);

impl ConfigSnapshot {
    pub fn capture(resolved: &ResolvedConfig) -> Self {
        let mut values = BTreeMap::new();

        for (key, resolved_value) in resolved.iter() {
            if is_secret_key(key) {
                values.insert(key.to_string(), SECRET_MASK.to_string());
            } else if resolved.is_set(key) {
                values.insert(key.to_string(), resolved_value.value.clone());
            }
        }

        ConfigSnapshot(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}
