// Configuration binding for harnessed services
// Precedence: explicit CLI flag > environment variable > compiled-in default

use crate::error::{BindingError, HarnessError, InvalidValue};
use clap::parser::ValueSource as ClapValueSource;
use clap::{Arg, ArgAction, Command};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::str::FromStr;

pub const LOG_LEVEL_FLAG: &str = "log_level";
pub const LOG_ENCODING_FLAG: &str = "log_encoding";

const RESERVED_FLAGS: [&str; 2] = ["help", "version"];

/// A single command-line flag, also readable from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagDecl {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

impl FlagDecl {
    pub const fn new(name: &'static str, default: &'static str, description: &'static str) -> Self {
        FlagDecl {
            name,
            default,
            description,
        }
    }
}

/// Derives the environment variable that overrides `flag` for `service`.
pub fn env_key(service: &str, flag: &str) -> String {
    format!("{}_{}", service.to_uppercase(), flag.to_uppercase())
}

/// Namespace prefix shared by every environment key of `service`.
pub fn env_prefix(service: &str) -> String {
    format!("{}_", service.to_uppercase())
}

/// Writes a raw string value into a typed config field.
///
/// The error message must describe the problem without echoing the value.
pub type BindFn<C> = fn(&mut C, &str) -> Result<(), String>;

/// A flag declaration paired with the config field it populates.
pub struct Field<C> {
    decl: FlagDecl,
    bind: BindFn<C>,
}

impl<C> Field<C> {
    pub const fn new(
        name: &'static str,
        default: &'static str,
        description: &'static str,
        bind: BindFn<C>,
    ) -> Self {
        Field {
            decl: FlagDecl::new(name, default, description),
            bind,
        }
    }

    pub fn decl(&self) -> FlagDecl {
        self.decl
    }
}

impl<C> fmt::Debug for Field<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("decl", &self.decl).finish()
    }
}

/// Parses a value for a typed field without leaking it into the error message.
pub fn parse<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse::<T>().map_err(|e| e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredFlag {
    pub decl: FlagDecl,
    pub env_key: String,
}

/// Closed set of flags known to one service, built once before parsing.
#[derive(Debug, Clone)]
pub struct FlagRegistry {
    service: String,
    flags: Vec<RegisteredFlag>,
}

impl FlagRegistry {
    pub fn new(
        service: &str,
        decls: impl IntoIterator<Item = FlagDecl>,
    ) -> Result<Self, BindingError> {
        let mut flags: Vec<RegisteredFlag> = Vec::new();

        for decl in decls {
            if !is_valid_name(decl.name) {
                return Err(BindingError::InvalidName(decl.name.to_string()));
            }

            let key = env_key(service, decl.name);
            if let Some(existing) = flags.iter().find(|f| f.env_key == key) {
                if existing.decl.name == decl.name {
                    return Err(BindingError::DuplicateFlag(decl.name.to_string()));
                }
                return Err(BindingError::EnvKeyCollision {
                    first: existing.decl.name.to_string(),
                    second: decl.name.to_string(),
                    env_key: key,
                });
            }

            flags.push(RegisteredFlag { decl, env_key: key });
        }

        Ok(FlagRegistry {
            service: service.to_string(),
            flags,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn env_prefix(&self) -> String {
        env_prefix(&self.service)
    }

    pub fn flags(&self) -> &[RegisteredFlag] {
        &self.flags
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredFlag> {
        self.flags.iter().find(|f| f.decl.name == name)
    }

    pub fn is_known_env_key(&self, key: &str) -> bool {
        self.flags.iter().any(|f| f.env_key == key)
    }

    /// Builds the clap command; every help line ends with its `${ENV_KEY}`.
    pub fn command(&self, version: &str) -> Command {
        let mut command = Command::new(self.service.clone())
            .version(version.to_string())
            .about(format!("{} service", self.service));

        for flag in &self.flags {
            let mut arg = Arg::new(flag.decl.name)
                .long(flag.decl.name)
                .value_name("VALUE")
                .action(ArgAction::Set)
                .help(help_text(flag));
            if !flag.decl.default.is_empty() {
                arg = arg.default_value(flag.decl.default);
            }
            command = command.arg(arg);
        }

        command
    }

    /// Parses `args` and returns only the flags the operator passed explicitly.
    pub fn parse_explicit<I, T>(
        &self,
        version: &str,
        args: I,
    ) -> Result<HashMap<String, String>, BindingError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = self.command(version).try_get_matches_from(args)?;

        let mut explicit = HashMap::new();
        for flag in &self.flags {
            let name = flag.decl.name;
            if matches.value_source(name) != Some(ClapValueSource::CommandLine) {
                continue;
            }
            if let Some(value) = matches.get_one::<String>(name) {
                explicit.insert(name.to_string(), value.clone());
            }
        }

        Ok(explicit)
    }
}

// clap rejects long names that start with '-'
fn is_valid_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && !RESERVED_FLAGS.contains(&name)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn help_text(flag: &RegisteredFlag) -> String {
    if flag.decl.description.is_empty() {
        format!("${{{}}}", flag.env_key)
    } else {
        format!("{} ${{{}}}", flag.decl.description, flag.env_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Default,
    Environment,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedValue {
    pub value: String,
    pub source: ValueSource,
}

/// Final value of every registered flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, ResolvedValue>,
}

impl ResolvedConfig {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.value.as_str())
    }

    pub fn source(&self, name: &str) -> Option<ValueSource> {
        self.values.get(name).map(|v| v.source)
    }

    /// True when the value came from the environment or an explicit flag.
    pub fn is_set(&self, name: &str) -> bool {
        matches!(
            self.source(name),
            Some(ValueSource::Environment | ValueSource::Flag)
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Layers defaults, environment and explicit flags for every registered flag.
///
/// Empty environment values count as unset.
pub fn resolve(
    registry: &FlagRegistry,
    env: &HashMap<String, String>,
    explicit: &HashMap<String, String>,
) -> ResolvedConfig {
    let values = registry
        .flags()
        .iter()
        .map(|flag| {
            let resolved = if let Some(value) = explicit.get(flag.decl.name) {
                ResolvedValue {
                    value: value.clone(),
                    source: ValueSource::Flag,
                }
            } else if let Some(value) = env.get(&flag.env_key).filter(|v| !v.is_empty()) {
                ResolvedValue {
                    value: value.clone(),
                    source: ValueSource::Environment,
                }
            } else {
                ResolvedValue {
                    value: flag.decl.default.to_string(),
                    source: ValueSource::Default,
                }
            };
            (flag.decl.name.to_string(), resolved)
        })
        .collect();

    ResolvedConfig { values }
}

/// Merges service flags with the harness-owned logging flags.
#[derive(Debug, Clone)]
pub struct ConfigBinder {
    registry: FlagRegistry,
    version: String,
}

impl ConfigBinder {
    pub fn new(
        service: &str,
        version: &str,
        service_flags: impl IntoIterator<Item = FlagDecl>,
    ) -> Result<Self, BindingError> {
        let decls = service_flags.into_iter().chain(GlobalConfig::flags());
        Ok(ConfigBinder {
            registry: FlagRegistry::new(service, decls)?,
            version: version.to_string(),
        })
    }

    pub fn registry(&self) -> &FlagRegistry {
        &self.registry
    }

    pub fn command(&self) -> Command {
        self.registry.command(&self.version)
    }

    pub fn bind<I, T>(
        &self,
        args: I,
        env: &HashMap<String, String>,
    ) -> Result<ResolvedConfig, BindingError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let explicit = self.registry.parse_explicit(&self.version, args)?;
        Ok(resolve(&self.registry, env, &explicit))
    }
}

/// Populates a typed service config from resolved values.
///
/// Every field is attempted; all invalid values are reported together.
pub fn bind_fields<C: Default>(
    fields: &[Field<C>],
    resolved: &ResolvedConfig,
) -> Result<C, BindingError> {
    let mut config = C::default();
    let mut invalid = Vec::new();

    for field in fields {
        let value = resolved.get(field.decl.name).unwrap_or(field.decl.default);
        if let Err(message) = (field.bind)(&mut config, value) {
            invalid.push(InvalidValue {
                field: field.decl.name.to_string(),
                message,
            });
        }
    }

    if invalid.is_empty() {
        Ok(config)
    } else {
        Err(BindingError::InvalidValues(invalid))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEncoding {
    Json,
    #[default]
    Console,
}

impl FromStr for LogEncoding {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogEncoding::Json),
            "console" => Ok(LogEncoding::Console),
            other => Err(HarnessError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Harness-owned settings shared by every service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub log_encoding: LogEncoding,
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            log_encoding: LogEncoding::Console,
            log_level: "debug".to_string(),
        }
    }
}

impl GlobalConfig {
    pub fn flags() -> [FlagDecl; 2] {
        [
            FlagDecl::new(LOG_LEVEL_FLAG, "debug", "Minimum log severity"),
            FlagDecl::new(LOG_ENCODING_FLAG, "console", "Log encoding: json or console"),
        ]
    }

    pub fn from_resolved(resolved: &ResolvedConfig) -> Result<Self, HarnessError> {
        let defaults = GlobalConfig::default();

        let log_encoding = match resolved.get(LOG_ENCODING_FLAG) {
            Some(raw) => raw.parse()?,
            None => defaults.log_encoding,
        };
        let log_level = resolved
            .get(LOG_LEVEL_FLAG)
            .map(str::to_string)
            .unwrap_or(defaults.log_level);

        Ok(GlobalConfig {
            log_encoding,
            log_level,
        })
    }
}
