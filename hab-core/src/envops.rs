// Environment operation dictionaries and the composer that flattens them.
//
// Configs, distros and complex aliases all describe environment changes as
// `unset`/`set`/`prepend`/`append` operations, optionally per platform. The
// `EnvBuilder` applies those operations across the traversal with the
// first-write wins rule: the first operation on a variable takes ownership
// and discards any shell inherited value, later prepends and appends only
// extend it. `PATH` keeps its shell inherited value, and the variables hab
// itself owns can not be modified at all.

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{HabError, Result};
use crate::formatter::{format_value, FormatContext};
use crate::platform::Platform;

/// Environment variables owned by hab that user configs can not touch.
pub const RESERVED_ENV_VARS: [&str; 2] = ["HAB_URI", "HAB_FREEZE"];

/// A value that can be written as a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Single(String),
    Multi(Vec<String>),
}

impl EnvValue {
    /// The value as a list of entries.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            EnvValue::Single(value) => vec![value.clone()],
            EnvValue::Multi(values) => values.clone(),
        }
    }
}

/// A flat operations dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvOps {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub set: IndexMap<String, EnvValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub prepend: IndexMap<String, EnvValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub append: IndexMap<String, EnvValue>,
}

impl EnvOps {
    pub fn is_empty(&self) -> bool {
        self.unset.is_empty()
            && self.set.is_empty()
            && self.prepend.is_empty()
            && self.append.is_empty()
    }
}

/// An environment block from a json document, flat or per platform.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvironmentConfig {
    Flat(EnvOps),
    OsSpecific(IndexMap<String, EnvOps>),
}

impl EnvironmentConfig {
    /// The operations that apply on the given platform.
    pub fn ops_for(&self, platform: Platform) -> Option<&EnvOps> {
        match self {
            EnvironmentConfig::Flat(ops) => Some(ops),
            EnvironmentConfig::OsSpecific(map) => map.get(platform.name()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            EnvironmentConfig::Flat(ops) => ops.is_empty(),
            EnvironmentConfig::OsSpecific(map) => map.values().all(EnvOps::is_empty),
        }
    }
}

impl<'de> Deserialize<'de> for EnvironmentConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let os_specific = value
            .get("os_specific")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !os_specific {
            let ops = serde_json::from_value(value).map_err(D::Error::custom)?;
            return Ok(EnvironmentConfig::Flat(ops));
        }

        let object = value
            .as_object()
            .ok_or_else(|| D::Error::custom("environment must be an object"))?;
        let mut map = IndexMap::new();
        for (key, ops) in object {
            if key == "os_specific" {
                continue;
            }
            let ops: EnvOps = serde_json::from_value(ops.clone()).map_err(D::Error::custom)?;
            map.insert(key.clone(), ops);
        }
        Ok(EnvironmentConfig::OsSpecific(map))
    }
}

impl Serialize for EnvironmentConfig {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            EnvironmentConfig::Flat(ops) => ops.serialize(serializer),
            EnvironmentConfig::OsSpecific(map) => {
                use serde::ser::SerializeMap;
                let mut state = serializer.serialize_map(Some(map.len() + 1))?;
                state.serialize_entry("os_specific", &true)?;
                for (key, ops) in map {
                    state.serialize_entry(key, ops)?;
                }
                state.end()
            }
        }
    }
}

/// Marker kept in composed values so the shell inherited `PATH` survives.
/// It renders as `$PATH`, `%PATH%` or `$env:PATH` when a script is written.
const PATH_INHERIT: &str = "{PATH!e}";

/// Flattens operation dictionaries into final variable values.
///
/// Values are kept as lists until rendered, entries are joined with the
/// platform's separator by the script renderer. An empty list means the
/// variable should be unset.
pub struct EnvBuilder<'a> {
    platform: Platform,
    vars: IndexMap<String, Vec<String>>,
    path_mapper: Option<&'a dyn Fn(&str) -> String>,
}

impl<'a> Clone for EnvBuilder<'a> {
    fn clone(&self) -> Self {
        EnvBuilder {
            platform: self.platform,
            vars: self.vars.clone(),
            path_mapper: self.path_mapper,
        }
    }
}

impl<'a> EnvBuilder<'a> {
    pub fn new(platform: Platform) -> Self {
        EnvBuilder {
            platform,
            vars: IndexMap::new(),
            path_mapper: None,
        }
    }

    /// Translate composed values through `platform_path_maps` so the result
    /// is valid for `platform` even when composed on another host.
    pub fn with_path_mapper(mut self, mapper: &'a dyn Fn(&str) -> String) -> Self {
        self.path_mapper = Some(mapper);
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Apply one operations dictionary in document order.
    pub fn apply_ops(&mut self, ops: &EnvOps, ctx: &FormatContext) -> Result<()> {
        for name in &ops.unset {
            self.check_reserved(name)?;
            if name.eq_ignore_ascii_case("PATH") {
                return Err(HabError::ReservedEnvVar("PATH".to_string()));
            }
            if self.vars.contains_key(name) {
                return Err(HabError::SetAfterFirstWrite {
                    op: "unset",
                    name: name.clone(),
                });
            }
            // An empty value marks the variable for removal
            self.vars.insert(name.clone(), Vec::new());
        }

        for (name, value) in &ops.set {
            self.check_reserved(name)?;
            if name.eq_ignore_ascii_case("PATH") {
                return Err(HabError::ReservedEnvVar("PATH".to_string()));
            }
            if self.vars.contains_key(name) {
                return Err(HabError::SetAfterFirstWrite {
                    op: "set",
                    name: name.clone(),
                });
            }
            let value = self.format_list(value, ctx);
            self.vars.insert(name.clone(), value);
        }

        for (name, value) in &ops.prepend {
            self.check_reserved(name)?;
            let value = self.format_list(value, ctx);
            let entry = self.entry_for_extend(name);
            entry.splice(0..0, value);
        }

        for (name, value) in &ops.append {
            self.check_reserved(name)?;
            let mut value = self.format_list(value, ctx);
            let entry = self.entry_for_extend(name);
            entry.append(&mut value);
        }

        Ok(())
    }

    /// Apply every platform matching dictionary of an environment config.
    pub fn apply_config(&mut self, config: &EnvironmentConfig, ctx: &FormatContext) -> Result<()> {
        if let Some(ops) = config.ops_for(self.platform) {
            self.apply_ops(ops, ctx)?;
        }
        Ok(())
    }

    /// Write a variable hab itself owns, bypassing the reserved check.
    pub fn set_owned(&mut self, name: &str, value: Vec<String>) {
        self.vars.insert(name.to_string(), value);
    }

    /// The composed variables in first-write order.
    pub fn finish(self) -> IndexMap<String, Vec<String>> {
        self.vars
    }

    /// Variables composed so far, without consuming the builder.
    pub fn vars(&self) -> &IndexMap<String, Vec<String>> {
        &self.vars
    }

    fn check_reserved(&self, name: &str) -> Result<()> {
        if RESERVED_ENV_VARS.contains(&name) {
            return Err(HabError::ReservedEnvVar(name.to_string()));
        }
        Ok(())
    }

    fn entry_for_extend(&mut self, name: &str) -> &mut Vec<String> {
        if !self.vars.contains_key(name) {
            // The first prepend or append on PATH extends the shell value
            // instead of replacing it, every other variable is owned outright.
            let seed = if name.eq_ignore_ascii_case("PATH") {
                vec![PATH_INHERIT.to_string()]
            } else {
                Vec::new()
            };
            self.vars.insert(name.to_string(), seed);
        }
        self.vars.get_mut(name).expect("entry was just inserted")
    }

    fn format_list(&self, value: &EnvValue, ctx: &FormatContext) -> Vec<String> {
        value
            .as_list()
            .iter()
            .map(|entry| {
                let formatted = format_value(entry, ctx, None);
                match self.path_mapper {
                    Some(mapper) => mapper(&formatted),
                    None => formatted,
                }
            })
            .collect()
    }
}
