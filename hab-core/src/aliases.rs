// Alias collection and alias_mods application.
//
// Distros declare aliases per platform as an ordered list of
// `[name, spec]` pairs. A spec is a plain command string, an argv list, or
// a dict carrying `cmd` plus an optional scoped `environment` and free form
// plugin keys. Aliases are collected from the selected distros in solve
// order with the first occurrence of a name winning. Configs and distros
// can then adjust matching aliases through `alias_mods`, which may only
// contribute environment operations.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::envops::{EnvBuilder, EnvValue, EnvironmentConfig};
use crate::errors::Result;
use crate::formatter::{format_value, FormatContext};
use crate::platform::Platform;

/// An alias definition as written in a distro json document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AliasSpec {
    Simple(String),
    Argv(Vec<String>),
    Complex(ComplexAlias),
}

/// The dict form of an alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexAlias {
    pub cmd: EnvValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Plugin keys like icon or label pass through composition untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A partial alias override. Only the environment is mergeable, any other
/// keys are ignored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasMod {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A fully resolved alias, normalized to the complex form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub cmd: EnvValue,
    /// Scoped environment values, composed on top of the global environment.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, Vec<String>>,
    /// The distro this alias came from as `(name, version)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<(String, String)>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Alias {
    /// Visibility check against a config's `min_verbosity` style table
    /// stored on the alias itself as a plugin key.
    pub fn visible(&self, verbosity: Option<i32>, target: &str) -> bool {
        let Some(verbosity) = verbosity else {
            return true;
        };
        let Some(table) = self.extra.get("min_verbosity").and_then(Value::as_object) else {
            return true;
        };
        let min = table
            .get(target)
            .or_else(|| table.get("global"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        min as i32 <= verbosity
    }
}

/// One alias definition waiting for mods before it is finalized.
struct PendingAlias {
    name: String,
    cmd: EnvValue,
    distro: (String, String),
    extra: Map<String, Value>,
    /// Environment op sources applied in order: the alias's own ops first,
    /// then distro mods, then config mods so the config wins on conflicts.
    env_sources: Vec<(EnvironmentConfig, FormatContext)>,
}

/// Collects aliases from selected distros and applies alias_mods.
pub struct AliasComposer {
    platform: Platform,
    pending: IndexMap<String, PendingAlias>,
}

impl AliasComposer {
    pub fn new(platform: Platform) -> Self {
        AliasComposer {
            platform,
            pending: IndexMap::new(),
        }
    }

    /// Add one distro's aliases for this composer's platform.
    ///
    /// `distro` is the `(name, version)` provenance pair and `ctx` supplies
    /// the distro's `relative_root` for command formatting.
    pub fn add_distro_aliases(
        &mut self,
        aliases: &[(String, AliasSpec)],
        distro: (String, String),
        ctx: &FormatContext,
    ) {
        for (name, spec) in aliases {
            if self.pending.contains_key(name) {
                debug!(
                    "Skipping duplicate alias \"{name}\" from {}=={}",
                    distro.0, distro.1
                );
                continue;
            }

            let (cmd, environment, extra) = match spec {
                AliasSpec::Simple(cmd) => (EnvValue::Single(cmd.clone()), None, Map::new()),
                AliasSpec::Argv(argv) => (EnvValue::Multi(argv.clone()), None, Map::new()),
                AliasSpec::Complex(complex) => (
                    complex.cmd.clone(),
                    complex.environment.clone(),
                    complex.extra.clone(),
                ),
            };

            let cmd = match cmd {
                EnvValue::Single(value) => EnvValue::Single(format_value(&value, ctx, None)),
                EnvValue::Multi(values) => EnvValue::Multi(
                    values
                        .iter()
                        .map(|value| format_value(value, ctx, None))
                        .collect(),
                ),
            };

            let mut env_sources = Vec::new();
            if let Some(environment) = environment {
                env_sources.push((environment, ctx.clone()));
            }

            self.pending.insert(
                name.clone(),
                PendingAlias {
                    name: name.clone(),
                    cmd,
                    distro: distro.clone(),
                    extra,
                    env_sources,
                },
            );
        }
    }

    /// Queue alias_mods for any matching alias names.
    ///
    /// Call once per contributing distro in solve order, then once for the
    /// reduced config so its mods are applied last and win on conflicts.
    pub fn add_mods(&mut self, mods: &IndexMap<String, AliasMod>, ctx: &FormatContext) {
        for (name, alias_mod) in mods {
            let Some(pending) = self.pending.get_mut(name) else {
                debug!("alias_mods for \"{name}\" matched no alias, ignored");
                continue;
            };
            if let Some(environment) = &alias_mod.environment {
                pending
                    .env_sources
                    .push((environment.clone(), ctx.clone()));
            }
        }
    }

    /// Compose every alias's scoped environment on top of the global one.
    ///
    /// The scoped environment starts from the composed global values, so a
    /// prepend on a globally set variable extends it, but only variables the
    /// alias touches are recorded on the alias.
    pub fn finish(self, global: &EnvBuilder<'_>) -> Result<IndexMap<String, Alias>> {
        let platform = self.platform;
        let mut ret = IndexMap::new();

        for (_, pending) in self.pending {
            let mut touched: Vec<String> = Vec::new();
            let mut scoped = global.clone();
            for (config, ctx) in &pending.env_sources {
                if let Some(ops) = config.ops_for(platform) {
                    touched.extend(ops.unset.iter().cloned());
                    touched.extend(ops.set.keys().cloned());
                    touched.extend(ops.prepend.keys().cloned());
                    touched.extend(ops.append.keys().cloned());
                    scoped.apply_ops(ops, ctx)?;
                }
            }

            let mut environment = IndexMap::new();
            let scoped = scoped.finish();
            for name in touched {
                if environment.contains_key(&name) {
                    continue;
                }
                if let Some(value) = scoped.get(&name) {
                    environment.insert(name, value.clone());
                }
            }

            ret.insert(
                pending.name,
                Alias {
                    cmd: pending.cmd,
                    environment,
                    distro: Some(pending.distro),
                    extra: pending.extra,
                },
            );
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FormatContext {
        FormatContext::new("/distros/the_dcc/1.2")
    }

    fn spec(json: &str) -> AliasSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_spec_forms() {
        assert_eq!(
            spec(r#""maya.exe""#),
            AliasSpec::Simple("maya.exe".to_string())
        );
        assert_eq!(
            spec(r#"["mayapy.exe", "-m", "pip"]"#),
            AliasSpec::Argv(vec![
                "mayapy.exe".to_string(),
                "-m".to_string(),
                "pip".to_string()
            ])
        );
        let complex = spec(r#"{"cmd": "dcc", "icon": "dcc.png"}"#);
        match complex {
            AliasSpec::Complex(complex) => {
                assert_eq!(complex.cmd, EnvValue::Single("dcc".to_string()));
                assert_eq!(complex.extra.get("icon").unwrap(), "dcc.png");
            }
            other => panic!("expected the complex form, got {other:?}"),
        }
    }

    #[test]
    fn test_first_occurrence_wins() {
        let mut composer = AliasComposer::new(Platform::Linux);
        composer.add_distro_aliases(
            &[("houdini".to_string(), spec(r#""/opt/hfs18.5/bin/houdini""#))],
            ("houdini18.5".to_string(), "18.5.499".to_string()),
            &ctx(),
        );
        composer.add_distro_aliases(
            &[("houdini".to_string(), spec(r#""/opt/hfs19.5/bin/houdini""#))],
            ("houdini19.5".to_string(), "19.5.493".to_string()),
            &ctx(),
        );

        let global = EnvBuilder::new(Platform::Linux);
        let aliases = composer.finish(&global).unwrap();
        assert_eq!(
            aliases.get("houdini").unwrap().cmd,
            EnvValue::Single("/opt/hfs18.5/bin/houdini".to_string())
        );
        assert_eq!(
            aliases.get("houdini").unwrap().distro,
            Some(("houdini18.5".to_string(), "18.5.499".to_string()))
        );
    }

    #[test]
    fn test_scoped_environment_extends_global() {
        let mut global = EnvBuilder::new(Platform::Linux);
        global
            .apply_ops(
                &serde_json::from_str(r#"{"set": {"ALIASED_GLOBAL_A": "Global A"}}"#).unwrap(),
                &ctx(),
            )
            .unwrap();

        let mut composer = AliasComposer::new(Platform::Linux);
        composer.add_distro_aliases(
            &[(
                "as_dict".to_string(),
                spec(
                    r#"{"cmd": ["python", "-c", "print('x')"],
                        "environment": {"prepend": {"ALIASED_GLOBAL_A": "Local A Prepend"}}}"#,
                ),
            )],
            ("aliased".to_string(), "2.0".to_string()),
            &ctx(),
        );

        let aliases = composer.finish(&global).unwrap();
        let alias = aliases.get("as_dict").unwrap();
        assert_eq!(
            alias.environment.get("ALIASED_GLOBAL_A").unwrap(),
            &vec!["Local A Prepend".to_string(), "Global A".to_string()]
        );
        // The global environment itself is untouched
        assert_eq!(
            global.vars().get("ALIASED_GLOBAL_A").unwrap(),
            &vec!["Global A".to_string()]
        );
    }

    #[test]
    fn test_alias_mods_config_wins() {
        let global = EnvBuilder::new(Platform::Linux);
        let mut composer = AliasComposer::new(Platform::Linux);
        composer.add_distro_aliases(
            &[(
                "dcc".to_string(),
                spec(r#"{"cmd": "dcc", "environment": {"append": {"DCC_MODS": "own"}}}"#),
            )],
            ("the_dcc".to_string(), "1.2".to_string()),
            &ctx(),
        );

        let distro_mods: IndexMap<String, AliasMod> = serde_json::from_str(
            r#"{"dcc": {"environment": {"append": {"DCC_MODS": "distro"}}}}"#,
        )
        .unwrap();
        let config_mods: IndexMap<String, AliasMod> = serde_json::from_str(
            r#"{"dcc": {"environment": {"append": {"DCC_MODS": "config"}}}}"#,
        )
        .unwrap();
        composer.add_mods(&distro_mods, &ctx());
        composer.add_mods(&config_mods, &ctx());

        let aliases = composer.finish(&global).unwrap();
        assert_eq!(
            aliases.get("dcc").unwrap().environment.get("DCC_MODS").unwrap(),
            &vec![
                "own".to_string(),
                "distro".to_string(),
                "config".to_string()
            ]
        );
    }

    #[test]
    fn test_visibility_filter() {
        let alias: Alias = serde_json::from_str(
            r#"{"cmd": "dcc", "min_verbosity": {"hab": 2}}"#,
        )
        .unwrap();
        assert!(alias.visible(None, "hab"));
        assert!(!alias.visible(Some(1), "hab"));
        assert!(alias.visible(Some(2), "hab"));
        // Falls back to the global entry for other targets
        assert!(alias.visible(Some(0), "hab-gui"));
    }
}
