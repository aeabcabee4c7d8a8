// The contract consumed by shell specific script renderers.
//
// By the time a renderer runs, prepends and appends are already flattened
// into final value lists. The helpers here turn those lists into per-shell
// strings: entries joined with the shell's separator and the deferred
// `{;}` / `{NAME!e}` markers resolved for the target language. Renderers
// only need to emit one setter or unsetter per operation and one wrapper
// per alias.

use crate::envops::EnvValue;
use crate::flat::FlatConfig;
use crate::formatter::{format_value, FormatContext};
use crate::platform::{Platform, Shell};

/// A single flattened environment operation.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvOp {
    Set { name: String, value: String },
    Unset { name: String },
}

impl EnvOp {
    pub fn name(&self) -> &str {
        match self {
            EnvOp::Set { name, .. } | EnvOp::Unset { name } => name,
        }
    }
}

/// An alias ready to render: the command line and its scoped operations.
#[derive(Debug, Clone)]
pub struct AliasScript {
    pub name: String,
    pub cmd: String,
    pub scoped: Vec<EnvOp>,
}

fn flatten(values: &[String], shell: Shell) -> String {
    let ctx = FormatContext::default();
    values
        .iter()
        .map(|value| format_value(value, &ctx, Some(shell)))
        .collect::<Vec<_>>()
        .join(shell.list_sep())
}

/// The ordered environment operations of a flat config for one shell.
pub fn iter_env_ops(flat: &FlatConfig, platform: Platform, shell: Shell) -> Vec<EnvOp> {
    let Some(environment) = flat.environment(platform) else {
        return Vec::new();
    };
    environment
        .iter()
        .map(|(name, values)| {
            if values.is_empty() {
                EnvOp::Unset { name: name.clone() }
            } else {
                EnvOp::Set {
                    name: name.clone(),
                    value: flatten(values, shell),
                }
            }
        })
        .collect()
}

/// The ordered aliases of a flat config for one shell, with scoped env ops.
pub fn iter_aliases(flat: &FlatConfig, platform: Platform, shell: Shell) -> Vec<AliasScript> {
    let Some(aliases) = flat.aliases_for(platform) else {
        return Vec::new();
    };
    let ctx = FormatContext::default();
    aliases
        .iter()
        .map(|(name, alias)| {
            let cmd = match &alias.cmd {
                EnvValue::Single(value) => shell.escape(&format_value(value, &ctx, Some(shell))),
                EnvValue::Multi(values) => {
                    let argv: Vec<String> = values
                        .iter()
                        .map(|value| format_value(value, &ctx, Some(shell)))
                        .collect();
                    shell.join_argv(&argv)
                }
            };
            let scoped = alias
                .environment
                .iter()
                .map(|(name, values)| {
                    if values.is_empty() {
                        EnvOp::Unset { name: name.clone() }
                    } else {
                        EnvOp::Set {
                            name: name.clone(),
                            value: flatten(values, shell),
                        }
                    }
                })
                .collect();
            AliasScript {
                name: name.clone(),
                cmd,
                scoped,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::FlatConfig;
    use serde_json::json;

    fn flat() -> FlatConfig {
        // Build through a freeze payload, the shortest path to a FlatConfig
        let payload = json!({
            "name": "child",
            "context": ["not_set"],
            "uri": "not_set/child",
            "environment": {
                "linux": {
                    "FMT_FOR_OS": ["a{;}b;c:{PATH!e}{;}d"],
                    "UNSET_VARIABLE": [],
                    "PATH": ["/apps/bin", "{PATH!e}"]
                },
                "windows": {
                    "FMT_FOR_OS": ["a{;}b;c:{PATH!e}{;}d"]
                }
            },
            "aliases": {
                "linux": {
                    "maya": {"cmd": "/usr/autodesk/maya2020/bin/maya"},
                    "pip": {"cmd": ["/usr/autodesk/maya2020/bin/mayapy", "-m", "pip"],
                            "environment": {"PYTHONDONTWRITEBYTECODE": ["1"]}}
                }
            }
        });
        FlatConfig::from_freeze(&payload).unwrap()
    }

    #[test]
    fn test_env_ops_flattening() {
        let flat = flat();
        let ops = iter_env_ops(&flat, Platform::Linux, Shell::Sh);

        assert!(ops.contains(&EnvOp::Set {
            name: "FMT_FOR_OS".to_string(),
            value: "a:b;c:$PATH:d".to_string(),
        }));
        assert!(ops.contains(&EnvOp::Unset {
            name: "UNSET_VARIABLE".to_string(),
        }));
        // The inherited PATH marker resolves to a shell reference
        assert!(ops.contains(&EnvOp::Set {
            name: "PATH".to_string(),
            value: "/apps/bin:$PATH".to_string(),
        }));
    }

    #[test]
    fn test_env_ops_per_shell() {
        let flat = flat();
        let ops = iter_env_ops(&flat, Platform::Windows, Shell::Batch);
        assert!(ops.contains(&EnvOp::Set {
            name: "FMT_FOR_OS".to_string(),
            value: "a;b;c:%PATH%;d".to_string(),
        }));

        let ops = iter_env_ops(&flat, Platform::Windows, Shell::Ps);
        assert!(ops.contains(&EnvOp::Set {
            name: "FMT_FOR_OS".to_string(),
            value: "a;b;c:$env:PATH;d".to_string(),
        }));
    }

    #[test]
    fn test_alias_commands() {
        let flat = flat();
        let aliases = iter_aliases(&flat, Platform::Linux, Shell::Sh);

        let maya = aliases.iter().find(|a| a.name == "maya").unwrap();
        assert_eq!(maya.cmd, "\"/usr/autodesk/maya2020/bin/maya\"");
        assert!(maya.scoped.is_empty());

        let pip = aliases.iter().find(|a| a.name == "pip").unwrap();
        assert_eq!(pip.cmd, "/usr/autodesk/maya2020/bin/mayapy -m pip");
        assert_eq!(
            pip.scoped,
            vec![EnvOp::Set {
                name: "PYTHONDONTWRITEBYTECODE".to_string(),
                value: "1".to_string(),
            }]
        );
    }
}
