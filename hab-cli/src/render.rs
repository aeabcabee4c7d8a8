//! Shell script rendering.
//!
//! The engine hands over flattened environment operations and aliases, this
//! module writes the `hab_config` and `hab_launch` scripts a wrapper shell
//! sources. Aliases become shell functions that temporarily apply their
//! scoped environment, run the command with forwarded arguments, and fully
//! restore the previous environment on exit.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use hab_core::{iter_aliases, iter_env_ops, AliasScript, EnvOp, FlatConfig, Platform, Result, Shell};

/// How the rendered scripts should be used.
pub struct ScriptOptions<'a> {
    pub dir: &'a Path,
    pub ext: &'a str,
    /// Alias to run at the end of the config script, with its arguments.
    pub launch: Option<(&'a str, &'a [String])>,
    /// Also write the `hab_launch` script that spawns a sub-shell.
    pub launch_script: bool,
    /// Exit the sub-shell once the launched alias returns.
    pub exit: bool,
    /// Print the scripts to stdout instead of writing them.
    pub dump: bool,
}

/// Render the scripts for a resolved config.
///
/// `freeze` is the encoded `HAB_FREEZE` value for this resolution.
pub fn write_scripts(
    flat: &FlatConfig,
    platform: Platform,
    freeze: Option<&str>,
    opts: &ScriptOptions<'_>,
) -> Result<Vec<PathBuf>> {
    let shell = Shell::from_ext(opts.ext, platform);
    let config_path = opts.dir.join(format!("hab_config{}", opts.ext));
    let launch_path = opts.dir.join(format!("hab_launch{}", opts.ext));

    let config_text = render_config(flat, platform, shell, freeze, opts);
    let mut written = Vec::new();

    if opts.dump {
        println!("{config_text}");
    } else {
        std::fs::write(&config_path, config_text)?;
        written.push(config_path.clone());
    }

    if opts.launch_script {
        let launch_text = render_launch(shell, &config_path);
        if opts.dump {
            println!("{launch_text}");
        } else {
            std::fs::write(&launch_path, launch_text)?;
            written.push(launch_path);
        }
    }
    Ok(written)
}

fn comment(shell: Shell) -> &'static str {
    match shell {
        Shell::Batch => "REM ",
        _ => "# ",
    }
}

fn render_config(
    flat: &FlatConfig,
    platform: Platform,
    shell: Shell,
    freeze: Option<&str>,
    opts: &ScriptOptions<'_>,
) -> String {
    let mut out = String::new();
    let com = comment(shell);

    if shell == Shell::Batch {
        out.push_str("@ECHO OFF\n");
    }

    let _ = writeln!(out, "{com}Customizing the prompt");
    out.push_str(&prompt_line(shell, &flat.uri_requested));
    out.push('\n');

    let mut ops = iter_env_ops(flat, platform, shell);
    if let Some(freeze) = freeze {
        ops.push(EnvOp::Set {
            name: "HAB_FREEZE".to_string(),
            value: freeze.to_string(),
        });
    }
    if !ops.is_empty() {
        let _ = writeln!(out, "{com}Setting environment variables:");
        for op in &ops {
            out.push_str(&setter_line(shell, op));
        }
        out.push('\n');
    }

    let aliases = iter_aliases(flat, platform, shell);
    if !aliases.is_empty() {
        let _ = writeln!(out, "{com}Creating aliases to launch programs:");
        for alias in &aliases {
            out.push_str(&alias_block(shell, alias));
        }
        out.push('\n');
    }

    if let Some((name, args)) = opts.launch {
        let _ = writeln!(out, "{com}Run the requested command");
        let args = if args.is_empty() {
            String::new()
        } else {
            format!(" {}", shell.join_argv(args))
        };
        match shell {
            // A doskey macro can not be called from a batch script, run the
            // alias command directly.
            Shell::Batch => {
                let cmd = aliases
                    .iter()
                    .find(|a| a.name == name)
                    .map(|a| a.cmd.clone())
                    .unwrap_or_default();
                let _ = writeln!(out, "{cmd}{args}");
            }
            _ => {
                let _ = writeln!(out, "{name}{args}");
            }
        }
        if opts.exit {
            match shell {
                Shell::Batch => out.push_str("exit\n"),
                _ => out.push_str("exit $?\n"),
            }
        }
    }

    if shell == Shell::Batch {
        out.push_str("@ECHO ON\n");
    }
    out
}

fn render_launch(shell: Shell, config_path: &Path) -> String {
    let path = config_path.display();
    match shell {
        Shell::Batch => format!("cmd.exe /k \"{path}\"\n"),
        Shell::Ps => {
            format!("powershell.exe -NoExit -ExecutionPolicy Unrestricted . \"{path}\"\n")
        }
        _ => format!("bash --init-file \"{path}\"\n"),
    }
}

fn prompt_line(shell: Shell, uri: &str) -> String {
    match shell {
        Shell::Batch => format!("set \"PROMPT=[{uri}] $P$G\"\n"),
        Shell::Ps => format!("function PROMPT {{'[{uri}] ' + $(Get-Location) + '>'}}\n"),
        _ => format!("export PS1=\"[{uri}] $PS1\"\n"),
    }
}

fn setter_line(shell: Shell, op: &EnvOp) -> String {
    match (shell, op) {
        (Shell::Batch, EnvOp::Set { name, value }) => format!("set \"{name}={value}\"\n"),
        (Shell::Batch, EnvOp::Unset { name }) => format!("set \"{name}=\"\n"),
        (Shell::Ps, EnvOp::Set { name, value }) => format!("$env:{name} = \"{value}\"\n"),
        (Shell::Ps, EnvOp::Unset { name }) => {
            format!("Remove-Item Env:\\{name} -ErrorAction SilentlyContinue\n")
        }
        (_, EnvOp::Set { name, value }) => format!("export {name}=\"{value}\"\n"),
        (_, EnvOp::Unset { name }) => format!("unset {name}\n"),
    }
}

/// Render one alias. For shells that support it, the wrapper applies the
/// alias's scoped environment and restores the previous values afterwards,
/// including variables the alias unset.
fn alias_block(shell: Shell, alias: &AliasScript) -> String {
    match shell {
        Shell::Batch => {
            // doskey macros have no scoped environment support
            format!(
                "C:\\Windows\\System32\\doskey.exe {}={} $*\n",
                alias.name, alias.cmd
            )
        }
        Shell::Ps => {
            if alias.scoped.is_empty() {
                return format!("function {}() {{ {} $args }}\n", alias.name, alias.cmd);
            }
            let mut out = format!("function {}() {{\n", alias.name);
            for (index, op) in alias.scoped.iter().enumerate() {
                let _ = writeln!(out, "    $_habOld{index} = $env:{}", op.name());
                match op {
                    EnvOp::Set { name, value } => {
                        let _ = writeln!(out, "    $env:{name} = \"{value}\"");
                    }
                    EnvOp::Unset { name } => {
                        let _ = writeln!(
                            out,
                            "    Remove-Item Env:\\{name} -ErrorAction SilentlyContinue"
                        );
                    }
                }
            }
            let _ = writeln!(out, "    try {{ {} $args }}", alias.cmd);
            let restores: Vec<String> = alias
                .scoped
                .iter()
                .enumerate()
                .map(|(index, op)| format!("$env:{} = $_habOld{index}", op.name()))
                .collect();
            let _ = writeln!(out, "    finally {{ {} }}", restores.join("; "));
            out.push_str("}\n");
            out
        }
        _ => {
            if alias.scoped.is_empty() {
                return format!(
                    "function {name}() {{ {cmd} \"$@\"; }};export -f {name};\n",
                    name = alias.name,
                    cmd = alias.cmd
                );
            }
            let mut out = format!("function {}() {{\n", alias.name);
            for (index, op) in alias.scoped.iter().enumerate() {
                let name = op.name();
                let _ = writeln!(
                    out,
                    "    local _hab_had_{index}=\"${{{name}+x}}\"; local _hab_old_{index}=\"${{{name}-}}\";"
                );
                match op {
                    EnvOp::Set { name, value } => {
                        let _ = writeln!(out, "    export {name}=\"{value}\";");
                    }
                    EnvOp::Unset { name } => {
                        let _ = writeln!(out, "    unset {name};");
                    }
                }
            }
            let _ = writeln!(out, "    {} \"$@\";", alias.cmd);
            out.push_str("    local _hab_ret=$?;\n");
            for (index, op) in alias.scoped.iter().enumerate() {
                let name = op.name();
                let _ = writeln!(
                    out,
                    "    if [ -n \"$_hab_had_{index}\" ]; then export {name}=\"$_hab_old_{index}\"; else unset {name}; fi;"
                );
            }
            out.push_str("    return $_hab_ret;\n");
            let _ = writeln!(out, "}}; export -f {};", alias.name);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat() -> FlatConfig {
        let payload = json!({
            "name": "child",
            "context": ["not_set"],
            "uri": "not_set/child",
            "environment": {
                "linux": {
                    "TEST": ["case"],
                    "FMT_FOR_OS": ["a{;}b;c:{PATH!e}{;}d"],
                    "UNSET_VARIABLE": []
                },
                "windows": {
                    "TEST": ["case"],
                    "FMT_FOR_OS": ["a{;}b;c:{PATH!e}{;}d"]
                }
            },
            "aliases": {
                "linux": {
                    "maya": {"cmd": "/usr/autodesk/maya2020/bin/maya"},
                    "pip": {"cmd": ["/usr/autodesk/maya2020/bin/mayapy", "-m", "pip"],
                            "environment": {"PYTHONDONTWRITEBYTECODE": ["1"]}}
                },
                "windows": {
                    "maya": {"cmd": "C:\\Program Files\\Autodesk\\Maya2020\\bin\\maya.exe"}
                }
            }
        });
        FlatConfig::from_freeze(&payload).unwrap()
    }

    fn options<'a>(dir: &'a Path, ext: &'a str) -> ScriptOptions<'a> {
        ScriptOptions {
            dir,
            ext,
            launch: None,
            launch_script: true,
            exit: false,
            dump: false,
        }
    }

    #[test]
    fn test_sh_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let written = write_scripts(
            &flat(),
            Platform::Linux,
            Some("v2:frozen"),
            &options(dir.path(), ".sh"),
        )
        .unwrap();
        assert_eq!(written.len(), 2);

        let config = std::fs::read_to_string(&written[0]).unwrap();
        assert!(config.contains("export PS1=\"[not_set/child] $PS1\""));
        assert!(config.contains("export TEST=\"case\""));
        assert!(config.contains("export FMT_FOR_OS=\"a:b;c:$PATH:d\""));
        assert!(config.contains("unset UNSET_VARIABLE"));
        assert!(config.contains("export HAB_FREEZE=\"v2:frozen\""));
        // Simple alias
        assert!(config
            .contains("function maya() { \"/usr/autodesk/maya2020/bin/maya\" \"$@\"; };export -f maya;"));
        // Scoped alias restores the previous environment
        assert!(config.contains("export PYTHONDONTWRITEBYTECODE=\"1\";"));
        assert!(config.contains("else unset PYTHONDONTWRITEBYTECODE; fi;"));

        let launch = std::fs::read_to_string(&written[1]).unwrap();
        assert!(launch.starts_with("bash --init-file "));
        assert!(launch.contains("hab_config.sh"));
    }

    #[test]
    fn test_bat_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let written = write_scripts(
            &flat(),
            Platform::Windows,
            None,
            &options(dir.path(), ".bat"),
        )
        .unwrap();

        let config = std::fs::read_to_string(&written[0]).unwrap();
        assert!(config.starts_with("@ECHO OFF\n"));
        assert!(config.contains("set \"PROMPT=[not_set/child] $P$G\""));
        assert!(config.contains("set \"TEST=case\""));
        assert!(config.contains("set \"FMT_FOR_OS=a;b;c:%PATH%;d\""));
        assert!(config.contains(
            "C:\\Windows\\System32\\doskey.exe maya=\"C:\\Program Files\\Autodesk\\Maya2020\\bin\\maya.exe\" $*"
        ));

        let launch = std::fs::read_to_string(&written[1]).unwrap();
        assert_eq!(launch, format!("cmd.exe /k \"{}\"\n", written[0].display()));
    }

    #[test]
    fn test_ps1_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let written = write_scripts(
            &flat(),
            Platform::Windows,
            None,
            &options(dir.path(), ".ps1"),
        )
        .unwrap();

        let config = std::fs::read_to_string(&written[0]).unwrap();
        assert!(config.contains("function PROMPT {'[not_set/child] ' + $(Get-Location) + '>'}"));
        assert!(config.contains("$env:TEST = \"case\""));
        assert!(config.contains("$env:FMT_FOR_OS = \"a;b;c:$env:PATH;d\""));
    }

    #[test]
    fn test_launch_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = vec!["-m".to_string(), "venv".to_string()];
        let opts = ScriptOptions {
            launch: Some(("pip", args.as_slice())),
            exit: true,
            ..options(dir.path(), ".sh")
        };
        let written = write_scripts(&flat(), Platform::Linux, None, &opts).unwrap();
        let config = std::fs::read_to_string(&written[0]).unwrap();
        assert!(config.contains("pip -m venv\n"));
        assert!(config.ends_with("exit $?\n"));
    }
}
