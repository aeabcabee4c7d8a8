//! `hab launch` - run a single alias with the resolved environment.
//!
//! The alias process inherits stdin/stdout/stderr and its exit code is
//! forwarded unchanged.

use std::process::{Command, ExitCode};

use clap::Args;
use hab_core::formatter::expand_value;
use hab_core::{freeze, iter_aliases, iter_env_ops, EnvOp, EnvValue, HabError};
use tracing::debug;

use crate::commands::{CliError, CmdResult, Settings};

#[derive(Args)]
pub struct LaunchArgs {
    /// The URI to resolve. Use `-` for the most recently saved URI.
    pub uri: String,

    /// The alias to launch.
    pub alias: String,

    /// Arguments forwarded to the alias.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub fn run(mut settings: Settings, args: &LaunchArgs) -> CmdResult {
    let uri = settings.expand_uri(&args.uri)?;
    let flat = settings
        .resolver
        .resolve(&uri)
        .map_err(CliError::resolving(&uri))?;
    settings.maybe_save_uri(&uri)?;

    let site = &settings.resolver.site;
    let platform = site.platform;
    let shell = platform.default_shell();

    let alias = flat
        .aliases_for(platform)
        .and_then(|aliases| aliases.get(&args.alias))
        .ok_or_else(|| {
            CliError::resolving(&uri)(HabError::InvalidRequirement(format!(
                "The alias \"{}\" is not defined for \"{uri}\"",
                args.alias
            )))
        })?;

    let mut argv: Vec<String> = match &alias.cmd {
        EnvValue::Single(value) => vec![expand_value(value, platform)],
        EnvValue::Multi(values) => values
            .iter()
            .map(|value| expand_value(value, platform))
            .collect(),
    };
    argv.extend(args.args.iter().cloned());
    if argv.is_empty() {
        return Err(CliError::resolving(&uri)(HabError::InvalidRequirement(
            format!("The alias \"{}\" has an empty command", args.alias),
        )));
    }

    let frozen =
        freeze::encode(&flat.freeze(), None, Some(site)).map_err(CliError::resolving(&uri))?;

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);

    // Establish the resolved environment, then the alias's scoped values
    let scoped = iter_aliases(&flat, platform, shell)
        .into_iter()
        .find(|a| a.name == args.alias)
        .map(|a| a.scoped)
        .unwrap_or_default();
    let global = iter_env_ops(&flat, platform, shell);
    for op in global.iter().chain(&scoped) {
        match op {
            EnvOp::Set { name, value } => {
                command.env(name, expand_value(value, platform));
            }
            EnvOp::Unset { name } => {
                command.env_remove(name);
            }
        }
    }
    command.env("HAB_FREEZE", &frozen);

    debug!("Launching: {argv:?}");
    let status = command.status().map_err(|err| CliError {
        uri: Some(uri.clone()),
        source: HabError::Io(err),
    })?;
    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}
