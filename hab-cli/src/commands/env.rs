//! `hab env` - configure and launch a new shell with the resolved setup.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use hab_core::freeze;

use crate::commands::{CliError, CmdResult, Settings};
use crate::render::{write_scripts, ScriptOptions};

#[derive(Args)]
pub struct EnvArgs {
    /// The URI to resolve. Use `-` for the most recently saved URI.
    pub uri: String,

    /// Run this alias after activating. This leaves the new shell active.
    #[arg(short = 'l', long)]
    pub launch: Option<String>,

    /// Print the scripts instead of writing them to disk.
    #[arg(long)]
    pub dump_scripts: bool,

    /// Directory the scripts are written into. Defaults to the system
    /// scratch directory.
    #[arg(long = "script-dir", value_name = "DIR")]
    pub script_dir: Option<PathBuf>,

    /// Extension of the scripts, selects the target shell.
    #[arg(long = "script-ext", value_name = "EXT")]
    pub script_ext: Option<String>,
}

pub fn run(mut settings: Settings, args: &EnvArgs) -> CmdResult {
    let uri = settings.expand_uri(&args.uri)?;
    let flat = settings
        .resolver
        .resolve(&uri)
        .map_err(CliError::resolving(&uri))?;
    settings.maybe_save_uri(&uri)?;

    let site = &settings.resolver.site;
    let frozen =
        freeze::encode(&flat.freeze(), None, Some(site)).map_err(CliError::resolving(&uri))?;

    let platform = site.platform;
    let ext = args
        .script_ext
        .clone()
        .unwrap_or_else(|| platform.default_ext().to_string());
    let dir = args.script_dir.clone().unwrap_or_else(std::env::temp_dir);
    let no_args: Vec<String> = Vec::new();

    let opts = ScriptOptions {
        dir: &dir,
        ext: &ext,
        launch: args.launch.as_deref().map(|name| (name, no_args.as_slice())),
        launch_script: true,
        exit: false,
        dump: args.dump_scripts,
    };
    write_scripts(&flat, platform, Some(&frozen), &opts)?;
    Ok(ExitCode::SUCCESS)
}
