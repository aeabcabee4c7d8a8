//! `hab activate` - resolve the setup and apply it to the current shell.
//!
//! In powershell and bash the wrapper must source the output, for example
//! `. hab activate ...`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use hab_core::freeze;

use crate::commands::{CliError, CmdResult, Settings};
use crate::render::{write_scripts, ScriptOptions};

#[derive(Args)]
pub struct ActivateArgs {
    /// The URI to resolve. Use `-` for the most recently saved URI.
    pub uri: String,

    /// Print the script instead of writing it to disk.
    #[arg(long)]
    pub dump_scripts: bool,

    /// Directory the script is written into.
    #[arg(long = "script-dir", value_name = "DIR")]
    pub script_dir: Option<PathBuf>,

    /// Extension of the script, selects the target shell.
    #[arg(long = "script-ext", value_name = "EXT")]
    pub script_ext: Option<String>,
}

pub fn run(mut settings: Settings, args: &ActivateArgs) -> CmdResult {
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

    let opts = ScriptOptions {
        dir: &dir,
        ext: &ext,
        launch: None,
        launch_script: false,
        exit: false,
        dump: args.dump_scripts,
    };
    write_scripts(&flat, platform, Some(&frozen), &opts)?;
    Ok(ExitCode::SUCCESS)
}
