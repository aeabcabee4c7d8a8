//! `hab set-uri` - remember the most recently used URI.

use std::process::ExitCode;

use clap::Args;
use hab_core::{HabError, UserPrefs};

use crate::commands::{CliError, CmdResult, Settings};

#[derive(Args)]
pub struct SetUriArgs {
    /// The URI to save. Prints the currently saved URI when omitted.
    pub uri: Option<String>,
}

pub fn run(mut settings: Settings, args: &SetUriArgs) -> CmdResult {
    if !settings.prefs_enabled {
        return Err(HabError::UriUnresolved(
            "set-uri requires user prefs to be enabled".to_string(),
        )
        .into());
    }

    let Some(uri) = &args.uri else {
        match UserPrefs::load().uri_check(settings.resolver.site.prefs_uri_timeout()) {
            Some(uri) => println!("{uri}"),
            None => println!("No URI is currently saved"),
        }
        return Ok(ExitCode::SUCCESS);
    };

    // Make sure the URI maps to something before remembering it
    settings
        .resolver
        .closest_config(uri)
        .map_err(CliError::resolving(uri))?;
    UserPrefs::load().save_uri(uri)?;
    println!("Saved URI: {uri}");
    Ok(ExitCode::SUCCESS)
}
