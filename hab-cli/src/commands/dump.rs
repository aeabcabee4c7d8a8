//! `hab dump` - resolve and print the requested setup.

use std::path::Path;
use std::process::ExitCode;

use clap::{Args, ValueEnum};
use hab_core::{freeze, FlatConfig, HabError};

use crate::commands::{CliError, CmdResult, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportType {
    /// The resolved configuration for one URI.
    Cfg,
    /// The merged site settings.
    Site,
    /// The encoded freeze string for one URI.
    Freeze,
    /// Every known URI with its freeze payload or resolve error.
    AllUris,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DumpFormat {
    Text,
    Json,
    Freeze,
}

#[derive(Args)]
pub struct DumpArgs {
    /// The URI to dump. Not required for site and all-uris reports.
    pub uri: Option<String>,

    #[arg(short = 't', long = "type", value_enum, default_value = "cfg")]
    pub report_type: ReportType,

    #[arg(short = 'f', long = "format", value_enum, default_value = "text")]
    pub format: DumpFormat,

    /// Decode this freeze string, or the contents of this file, instead of
    /// resolving a URI.
    #[arg(long, value_name = "STR|PATH")]
    pub unfreeze: Option<String>,
}

pub fn run(mut settings: Settings, args: &DumpArgs) -> CmdResult {
    if let Some(frozen) = &args.unfreeze {
        return unfreeze(&settings, args, frozen);
    }

    match args.report_type {
        ReportType::Site => {
            let site = &settings.resolver.site;
            println!("Dump of Site");
            for path in &site.paths {
                println!("  {}", path.display());
            }
            for (key, value) in site.settings() {
                println!("{key}:  {value}");
            }
        }
        ReportType::AllUris => {
            let freezes = settings.resolver.freeze_configs()?;
            match args.format {
                DumpFormat::Text => {
                    for (uri, value) in &freezes {
                        match value.as_str() {
                            Some(error) => println!("{error}"),
                            None => println!("{uri}"),
                        }
                    }
                }
                _ => {
                    let text = serde_json::to_string_pretty(&freezes)
                        .expect("freeze payloads are valid json");
                    println!("{text}");
                }
            }
        }
        ReportType::Cfg | ReportType::Freeze => {
            let uri = args.uri.as_deref().ok_or_else(|| {
                CliError::from(HabError::UriUnresolved("a URI is required".to_string()))
            })?;
            let uri = settings.expand_uri(uri)?;
            let flat = settings
                .resolver
                .resolve(&uri)
                .map_err(CliError::resolving(&uri))?;
            settings.maybe_save_uri(&uri)?;
            print_flat(&settings, args, &flat)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_flat(settings: &Settings, args: &DumpArgs, flat: &FlatConfig) -> Result<(), CliError> {
    let site = &settings.resolver.site;
    let as_freeze =
        args.report_type == ReportType::Freeze || args.format == DumpFormat::Freeze;
    if as_freeze {
        let text = freeze::encode(&flat.freeze(), None, Some(site))?;
        println!("{text}");
        return Ok(());
    }
    match args.format {
        DumpFormat::Json => {
            let text = serde_json::to_string_pretty(&flat.freeze())
                .expect("freeze payloads are valid json");
            println!("{text}");
        }
        _ => println!("{}", flat.dump(site.platform, settings.verbosity)),
    }
    Ok(())
}

fn unfreeze(settings: &Settings, args: &DumpArgs, frozen: &str) -> CmdResult {
    let site = &settings.resolver.site;
    // Accept the raw string or a file holding it
    let text = if Path::new(frozen).is_file() {
        std::fs::read_to_string(frozen).map_err(HabError::Io)?
    } else {
        frozen.to_string()
    };
    let payload = freeze::decode(text.trim(), Some(site), site.platform)?;

    match args.format {
        DumpFormat::Text => {
            let flat = FlatConfig::from_freeze(&payload)?;
            println!("{}", flat.dump(site.platform, settings.verbosity));
        }
        _ => {
            let text =
                serde_json::to_string_pretty(&payload).expect("freeze payloads are valid json");
            println!("{text}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
