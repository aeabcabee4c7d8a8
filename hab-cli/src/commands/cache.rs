//! `hab cache` - generate or remove the habcache for a site file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use hab_core::cache;

use crate::commands::{CmdResult, Settings};

#[derive(Args)]
pub struct CacheArgs {
    /// The site file to cache.
    pub site_file: PathBuf,

    /// Remove the habcache for the site file instead of generating it.
    #[arg(long = "no-cache")]
    pub no_cache: bool,
}

pub fn run(settings: Settings, args: &CacheArgs) -> CmdResult {
    let site = &settings.resolver.site;
    if args.no_cache {
        let cache_path = site.cache_path(&args.site_file);
        if cache_path.is_file() {
            std::fs::remove_file(&cache_path).map_err(hab_core::HabError::Io)?;
            println!("Removed habcache: {}", cache_path.display());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cache_path = cache::save(site, &args.site_file)?;
    println!("Saved habcache: {}", cache_path.display());
    Ok(ExitCode::SUCCESS)
}
