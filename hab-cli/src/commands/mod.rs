//! Shared state and helpers for the cli subcommands.

pub mod activate;
pub mod cache;
pub mod dump;
pub mod env;
pub mod launch;
pub mod set_uri;

use std::fmt;
use std::process::ExitCode;

use hab_core::{paths_from_env, HabError, Resolver, Site, UserPrefs};

use crate::GlobalOpts;

/// An engine error, optionally tagged with the URI being resolved so the
/// user sees `Error resolving <uri>: <message>`.
#[derive(Debug)]
pub struct CliError {
    pub uri: Option<String>,
    pub source: HabError,
}

impl CliError {
    pub fn resolving(uri: &str) -> impl Fn(HabError) -> CliError + '_ {
        move |source| CliError {
            uri: Some(uri.to_string()),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uri {
            Some(uri) => write!(f, "Error resolving {uri}: {}", self.source),
            None => write!(f, "{}", self.source),
        }
    }
}

impl From<HabError> for CliError {
    fn from(source: HabError) -> Self {
        CliError { uri: None, source }
    }
}

pub type CmdResult = Result<ExitCode, CliError>;

/// Settings shared by every subcommand.
pub struct Settings {
    pub resolver: Resolver,
    pub prefs_enabled: bool,
    pub save_prefs: bool,
    pub verbosity: i32,
}

impl Settings {
    pub fn from_opts(opts: &GlobalOpts) -> Result<Self, CliError> {
        let paths = if opts.site.is_empty() {
            paths_from_env()
        } else {
            opts.site.clone()
        };
        let site = Site::load(paths)?;

        let prefs_enabled = if opts.prefs {
            true
        } else if opts.no_prefs {
            false
        } else {
            site.prefs_default()
        };

        let resolver =
            Resolver::new(site).with_forced_requirements(opts.requirements.iter())?;

        Ok(Settings {
            resolver,
            prefs_enabled,
            save_prefs: opts.save_prefs,
            verbosity: opts.verbosity as i32,
        })
    }

    /// Handle the special `-` URI by recalling the saved one.
    pub fn expand_uri(&self, uri: &str) -> Result<String, CliError> {
        if uri != "-" {
            return Ok(uri.to_string());
        }
        if !self.prefs_enabled {
            return Err(HabError::UriUnresolved(
                "\"-\" requires user prefs to be enabled".to_string(),
            )
            .into());
        }
        let timeout = self.resolver.site.prefs_uri_timeout();
        UserPrefs::load()
            .uri_check(timeout)
            .ok_or_else(|| HabError::UriUnresolved("no saved URI to recall".to_string()).into())
    }

    /// Persist the URI when `--save-prefs` was passed and prefs are on.
    pub fn maybe_save_uri(&self, uri: &str) -> Result<(), CliError> {
        if self.save_prefs && self.prefs_enabled {
            UserPrefs::load().save_uri(uri)?;
        }
        Ok(())
    }
}
