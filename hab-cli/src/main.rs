//! hab - an environment launcher.
//!
//! Resolves a slash separated URI into environment variables, aliases and
//! versioned distros, then renders shell scripts that activate the current
//! shell, spawn a configured sub-shell or launch a single program.

mod commands;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::Settings;

#[derive(Parser)]
#[command(name = "hab", version, about = "Environment launcher")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalOpts {
    /// One or more site json files to load settings from. Uses the
    /// HAB_PATHS environment variable if not passed.
    #[arg(long = "site", global = true, value_name = "PATH")]
    site: Vec<PathBuf>,

    /// Increase the verbosity of the output. Can be used up to 2 times.
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    verbosity: u8,

    /// Force this distro requirement, ignoring normally resolved
    /// requirements. Use with caution.
    #[arg(short = 'r', long = "requirement", global = true, value_name = "REQ")]
    requirements: Vec<String>,

    /// Enable user prefs for this run, overriding the site default.
    #[arg(long = "prefs", global = true, overrides_with = "no_prefs")]
    prefs: bool,

    /// Disable user prefs for this run.
    #[arg(long = "no-prefs", global = true)]
    no_prefs: bool,

    /// Save the resolved URI as the user's most recent URI.
    #[arg(long = "save-prefs", global = true)]
    save_prefs: bool,

    /// A file holding a tracing filter directive used instead of -v.
    #[arg(long = "logging-config", global = true, value_name = "PATH")]
    logging_config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Configure and launch a new shell with the resolved setup.
    Env(commands::env::EnvArgs),
    /// Resolve the setup and update the current shell.
    Activate(commands::activate::ActivateArgs),
    /// Launch an alias without modifying the current shell.
    Launch(commands::launch::LaunchArgs),
    /// Resolve and print the requested setup.
    Dump(commands::dump::DumpArgs),
    /// Save the habcache for a site file.
    Cache(commands::cache::CacheArgs),
    /// Save the most recently used URI.
    SetUri(commands::set_uri::SetUriArgs),
}

fn init_tracing(opts: &GlobalOpts) {
    let filter = opts
        .logging_config
        .as_deref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|| {
            match opts.verbosity {
                0 => "warn",
                1 => "info",
                _ => "debug",
            }
            .to_string()
        });
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.global);

    let settings = match Settings::from_opts(&cli.global) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    let ret = match &cli.command {
        Command::Env(args) => commands::env::run(settings, args),
        Command::Activate(args) => commands::activate::run(settings, args),
        Command::Launch(args) => commands::launch::run(settings, args),
        Command::Dump(args) => commands::dump::run(settings, args),
        Command::Cache(args) => commands::cache::run(settings, args),
        Command::SetUri(args) => commands::set_uri::run(settings, args),
    };

    match ret {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
