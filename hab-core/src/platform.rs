// Platform abstraction so the engine can compose environments for any
// supported platform, not just the host it runs on. Tests inject a platform
// to exercise windows behavior on linux and vice versa.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A platform hab can resolve environments for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    Osx,
}

impl Platform {
    /// The platform hab is currently running on.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Osx
        } else {
            Platform::Linux
        }
    }

    /// All platforms hab understands, in a stable order.
    pub fn all() -> [Platform; 3] {
        [Platform::Windows, Platform::Linux, Platform::Osx]
    }

    /// The name used for this platform in json documents.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Osx => "osx",
        }
    }

    /// Parse a platform name as used in json documents.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "windows" | "win32" => Some(Platform::Windows),
            "linux" => Some(Platform::Linux),
            "osx" | "darwin" => Some(Platform::Osx),
            _ => None,
        }
    }

    /// Separator used between entries of list environment variables.
    pub fn list_sep(&self) -> &'static str {
        match self {
            Platform::Windows => ";",
            _ => ":",
        }
    }

    /// Separator used between directory names in file paths.
    pub fn path_sep(&self) -> char {
        match self {
            Platform::Windows => '\\',
            _ => '/',
        }
    }

    /// The default script extension for this platform.
    pub fn default_ext(&self) -> &'static str {
        match self {
            Platform::Windows => ".bat",
            _ => ".sh",
        }
    }

    /// The default shell language for this platform.
    pub fn default_shell(&self) -> Shell {
        match self {
            Platform::Windows => Shell::Batch,
            _ => Shell::Sh,
        }
    }

    /// A platform specific reference to the named environment variable.
    pub fn env_ref(&self, name: &str) -> String {
        self.default_shell().env_ref(name)
    }

    /// Escape a value for the platform's default shell.
    pub fn escape(&self, value: &str) -> String {
        self.default_shell().escape(value)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The scripting languages hab can render for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// bash on linux or osx
    Sh,
    /// bash running on windows (cygwin, git-bash)
    ShWin,
    /// Power Shell
    Ps,
    /// Command Prompt
    Batch,
}

impl Shell {
    /// Map a script file extension onto the shell that will source it.
    ///
    /// `.bat` and `.cmd` are batch, `.ps1` is power shell. `.sh` or no
    /// extension is bash, which behaves differently on windows.
    pub fn from_ext(ext: &str, platform: Platform) -> Self {
        match ext {
            ".bat" | ".cmd" => Shell::Batch,
            ".ps1" => Shell::Ps,
            _ => {
                if platform == Platform::Windows {
                    Shell::ShWin
                } else {
                    Shell::Sh
                }
            }
        }
    }

    /// Environment variable path separator as seen by this shell.
    ///
    /// Bash on windows keeps `:`, the native windows shells use `;`.
    pub fn list_sep(&self) -> &'static str {
        match self {
            Shell::Sh | Shell::ShWin => ":",
            Shell::Ps | Shell::Batch => ";",
        }
    }

    /// An environment variable reference in this shell's syntax.
    pub fn env_ref(&self, name: &str) -> String {
        match self {
            Shell::Sh | Shell::ShWin => format!("${name}"),
            Shell::Ps => format!("$env:{name}"),
            Shell::Batch => format!("%{name}%"),
        }
    }

    /// Escape a single value for safe use in this shell.
    pub fn escape(&self, value: &str) -> String {
        match self {
            Shell::Ps => value.replace(' ', "` "),
            // Wrapping in quotes takes care of escaping file paths
            _ => format!("\"{value}\""),
        }
    }

    /// Join an argv list into a single command line for this shell.
    pub fn join_argv(&self, argv: &[String]) -> String {
        match self {
            Shell::Ps => argv
                .iter()
                .map(|a| self.escape(a))
                .collect::<Vec<_>>()
                .join(" "),
            _ => argv
                .iter()
                .map(|a| {
                    if a.contains(' ') || a.contains('"') {
                        format!("\"{}\"", a.replace('"', "\\\""))
                    } else {
                        a.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}
