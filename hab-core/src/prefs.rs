// User preference persistence used by the cli.
//
// `hab set-uri` stores the last used URI with a timestamp, and the special
// URI `-` recalls it. The engine itself never reads these implicitly, the
// cli decides when prefs are enabled.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::Result;

/// The file prefs are stored in, inside the user's home directory.
pub const PREFS_FILENAME: &str = ".hab_user_prefs.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Seconds since the unix epoch when `uri` was saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_saved_at: Option<u64>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn home_dir() -> PathBuf {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var).map(PathBuf::from).unwrap_or_default()
}

impl UserPrefs {
    pub fn filename() -> PathBuf {
        home_dir().join(PREFS_FILENAME)
    }

    /// Load the prefs file, treating a missing or broken file as empty.
    pub fn load() -> Self {
        let path = Self::filename();
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!("Ignoring invalid prefs file \"{}\": {err}", path.display());
                UserPrefs::default()
            }),
            Err(_) => UserPrefs::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::filename();
        let text = serde_json::to_string_pretty(self)
            .expect("prefs are always serializable");
        std::fs::write(&path, text)?;
        debug!("Saved user prefs: {}", path.display());
        Ok(())
    }

    /// Remember the given URI as the most recently used one.
    pub fn save_uri(&mut self, uri: &str) -> Result<()> {
        self.uri = Some(uri.to_string());
        self.uri_saved_at = Some(now());
        self.save()
    }

    /// The saved URI if it has not outlived `timeout` minutes.
    pub fn uri_check(&self, timeout: Option<u64>) -> Option<String> {
        let uri = self.uri.clone()?;
        if let (Some(timeout), Some(saved_at)) = (timeout, self.uri_saved_at) {
            let age_minutes = now().saturating_sub(saved_at) / 60;
            if age_minutes >= timeout {
                debug!("Saved URI timed out after {age_minutes} minutes");
                return None;
            }
        }
        Some(uri)
    }
}
