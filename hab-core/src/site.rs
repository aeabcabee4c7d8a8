// Site configuration.
//
// One or more site json files tell hab where to find configs and distros
// and how to behave. Each file holds `set`/`append`/`prepend`/`unset` keys
// mapping to settings. Files are merged right to left so the left-most file
// wins for any keyed value, while list settings nest: the left file's
// prepends sit outside the right file's prepends and symmetrically for
// appends.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{HabError, Result};
use crate::platform::Platform;

/// Settings every site starts from.
const DEFAULT_SITE: &str = r#"{
    "set": {
        "config_paths": [],
        "distro_paths": [],
        "ignored_distros": ["release", "pre"],
        "platforms": ["windows", "osx", "linux"],
        "site_cache_file_template": ["{stem}.habcache"]
    }
}"#;

/// Entry point group that can contribute additional site files.
const ADD_PATHS_GROUP: &str = "hab.site.add_paths";

/// The merged site configuration.
#[derive(Debug, Clone)]
pub struct Site {
    pub platform: Platform,
    /// The site files that were merged, left-most first.
    pub paths: Vec<PathBuf>,
    data: IndexMap<String, Value>,
}

impl Site {
    /// Merge the given site files for the current platform.
    pub fn load(paths: Vec<PathBuf>) -> Result<Self> {
        Self::load_for_platform(paths, Platform::current())
    }

    /// Merge the given site files, composing paths for `platform`.
    pub fn load_for_platform(paths: Vec<PathBuf>, platform: Platform) -> Result<Self> {
        let mut site = Site {
            platform,
            paths,
            data: IndexMap::new(),
        };

        let defaults: Value =
            serde_json::from_str(DEFAULT_SITE).expect("the default site is valid json");
        merge_data(&mut site.data, &defaults, Path::new(""));

        // Right to left so the left-most file is applied last and wins
        for path in site.paths.clone().iter().rev() {
            site.merge_file(path)?;
        }

        // Site files registered through the add_paths entry point merge as
        // left-most and do not re-trigger the extension themselves.
        let added: Vec<PathBuf> = site
            .entry_points_for_group(ADD_PATHS_GROUP)
            .into_iter()
            .map(|(_, value)| PathBuf::from(value))
            .filter(|path| !site.paths.contains(path))
            .collect();
        for path in added.iter().rev() {
            debug!("Site file added by {ADD_PATHS_GROUP}: {}", path.display());
            site.merge_file(path)?;
        }
        for path in added.into_iter().rev() {
            site.paths.insert(0, path);
        }

        Ok(site)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|err| HabError::SiteLoad {
            filename: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let data: Value = serde_json::from_str(&text).map_err(|err| HabError::SiteLoad {
            filename: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        debug!("Loading site file: {}", path.display());
        let relative_root = path.parent().unwrap_or_else(|| Path::new(""));
        merge_data(&mut self.data, &data, relative_root);
        Ok(())
    }

    /// A raw merged setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The merged settings in insertion order, for site dumps.
    pub fn settings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Glob patterns configs are discovered from.
    pub fn config_paths(&self) -> Vec<String> {
        self.string_list("config_paths")
    }

    /// Glob patterns distros are discovered from.
    pub fn distro_paths(&self) -> Vec<String> {
        self.string_list("distro_paths")
    }

    /// The platforms this site resolves environments for.
    pub fn platforms(&self) -> Vec<Platform> {
        let platforms: Vec<Platform> = self
            .string_list("platforms")
            .iter()
            .filter_map(|name| Platform::from_name(name))
            .collect();
        if platforms.is_empty() {
            Platform::all().to_vec()
        } else {
            platforms
        }
    }

    pub fn prereleases(&self) -> bool {
        self.get("prereleases").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Version strings that cause a distro directory to be skipped.
    pub fn ignored_distros(&self) -> Vec<String> {
        self.string_list("ignored_distros")
    }

    pub fn freeze_version(&self) -> Option<u32> {
        self.get("freeze_version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
    }

    pub fn colorize(&self) -> bool {
        self.get("colorize").and_then(Value::as_bool).unwrap_or(true)
    }

    /// Whether user prefs are enabled when the cli is run without
    /// `--prefs`/`--no-prefs`.
    pub fn prefs_default(&self) -> bool {
        match self.get("prefs_default") {
            Some(Value::Bool(enabled)) => *enabled,
            Some(Value::String(text)) => !matches!(text.as_str(), "disabled" | "off"),
            _ => false,
        }
    }

    /// How long a saved URI stays valid, in minutes.
    pub fn prefs_uri_timeout(&self) -> Option<u64> {
        self.get("prefs_uri_timeout").and_then(Value::as_u64)
    }

    /// The habcache sidecar for a given site file.
    pub fn cache_path(&self, site_file: &Path) -> PathBuf {
        let template = self
            .string_list("site_cache_file_template")
            .first()
            .cloned()
            .unwrap_or_else(|| "{stem}.habcache".to_string());
        let stem = site_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = template.replace("{stem}", &stem);
        site_file.parent().unwrap_or_else(|| Path::new("")).join(name)
    }

    /// Named `platform -> leading directory` maps used to translate paths
    /// across platforms.
    pub fn platform_path_maps(&self) -> IndexMap<String, IndexMap<String, String>> {
        let mut ret = IndexMap::new();
        let Some(maps) = self.get("platform_path_maps").and_then(Value::as_object) else {
            return ret;
        };
        for (name, mapping) in maps {
            let Some(mapping) = mapping.as_object() else {
                continue;
            };
            let mut entry = IndexMap::new();
            for (platform, prefix) in mapping {
                if let Some(prefix) = prefix.as_str() {
                    entry.insert(platform.clone(), prefix.to_string());
                }
            }
            ret.insert(name.clone(), entry);
        }
        ret
    }

    /// Enabled entry points for a group. Null values disable a name.
    pub fn entry_points_for_group(&self, group: &str) -> Vec<(String, String)> {
        let Some(groups) = self.get("entry_points").and_then(Value::as_object) else {
            return Vec::new();
        };
        let Some(entries) = groups.get(group).and_then(Value::as_object) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|(name, value)| {
                value
                    .as_str()
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect()
    }

    /// Convert a path valid on this platform to one valid on `target`.
    pub fn platform_path_map(&self, value: &str, target: Platform) -> String {
        let current = self.platform.name();
        let normalized = value.replace('\\', "/");
        for mapping in self.platform_path_maps().values() {
            let (Some(src), Some(dest)) = (mapping.get(current), mapping.get(target.name()))
            else {
                continue;
            };
            let src_normalized = src.replace('\\', "/");
            if normalized == src_normalized {
                return dest.clone();
            }
            if let Some(tail) = normalized.strip_prefix(&format!("{src_normalized}/")) {
                return format!("{dest}/{tail}");
            }
        }
        value.to_string()
    }

    /// Replace a leading mapped directory with its reversible `{name}` sigil.
    pub fn path_to_sigil(&self, value: &str) -> String {
        let current = self.platform.name();
        let normalized = value.replace('\\', "/");
        for (name, mapping) in self.platform_path_maps() {
            let Some(src) = mapping.get(current) else {
                continue;
            };
            let src_normalized = src.replace('\\', "/");
            if normalized == src_normalized {
                return format!("{{{name}}}");
            }
            if let Some(tail) = normalized.strip_prefix(&format!("{src_normalized}/")) {
                return format!("{{{name}}}/{tail}");
            }
        }
        normalized
    }

    /// Expand a `{name}` sigil back into the path for `target`.
    pub fn path_from_sigil(&self, value: &str, target: Platform) -> String {
        let Some(rest) = value.strip_prefix('{') else {
            return value.to_string();
        };
        let Some((name, tail)) = rest.split_once('}') else {
            return value.to_string();
        };
        let maps = self.platform_path_maps();
        let Some(prefix) = maps.get(name).and_then(|m| m.get(target.name())) else {
            return value.to_string();
        };
        format!("{prefix}{tail}")
    }
}

/// Merge one file's operations into the running site data.
fn merge_data(data: &mut IndexMap<String, Value>, incoming: &Value, relative_root: &Path) {
    let root = crate::formatter::forward_slash(relative_root);

    if let Some(keys) = incoming.get("unset").and_then(Value::as_array) {
        for key in keys.iter().filter_map(Value::as_str) {
            data.shift_remove(key);
        }
    }

    if let Some(settings) = incoming.get("set").and_then(Value::as_object) {
        for (key, value) in settings {
            let value = format_setting(value, &root);
            match (data.get_mut(key), &value) {
                // Mapping settings merge per entry so the left-most file
                // wins for a given key without discarding the others.
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    deep_merge(existing, incoming);
                }
                _ => {
                    data.insert(key.clone(), value);
                }
            }
        }
    }

    if let Some(settings) = incoming.get("prepend").and_then(Value::as_object) {
        for (key, value) in settings {
            let value = format_setting(value, &root);
            let merged = join_values(value, data.get(key).cloned());
            data.insert(key.clone(), merged);
        }
    }

    if let Some(settings) = incoming.get("append").and_then(Value::as_object) {
        for (key, value) in settings {
            let value = format_setting(value, &root);
            let merged = join_values(data.get(key).cloned().unwrap_or(Value::Null), Some(value));
            data.insert(key.clone(), merged);
        }
    }
}

fn deep_merge(existing: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (existing.get_mut(key), value) {
            (Some(Value::Object(current)), Value::Object(nested)) => {
                deep_merge(current, nested);
            }
            _ => {
                existing.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Join `a` before `b`, flattening lists and merging maps with `b` winning.
fn join_values(a: Value, b: Option<Value>) -> Value {
    let Some(b) = b else {
        return normalize_list(a);
    };
    match (a, b) {
        (Value::Object(mut a), Value::Object(b)) => {
            for (k, v) in b {
                a.insert(k, v);
            }
            Value::Object(a)
        }
        (a, b) => {
            let mut list = as_list(a);
            list.extend(as_list(b));
            Value::Array(list)
        }
    }
}

fn normalize_list(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => Value::Array(as_list(other)),
    }
}

fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Expand `{relative_root}` markers in string settings.
fn format_setting(value: &Value, relative_root: &str) -> Value {
    match value {
        Value::String(text) => Value::String(text.replace("{relative_root}", relative_root)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| format_setting(item, relative_root))
                .collect(),
        ),
        Value::Object(map) => {
            let mut ret = Map::new();
            for (key, item) in map {
                ret.insert(key.clone(), format_setting(item, relative_root));
            }
            Value::Object(ret)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_site(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_left_most_value_wins() {
        let dir = TempDir::new().unwrap();
        let left = write_site(
            dir.path(),
            "site_left.json",
            r#"{"set": {"generic_value": false, "filename": ["site_left.json"]}}"#,
        );
        let right = write_site(
            dir.path(),
            "site_right.json",
            r#"{"set": {"generic_value": true, "filename": ["site_right.json"], "override": ["site_right.json"]}}"#,
        );

        let site = Site::load_for_platform(vec![left.clone(), right.clone()], Platform::Linux)
            .unwrap();
        assert_eq!(site.get("generic_value"), Some(&Value::Bool(false)));
        assert_eq!(
            site.get("filename").unwrap(),
            &serde_json::json!(["site_left.json"])
        );
        assert_eq!(
            site.get("override").unwrap(),
            &serde_json::json!(["site_right.json"])
        );

        // Reversed order flips the winner
        let site = Site::load_for_platform(vec![right, left], Platform::Linux).unwrap();
        assert_eq!(site.get("generic_value"), Some(&Value::Bool(true)));
        assert_eq!(
            site.get("filename").unwrap(),
            &serde_json::json!(["site_right.json"])
        );
    }

    #[test]
    fn test_prepend_append_nesting() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for name in ["left", "middle", "right"] {
            paths.push(write_site(
                dir.path(),
                &format!("site_{name}.json"),
                &format!(
                    r#"{{"prepend": {{"test_paths": ["{name}_prepend"]}},
                        "append": {{"test_paths": ["{name}_append"]}}}}"#
                ),
            ));
        }

        let site = Site::load_for_platform(paths, Platform::Linux).unwrap();
        assert_eq!(
            site.get("test_paths").unwrap(),
            &serde_json::json!([
                "left_prepend",
                "middle_prepend",
                "right_prepend",
                "right_append",
                "middle_append",
                "left_append"
            ])
        );
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = Site::load_for_platform(
            vec![PathBuf::from("/no/such/site.json")],
            Platform::Linux,
        )
        .unwrap_err();
        assert!(matches!(err, HabError::SiteLoad { .. }));
    }

    #[test]
    fn test_defaults() {
        let site = Site::load_for_platform(Vec::new(), Platform::Linux).unwrap();
        assert_eq!(site.ignored_distros(), vec!["release", "pre"]);
        assert_eq!(site.platforms().len(), 3);
        assert!(!site.prereleases());
        assert_eq!(
            site.cache_path(Path::new("/studio/site_main.json")),
            PathBuf::from("/studio/site_main.habcache")
        );
    }

    #[test]
    fn test_relative_root_expansion() {
        let dir = TempDir::new().unwrap();
        let path = write_site(
            dir.path(),
            "site.json",
            r#"{"set": {"config_paths": ["{relative_root}/configs"]}}"#,
        );
        let site = Site::load_for_platform(vec![path], Platform::Linux).unwrap();
        let root = crate::formatter::forward_slash(dir.path());
        assert_eq!(site.config_paths(), vec![format!("{root}/configs")]);
    }

    #[test]
    fn test_platform_path_maps_merge_and_sigils() {
        let dir = TempDir::new().unwrap();
        let left = write_site(
            dir.path(),
            "left.json",
            r#"{"set": {"platform_path_maps": {
                "network-share": {"windows": "\\\\example\\shared", "linux": "/mnt/shared"}}}}"#,
        );
        let right = write_site(
            dir.path(),
            "right.json",
            r#"{"set": {"platform_path_maps": {
                "network-share": {"windows": "x:\\shared", "linux": "/ignored"},
                "site-tools": {"windows": "c:\\tools", "linux": "/opt/tools"}}}}"#,
        );
        let site = Site::load_for_platform(vec![left, right], Platform::Linux).unwrap();

        let maps = site.platform_path_maps();
        // The left file wins for network-share, site-tools survives
        assert_eq!(maps["network-share"]["linux"], "/mnt/shared");
        assert_eq!(maps["site-tools"]["linux"], "/opt/tools");

        assert_eq!(
            site.platform_path_map("/mnt/shared/project", Platform::Windows),
            "\\\\example\\shared/project"
        );
        assert_eq!(
            site.path_to_sigil("/mnt/shared/project"),
            "{network-share}/project"
        );
        assert_eq!(
            site.path_from_sigil("{network-share}/project", Platform::Linux),
            "/mnt/shared/project"
        );
        assert_eq!(
            site.path_from_sigil("{network-share}/project", Platform::Windows),
            "\\\\example\\shared/project"
        );
    }

    #[test]
    fn test_entry_points_null_disables() {
        let dir = TempDir::new().unwrap();
        let left = write_site(
            dir.path(),
            "left.json",
            r#"{"set": {"entry_points": {"hab.launch": {"gui": null}}}}"#,
        );
        let right = write_site(
            dir.path(),
            "right.json",
            r#"{"set": {"entry_points": {"hab.launch": {"gui": "hab_gui", "cli": "hab_cli"}}}}"#,
        );
        let site = Site::load_for_platform(vec![left, right], Platform::Linux).unwrap();
        // Only hab.launch group keys from the right file survive the merge
        // per entry, and the left file's null disables gui.
        let eps = site.entry_points_for_group("hab.launch");
        assert_eq!(eps, vec![("cli".to_string(), "hab_cli".to_string())]);
    }

    #[test]
    fn test_add_paths_extension() {
        let dir = TempDir::new().unwrap();
        let extra = write_site(
            dir.path(),
            "extra.json",
            r#"{"set": {"added_value": true}}"#,
        );
        let main = write_site(
            dir.path(),
            "main.json",
            &format!(
                r#"{{"set": {{"entry_points": {{"hab.site.add_paths": {{"extra": "{}"}}}}}}}}"#,
                crate::formatter::forward_slash(&extra)
            ),
        );
        let site = Site::load_for_platform(vec![main], Platform::Linux).unwrap();
        assert_eq!(site.get("added_value"), Some(&Value::Bool(true)));
        assert_eq!(site.paths[0], extra);
    }
}
