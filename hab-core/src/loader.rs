// Discovery of config and distro json documents.
//
// Each site glob is resolved left to right. Config globs match `*.json`
// below the pattern, distro globs are augmented with `*/.hab.json` so each
// version directory carries its own document. Distro documents that fail to
// parse or version are dropped with a warning so one broken release can not
// take down the whole forest.

use std::path::{Path, PathBuf};

use pep440_rs::Version;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::CachedPaths;
use crate::errors::{HabError, Result};
use crate::forest::{ConfigForest, ConfigNode, DistroForest, DistroVersion};
use crate::site::Site;

/// Relative glob used to find config documents below a config path.
pub const CONFIG_GLOB: &str = "*.json";
/// Relative glob used to find distro documents below a distro path.
pub const DISTRO_GLOB: &str = "*/.hab.json";
/// Sidecar file a distro version can be stored in next to its document.
pub const VERSION_FILE: &str = ".hab_version.txt";

/// Resolve a glob pattern into a sorted list of files.
pub fn glob_files(pattern: &str, suffix: &str) -> Vec<PathBuf> {
    let full = format!("{}/{}", pattern.trim_end_matches('/'), suffix);
    match glob::glob(&full) {
        Ok(paths) => {
            let mut files: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
            files.sort();
            files
        }
        Err(err) => {
            warn!("Invalid glob pattern \"{full}\": {err}");
            Vec::new()
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|err| HabError::InvalidJson {
        filename: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// Build both forests for a site, preferring cached documents when given.
pub fn load_forests(
    site: &Site,
    cache: Option<&CachedPaths>,
) -> Result<(ConfigForest, DistroForest)> {
    let mut configs = ConfigForest::new();
    for pattern in site.config_paths() {
        let root = PathBuf::from(&pattern);
        for (path, data) in documents_for(pattern.as_str(), CONFIG_GLOB, cache, |c| {
            &c.config_paths
        }) {
            let data = match data {
                Some(data) => data,
                None => read_json(&path)?,
            };
            let node = ConfigNode::from_value(&path, &data)?;
            configs.insert(node, &root)?;
        }
    }

    let ignored = site.ignored_distros();
    let mut distros = DistroForest::new();
    for pattern in site.distro_paths() {
        let root = PathBuf::from(&pattern);
        for (path, entry) in cached_distros_for(pattern.as_str(), cache) {
            let dirname = path.parent().unwrap_or_else(|| Path::new(""));
            let dir_name = dirname
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if ignored.contains(&dir_name) {
                debug!(
                    "Skipping \"{}\", its dirname is in the ignored list",
                    path.display()
                );
                continue;
            }

            let (data, version) = match entry {
                Some((data, version)) => (data, Some(version)),
                None => match read_json(&path) {
                    Ok(data) => (data, None),
                    Err(err) => {
                        warn!("Dropping distro: {err}");
                        continue;
                    }
                },
            };

            let version = match version {
                Some(version) => version,
                None => match resolve_distro_version(&path, &data) {
                    Ok(version) => version,
                    Err(err) => {
                        warn!("Dropping distro: {err}");
                        continue;
                    }
                },
            };

            match DistroVersion::from_value(&path, version, &data) {
                Ok(distro) => distros.insert(distro, &root)?,
                Err(err) => warn!("Dropping distro: {err}"),
            }
        }
    }

    Ok((configs, distros))
}

/// Yield `(path, Some(data))` from the cache or `(path, None)` from a live
/// glob when the pattern is not cached.
fn documents_for<'a>(
    pattern: &str,
    suffix: &str,
    cache: Option<&'a CachedPaths>,
    select: impl Fn(&'a CachedPaths) -> &'a crate::cache::CachedGlobs,
) -> Vec<(PathBuf, Option<Value>)> {
    if let Some(globs) = cache.map(select) {
        // Cache keys are stored with forward slashes
        if let Some(files) = globs.get(&pattern.replace('\\', "/")) {
            debug!("Using cache for glob: {pattern}");
            return files
                .iter()
                .map(|(path, entry)| (path.clone(), Some(entry.data.clone())))
                .collect();
        }
    }
    debug!("Using a live scan for glob: {pattern}");
    glob_files(pattern, suffix)
        .into_iter()
        .map(|path| (path, None))
        .collect()
}

fn cached_distros_for(
    pattern: &str,
    cache: Option<&CachedPaths>,
) -> Vec<(PathBuf, Option<(Value, Version)>)> {
    if let Some(globs) = cache.map(|c| &c.distro_paths) {
        if let Some(files) = globs.get(&pattern.replace('\\', "/")) {
            debug!("Using cache for glob: {pattern}");
            return files
                .iter()
                .filter_map(|(path, entry)| {
                    let version: Version = entry.version.as_ref()?.parse().ok()?;
                    Some((path.clone(), Some((entry.data.clone(), version))))
                })
                .collect();
        }
    }
    debug!("Using a live scan for glob: {pattern}");
    glob_files(pattern, DISTRO_GLOB)
        .into_iter()
        .map(|path| (path, None))
        .collect()
}

/// Determine the version of a distro document.
///
/// The version is the first of: the `version` field, the contents of the
/// `.hab_version.txt` sidecar, the parent directory name, and finally a tag
/// from a version control checkout of the parent directory.
pub fn resolve_distro_version(path: &Path, data: &Value) -> Result<Version> {
    let invalid = |reason: String| HabError::InvalidVersion {
        filename: path.to_path_buf(),
        reason,
    };

    if let Some(version) = data.get("version").and_then(Value::as_str) {
        return version
            .parse()
            .map_err(|err| invalid(format!("invalid version field: {err}")));
    }

    let dirname = path.parent().unwrap_or_else(|| Path::new(""));
    let sidecar = dirname.join(VERSION_FILE);
    if sidecar.is_file() {
        let text = std::fs::read_to_string(&sidecar)?;
        return text
            .trim()
            .parse()
            .map_err(|err| invalid(format!("invalid {VERSION_FILE}: {err}")));
    }

    if let Some(name) = dirname.file_name().and_then(|n| n.to_str()) {
        if let Ok(version) = name.parse() {
            return Ok(version);
        }
    }

    if let Some(version) = scm_version(dirname) {
        return Ok(version);
    }

    Err(invalid(
        "The version is defined in one of several ways, checked in this order: \
         1. The version property of .hab.json. \
         2. A .hab_version.txt file next to .hab.json. \
         3. .hab.json's parent directory name. \
         4. A version control tag of the checkout."
            .to_string(),
    ))
}

/// Derive a version from the most recent tag of an enclosing checkout.
fn scm_version(dirname: &Path) -> Option<Version> {
    let repo = git2::Repository::discover(dirname).ok()?;
    let describe = repo
        .describe(git2::DescribeOptions::new().describe_tags())
        .ok()?;
    let text = describe.format(None).ok()?;
    // Tags like v1.2.3-4-gdeadbee keep only the release portion
    let tag = text.split('-').next()?.trim_start_matches('v');
    let version = tag.parse().ok()?;
    debug!("Using scm version {version} for {}", dirname.display());
    Some(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write_json(path: &Path, data: &Value) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string_pretty(data).unwrap()).unwrap();
    }

    fn site_for(dir: &Path) -> Site {
        let root = crate::formatter::forward_slash(dir);
        let path = dir.join("site.json");
        fs::write(
            &path,
            format!(
                r#"{{"set": {{
                    "config_paths": ["{root}/configs"],
                    "distro_paths": ["{root}/distros/*"]}}}}"#
            ),
        )
        .unwrap();
        Site::load_for_platform(vec![path], Platform::Linux).unwrap()
    }

    #[test]
    fn test_load_forests() {
        let dir = TempDir::new().unwrap();
        write_json(
            &dir.path().join("configs/project_a.json"),
            &json!({"name": "project_a", "context": [], "distros": ["the_dcc"]}),
        );
        write_json(
            &dir.path().join("distros/the_dcc/1.2/.hab.json"),
            &json!({"name": "the_dcc"}),
        );
        write_json(
            &dir.path().join("distros/the_dcc/1.3/.hab.json"),
            &json!({"name": "the_dcc", "version": "1.3"}),
        );

        let site = site_for(dir.path());
        let (configs, distros) = load_forests(&site, None).unwrap();

        assert!(configs.get("project_a").is_some());
        let dcc = distros.get("the_dcc").unwrap();
        assert_eq!(dcc.versions.len(), 2);
        let req = "the_dcc".parse().unwrap();
        assert_eq!(dcc.latest_version(&req, false).unwrap().name(), "the_dcc==1.3");
    }

    #[test]
    fn test_invalid_distro_is_dropped() {
        let dir = TempDir::new().unwrap();
        write_json(
            &dir.path().join("distros/the_dcc/1.2/.hab.json"),
            &json!({"name": "the_dcc"}),
        );
        write_json(
            &dir.path().join("distros/broken/not_a_version/.hab.json"),
            &json!({"name": "broken"}),
        );

        let site = site_for(dir.path());
        let (_, distros) = load_forests(&site, None).unwrap();
        assert!(distros.get("the_dcc").is_some());
        assert!(distros.get("broken").is_none());
    }

    #[test]
    fn test_ignored_distros_are_skipped() {
        let dir = TempDir::new().unwrap();
        // "release" is in the default ignored_distros list
        write_json(
            &dir.path().join("distros/the_dcc/release/.hab.json"),
            &json!({"name": "the_dcc", "version": "1.0"}),
        );
        let site = site_for(dir.path());
        let (_, distros) = load_forests(&site, None).unwrap();
        assert!(distros.get("the_dcc").is_none());
    }

    #[test]
    fn test_version_sources() {
        let dir = TempDir::new().unwrap();

        // Explicit field beats the directory name
        let path = dir.path().join("distros/a/2.0/.hab.json");
        write_json(&path, &json!({"name": "a", "version": "2.1"}));
        assert_eq!(
            resolve_distro_version(&path, &read_json(&path).unwrap())
                .unwrap()
                .to_string(),
            "2.1"
        );

        // The sidecar file beats the directory name
        let path = dir.path().join("distros/b/dev/.hab.json");
        write_json(&path, &json!({"name": "b"}));
        fs::write(path.parent().unwrap().join(VERSION_FILE), "1.7\n").unwrap();
        assert_eq!(
            resolve_distro_version(&path, &read_json(&path).unwrap())
                .unwrap()
                .to_string(),
            "1.7"
        );

        // Directory name fallback
        let path = dir.path().join("distros/c/2020.0/.hab.json");
        write_json(&path, &json!({"name": "c"}));
        assert_eq!(
            resolve_distro_version(&path, &read_json(&path).unwrap())
                .unwrap()
                .to_string(),
            "2020.0"
        );

        // Nothing works: an error naming the checked sources
        let path = dir.path().join("distros/d/trunk/.hab.json");
        write_json(&path, &json!({"name": "d"}));
        let err = resolve_distro_version(&path, &read_json(&path).unwrap()).unwrap_err();
        assert!(matches!(err, HabError::InvalidVersion { .. }));
    }

    #[test]
    fn test_duplicate_across_globs_first_wins() {
        let dir = TempDir::new().unwrap();
        let root = crate::formatter::forward_slash(dir.path());
        write_json(
            &dir.path().join("dev/configs/project_a.json"),
            &json!({"name": "project_a", "context": [], "inherits": false}),
        );
        write_json(
            &dir.path().join("shared/configs/project_a.json"),
            &json!({"name": "project_a", "context": [], "inherits": true}),
        );

        let path = dir.path().join("site.json");
        fs::write(
            &path,
            format!(
                r#"{{"set": {{"config_paths": [
                    "{root}/dev/configs", "{root}/shared/configs"]}}}}"#
            ),
        )
        .unwrap();
        let site = Site::load_for_platform(vec![path], Platform::Linux).unwrap();

        let (configs, _) = load_forests(&site, None).unwrap();
        let node = configs.get("project_a").unwrap();
        assert_eq!(node.inherits, Some(false));
        assert_eq!(node.root_paths.len(), 2);
    }
}
