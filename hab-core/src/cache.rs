// The habcache sidecar.
//
// `hab cache <site.json>` persists the results of globbing and parsing the
// config and distro documents a site file points at, including each distro's
// resolved version. Readers validate the recorded mtimes of the site file
// and every globbed document and silently fall back to a live scan when
// anything drifted. Writes go through a temp file in the same directory and
// an atomic rename, so concurrent readers never observe a partial cache.
//
// Paths inside the cache are stored through `platform_path_maps` sigils so
// one cache file can be shared by hosts of different platforms.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{HabError, Result};
use crate::loader::{glob_files, resolve_distro_version, CONFIG_GLOB, DISTRO_GLOB};
use crate::site::Site;

/// Newest habcache format this build can read.
pub const SUPPORTED_VERSION: u32 = 1;

/// Environment variable that disables cache reads, used by the test suite.
pub const UNCACHED_ONLY_ENV: &str = "HAB_TEST_UNCACHED_ONLY";

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    site_mtimes: IndexMap<String, f64>,
    #[serde(default)]
    config_paths: IndexMap<String, IndexMap<String, FileEntry>>,
    #[serde(default)]
    distro_paths: IndexMap<String, IndexMap<String, FileEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    mtime: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    data: Value,
}

/// One cached document ready for the loader.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    /// Resolved distro version, absent for configs.
    pub version: Option<String>,
    pub data: Value,
}

/// Cached documents per glob pattern, keyed by forward-slash paths.
pub type CachedGlobs = IndexMap<String, IndexMap<PathBuf, CachedEntry>>;

/// The merged cache contents for a site.
#[derive(Debug, Default)]
pub struct CachedPaths {
    pub config_paths: CachedGlobs,
    pub distro_paths: CachedGlobs,
}

fn mtime_of(path: &Path) -> Result<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(secs.as_secs_f64())
}

/// Load and validate the caches of every site file, right to left so the
/// left-most cache wins for duplicated glob patterns.
///
/// Returns `None` when no cache exists or any cache is stale, in which case
/// the caller performs a live scan.
pub fn load(site: &Site) -> Option<CachedPaths> {
    if std::env::var_os(UNCACHED_ONLY_ENV).is_some() {
        debug!("{UNCACHED_ONLY_ENV} is set, ignoring habcache files");
        return None;
    }

    let mut ret = CachedPaths::default();
    let mut found = false;

    for site_file in site.paths.iter().rev() {
        let cache_path = site.cache_path(site_file);
        if !cache_path.is_file() {
            continue;
        }
        debug!("Site cache loading: {}", cache_path.display());
        match load_one(site, site_file, &cache_path, &mut ret) {
            Ok(loaded) => found |= loaded,
            Err(err) => {
                warn!("Falling back to a live scan: {err}");
                return None;
            }
        }
    }

    found.then_some(ret)
}

fn load_one(
    site: &Site,
    site_file: &Path,
    cache_path: &Path,
    ret: &mut CachedPaths,
) -> Result<bool> {
    let text = std::fs::read_to_string(cache_path)?;
    let cache: CacheFile = serde_json::from_str(&text).map_err(|err| HabError::CacheStale {
        site_file: site_file.to_path_buf(),
        reason: err.to_string(),
    })?;

    if cache.version > SUPPORTED_VERSION {
        warn!(
            "File is using an unsupported habcache version {}. Only versions <= {} are \
             supported, ignoring {}",
            cache.version,
            SUPPORTED_VERSION,
            cache_path.display()
        );
        return Ok(false);
    }

    let stale = |reason: String| HabError::CacheStale {
        site_file: site_file.to_path_buf(),
        reason,
    };

    for (sigil, recorded) in &cache.site_mtimes {
        let path = site.path_from_sigil(sigil, site.platform);
        let current = mtime_of(Path::new(&path))?;
        if current != *recorded {
            return Err(stale(format!("site file changed: {path}")));
        }
    }

    for (globs, suffix, target) in [
        (&cache.config_paths, CONFIG_GLOB, &mut ret.config_paths),
        (&cache.distro_paths, DISTRO_GLOB, &mut ret.distro_paths),
    ] {
        for (pattern_sigil, files) in globs {
            let pattern = site.path_from_sigil(pattern_sigil, site.platform);
            let mut expanded: IndexMap<PathBuf, CachedEntry> = IndexMap::new();
            for (path_sigil, entry) in files {
                let path = PathBuf::from(site.path_from_sigil(path_sigil, site.platform));
                let current = mtime_of(&path)
                    .map_err(|_| stale(format!("file removed: {}", path.display())))?;
                if current != entry.mtime {
                    return Err(stale(format!("file changed: {}", path.display())));
                }
                expanded.insert(
                    path,
                    CachedEntry {
                        version: entry.version.clone(),
                        data: entry.data.clone(),
                    },
                );
            }

            // A file added since the cache was written also invalidates it
            let live = glob_files(&pattern, suffix);
            if live.len() != expanded.len() || live.iter().any(|p| !expanded.contains_key(p)) {
                return Err(stale(format!("glob results changed: {pattern}")));
            }

            target.insert(pattern, expanded);
        }
    }

    Ok(true)
}

/// Generate the cache contents for a single site file.
pub fn generate(site: &Site, site_file: &Path) -> Result<Value> {
    // The cache only covers paths declared by this site file
    let temp_site = Site::load_for_platform(vec![site_file.to_path_buf()], site.platform)?;

    let mut cache = CacheFile {
        version: SUPPORTED_VERSION,
        site_mtimes: IndexMap::new(),
        config_paths: IndexMap::new(),
        distro_paths: IndexMap::new(),
    };
    cache.site_mtimes.insert(
        site.path_to_sigil(&crate::formatter::forward_slash(site_file)),
        mtime_of(site_file)?,
    );

    for pattern in temp_site.config_paths() {
        let mut files = IndexMap::new();
        for path in glob_files(&pattern, CONFIG_GLOB) {
            let text = std::fs::read_to_string(&path)?;
            let data: Value = serde_json::from_str(&text).map_err(|err| HabError::InvalidJson {
                filename: path.clone(),
                reason: err.to_string(),
            })?;
            files.insert(
                site.path_to_sigil(&crate::formatter::forward_slash(&path)),
                FileEntry {
                    mtime: mtime_of(&path)?,
                    version: None,
                    data,
                },
            );
        }
        cache.config_paths.insert(site.path_to_sigil(&pattern), files);
    }

    let ignored = temp_site.ignored_distros();
    for pattern in temp_site.distro_paths() {
        let mut files = IndexMap::new();
        for path in glob_files(&pattern, DISTRO_GLOB) {
            let dir_name = path
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if ignored.contains(&dir_name) {
                debug!("Skipping ignored distro: {}", path.display());
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            let data: Value = match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(err) => {
                    warn!("Skipping \"{}\": {err}", path.display());
                    continue;
                }
            };
            let version = match resolve_distro_version(&path, &data) {
                Ok(version) => version,
                Err(err) => {
                    debug!("Skipping: {err}");
                    continue;
                }
            };
            files.insert(
                site.path_to_sigil(&crate::formatter::forward_slash(&path)),
                FileEntry {
                    mtime: mtime_of(&path)?,
                    version: Some(version.to_string()),
                    data,
                },
            );
        }
        cache.distro_paths.insert(site.path_to_sigil(&pattern), files);
    }

    Ok(serde_json::to_value(&cache).expect("cache contents are valid json"))
}

/// Write the cache for a site file next to it, atomically.
pub fn save(site: &Site, site_file: &Path) -> Result<PathBuf> {
    let cache_path = site.cache_path(site_file);
    let contents = generate(site, site_file)?;

    let parent = cache_path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut temp, &contents).map_err(|err| {
        HabError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    })?;
    temp.persist(&cache_path)
        .map_err(|err| HabError::Io(err.error))?;
    debug!("Saved habcache: {}", cache_path.display());
    Ok(cache_path)
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

    fn build_site(dir: &Path) -> Site {
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

    fn seed(dir: &Path) {
        write_json(
            &dir.join("configs/project_a.json"),
            &json!({"name": "project_a", "context": []}),
        );
        write_json(
            &dir.join("distros/the_dcc/1.2/.hab.json"),
            &json!({"name": "the_dcc"}),
        );
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let site = build_site(dir.path());

        let cache_path = save(&site, &site.paths[0]).unwrap();
        assert!(cache_path.is_file());

        let cached = load(&site).expect("cache should be valid");
        assert_eq!(cached.config_paths.len(), 1);
        let files = cached.config_paths.values().next().unwrap();
        assert_eq!(files.len(), 1);

        let distro_files = cached.distro_paths.values().next().unwrap();
        let entry = distro_files.values().next().unwrap();
        assert_eq!(entry.version.as_deref(), Some("1.2"));

        // The cached forests load without touching the document files
        let (configs, distros) = crate::loader::load_forests(&site, Some(&cached)).unwrap();
        assert!(configs.get("project_a").is_some());
        assert!(distros.get("the_dcc").is_some());
    }

    #[test]
    fn test_stale_on_new_file() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let site = build_site(dir.path());
        save(&site, &site.paths[0]).unwrap();

        // Adding a config after caching invalidates it
        write_json(
            &dir.path().join("configs/project_b.json"),
            &json!({"name": "project_b", "context": []}),
        );
        assert!(load(&site).is_none());
    }

    #[test]
    fn test_no_cache_file() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let site = build_site(dir.path());
        assert!(load(&site).is_none());
    }
}
