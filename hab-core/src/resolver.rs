// The resolver ties the pieces together: it owns the site, loads the two
// forests (through the habcache when one is valid), maps URIs onto config
// nodes and reduces them into flat configs.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::cache;
use crate::errors::{HabError, Result};
use crate::flat::{FlatConfig, ResolveContext};
use crate::forest::{natural_sort, ConfigForest, ConfigNode, DistroForest};
use crate::loader;
use crate::requirements::{MarkerEnv, Requirement};
use crate::site::Site;

/// Environment variable holding the default list of site files.
pub const HAB_PATHS_ENV: &str = "HAB_PATHS";

/// Site file paths from the `HAB_PATHS` environment variable.
pub fn paths_from_env() -> Vec<PathBuf> {
    let Ok(value) = std::env::var(HAB_PATHS_ENV) else {
        return Vec::new();
    };
    let sep = if cfg!(windows) { ';' } else { ':' };
    value
        .split(sep)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Resolves hab environments for one site.
pub struct Resolver {
    pub site: Site,
    pub prereleases: bool,
    /// Additional requirements respected even when no config names them.
    pub forced: IndexMap<String, Requirement>,
    marker_env: MarkerEnv,
    forests: Option<(ConfigForest, DistroForest)>,
}

impl Resolver {
    pub fn new(site: Site) -> Self {
        let prereleases = site.prereleases();
        let marker_env = MarkerEnv::for_platform(site.platform);
        Resolver {
            site,
            prereleases,
            forced: IndexMap::new(),
            marker_env,
            forests: None,
        }
    }

    /// Add forced requirements, the `-r` flag and enabled optional distros.
    pub fn with_forced_requirements<I, S>(mut self, requirements: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let forced = Requirement::simplify(requirements)?;
        self.forced.extend(forced);
        Ok(self)
    }

    /// Discard loaded forests so the next use re-scans the site.
    pub fn clear_caches(&mut self) {
        debug!("Resolver cache cleared.");
        self.forests = None;
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.forests.is_none() {
            let cached = cache::load(&self.site);
            let forests = loader::load_forests(&self.site, cached.as_ref())?;
            self.forests = Some(forests);
        }
        Ok(())
    }

    pub fn configs(&mut self) -> Result<&ConfigForest> {
        self.ensure_loaded()?;
        Ok(&self.forests.as_ref().expect("loaded above").0)
    }

    pub fn distros(&mut self) -> Result<&DistroForest> {
        self.ensure_loaded()?;
        Ok(&self.forests.as_ref().expect("loaded above").1)
    }

    /// The most specific config node for a URI.
    pub fn closest_config(&mut self, uri: &str) -> Result<&ConfigNode> {
        self.ensure_loaded()?;
        let (configs, _) = self.forests.as_ref().expect("loaded above");
        configs
            .closest(uri)
            .ok_or_else(|| HabError::UriUnresolved(uri.to_string()))
    }

    /// Find the closest configuration and reduce it into its final form.
    pub fn resolve(&mut self, uri: &str) -> Result<FlatConfig> {
        self.ensure_loaded()?;
        self.resolve_loaded(uri)
    }

    fn resolve_loaded(&self, uri: &str) -> Result<FlatConfig> {
        let (configs, distros) = self
            .forests
            .as_ref()
            .expect("resolve_loaded requires loaded forests");
        let node = configs
            .closest(uri)
            .ok_or_else(|| HabError::UriUnresolved(uri.to_string()))?;
        debug!("Closest config for {uri}: {}", node.uri);
        let ctx = ResolveContext {
            site: &self.site,
            configs,
            distros,
            marker_env: &self.marker_env,
            prereleases: self.prereleases,
            forced: &self.forced,
        };
        FlatConfig::from_node(node, uri, &ctx)
    }

    /// The freeze payload of every non-placeholder URI.
    ///
    /// URIs that fail to resolve report their error text instead of
    /// failing the whole sweep.
    pub fn freeze_configs(&mut self) -> Result<IndexMap<String, Value>> {
        self.ensure_loaded()?;
        let uris = {
            let (configs, _) = self.forests.as_ref().expect("loaded above");
            configs.all_uris()
        };

        let mut ret = IndexMap::new();
        for uri in uris {
            let value = match self.resolve_loaded(&uri) {
                Ok(flat) => flat.freeze(),
                Err(error) => Value::String(format!("Error resolving {uri}: {error}")),
            };
            ret.insert(uri, value);
        }
        Ok(ret)
    }

    /// A text listing of the config tree, filtered by min_verbosity.
    pub fn dump_forest(&mut self, verbosity: i32, target: &str) -> Result<String> {
        self.ensure_loaded()?;
        let (configs, _) = self.forests.as_ref().expect("loaded above");

        let mut rows = Vec::new();
        let mut roots: Vec<String> = configs
            .all_uris()
            .into_iter()
            .map(|uri| match uri.split_once('/') {
                Some((root, _)) => root.to_string(),
                None => uri,
            })
            .collect();
        roots.dedup();
        natural_sort(&mut roots);
        roots.dedup();

        for root in roots {
            rows.push(root.clone());
            let mut uris: Vec<String> = configs
                .all_uris()
                .into_iter()
                .filter(|uri| *uri == root || uri.starts_with(&format!("{root}/")))
                .collect();
            natural_sort(&mut uris);
            for uri in uris {
                let node = configs.get(&uri).expect("all_uris only lists known nodes");
                if !node.visible(Some(verbosity), target) {
                    continue;
                }
                let depth = uri.matches('/').count() + 1;
                rows.push(format!("{}{uri}", "  ".repeat(depth)));
            }
        }
        Ok(rows.join("\n"))
    }

    /// A text listing of every distro and its versions.
    pub fn dump_distros(&mut self) -> Result<String> {
        self.ensure_loaded()?;
        let (_, distros) = self.forests.as_ref().expect("loaded above");
        let mut rows = Vec::new();
        for (name, distro) in distros.iter() {
            rows.push(name.clone());
            let mut versions: Vec<String> = distro
                .versions
                .values()
                .map(|version| version.name())
                .collect();
            natural_sort(&mut versions);
            for version in versions {
                rows.push(format!("  {version}"));
            }
        }
        Ok(rows.join("\n"))
    }
}
