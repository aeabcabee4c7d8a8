// Reduction of a matched config node into its final, fully composed form.
//
// The reducer fills unset fields from ancestors while `inherits` is true,
// continuing into the `default` tree once the user tree root is passed.
// The solver then turns the reduced requirements into concrete versions,
// and the environment and alias composers run once per supported platform
// so the result can be frozen and rehydrated anywhere.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::aliases::{Alias, AliasComposer, AliasMod};
use crate::envops::{EnvBuilder, EnvironmentConfig};
use crate::errors::{HabError, Result};
use crate::forest::{ConfigForest, ConfigNode, DistroForest, OptionalDistro, StubRules};
use crate::formatter::{forward_slash, FormatContext};
use crate::platform::Platform;
use crate::requirements::{MarkerEnv, Requirement};
use crate::site::Site;
use crate::solver::{Selection, Solver};

/// Everything a reduction needs from the resolver.
pub struct ResolveContext<'a> {
    pub site: &'a Site,
    pub configs: &'a ConfigForest,
    pub distros: &'a DistroForest,
    pub marker_env: &'a MarkerEnv,
    pub prereleases: bool,
    pub forced: &'a IndexMap<String, Requirement>,
}

/// The inheritable fields collected by the reducer.
#[derive(Debug, Default)]
struct Reduced {
    inherits: Option<bool>,
    distros: Option<IndexMap<String, Requirement>>,
    environment: Option<EnvironmentConfig>,
    alias_mods: Option<IndexMap<String, AliasMod>>,
    optional_distros: Option<IndexMap<String, OptionalDistro>>,
    stub_distros: Option<StubRules>,
    min_verbosity: Option<BTreeMap<String, i32>>,
    variables: Option<BTreeMap<String, String>>,
    /// URIs that contributed a value, in visit order.
    sources: Vec<String>,
}

impl Reduced {
    fn missing_values(&self) -> bool {
        self.inherits.is_none()
            || self.distros.is_none()
            || self.environment.is_none()
            || self.alias_mods.is_none()
            || self.optional_distros.is_none()
            || self.stub_distros.is_none()
            || self.min_verbosity.is_none()
            || self.variables.is_none()
    }

    /// Copy any still-unset field that `node` defines.
    fn adopt(&mut self, node: &ConfigNode) {
        let mut contributed = false;
        macro_rules! take {
            ($field:ident) => {
                if self.$field.is_none() && node.$field.is_some() {
                    self.$field = node.$field.clone();
                    contributed = true;
                }
            };
        }
        take!(inherits);
        take!(distros);
        take!(environment);
        take!(alias_mods);
        take!(optional_distros);
        take!(stub_distros);
        take!(min_verbosity);
        take!(variables);
        if contributed {
            self.sources.push(node.uri.clone());
        }
    }
}

/// Walk the inheritance chain for `node`, filling unset fields.
fn reduce(forest: &ConfigForest, node: &ConfigNode) -> Reduced {
    let mut reduced = Reduced::default();
    let mut visited: HashSet<String> = HashSet::new();
    collect(forest, node, &mut reduced, &mut visited, false);
    reduced
}

fn collect(
    forest: &ConfigForest,
    node: &ConfigNode,
    reduced: &mut Reduced,
    visited: &mut HashSet<String>,
    in_default: bool,
) {
    // The default tree may itself use inherits, never revisit a node
    if !visited.insert(format!("{in_default}:{}", node.uri)) {
        return;
    }
    debug!("Loading node: {} inherits: {:?}", node.uri, node.inherits);
    reduced.adopt(node);

    if !node.inherits.unwrap_or(false) || !reduced.missing_values() {
        return;
    }
    if let Some(parent) = forest.parent(&node.uri) {
        collect(forest, parent, reduced, visited, in_default);
    } else if !in_default {
        let segments: Vec<&str> = node.uri.split('/').collect();
        if let Some(default_node) = forest.closest_default(&segments) {
            collect(forest, default_node, reduced, visited, true);
        }
    }
}

/// A reduced, solved and composed configuration, ready to render or freeze.
#[derive(Debug, Clone)]
pub struct FlatConfig {
    /// The URI that was asked for.
    pub uri_requested: String,
    /// The URI of the config node that answered.
    pub uri_matched: String,
    pub name: String,
    pub context: Vec<String>,
    pub filename: Option<PathBuf>,
    pub inherits: bool,
    pub distros: IndexMap<String, Requirement>,
    pub optional_distros: IndexMap<String, OptionalDistro>,
    pub stub_distros: StubRules,
    pub min_verbosity: BTreeMap<String, i32>,
    pub variables: BTreeMap<String, String>,
    /// Selected distro versions in solve order.
    pub versions: Vec<Selection>,
    /// Composed environment per platform name.
    pub environments: IndexMap<String, IndexMap<String, Vec<String>>>,
    /// Composed aliases per platform name.
    pub aliases: IndexMap<String, IndexMap<String, Alias>>,
    /// URIs and distros that contributed values, for diagnostics.
    pub inherits_applied_from: Vec<String>,
}

impl FlatConfig {
    /// Reduce, solve and compose the given config node.
    pub fn from_node(
        node: &ConfigNode,
        uri_requested: &str,
        ctx: &ResolveContext<'_>,
    ) -> Result<Self> {
        if let Some(error) = &node.error {
            return Err(HabError::InvalidRequirement(error.clone()));
        }

        let reduced = reduce(ctx.configs, node);
        let variables = reduced.variables.clone().unwrap_or_default();
        let stub_distros = reduced.stub_distros.clone().unwrap_or_default();

        // Per-URI stub rules: names in `set` may resolve to empty stubs,
        // `unset` removes names added by an inherited rule.
        let mut stub_names: HashSet<String> = stub_distros.set.iter().cloned().collect();
        for name in &stub_distros.unset {
            stub_names.remove(name);
        }

        let requirements = reduced.distros.clone().unwrap_or_default();
        let mut solver = Solver::new(requirements.clone(), ctx.distros, ctx.marker_env)
            .with_forced(ctx.forced.clone())
            .with_stub_names(stub_names)
            .with_prereleases(ctx.prereleases);
        let solution = solver.resolve()?;

        let mut flat = FlatConfig {
            uri_requested: uri_requested.to_string(),
            uri_matched: node.uri.clone(),
            name: node.name.clone(),
            context: node.context.clone(),
            filename: node.filename.clone(),
            inherits: reduced.inherits.unwrap_or(false),
            distros: requirements,
            optional_distros: reduced.optional_distros.clone().unwrap_or_default(),
            stub_distros,
            min_verbosity: reduced.min_verbosity.clone().unwrap_or_default(),
            variables,
            versions: solution.selections,
            environments: IndexMap::new(),
            aliases: IndexMap::new(),
            inherits_applied_from: reduced.sources.clone(),
        };

        for platform in ctx.site.platforms() {
            let (environment, aliases) = flat.compose_platform(node, &reduced, platform, ctx)?;
            flat.environments.insert(platform.name().to_string(), environment);
            flat.aliases.insert(platform.name().to_string(), aliases);
        }
        Ok(flat)
    }

    fn compose_platform(
        &self,
        node: &ConfigNode,
        reduced: &Reduced,
        platform: Platform,
        ctx: &ResolveContext<'_>,
    ) -> Result<(IndexMap<String, Vec<String>>, IndexMap<String, Alias>)> {
        let mapper = |text: &str| ctx.site.platform_path_map(text, platform);
        let mut builder = EnvBuilder::new(platform).with_path_mapper(&mapper);

        let config_ctx = FormatContext::new(forward_slash(&node.dirname()))
            .with_variables(self.variables.clone());
        if let Some(environment) = &reduced.environment {
            builder.apply_config(environment, &config_ctx)?;
        }

        // Distro contributions in solve order, stubs contribute nothing
        let mut composer = AliasComposer::new(platform);
        let mut distro_mods: Vec<(IndexMap<String, AliasMod>, FormatContext)> = Vec::new();
        for selection in self.versions.iter().filter(|s| !s.stub) {
            let version = ctx
                .distros
                .get(&selection.name)
                .and_then(|distro| distro.versions.get(&selection.version))
                .ok_or_else(|| {
                    HabError::InvalidRequirement(format!(
                        "Unable to find a distro for requirement: {}",
                        selection.name
                    ))
                })?;
            let distro_ctx = FormatContext::new(forward_slash(&version.dirname()))
                .with_variables(self.variables.clone());

            if let Some(environment) = &version.environment {
                builder.apply_config(environment, &distro_ctx)?;
            }
            if let Some(aliases) = version.aliases.get(platform.name()) {
                composer.add_distro_aliases(
                    aliases,
                    (selection.name.clone(), selection.version.to_string()),
                    &distro_ctx,
                );
            }
            if let Some(mods) = &version.alias_mods {
                distro_mods.push((mods.clone(), distro_ctx));
            }
        }

        // Mods apply distro first, config last so the config wins
        for (mods, distro_ctx) in &distro_mods {
            composer.add_mods(mods, distro_ctx);
        }
        if let Some(mods) = &reduced.alias_mods {
            composer.add_mods(mods, &config_ctx);
        }

        builder.set_owned("HAB_URI", vec![self.uri_requested.clone()]);
        let aliases = composer.finish(&builder)?;
        Ok((builder.finish(), aliases))
    }

    /// The composed environment for one platform.
    pub fn environment(&self, platform: Platform) -> Option<&IndexMap<String, Vec<String>>> {
        self.environments.get(platform.name())
    }

    /// The composed aliases for one platform.
    pub fn aliases_for(&self, platform: Platform) -> Option<&IndexMap<String, Alias>> {
        self.aliases.get(platform.name())
    }

    /// Selected versions as `name==version` strings in solve order.
    pub fn distro_versions(&self) -> Vec<String> {
        self.versions.iter().map(Selection::name_version).collect()
    }

    /// Build the freeze payload covering every supported platform.
    ///
    /// `HAB_URI` is stripped from each platform environment, it always
    /// equals `uri` and would only bloat the encoded string. Empty optional
    /// sections are omitted entirely.
    pub fn freeze(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("name".to_string(), json!(self.name));
        payload.insert("context".to_string(), json!(self.context));
        payload.insert("uri".to_string(), json!(self.uri_requested));

        let versions: Vec<Value> = self
            .versions
            .iter()
            .map(|s| json!([s.name, s.version.to_string()]))
            .collect();
        if !versions.is_empty() {
            payload.insert("versions".to_string(), Value::Array(versions));
        }

        let mut environment = Map::new();
        for (platform, vars) in &self.environments {
            let mut out = Map::new();
            for (name, values) in vars {
                if name == "HAB_URI" {
                    continue;
                }
                out.insert(name.clone(), json!(values));
            }
            environment.insert(platform.clone(), Value::Object(out));
        }
        payload.insert("environment".to_string(), Value::Object(environment));

        let mut aliases = Map::new();
        for (platform, table) in &self.aliases {
            if table.is_empty() {
                continue;
            }
            let mut out = Map::new();
            for (name, alias) in table {
                out.insert(
                    name.clone(),
                    serde_json::to_value(alias).expect("aliases are valid json"),
                );
            }
            aliases.insert(platform.clone(), Value::Object(out));
        }
        if !aliases.is_empty() {
            payload.insert("aliases".to_string(), Value::Object(aliases));
        }

        Value::Object(payload)
    }

    /// Rehydrate a decoded freeze payload.
    pub fn from_freeze(payload: &Value) -> Result<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| HabError::FreezeDecode("The freeze is not an object".to_string()))?;
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let uri = object
            .get("uri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let context: Vec<String> = object
            .get("context")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut versions = Vec::new();
        if let Some(items) = object.get("versions").and_then(Value::as_array) {
            for item in items {
                let pair = item.as_array().ok_or_else(|| {
                    HabError::FreezeDecode("versions entries must be pairs".to_string())
                })?;
                let (Some(name), Some(version)) = (
                    pair.first().and_then(Value::as_str),
                    pair.get(1).and_then(Value::as_str),
                ) else {
                    return Err(HabError::FreezeDecode(
                        "versions entries must be pairs of strings".to_string(),
                    ));
                };
                versions.push(Selection {
                    name: name.to_string(),
                    version: version.parse().map_err(|err| {
                        HabError::FreezeDecode(format!("Invalid frozen version: {err}"))
                    })?,
                    stub: false,
                });
            }
        }

        let mut environments: IndexMap<String, IndexMap<String, Vec<String>>> = IndexMap::new();
        if let Some(platforms) = object.get("environment").and_then(Value::as_object) {
            for (platform, vars) in platforms {
                let mut out = IndexMap::new();
                if let Some(vars) = vars.as_object() {
                    for (name, values) in vars {
                        let values: Vec<String> = match values {
                            Value::String(value) => vec![value.clone()],
                            Value::Array(items) => items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect(),
                            _ => Vec::new(),
                        };
                        out.insert(name.clone(), values);
                    }
                }
                // HAB_URI is stripped on freeze, restore it
                out.insert("HAB_URI".to_string(), vec![uri.clone()]);
                environments.insert(platform.clone(), out);
            }
        }

        let mut aliases: IndexMap<String, IndexMap<String, Alias>> = IndexMap::new();
        if let Some(platforms) = object.get("aliases").and_then(Value::as_object) {
            for (platform, table) in platforms {
                let mut out = IndexMap::new();
                if let Some(table) = table.as_object() {
                    for (alias_name, alias) in table {
                        let alias: Alias =
                            serde_json::from_value(alias.clone()).map_err(|err| {
                                HabError::FreezeDecode(format!("Invalid frozen alias: {err}"))
                            })?;
                        out.insert(alias_name.clone(), alias);
                    }
                }
                aliases.insert(platform.clone(), out);
            }
        }

        Ok(FlatConfig {
            uri_requested: uri.clone(),
            uri_matched: uri,
            name,
            context,
            filename: None,
            inherits: false,
            distros: IndexMap::new(),
            optional_distros: IndexMap::new(),
            stub_distros: StubRules::default(),
            min_verbosity: BTreeMap::new(),
            variables: BTreeMap::new(),
            versions,
            environments,
            aliases,
            inherits_applied_from: Vec::new(),
        })
    }

    /// A human readable report of this configuration.
    pub fn dump(&self, platform: Platform, verbosity: i32) -> String {
        let mut rows: Vec<String> = Vec::new();
        rows.push(format!("name:  {}", self.name));
        rows.push(format!("uri:  {}", self.uri_requested));
        if self.uri_matched != self.uri_requested {
            rows.push(format!("uri matched:  {}", self.uri_matched));
        }

        if verbosity >= 1 && !self.versions.is_empty() {
            let mut versions = self.distro_versions();
            crate::forest::natural_sort(&mut versions);
            rows.push(format!("versions:  {}", versions.join(", ")));
        }

        if let Some(aliases) = self.aliases_for(platform) {
            let names: Vec<&str> = aliases
                .iter()
                .filter(|(_, alias)| alias.visible(Some(verbosity), "hab"))
                .map(|(name, _)| name.as_str())
                .collect();
            if !names.is_empty() {
                rows.push(format!("aliases:  {}", names.join(", ")));
            }
        }

        if verbosity >= 2 {
            if let Some(environment) = self.environment(platform) {
                let sep = platform.list_sep();
                for (index, (name, values)) in environment.iter().enumerate() {
                    let label = if index == 0 { "environment:  " } else { "              " };
                    rows.push(format!("{label}{name}:  {}", values.join(sep)));
                }
            }
            if verbosity >= 3 && !self.inherits_applied_from.is_empty() {
                rows.push(format!(
                    "inherited from:  {}",
                    self.inherits_applied_from.join(", ")
                ));
            }
        }

        let width = rows.iter().map(String::len).max().unwrap_or(0).clamp(20, 80);
        let line = "-".repeat(width);
        format!(
            "Dump of FlatConfig('{}')\n{line}\n{}\n{line}",
            self.uri_matched,
            rows.join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{ConfigNode, DistroVersion};
    use serde_json::json;
    use std::path::Path;

    fn add_config(forest: &mut ConfigForest, data: Value) {
        let node = ConfigNode::from_value(Path::new("/configs/test.json"), &data).unwrap();
        forest.insert(node, Path::new("/configs")).unwrap();
    }

    fn add_distro(forest: &mut DistroForest, version: &str, data: Value) {
        let name = data["name"].as_str().unwrap().to_string();
        let version = DistroVersion::from_value(
            Path::new(&format!("/distros/{name}/{version}/.hab.json")),
            version.parse().unwrap(),
            &data,
        )
        .unwrap();
        forest.insert(version, Path::new("/distros")).unwrap();
    }

    struct Fixture {
        site: Site,
        configs: ConfigForest,
        distros: DistroForest,
        marker_env: MarkerEnv,
        forced: IndexMap<String, Requirement>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut configs = ConfigForest::new();
            add_config(
                &mut configs,
                json!({"name": "not_set", "context": [], "distros": ["maya2020"]}),
            );
            add_config(
                &mut configs,
                json!({
                    "name": "child",
                    "context": ["not_set"],
                    "inherits": true,
                    "environment": {"set": {"TEST": "case"}}
                }),
            );
            add_config(
                &mut configs,
                json!({"name": "default", "context": [],
                       "environment": {"set": {"STUDIO": "default"}}}),
            );

            let mut distros = DistroForest::new();
            add_distro(
                &mut distros,
                "2020.0",
                json!({"name": "maya2020", "aliases": {
                    "linux": [["maya", "/usr/autodesk/maya2020/bin/maya"]],
                    "windows": [["maya", "C:/Program Files/Autodesk/Maya2020/bin/maya.exe"]]
                }}),
            );
            add_distro(
                &mut distros,
                "2020.1",
                json!({"name": "maya2020",
                    "environment": {"append": {"MAYA_MODULE_PATH": "{relative_root}/modules"}},
                    "aliases": {
                    "linux": [["maya", "/usr/autodesk/maya2020.1/bin/maya"]],
                    "windows": [["maya", "C:/Program Files/Autodesk/Maya2020.1/bin/maya.exe"]]
                }}),
            );

            Fixture {
                site: Site::load_for_platform(Vec::new(), Platform::Linux).unwrap(),
                configs,
                distros,
                marker_env: MarkerEnv::for_platform(Platform::Linux),
                forced: IndexMap::new(),
            }
        }

        fn ctx(&self) -> ResolveContext<'_> {
            ResolveContext {
                site: &self.site,
                configs: &self.configs,
                distros: &self.distros,
                marker_env: &self.marker_env,
                prereleases: false,
                forced: &self.forced,
            }
        }

        fn resolve(&self, uri: &str) -> Result<FlatConfig> {
            let node = self.configs.closest(uri).unwrap();
            FlatConfig::from_node(node, uri, &self.ctx())
        }
    }

    #[test]
    fn test_reduce_inherits_distros() {
        let fixture = Fixture::new();
        let flat = fixture.resolve("not_set/child").unwrap();

        assert_eq!(flat.uri_matched, "not_set/child");
        assert_eq!(flat.name, "child");
        assert!(flat.inherits);
        // distros inherited from the parent
        assert_eq!(flat.distro_versions(), vec!["maya2020==2020.1"]);
        // The environment defined on the child survives
        let env = flat.environment(Platform::Linux).unwrap();
        assert_eq!(env.get("TEST").unwrap(), &vec!["case".to_string()]);
        // HAB_URI is always present
        assert_eq!(
            env.get("HAB_URI").unwrap(),
            &vec!["not_set/child".to_string()]
        );
        assert_eq!(
            flat.inherits_applied_from,
            vec!["not_set/child".to_string(), "not_set".to_string()]
        );
    }

    #[test]
    fn test_distro_environment_and_aliases() {
        let fixture = Fixture::new();
        let flat = fixture.resolve("not_set/child").unwrap();

        let env = flat.environment(Platform::Linux).unwrap();
        assert_eq!(
            env.get("MAYA_MODULE_PATH").unwrap(),
            &vec!["/distros/maya2020/2020.1/modules".to_string()]
        );

        let aliases = flat.aliases_for(Platform::Linux).unwrap();
        let maya = aliases.get("maya").unwrap();
        assert_eq!(
            maya.distro,
            Some(("maya2020".to_string(), "2020.1".to_string()))
        );

        // Both platforms were composed even though we run on linux
        assert!(flat.aliases_for(Platform::Windows).is_some());
    }

    #[test]
    fn test_uri_requested_vs_matched() {
        let fixture = Fixture::new();
        let flat = fixture.resolve("not_set/child/test").unwrap();
        assert_eq!(flat.uri_requested, "not_set/child/test");
        assert_eq!(flat.uri_matched, "not_set/child");
        let env = flat.environment(Platform::Linux).unwrap();
        assert_eq!(
            env.get("HAB_URI").unwrap(),
            &vec!["not_set/child/test".to_string()]
        );
    }

    #[test]
    fn test_freeze_round_trip() {
        let fixture = Fixture::new();
        let flat = fixture.resolve("not_set/child").unwrap();

        let payload = flat.freeze();
        // HAB_URI is stripped from the payload
        assert!(payload["environment"]["linux"].get("HAB_URI").is_none());

        let restored = FlatConfig::from_freeze(&payload).unwrap();
        assert_eq!(restored.uri_requested, flat.uri_requested);
        assert_eq!(restored.distro_versions(), flat.distro_versions());
        // And restored on decode
        assert_eq!(
            restored.environment(Platform::Linux).unwrap().get("HAB_URI"),
            flat.environment(Platform::Linux).unwrap().get("HAB_URI")
        );
        assert_eq!(
            restored.environment(Platform::Windows).unwrap().get("MAYA_MODULE_PATH"),
            flat.environment(Platform::Windows).unwrap().get("MAYA_MODULE_PATH")
        );
        assert_eq!(restored.aliases, flat.aliases);
    }

    #[test]
    fn test_error_nodes_surface_on_resolve() {
        let mut fixture = Fixture::new();
        add_config(
            &mut fixture.configs,
            json!({"name": "broken", "context": [], "distros": ["the_dcc=="]}),
        );
        let err = fixture.resolve("broken").unwrap_err();
        assert!(matches!(err, HabError::InvalidRequirement(_)));
    }

    #[test]
    fn test_default_tree_reduction() {
        let fixture = Fixture::new();
        let flat = fixture.resolve("project_z/Sc001").unwrap();
        assert_eq!(flat.uri_matched, "default");
        let env = flat.environment(Platform::Linux).unwrap();
        assert_eq!(env.get("STUDIO").unwrap(), &vec!["default".to_string()]);
    }

    #[test]
    fn test_stub_distros() {
        let mut fixture = Fixture::new();
        add_config(
            &mut fixture.configs,
            json!({
                "name": "stubbed",
                "context": [],
                "distros": ["maya2020", "not_installed"],
                "stub_distros": {"set": ["not_installed"]}
            }),
        );
        let flat = fixture.resolve("stubbed").unwrap();
        let stubs: Vec<_> = flat.versions.iter().filter(|s| s.stub).collect();
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].name, "not_installed");
        // The stub contributes no aliases or environment
        let aliases = flat.aliases_for(Platform::Linux).unwrap();
        assert!(aliases.values().all(|a| a.distro.as_ref().unwrap().0 == "maya2020"));
    }
}
