// The two forests hab resolves against: configs keyed by URI and distros
// keyed by (name, version).
//
// Config nodes form trees by URI. The parent relationship is a URI
// truncation, not a pointer, so all nodes live in one map keyed by the full
// URI string. Ancestors that were never defined by a json file are filled in
// with placeholder nodes so walk-up always terminates at a real entry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use pep440_rs::Version;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::aliases::{AliasMod, AliasSpec};
use crate::envops::EnvironmentConfig;
use crate::errors::{HabError, Result};
use crate::formatter::check_variable_names;
use crate::requirements::Requirement;

/// Separator between URI segments.
pub const URI_SEP: char = '/';

/// The reserved root name of the fallback tree.
pub const DEFAULT_TREE: &str = "default";

/// An `optional_distros` entry: a description and whether guis enable it
/// by default. The resolver itself treats these as inert data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionalDistro {
    pub description: String,
    pub default_on: bool,
}

impl<'de> Deserialize<'de> for OptionalDistro {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let value = Value::deserialize(deserializer)?;
        let items = value
            .as_array()
            .ok_or_else(|| D::Error::custom("optional_distros entries must be lists"))?;
        let description = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::custom("optional_distros entries need a description"))?
            .to_string();
        let default_on = items.get(1).and_then(Value::as_bool).unwrap_or(false);
        Ok(OptionalDistro {
            description,
            default_on,
        })
    }
}

/// Per-URI control over which distro names may resolve to empty stubs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StubRules {
    #[serde(default)]
    pub set: Vec<String>,
    #[serde(default)]
    pub unset: Vec<String>,
}

/// Raw json shape shared by config and distro documents. Unknown keys are
/// collected so plugin payloads survive composition.
#[derive(Debug, Deserialize)]
struct RawNode {
    name: String,
    #[serde(default)]
    context: Option<Vec<String>>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    inherits: Option<bool>,
    #[serde(default)]
    distros: Option<Vec<String>>,
    #[serde(default)]
    environment: Option<EnvironmentConfig>,
    #[serde(default)]
    aliases: Option<IndexMap<String, Vec<(String, AliasSpec)>>>,
    #[serde(default)]
    alias_mods: Option<IndexMap<String, AliasMod>>,
    #[serde(default)]
    optional_distros: Option<IndexMap<String, OptionalDistro>>,
    #[serde(default)]
    stub_distros: Option<StubRules>,
    #[serde(default)]
    min_verbosity: Option<BTreeMap<String, i32>>,
    #[serde(default)]
    variables: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn parse_raw(filename: &Path, data: &Value) -> Result<RawNode> {
    serde_json::from_value(data.clone()).map_err(|err| HabError::InvalidJson {
        filename: filename.to_path_buf(),
        reason: err.to_string(),
    })
}

/// A config document, or a placeholder standing in for an undefined parent.
#[derive(Debug, Clone)]
pub struct ConfigNode {
    pub name: String,
    pub context: Vec<String>,
    pub uri: String,
    pub filename: Option<PathBuf>,
    pub placeholder: bool,
    pub inherits: Option<bool>,
    pub distros: Option<IndexMap<String, Requirement>>,
    pub environment: Option<EnvironmentConfig>,
    pub alias_mods: Option<IndexMap<String, AliasMod>>,
    pub optional_distros: Option<IndexMap<String, OptionalDistro>>,
    pub stub_distros: Option<StubRules>,
    pub min_verbosity: Option<BTreeMap<String, i32>>,
    pub variables: Option<BTreeMap<String, String>>,
    pub payload: Map<String, Value>,
    /// Glob roots this URI was seen in, drives the duplicate policy.
    pub root_paths: BTreeSet<PathBuf>,
    /// Load-time requirement or variable errors are stored here and only
    /// surfaced when this URI is actually resolved.
    pub error: Option<String>,
}

impl ConfigNode {
    pub fn from_value(filename: &Path, data: &Value) -> Result<Self> {
        let raw = parse_raw(filename, data)?;
        let context = raw.context.unwrap_or_default();
        let uri = join_uri(&context, &raw.name);

        let mut error = None;
        let distros = match raw.distros {
            Some(reqs) => match Requirement::simplify(reqs.iter()) {
                Ok(map) => Some(map),
                Err(err) => {
                    error = Some(err.to_string());
                    None
                }
            },
            None => None,
        };
        if error.is_none() {
            if let Some(variables) = &raw.variables {
                if let Err(err) = check_variable_names(variables.keys()) {
                    error = Some(err.to_string());
                }
            }
        }

        Ok(ConfigNode {
            name: raw.name,
            context,
            uri,
            filename: Some(filename.to_path_buf()),
            placeholder: false,
            inherits: raw.inherits,
            distros,
            environment: raw.environment,
            alias_mods: raw.alias_mods,
            optional_distros: raw.optional_distros,
            stub_distros: raw.stub_distros,
            min_verbosity: raw.min_verbosity,
            variables: raw.variables,
            payload: raw.extra,
            root_paths: BTreeSet::new(),
            error,
        })
    }

    fn placeholder(uri: &str) -> Self {
        let mut segments: Vec<String> = uri.split(URI_SEP).map(str::to_string).collect();
        let name = segments.pop().unwrap_or_default();
        ConfigNode {
            name,
            context: segments,
            uri: uri.to_string(),
            filename: None,
            placeholder: true,
            inherits: None,
            distros: None,
            environment: None,
            alias_mods: None,
            optional_distros: None,
            stub_distros: None,
            min_verbosity: None,
            variables: None,
            payload: Map::new(),
            root_paths: BTreeSet::new(),
            error: None,
        }
    }

    /// Directory of the json file, used for `{relative_root}`.
    pub fn dirname(&self) -> PathBuf {
        self.filename
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Whether dumps should show this node at the given verbosity.
    pub fn visible(&self, verbosity: Option<i32>, target: &str) -> bool {
        let Some(verbosity) = verbosity else {
            return true;
        };
        let Some(table) = &self.min_verbosity else {
            return true;
        };
        let min = table
            .get(target)
            .or_else(|| table.get("global"))
            .copied()
            .unwrap_or(0);
        min <= verbosity
    }
}

/// The tree of config nodes, including the `default` fallback tree.
#[derive(Debug, Default)]
pub struct ConfigForest {
    nodes: BTreeMap<String, ConfigNode>,
}

impl ConfigForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<&ConfigNode> {
        self.nodes.get(uri)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a loaded node, filling in placeholder ancestors.
    ///
    /// A URI redefined inside the same glob root is a fatal duplicate.
    /// Across distinct roots the first definition wins with a warning, which
    /// lets developer checkouts shadow shared configs.
    pub fn insert(&mut self, mut node: ConfigNode, root_path: &Path) -> Result<()> {
        node.root_paths.insert(root_path.to_path_buf());
        let uri = node.uri.clone();

        if let Some(existing) = self.nodes.get_mut(&uri) {
            if !existing.placeholder {
                if existing.root_paths.contains(root_path) {
                    return Err(HabError::DuplicateJson {
                        uri,
                        filename: node.filename.unwrap_or_default(),
                    });
                }
                warn!(
                    "Can not add \"{}\", the context \"{uri}\" is already set",
                    node.filename
                        .as_deref()
                        .unwrap_or_else(|| Path::new(""))
                        .display()
                );
                existing.root_paths.insert(root_path.to_path_buf());
                return Ok(());
            }
            node.root_paths.extend(existing.root_paths.iter().cloned());
            debug!("Replacing placeholder: {uri}");
        }

        // Create any missing ancestors so walk-up always finds a node
        let segments: Vec<&str> = uri.split(URI_SEP).collect();
        for depth in 1..segments.len() {
            let ancestor = segments[..depth].join("/");
            if !self.nodes.contains_key(&ancestor) {
                debug!("Created placeholder: {ancestor}");
                self.nodes
                    .insert(ancestor.clone(), ConfigNode::placeholder(&ancestor));
            }
        }

        debug!("Add to forest: {uri}");
        self.nodes.insert(uri, node);
        Ok(())
    }

    /// The parent of a URI by truncation, `None` for roots.
    pub fn parent(&self, uri: &str) -> Option<&ConfigNode> {
        let (parent, _) = uri.rsplit_once(URI_SEP)?;
        self.nodes.get(parent)
    }

    /// Direct children of a URI in name order.
    pub fn children(&self, uri: &str) -> impl Iterator<Item = &ConfigNode> {
        let prefix = format!("{uri}/");
        let prefix_len = prefix.len();
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter(move |(key, _)| !key[prefix_len..].contains(URI_SEP))
            .map(|(_, node)| node)
    }

    /// Every non-placeholder URI in natural sort order.
    pub fn all_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .nodes
            .values()
            .filter(|node| !node.placeholder)
            .map(|node| node.uri.clone())
            .collect();
        natural_sort(&mut uris);
        uris
    }

    /// Map a requested URI onto the most specific config available.
    ///
    /// Tries an exact match, then walks up dropping trailing segments. When
    /// the root name is unknown the `default` tree is searched instead,
    /// descending while a child name is the longest prefix of the matching
    /// URI segment.
    pub fn closest(&self, uri: &str) -> Option<&ConfigNode> {
        let uri = uri.trim_matches(URI_SEP);
        let segments: Vec<&str> = uri.split(URI_SEP).filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return None;
        }

        if self.nodes.contains_key(segments[0]) {
            for depth in (1..=segments.len()).rev() {
                let candidate = segments[..depth].join("/");
                if let Some(node) = self.nodes.get(&candidate) {
                    return Some(node);
                }
            }
        }

        self.closest_default(&segments)
    }

    /// Walk the `default` tree for a URI's segments, descending while a
    /// child name is the longest prefix of the corresponding segment.
    ///
    /// The first segment is the project name, it never matches `default`
    /// children and is skipped.
    pub fn closest_default(&self, segments: &[&str]) -> Option<&ConfigNode> {
        let mut current = self.nodes.get(DEFAULT_TREE)?;
        for segment in segments.iter().skip(1) {
            let matched = self
                .children(&current.uri)
                .filter(|child| segment.starts_with(child.name.as_str()))
                .max_by_key(|child| child.name.len());
            match matched {
                Some(child) => current = child,
                None => break,
            }
        }
        Some(current)
    }
}

/// One version of a distro.
#[derive(Debug, Clone)]
pub struct DistroVersion {
    pub distro_name: String,
    pub version: Version,
    pub filename: PathBuf,
    pub distros: IndexMap<String, Requirement>,
    pub environment: Option<EnvironmentConfig>,
    pub aliases: IndexMap<String, Vec<(String, AliasSpec)>>,
    pub alias_mods: Option<IndexMap<String, AliasMod>>,
    pub variables: Option<BTreeMap<String, String>>,
    pub payload: Map<String, Value>,
    pub root_paths: BTreeSet<PathBuf>,
}

impl DistroVersion {
    pub fn from_value(filename: &Path, version: Version, data: &Value) -> Result<Self> {
        let raw = parse_raw(filename, data)?;
        // The loader already folded the inline version field into `version`
        let _ = raw.version;
        let distros = match raw.distros {
            Some(reqs) => Requirement::simplify(reqs.iter())?,
            None => IndexMap::new(),
        };
        if let Some(variables) = &raw.variables {
            check_variable_names(variables.keys())?;
        }
        Ok(DistroVersion {
            distro_name: raw.name,
            version,
            filename: filename.to_path_buf(),
            distros,
            environment: raw.environment,
            aliases: raw.aliases.unwrap_or_default(),
            alias_mods: raw.alias_mods,
            variables: raw.variables,
            payload: raw.extra,
            root_paths: BTreeSet::new(),
        })
    }

    /// The `name==version` display name.
    pub fn name(&self) -> String {
        format!("{}=={}", self.distro_name, self.version)
    }

    pub fn dirname(&self) -> PathBuf {
        self.filename
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

impl fmt::Display for DistroVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.distro_name, self.version)
    }
}

/// All discovered versions of one distro name.
#[derive(Debug, Default)]
pub struct Distro {
    pub name: String,
    pub versions: BTreeMap<Version, DistroVersion>,
}

impl Distro {
    /// The newest version satisfying the requirement.
    ///
    /// Pre-release versions are only considered when the site enables them
    /// or the requirement explicitly names one.
    pub fn latest_version(&self, req: &Requirement, prereleases: bool) -> Result<&DistroVersion> {
        let allow_prerelease = prereleases || req.mentions_prerelease();
        let found = self
            .versions
            .iter()
            .rev()
            .filter(|(version, _)| allow_prerelease || !version.any_prerelease())
            .find(|(version, _)| req.contains(version));
        match found {
            Some((_, version)) => Ok(version),
            None => {
                let known = self
                    .versions
                    .keys()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(HabError::InvalidRequirement(format!(
                    "Unable to find a valid version for \"{req}\" in versions [{known}]"
                )))
            }
        }
    }
}

/// The flat map of distros discovered from a site.
#[derive(Debug, Default)]
pub struct DistroForest {
    distros: BTreeMap<String, Distro>,
}

impl DistroForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Distro> {
        self.distros.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.distros.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.distros.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Distro)> {
        self.distros.iter()
    }

    /// Add a loaded distro version, mirroring the config duplicate policy.
    pub fn insert(&mut self, mut version: DistroVersion, root_path: &Path) -> Result<()> {
        version.root_paths.insert(root_path.to_path_buf());
        let distro = self
            .distros
            .entry(version.distro_name.clone())
            .or_insert_with(|| Distro {
                name: version.distro_name.clone(),
                versions: BTreeMap::new(),
            });

        if let Some(existing) = distro.versions.get_mut(&version.version) {
            if existing.root_paths.contains(root_path) {
                return Err(HabError::DuplicateJson {
                    uri: version.name(),
                    filename: version.filename,
                });
            }
            warn!(
                "Can not add \"{}\", the distro \"{}\" is already set",
                version.filename.display(),
                version.name()
            );
            existing.root_paths.insert(root_path.to_path_buf());
            return Ok(());
        }

        debug!("Add to forest: {}", version.name());
        distro.versions.insert(version.version.clone(), version);
        Ok(())
    }
}

pub fn join_uri(context: &[String], name: &str) -> String {
    let mut parts: Vec<&str> = context.iter().map(String::as_str).collect();
    parts.push(name);
    parts.join("/")
}

/// Sort strings treating contiguous digits as single numbers, ignoring case.
pub fn natural_sort(items: &mut [String]) {
    items.sort_by_key(|item| natural_key(item));
}

fn natural_key(text: &str) -> Vec<(u8, u64, String)> {
    let mut key = Vec::new();
    let mut chunk = String::new();
    let mut digits = false;

    for ch in text.chars() {
        if ch.is_ascii_digit() != digits && !chunk.is_empty() {
            key.push(chunk_key(&chunk, digits));
            chunk.clear();
        }
        digits = ch.is_ascii_digit();
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        key.push(chunk_key(&chunk, digits));
    }
    key
}

fn chunk_key(chunk: &str, digits: bool) -> (u8, u64, String) {
    if digits {
        (0, chunk.parse().unwrap_or(u64::MAX), String::new())
    } else {
        (1, 0, chunk.to_lowercase())
    }
}
