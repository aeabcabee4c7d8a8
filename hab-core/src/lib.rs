// hab-core - the hab resolution engine
// Resolves slash separated URIs into fully specified environments: the
// environment variables, aliases and versioned distros a task needs.

pub mod aliases;
pub mod cache;
pub mod envops;
pub mod errors;
pub mod flat;
pub mod forest;
pub mod formatter;
pub mod freeze;
pub mod loader;
pub mod platform;
pub mod prefs;
pub mod requirements;
pub mod resolver;
pub mod script;
pub mod site;
pub mod solver;

// Re-export the public types
pub use aliases::{Alias, AliasMod, AliasSpec, ComplexAlias};
pub use envops::{EnvBuilder, EnvOps, EnvValue, EnvironmentConfig, RESERVED_ENV_VARS};
pub use errors::{HabError, Result};
pub use flat::{FlatConfig, ResolveContext};
pub use forest::{
    ConfigForest, ConfigNode, Distro, DistroForest, DistroVersion, OptionalDistro, StubRules,
};
pub use formatter::{format_value, FormatContext, RESERVED_VARIABLE_NAMES};
pub use platform::{Platform, Shell};
pub use prefs::UserPrefs;
pub use requirements::{Marker, MarkerEnv, Requirement};
pub use resolver::{paths_from_env, Resolver, HAB_PATHS_ENV};
pub use script::{iter_aliases, iter_env_ops, AliasScript, EnvOp};
pub use site::Site;
pub use solver::{Selection, Solution, Solver};
