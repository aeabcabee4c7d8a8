// Recursive requirement solving.
//
// The solver walks the requirement queue breadth-first: root requirements in
// the order given, each selected distro's own requirements enqueued in
// declaration order. Specifiers accumulate per name, and the newest version
// satisfying the union is committed. When a later requirement invalidates a
// committed version, the version is excluded with an implicit `!=` specifier
// and the whole solve restarts, bounded by a redirect limit.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;

use indexmap::IndexMap;
use pep440_rs::Version;
use tracing::{debug, info, warn};

use crate::errors::{HabError, Result};
use crate::forest::DistroForest;
use crate::requirements::{MarkerEnv, Requirement};

/// One committed distro choice, in solve order.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub name: String,
    pub version: Version,
    /// Stub selections satisfy requirements but contribute nothing.
    pub stub: bool,
}

impl Selection {
    pub fn name_version(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

/// The final solve result.
#[derive(Debug, Default)]
pub struct Solution {
    /// Merged requirement per distro name.
    pub requirements: IndexMap<String, Requirement>,
    /// Committed versions in deterministic solve order.
    pub selections: Vec<Selection>,
}

enum Interrupt {
    /// A committed version became invalid, re-run the solve.
    Redirect,
    Fail(HabError),
}

pub struct Solver<'a> {
    requirements: IndexMap<String, Requirement>,
    distros: &'a DistroForest,
    marker_env: &'a MarkerEnv,
    forced: IndexMap<String, Requirement>,
    stub_names: HashSet<String>,
    prereleases: bool,
    /// Versions excluded by redirects as `name -> !=version` requirements.
    pub invalid: IndexMap<String, Requirement>,
    pub max_redirects: usize,
    pub redirects_required: usize,
}

impl<'a> Solver<'a> {
    pub fn new(
        requirements: IndexMap<String, Requirement>,
        distros: &'a DistroForest,
        marker_env: &'a MarkerEnv,
    ) -> Self {
        Solver {
            requirements,
            distros,
            marker_env,
            forced: IndexMap::new(),
            stub_names: HashSet::new(),
            prereleases: false,
            invalid: IndexMap::new(),
            max_redirects: 2,
            redirects_required: 0,
        }
    }

    /// Force these requirements over whatever configs request. This is how
    /// `-r` and enabled `optional_distros` reach the solver.
    pub fn with_forced(mut self, forced: IndexMap<String, Requirement>) -> Self {
        self.forced = forced;
        self
    }

    /// Distro names that may resolve to an empty stub when missing.
    pub fn with_stub_names(mut self, stub_names: HashSet<String>) -> Self {
        self.stub_names = stub_names;
        self
    }

    pub fn with_prereleases(mut self, prereleases: bool) -> Self {
        self.prereleases = prereleases;
        self
    }

    /// Solve into a final set of requirements and versions.
    pub fn resolve(&mut self) -> Result<Solution> {
        self.redirects_required = 0;
        info!("Resolving requirements: {:?}", self.requirements.keys());
        loop {
            debug!(
                "Attempt {} at resolving requirements",
                self.redirects_required + 1
            );
            match self.attempt() {
                Ok(solution) => return Ok(solution),
                Err(Interrupt::Redirect) => {
                    self.redirects_required += 1;
                    if self.redirects_required >= self.max_redirects {
                        return Err(HabError::MaxRedirects(self.max_redirects));
                    }
                }
                Err(Interrupt::Fail(err)) => return Err(err),
            }
        }
    }

    fn attempt(&mut self) -> std::result::Result<Solution, Interrupt> {
        // Forced requirements replace matching roots and are always solved
        let mut roots = self.requirements.clone();
        for (name, req) in &self.forced {
            roots.insert(name.clone(), req.clone());
        }

        let mut queue: VecDeque<Requirement> = roots.into_values().collect();
        let mut resolved: IndexMap<String, Requirement> = IndexMap::new();
        let mut selections: Vec<Selection> = Vec::new();
        let mut selected: IndexMap<String, (Version, bool)> = IndexMap::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut reported: HashSet<String> = HashSet::new();

        while let Some(req) = queue.pop_front() {
            let mut req = req;
            if let Some(marker) = &req.marker {
                if !marker.evaluate(self.marker_env) {
                    warn!("Requirement ignored due to marker: {req}");
                    continue;
                }
            }

            if let Some(forced) = self.forced.get(&req.name) {
                if reported.insert(req.name.clone()) {
                    // Forcing can configure an environment incorrectly, make
                    // sure it is always visible.
                    warn!("Forced Requirement: {forced}");
                }
                req = forced.clone();
            }

            // Accumulate specifiers for this name across the whole solve
            let merged = match resolved.get_mut(&req.name) {
                Some(existing) => {
                    existing.merge_specifiers(&req);
                    existing.clone()
                }
                None => {
                    resolved.insert(req.name.clone(), req.clone());
                    req.clone()
                }
            };

            // Excluded versions only constrain picking, not the output
            let mut pick_req = merged.clone();
            if let Some(invalid) = self.invalid.get(&req.name) {
                debug!("Applying invalid specifiers: {invalid}");
                pick_req.merge_specifiers(invalid);
            }

            if let Some((version, stub)) = selected.get(&req.name) {
                if *stub || pick_req.contains(version) {
                    continue;
                }
                // The committed version no longer satisfies the union,
                // exclude it and start over.
                let exclude: Requirement = format!("{}!={}", req.name, version)
                    .parse()
                    .map_err(Interrupt::Fail)?;
                debug!("Removing invalid version {}=={}", req.name, version);
                match self.invalid.get_mut(&req.name) {
                    Some(existing) => existing.merge_specifiers(&exclude),
                    None => {
                        self.invalid.insert(req.name.clone(), exclude);
                    }
                }
                return Err(Interrupt::Redirect);
            }

            let version = match self.pick_version(&pick_req)? {
                Picked::Version(version) => version,
                Picked::Stub => {
                    info!("Using a stub distro for: {pick_req}");
                    let version = Version::from_str("0").expect("static version");
                    selected.insert(req.name.clone(), (version.clone(), true));
                    selections.push(Selection {
                        name: req.name.clone(),
                        version,
                        stub: true,
                    });
                    continue;
                }
            };

            debug!("Found version: {}=={version}", req.name);
            selected.insert(req.name.clone(), (version.clone(), false));
            selections.push(Selection {
                name: req.name.clone(),
                version: version.clone(),
                stub: false,
            });

            if processed.insert(format!("{}=={version}", req.name)) {
                let distro = self
                    .distros
                    .get(&req.name)
                    .expect("picked versions come from the forest");
                let picked = &distro.versions[&version];
                for dependency in picked.distros.values() {
                    queue.push_back(dependency.clone());
                }
            }
        }

        Ok(Solution {
            requirements: resolved,
            selections,
        })
    }

    fn pick_version(&self, req: &Requirement) -> std::result::Result<Picked, Interrupt> {
        match self.distros.get(&req.name) {
            Some(distro) => match distro.latest_version(req, self.prereleases) {
                Ok(version) => Ok(Picked::Version(version.version.clone())),
                Err(err) => {
                    if self.stub_names.contains(&req.name) {
                        Ok(Picked::Stub)
                    } else {
                        Err(Interrupt::Fail(err))
                    }
                }
            },
            None => {
                if self.stub_names.contains(&req.name) {
                    Ok(Picked::Stub)
                } else {
                    Err(Interrupt::Fail(HabError::InvalidRequirement(format!(
                        "Unable to find a distro for requirement: {req}"
                    ))))
                }
            }
        }
    }
}

enum Picked {
    Version(Version),
    Stub,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::DistroVersion;
    use crate::platform::Platform;
    use serde_json::json;
    use std::path::Path;

    fn add(forest: &mut DistroForest, name: &str, version: &str, distros: &[&str]) {
        let data = json!({"name": name, "distros": distros});
        let version = DistroVersion::from_value(
            Path::new(&format!("/distros/{name}/{version}/.hab.json")),
            version.parse().unwrap(),
            &data,
        )
        .unwrap();
        forest.insert(version, Path::new("/distros")).unwrap();
    }

    fn fixture() -> DistroForest {
        let mut forest = DistroForest::new();
        let dcc_deps = [
            "the_dcc_plugin_a>=1.0",
            "the_dcc_plugin_b>=0.9",
            "the_dcc_plugin_e<2.0",
        ];
        add(&mut forest, "the_dcc", "1.0", &[]);
        add(&mut forest, "the_dcc", "1.1", &dcc_deps);
        add(&mut forest, "the_dcc", "1.2", &dcc_deps);
        add(&mut forest, "the_dcc_plugin_a", "1.0", &[]);
        add(&mut forest, "the_dcc_plugin_a", "1.1", &["the_dcc_plugin_d"]);
        add(&mut forest, "the_dcc_plugin_b", "0.9", &["the_dcc<1.2"]);
        add(&mut forest, "the_dcc_plugin_b", "1.1", &[]);
        add(&mut forest, "the_dcc_plugin_d", "1.0", &[]);
        add(&mut forest, "the_dcc_plugin_d", "1.1", &[]);
        add(&mut forest, "the_dcc_plugin_e", "1.0", &[]);
        add(&mut forest, "the_dcc_plugin_e", "1.1", &[]);
        forest
    }

    fn solve(roots: &[&str], forest: &DistroForest) -> Result<Solution> {
        let env = MarkerEnv::for_platform(Platform::Linux);
        let requirements = Requirement::simplify(roots.iter()).unwrap();
        Solver::new(requirements, forest, &env).resolve()
    }

    fn names(solution: &Solution) -> Vec<String> {
        solution
            .selections
            .iter()
            .map(Selection::name_version)
            .collect()
    }

    #[test]
    fn test_simple_resolve() {
        let forest = fixture();
        let solution = solve(&["the_dcc"], &forest).unwrap();

        assert_eq!(
            names(&solution),
            vec![
                "the_dcc==1.2",
                "the_dcc_plugin_a==1.1",
                "the_dcc_plugin_b==1.1",
                "the_dcc_plugin_e==1.1",
                "the_dcc_plugin_d==1.1",
            ]
        );
        assert_eq!(
            solution.requirements.get("the_dcc_plugin_a").unwrap().to_string(),
            "the_dcc_plugin_a>=1.0"
        );
    }

    #[test]
    fn test_recalculated_resolve() {
        // The first pick the_dcc==1.2 is discarded when plugin_b==0.9 pulls
        // in the_dcc<1.2.
        let forest = fixture();
        let env = MarkerEnv::for_platform(Platform::Linux);
        let requirements =
            Requirement::simplify(["the_dcc", "the_dcc_plugin_b==0.9"]).unwrap();
        let mut solver = Solver::new(requirements, &forest, &env);
        let solution = solver.resolve().unwrap();

        assert_eq!(solver.redirects_required, 1);
        assert_eq!(
            solver.invalid.get("the_dcc").unwrap().to_string(),
            "the_dcc!=1.2"
        );
        assert_eq!(
            solution.requirements.get("the_dcc").unwrap().to_string(),
            "the_dcc<1.2"
        );
        assert!(names(&solution).contains(&"the_dcc==1.1".to_string()));
        assert!(names(&solution).contains(&"the_dcc_plugin_b==0.9".to_string()));
    }

    #[test]
    fn test_redirect_limit() {
        let forest = fixture();
        let env = MarkerEnv::for_platform(Platform::Linux);
        let requirements =
            Requirement::simplify(["the_dcc", "the_dcc_plugin_b==0.9"]).unwrap();
        let mut solver = Solver::new(requirements, &forest, &env);
        solver.max_redirects = 0;
        let err = solver.resolve().unwrap_err();
        assert_eq!(err.to_string(), "Redirect limit of 0 reached");
    }

    #[test]
    fn test_missing_distro() {
        let forest = fixture();
        let err = solve(&["no_existant_distro"], &forest).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to find a distro for requirement: no_existant_distro"
        );
    }

    #[test]
    fn test_impossible_requirement() {
        let forest = fixture();
        let err = solve(&["the_dcc>1.1", "the_dcc_plugin_b<1.0"], &forest).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Unable to find a valid version for \"the_dcc"));
    }

    #[test]
    fn test_marker_skips_requirement() {
        let forest = fixture();
        // The marker is false on every platform, so the missing distro is
        // never looked up and pulls in nothing.
        let solution = solve(
            &["the_dcc==1.0", "no_exist; platform_system == 'Invalid'"],
            &forest,
        )
        .unwrap();
        assert_eq!(names(&solution), vec!["the_dcc==1.0"]);
    }

    #[test]
    fn test_forced_requirements() {
        let forest = fixture();
        let env = MarkerEnv::for_platform(Platform::Linux);
        let requirements = Requirement::simplify(["the_dcc_plugin_a"]).unwrap();
        let forced =
            Requirement::simplify(["the_dcc_plugin_e==1.0"]).unwrap();
        let mut solver = Solver::new(requirements, &forest, &env).with_forced(forced);
        let solution = solver.resolve().unwrap();

        let picked = names(&solution);
        assert!(picked.contains(&"the_dcc_plugin_a==1.1".to_string()));
        assert!(picked.contains(&"the_dcc_plugin_e==1.0".to_string()));
    }

    #[test]
    fn test_stubbed_distro() {
        let forest = fixture();
        let env = MarkerEnv::for_platform(Platform::Linux);
        let requirements = Requirement::simplify(["missing_plugin", "the_dcc==1.0"]).unwrap();

        let stubs: HashSet<String> = ["missing_plugin".to_string()].into();
        let mut solver = Solver::new(requirements.clone(), &forest, &env).with_stub_names(stubs);
        let solution = solver.resolve().unwrap();
        assert!(solution.selections[0].stub);
        assert_eq!(solution.selections[0].name, "missing_plugin");

        // Without the stub rule the same solve fails
        let mut solver = Solver::new(requirements, &forest, &env);
        assert!(solver.resolve().is_err());
    }
}
