//! Build modules and the module dependency graph.
//!
//! A build consists of either one module or several named modules. Modules
//! declare compile-dependencies on each other; the resulting graph is
//! resolved to its transitive closure once at session start, and imported
//! products are looked up in that closure.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::core::ArcStr;
use crate::error::ConfigError;

/// Configuration of one build module: a named, path-rooted unit of the
/// build carrying its declared module dependencies and settings.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    name: ArcStr,
    root: Utf8PathBuf,
    dependencies: Vec<ArcStr>,
    settings: BTreeMap<String, String>,
}

impl ModuleConfig {
    pub fn new(name: impl AsRef<str>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: ArcStr::from(name.as_ref()),
            root: root.into(),
            dependencies: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    /// Declares a compile-dependency on another module.
    pub fn with_dependency(mut self, name: impl AsRef<str>) -> Self {
        self.dependencies.push(ArcStr::from(name.as_ref()));
        self
    }

    /// Attaches an arbitrary string setting readable by tasks.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The directly declared module dependencies, in declaration order.
    pub fn dependencies(&self) -> &[ArcStr] {
        &self.dependencies
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub(crate) fn name_arc(&self) -> ArcStr {
        self.name.clone()
    }
}

/// The dependency graph over all registered modules, resolved to its
/// transitive closure at construction time.
#[derive(Debug)]
pub struct ModuleGraph {
    configs: BTreeMap<ArcStr, ModuleConfig>,
    /// Transitive compile-dependencies per module, deterministic order.
    closure: BTreeMap<ArcStr, BTreeSet<ArcStr>>,
}

impl ModuleGraph {
    pub(crate) fn build(modules: Vec<ModuleConfig>) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();
        let mut configs: BTreeMap<ArcStr, ModuleConfig> = BTreeMap::new();

        for module in modules {
            if configs.contains_key(&module.name) {
                errors.push(ConfigError::DuplicateModule(module.name.to_string()));
                continue;
            }
            configs.insert(module.name.clone(), module);
        }

        let mut graph: DiGraph<ArcStr, ()> = DiGraph::new();
        let mut indices: BTreeMap<ArcStr, NodeIndex> = BTreeMap::new();

        for name in configs.keys() {
            let index = graph.add_node(name.clone());
            indices.insert(name.clone(), index);
        }

        for (name, module) in &configs {
            for dependency in &module.dependencies {
                match indices.get(dependency) {
                    Some(&target) => {
                        graph.add_edge(indices[name], target, ());
                    }
                    None => errors.push(ConfigError::UnknownModule {
                        module: name.to_string(),
                        dependency: dependency.to_string(),
                    }),
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let name = graph[cycle.node_id()].to_string();
            errors.push(ConfigError::ModuleCycle(name));
        }

        if !errors.is_empty() {
            return Err(match errors.len() {
                1 => errors.pop().unwrap(),
                _ => ConfigError::Many(errors),
            });
        }

        // Transitive closure per module, via DFS along dependency edges.
        let mut closure = BTreeMap::new();
        for (name, &index) in &indices {
            let mut reachable = BTreeSet::new();
            let mut dfs = Dfs::new(&graph, index);
            while let Some(nx) = dfs.next(&graph) {
                if nx != index {
                    reachable.insert(graph[nx].clone());
                }
            }
            closure.insert(name.clone(), reachable);
        }

        Ok(Self { configs, closure })
    }

    /// All module names, in deterministic (lexicographic) order.
    pub fn names(&self) -> impl Iterator<Item = &ArcStr> {
        self.configs.keys()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn config(&self, name: &str) -> Option<&ModuleConfig> {
        self.configs.get(name)
    }

    /// The transitive compile-dependencies of a module.
    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<ArcStr>> {
        self.closure.get(name)
    }
}
