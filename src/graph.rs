//! Dependency graph construction and resolution.
//!
//! Nodes are all [`ConfiguredTask`]s across all modules; edges point from
//! a task to the providers of the products it consumes. Construction
//! validates the whole configuration eagerly (batching every violation it
//! finds), so resolution afterwards is infallible: compute the transitive
//! closure of the requested products' providers and order it so that
//! providers come before consumers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::module::ModuleGraph;
use crate::task::{ConfiguredTask, TaskRegistry};

/// One task of the resolved execution plan, with the upstream
/// (module, product) pairs its job is wired to consume.
pub(crate) struct ResolvedTask {
    pub(crate) task: Arc<ConfiguredTask>,
    pub(crate) upstream: Vec<(ArcStr, ArcStr)>,
}

#[derive(Debug)]
pub(crate) struct TaskGraph {
    graph: DiGraph<Arc<ConfiguredTask>, ()>,
    /// Nodes providing the requested products, one per request.
    requested: Vec<NodeIndex>,
}

/// Adds the edge `consumer → provider of (provider_module, product)`, or
/// records the violation when the lookup does not resolve to exactly one
/// task.
fn wire(
    graph: &mut DiGraph<Arc<ConfiguredTask>, ()>,
    errors: &mut Vec<ConfigError>,
    local: &BTreeMap<(ArcStr, ArcStr), Vec<NodeIndex>>,
    consumer: NodeIndex,
    task: &ConfiguredTask,
    provider_module: &ArcStr,
    product: &ArcStr,
) {
    match local
        .get(&(provider_module.clone(), product.clone()))
        .map(Vec::as_slice)
    {
        Some([provider]) => {
            if *provider == consumer {
                errors.push(ConfigError::TaskCycle(task.qualified_name()));
            } else {
                graph.add_edge(consumer, *provider, ());
            }
        }
        Some(_) => {
            // Already reported as DuplicateProduct.
        }
        None => errors.push(ConfigError::NoProvider {
            module: provider_module.to_string(),
            product: product.to_string(),
            wanted_by: task.qualified_name(),
        }),
    }
}

impl TaskGraph {
    /// Builds and validates the full task graph for one build invocation.
    ///
    /// Every violation found in this pass is collected and reported at
    /// once instead of failing on the first.
    pub(crate) fn build(
        modules: &ModuleGraph,
        registries: &BTreeMap<ArcStr, TaskRegistry>,
        requested: &[&str],
    ) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();
        let mut graph: DiGraph<Arc<ConfiguredTask>, ()> = DiGraph::new();

        // Module-local and build-global provider indices. Registries and
        // their tasks iterate in lexicographic order, so node indices and
        // every downstream ordering are deterministic.
        let mut local: BTreeMap<(ArcStr, ArcStr), Vec<NodeIndex>> = BTreeMap::new();
        let mut global: BTreeMap<ArcStr, Vec<NodeIndex>> = BTreeMap::new();

        for (module, registry) in registries {
            for task in registry.tasks() {
                let index = graph.add_node(task.clone());
                let key = (module.clone(), task.provides().clone());
                local.entry(key).or_default().push(index);
                global.entry(task.provides().clone()).or_default().push(index);
            }
        }

        for ((module, product), providers) in &local {
            if providers.len() > 1 {
                let names = providers
                    .iter()
                    .map(|&index| graph[index].name().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                errors.push(ConfigError::DuplicateProduct {
                    module: module.to_string(),
                    product: product.to_string(),
                    providers: names,
                });
            }
        }

        // Requested products must resolve to exactly one provider anywhere;
        // unknown ones are batched into a single error.
        let mut requested_nodes = Vec::new();
        let mut unknown = Vec::new();

        for &request in requested {
            match global.get(request).map(Vec::as_slice) {
                None | Some([]) => unknown.push(request.to_string()),
                Some([index]) => requested_nodes.push(*index),
                Some(providers) => {
                    let names = providers
                        .iter()
                        .map(|&index| graph[index].module().to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    errors.push(ConfigError::AmbiguousProduct {
                        product: request.to_string(),
                        modules: names,
                    });
                }
            }
        }

        if !unknown.is_empty() {
            errors.push(ConfigError::UnknownProducts(unknown));
        }

        // Wire edges task → provider for used, imported and imported-all
        // products. Each lookup must resolve to exactly one task.
        let indices: Vec<NodeIndex> = graph.node_indices().collect();

        for index in indices {
            let task = graph[index].clone();
            let module = task.module_arc();

            for product in task.uses() {
                wire(&mut graph, &mut errors, &local, index, &task, &module, product);
            }

            let dependencies = modules
                .dependencies_of(&module)
                .cloned()
                .unwrap_or_default();

            for product in task.imports() {
                if dependencies.is_empty() {
                    errors.push(ConfigError::NoProvider {
                        module: module.to_string(),
                        product: product.to_string(),
                        wanted_by: task.qualified_name(),
                    });
                }
                for dependency in &dependencies {
                    wire(&mut graph, &mut errors, &local, index, &task, dependency, product);
                }
            }

            for product in task.imports_all() {
                for other in modules.names() {
                    wire(&mut graph, &mut errors, &local, index, &task, other, product);
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            errors.push(ConfigError::TaskCycle(
                graph[cycle.node_id()].qualified_name(),
            ));
        }

        if !errors.is_empty() {
            return Err(match errors.len() {
                1 => errors.pop().unwrap(),
                _ => ConfigError::Many(errors),
            });
        }

        Ok(Self {
            graph,
            requested: requested_nodes,
        })
    }

    /// Resolves the minimal execution plan: the transitive closure of the
    /// requested products' providers, ordered so that a task never
    /// precedes a task it depends on. Ties break by node insertion order,
    /// keeping the plan stable across runs of the same graph.
    pub(crate) fn resolve(&self) -> Vec<ResolvedTask> {
        let mut closure = HashSet::new();

        for &start in &self.requested {
            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(index) = dfs.next(&self.graph) {
                closure.insert(index);
            }
        }

        // toposort puts consumers before their providers (edges point
        // task → provider), so the execution order is the reverse.
        let order = toposort(&self.graph, None)
            .expect("cycles are rejected at graph construction");

        order
            .into_iter()
            .rev()
            .filter(|index| closure.contains(index))
            .map(|index| {
                let mut upstream: Vec<_> = self
                    .graph
                    .neighbors(index)
                    .map(|provider| {
                        let provider = &self.graph[provider];
                        (provider.module_arc(), provider.provides().clone())
                    })
                    .collect();
                upstream.sort();
                upstream.dedup();

                ResolvedTask {
                    task: self.graph[index].clone(),
                    upstream,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleConfig;
    use crate::task::TaskSpec;

    fn registries(
        specs: Vec<(&str, TaskSpec)>,
    ) -> BTreeMap<ArcStr, TaskRegistry> {
        let mut map: BTreeMap<ArcStr, TaskRegistry> = BTreeMap::new();
        for (module, spec) in specs {
            let module = ArcStr::from(module);
            map.entry(module.clone())
                .or_insert_with(|| TaskRegistry::new(module))
                .register(spec)
                .unwrap();
        }
        map
    }

    fn single_module() -> ModuleGraph {
        ModuleGraph::build(vec![ModuleConfig::new("app", "app")]).unwrap()
    }

    fn names(plan: &[ResolvedTask]) -> Vec<String> {
        plan.iter().map(|r| r.task.qualified_name()).collect()
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let modules = single_module();
        let registries = registries(vec![
            ("app", TaskSpec::new("jarA").provides("jar")),
            ("app", TaskSpec::new("jarB").provides("jar")),
        ]);

        let err = TaskGraph::build(&modules, &registries, &["jar"]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("provided by multiple tasks"));
        assert!(text.contains("jarA"));
        assert!(text.contains("jarB"));
    }

    #[test]
    fn test_unknown_products_reported_together() {
        let modules = single_module();
        let registries = registries(vec![("app", TaskSpec::new("jar"))]);

        let err =
            TaskGraph::build(&modules, &registries, &["docs", "jar", "sources"]).unwrap_err();
        match err {
            ConfigError::UnknownProducts(products) => {
                assert_eq!(products, vec!["docs".to_string(), "sources".to_string()]);
            }
            other => panic!("expected UnknownProducts, got {other}"),
        }
    }

    #[test]
    fn test_requested_ambiguous_across_modules() {
        let modules = ModuleGraph::build(vec![
            ModuleConfig::new("a", "a"),
            ModuleConfig::new("b", "b"),
        ])
        .unwrap();
        let registries = registries(vec![
            ("a", TaskSpec::new("jar")),
            ("b", TaskSpec::new("jar")),
        ]);

        let err = TaskGraph::build(&modules, &registries, &["jar"]).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousProduct { .. }));
    }

    #[test]
    fn test_missing_provider_for_used_product() {
        let modules = single_module();
        let registries =
            registries(vec![("app", TaskSpec::new("compileJava").uses(["source"]))]);

        let err = TaskGraph::build(&modules, &registries, &["compileJava"]).unwrap_err();
        assert!(matches!(err, ConfigError::NoProvider { .. }));
    }

    #[test]
    fn test_closure_is_minimal() {
        let modules = single_module();
        let registries = registries(vec![
            ("app", TaskSpec::new("provideSource").provides("source")),
            (
                "app",
                TaskSpec::new("compileJava")
                    .provides("compilation")
                    .uses(["source"]),
            ),
            ("app", TaskSpec::new("javadoc").uses(["source"])),
        ]);

        let graph = TaskGraph::build(&modules, &registries, &["compilation"]).unwrap();
        let plan = names(&graph.resolve());

        assert_eq!(plan, vec!["app#provideSource", "app#compileJava"]);
    }

    #[test]
    fn test_resolution_order_respects_dependencies() {
        let modules = single_module();
        let registries = registries(vec![
            ("app", TaskSpec::new("provideSource").provides("source")),
            (
                "app",
                TaskSpec::new("resolveCompileDependencies").provides("compileDependencies"),
            ),
            (
                "app",
                TaskSpec::new("compileJava")
                    .provides("compilation")
                    .uses(["source", "compileDependencies"]),
            ),
        ]);

        let graph = TaskGraph::build(&modules, &registries, &["compilation"]).unwrap();
        let plan = names(&graph.resolve());

        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2], "app#compileJava");
        assert!(plan.contains(&"app#provideSource".to_string()));
        assert!(plan.contains(&"app#resolveCompileDependencies".to_string()));
    }

    #[test]
    fn test_stable_order_across_runs() {
        let modules = single_module();
        let build = || {
            let registries = registries(vec![
                ("app", TaskSpec::new("a")),
                ("app", TaskSpec::new("b")),
                ("app", TaskSpec::new("c")),
                (
                    "app",
                    TaskSpec::goal("all").uses(["a", "b", "c"]),
                ),
            ]);
            let graph = TaskGraph::build(&modules, &registries, &["all"]).unwrap();
            names(&graph.resolve())
        };

        assert_eq!(build(), build());
    }

    #[test]
    fn test_task_cycle_rejected() {
        let modules = single_module();
        let registries = registries(vec![
            ("app", TaskSpec::new("a").uses(["b"])),
            ("app", TaskSpec::new("b").uses(["a"])),
        ]);

        let err = TaskGraph::build(&modules, &registries, &["a"]).unwrap_err();
        assert!(err.to_string().contains("Cycle in task dependencies"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let modules = single_module();
        let registries = registries(vec![("app", TaskSpec::new("a").uses(["a"]))]);

        let err = TaskGraph::build(&modules, &registries, &["a"]).unwrap_err();
        assert!(matches!(err, ConfigError::TaskCycle(_)));
    }

    #[test]
    fn test_imports_resolve_in_dependency_modules() {
        let modules = ModuleGraph::build(vec![
            ModuleConfig::new("app", "app").with_dependency("lib"),
            ModuleConfig::new("lib", "lib"),
        ])
        .unwrap();
        let registries = registries(vec![
            ("lib", TaskSpec::new("jar")),
            (
                "app",
                TaskSpec::new("compileJava")
                    .provides("compilation")
                    .imports(["jar"]),
            ),
        ]);

        let graph = TaskGraph::build(&modules, &registries, &["compilation"]).unwrap();
        let plan = names(&graph.resolve());

        assert_eq!(plan, vec!["lib#jar", "app#compileJava"]);
    }

    #[test]
    fn test_import_without_module_dependencies_fails() {
        let modules = single_module();
        let registries = registries(vec![(
            "app",
            TaskSpec::new("compileJava").imports(["jar"]),
        )]);

        let err = TaskGraph::build(&modules, &registries, &["compileJava"]).unwrap_err();
        assert!(matches!(err, ConfigError::NoProvider { .. }));
    }

    #[test]
    fn test_import_all_wires_every_module() {
        let modules = ModuleGraph::build(vec![
            ModuleConfig::new("a", "a"),
            ModuleConfig::new("b", "b"),
            ModuleConfig::new("tools", "tools"),
        ])
        .unwrap();
        let registries = registries(vec![
            ("a", TaskSpec::new("jar")),
            ("b", TaskSpec::new("jar")),
            ("tools", TaskSpec::new("jar")),
            ("tools", TaskSpec::goal("assembleAll").imports_all(["jar"])),
        ]);

        let graph = TaskGraph::build(&modules, &registries, &["assembleAll"]).unwrap();
        let plan = names(&graph.resolve());

        assert_eq!(plan.len(), 4);
        assert_eq!(plan[3], "tools#assembleAll");
    }
}
