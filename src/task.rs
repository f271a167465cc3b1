//! The task contract and declarative task configuration.
//!
//! A task is an executable unit consuming zero or more products and
//! producing exactly one (or none, if empty). Tasks are registered as
//! [`ConfiguredTask`]s: immutable descriptors naming the provided product,
//! the consumed products, the skip hints and a factory for the runnable
//! instance. The descriptors live for the whole process; instances are
//! created per build run by the owning job.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{ArcStr, BuildSettings};
use crate::error::ConfigError;
use crate::module::{ModuleConfig, ModuleGraph};
use crate::product::{Product, UsedProducts};

/// Result of a single executed task.
///
/// `Ok` and `UpToDate` carry the produced [`Product`]; `Empty` marks a
/// task that legitimately produced nothing.
#[derive(Debug)]
pub enum TaskOutput {
    Ok(Product),
    UpToDate(Product),
    Empty,
}

/// The context passed to every task execution.
///
/// Everything a task may care about is injected here explicitly: the
/// owning module's configuration, the transitive module graph, the view
/// of upstream products it declared, and the build settings. Tasks that
/// don't need a field simply ignore it.
pub struct TaskContext<'a> {
    /// Configuration of the module owning this task.
    pub module: &'a ModuleConfig,
    /// The resolved module dependency graph.
    pub modules: &'a ModuleGraph,
    /// The upstream products this task declared; reads block until the
    /// providing job completes them.
    pub products: &'a UsedProducts,
    /// Build-wide settings.
    pub settings: &'a BuildSettings,
    /// Tracing span assigned to this task.
    pub(crate) span: tracing::Span,
}

impl TaskContext<'_> {
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// A runnable build action. Implementations are supplied by plugins or
/// userland code; the engine only cares about the returned status.
pub trait Task: Send + Sync {
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskOutput>;
}

/// Factory producing a fresh task instance for one job execution.
pub(crate) type TaskFactory = Arc<dyn Fn() -> Box<dyn Task> + Send + Sync>;

type SkipHintFnPtr = Arc<dyn Fn() -> anyhow::Result<String> + Send + Sync>;

/// A lazily-evaluated string describing one input of a task for the
/// incremental-build signature, e.g. a tool version or a source-set hash.
/// Evaluated only when the signature is computed; a changed value
/// invalidates the task's cached product.
#[derive(Clone)]
pub struct SkipHint {
    name: ArcStr,
    supplier: SkipHintFnPtr,
}

impl SkipHint {
    pub fn new<F>(name: impl AsRef<str>, supplier: F) -> Self
    where
        F: Fn() -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            name: ArcStr::from(name.as_ref()),
            supplier: Arc::new(supplier),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the supplier into a stable `name=value` signature entry.
    pub(crate) fn evaluate(&self) -> anyhow::Result<String> {
        let value = (self.supplier)()?;
        Ok(format!("{}={}", self.name, value))
    }
}

impl Debug for SkipHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SkipHint({})", self.name)
    }
}

/// Declarative descriptor of one registered task, immutable after
/// registration.
pub struct ConfiguredTask {
    name: ArcStr,
    module: ArcStr,
    provides: ArcStr,
    uses: Vec<ArcStr>,
    imports: Vec<ArcStr>,
    imports_all: Vec<ArcStr>,
    hints: Vec<SkipHint>,
    factory: Option<TaskFactory>,
    goal: bool,
}

impl ConfiguredTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub(crate) fn module_arc(&self) -> ArcStr {
        self.module.clone()
    }

    /// The product this task provides. Goals provide a pseudo-product
    /// named after the goal, completed with the empty marker.
    pub fn provides(&self) -> &ArcStr {
        &self.provides
    }

    /// Products consumed from the task's own module.
    pub fn uses(&self) -> &[ArcStr] {
        &self.uses
    }

    /// Products imported from each module the owning module depends on.
    pub fn imports(&self) -> &[ArcStr] {
        &self.imports
    }

    /// Products imported from every module of the build.
    pub fn imports_all(&self) -> &[ArcStr] {
        &self.imports_all
    }

    pub fn skip_hints(&self) -> &[SkipHint] {
        &self.hints
    }

    pub fn is_goal(&self) -> bool {
        self.goal
    }

    pub(crate) fn factory(&self) -> Option<&TaskFactory> {
        self.factory.as_ref()
    }

    /// "module#task", the job name used in logs and reports.
    pub(crate) fn qualified_name(&self) -> String {
        format!("{}#{}", self.module, self.name)
    }
}

impl Debug for ConfiguredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredTask")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("provides", &self.provides)
            .field("goal", &self.goal)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`ConfiguredTask`], registered through
/// [`SessionConfig::add_task`](crate::SessionConfig::add_task).
pub struct TaskSpec {
    name: ArcStr,
    provides: Option<ArcStr>,
    uses: Vec<ArcStr>,
    imports: Vec<ArcStr>,
    imports_all: Vec<ArcStr>,
    hints: Vec<SkipHint>,
    factory: Option<TaskFactory>,
    goal: bool,
}

impl TaskSpec {
    /// A regular task. Unless overridden with [`provides`](Self::provides),
    /// the provided product is named after the task.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: ArcStr::from(name.as_ref()),
            provides: None,
            uses: Vec::new(),
            imports: Vec::new(),
            imports_all: Vec::new(),
            hints: Vec::new(),
            factory: None,
            goal: false,
        }
    }

    /// A goal: a virtual grouping task with no product of its own, used
    /// purely to group other products under one requestable name.
    pub fn goal(name: impl AsRef<str>) -> Self {
        let mut spec = Self::new(name);
        spec.goal = true;
        spec
    }

    pub fn provides(mut self, product: impl AsRef<str>) -> Self {
        self.provides = Some(ArcStr::from(product.as_ref()));
        self
    }

    pub fn uses<I, S>(mut self, products: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.uses
            .extend(products.into_iter().map(|p| ArcStr::from(p.as_ref())));
        self
    }

    pub fn imports<I, S>(mut self, products: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.imports
            .extend(products.into_iter().map(|p| ArcStr::from(p.as_ref())));
        self
    }

    pub fn imports_all<I, S>(mut self, products: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.imports_all
            .extend(products.into_iter().map(|p| ArcStr::from(p.as_ref())));
        self
    }

    pub fn skip_hint<F>(mut self, name: impl AsRef<str>, supplier: F) -> Self
    where
        F: Fn() -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.hints.push(SkipHint::new(name, supplier));
        self
    }

    /// Supplies the factory producing the runnable task instance.
    pub fn run_with<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Convenience for stateless tasks: wraps a closure as the task body.
    pub fn run_fn<F>(self, body: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<TaskOutput> + Send + Sync + Clone + 'static,
    {
        self.run_with(move || {
            Box::new(FnTask {
                body: body.clone(),
            })
        })
    }

    pub(crate) fn into_configured(self, module: ArcStr) -> ConfiguredTask {
        let provides = self.provides.unwrap_or_else(|| self.name.clone());
        ConfiguredTask {
            name: self.name,
            module,
            provides,
            uses: self.uses,
            imports: self.imports,
            imports_all: self.imports_all,
            hints: self.hints,
            factory: self.factory,
            goal: self.goal,
        }
    }
}

struct FnTask<F> {
    body: F,
}

impl<F> Task for FnTask<F>
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<TaskOutput> + Send + Sync,
{
    fn run(&mut self, ctx: &TaskContext<'_>) -> anyhow::Result<TaskOutput> {
        (self.body)(ctx)
    }
}

/// Per-module registry of configured tasks, the source the dependency
/// graph builder wires edges from.
#[derive(Debug)]
pub(crate) struct TaskRegistry {
    module: ArcStr,
    tasks: BTreeMap<ArcStr, Arc<ConfiguredTask>>,
}

impl TaskRegistry {
    pub(crate) fn new(module: ArcStr) -> Self {
        Self {
            module,
            tasks: BTreeMap::new(),
        }
    }

    pub(crate) fn register(&mut self, spec: TaskSpec) -> Result<(), ConfigError> {
        if self.tasks.contains_key(&spec.name) {
            return Err(ConfigError::DuplicateTask {
                module: self.module.to_string(),
                task: spec.name.to_string(),
            });
        }

        let task = spec.into_configured(self.module.clone());
        self.tasks.insert(task.name.clone(), Arc::new(task));
        Ok(())
    }

    /// All registered tasks, in deterministic (lexicographic) order.
    pub(crate) fn tasks(&self) -> impl Iterator<Item = &Arc<ConfiguredTask>> {
        self.tasks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provides_defaults_to_task_name() {
        let task = TaskSpec::new("compileJava").into_configured(ArcStr::from("app"));
        assert_eq!(task.provides().as_ref(), "compileJava");

        let task = TaskSpec::new("compileJava")
            .provides("compilation")
            .into_configured(ArcStr::from("app"));
        assert_eq!(task.provides().as_ref(), "compilation");
    }

    #[test]
    fn test_goal_has_no_factory() {
        let goal = TaskSpec::goal("assemble")
            .uses(["jar"])
            .into_configured(ArcStr::from("app"));
        assert!(goal.is_goal());
        assert!(goal.factory().is_none());
        assert_eq!(goal.qualified_name(), "app#assemble");
    }

    #[test]
    fn test_skip_hint_entry_format() {
        let hint = SkipHint::new("javac", || Ok("17".to_string()));
        assert_eq!(hint.evaluate().unwrap(), "javac=17");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = TaskRegistry::new(ArcStr::from("app"));
        registry.register(TaskSpec::new("jar")).unwrap();

        let err = registry.register(TaskSpec::new("jar")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTask { .. }));
    }
}
