//! The build session: configuration, orchestration and the public entry
//! points.
//!
//! A [`SessionConfig`] collects modules and task specs; [`finish`]
//! validates the module graph and freezes everything into a [`Session`].
//! Running the session builds the task graph, resolves the requested
//! closure, initializes per-module product repositories and executes the
//! plan on the job pool. All registries are explicit maps owned here and
//! passed by reference into each component; there is no global state.
//!
//! [`finish`]: SessionConfig::finish

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;

use crate::cache::ProductCache;
use crate::core::{ArcStr, BuildSettings, TOOL_VERSION};
use crate::error::{ConfigError, TataraError};
use crate::graph::TaskGraph;
use crate::module::{ModuleConfig, ModuleGraph};
use crate::pool::{ExecutionReport, Job, JobPool};
use crate::product::{ProductPromise, ProductRepository, UsedProducts};
use crate::skip::Signatures;
use crate::task::{TaskRegistry, TaskSpec};
use crate::utils::{Stopwatch, as_overhead};

/// One requestable product, as listed by [`Session::products`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub module: String,
    pub product: String,
    pub task: String,
    pub goal: bool,
}

/// Builder collecting the build configuration before a session starts.
pub struct SessionConfig {
    modules: Vec<ModuleConfig>,
    tasks: Vec<(ArcStr, TaskSpec)>,
    settings: BuildSettings,
}

impl SessionConfig {
    fn new() -> Self {
        Self {
            modules: Vec::new(),
            tasks: Vec::new(),
            settings: BuildSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: BuildSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn add_module(mut self, module: ModuleConfig) -> Self {
        self.modules.push(module);
        self
    }

    /// Registers a task in the given module. Validation happens in
    /// [`finish`](Self::finish).
    pub fn add_task(mut self, module: impl AsRef<str>, spec: TaskSpec) -> Self {
        self.tasks.push((ArcStr::from(module.as_ref()), spec));
        self
    }

    /// Validates the module graph, registers every task and freezes the
    /// configuration into a runnable [`Session`].
    pub fn finish(self) -> Result<Session, ConfigError> {
        let modules = ModuleGraph::build(self.modules)?;

        let mut registries: BTreeMap<ArcStr, TaskRegistry> = modules
            .names()
            .map(|name| (name.clone(), TaskRegistry::new(name.clone())))
            .collect();

        let mut errors = Vec::new();
        for (module, spec) in self.tasks {
            match registries.get_mut(&module) {
                Some(registry) => {
                    if let Err(err) = registry.register(spec) {
                        errors.push(err);
                    }
                }
                None => errors.push(ConfigError::UnknownTaskModule {
                    module: module.to_string(),
                    task: spec.into_configured(module.clone()).name().to_string(),
                }),
            }
        }

        if !errors.is_empty() {
            return Err(match errors.len() {
                1 => errors.pop().unwrap(),
                _ => ConfigError::Many(errors),
            });
        }

        Ok(Session {
            modules: Arc::new(modules),
            registries,
            settings: Arc::new(self.settings),
        })
    }
}

/// A frozen build configuration, ready to execute product requests.
#[derive(Debug)]
pub struct Session {
    modules: Arc<ModuleGraph>,
    registries: BTreeMap<ArcStr, TaskRegistry>,
    settings: Arc<BuildSettings>,
}

impl Session {
    pub fn config() -> SessionConfig {
        SessionConfig::new()
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn modules(&self) -> &ModuleGraph {
        &self.modules
    }

    /// Every requestable product, in deterministic order.
    pub fn products(&self) -> Vec<ProductInfo> {
        let mut products = Vec::new();
        for (module, registry) in &self.registries {
            for task in registry.tasks() {
                products.push(ProductInfo {
                    module: module.to_string(),
                    product: task.provides().to_string(),
                    task: task.name().to_string(),
                    goal: task.is_goal(),
                });
            }
        }
        products.sort_by(|a, b| (&a.module, &a.product).cmp(&(&b.module, &b.product)));
        products
    }

    /// Deletes all cached build data of the current tool version.
    pub fn clean(&self) -> Result<(), TataraError> {
        let s = Instant::now();
        let versioned = self.settings.cache_dir.join(TOOL_VERSION);

        if fs::metadata(&versioned).is_ok() {
            fs::remove_dir_all(&versioned)?;
        }

        eprintln!("Cleaned the build cache {}", as_overhead(s));
        Ok(())
    }

    /// Builds the requested products.
    ///
    /// Resolves the minimal task closure, executes it concurrently and
    /// returns the per-job execution report in stable order. The whole
    /// invocation holds an advisory lock so two builds never share
    /// signature files.
    pub fn run(&self, requested: &[&str]) -> Result<ExecutionReport, TataraError> {
        let s = Instant::now();
        eprintln!(
            "Running {} for products: {}",
            style("tatara").red(),
            style(requested.join(", ")).blue()
        );

        let _lock = LockFile::acquire(&self.settings.cache_dir)?;

        let resolved = {
            let _watch = Stopwatch::start("graph resolution");
            TaskGraph::build(&self.modules, &self.registries, requested)?.resolve()
        };
        tracing::info!("Resolved {} tasks for {} requested products", resolved.len(), requested.len());

        // Fresh per-module repositories for this run; one promise per
        // resolved provider, created before any lookup happens.
        let repositories: BTreeMap<ArcStr, Arc<ProductRepository>> = self
            .modules
            .names()
            .map(|name| (name.clone(), Arc::new(ProductRepository::new(name.clone()))))
            .collect();

        let mut promises: BTreeMap<(ArcStr, ArcStr), Arc<ProductPromise>> = BTreeMap::new();
        for entry in &resolved {
            let module = entry.task.module_arc();
            let repository = &repositories[&module];
            let promise = repository.create(entry.task.provides())?;
            promises.insert((module, entry.task.provides().clone()), promise);
        }

        let prevention = self
            .settings
            .cache_dir
            .join(TOOL_VERSION)
            .join("execution-prevention");
        let signatures = Arc::new(Signatures::new(prevention.join("checksums")));
        let cache = Arc::new(ProductCache::new(prevention.join("products")));

        let mut jobs = Vec::with_capacity(resolved.len());
        for entry in &resolved {
            let module = entry.task.module_arc();
            let config = self
                .modules
                .config(&module)
                .expect("modules validated at registration");

            let mut products = UsedProducts::new(module.clone());
            for (upstream_module, upstream_product) in &entry.upstream {
                let promise = promises
                    .get(&(upstream_module.clone(), upstream_product.clone()))
                    .expect("upstream providers are part of the resolved closure");
                products.insert(promise.clone());
            }

            let promise = promises[&(module, entry.task.provides().clone())].clone();

            jobs.push(Job::new(
                entry.task.clone(),
                Arc::new(config.clone()),
                self.modules.clone(),
                products,
                promise,
                signatures.clone(),
                cache.clone(),
                self.settings.clone(),
            ));
        }

        let mut pool = JobPool::new(repositories.values().cloned().collect());
        pool.submit_all(jobs);

        let report = match pool.shutdown() {
            Ok(executions) => ExecutionReport::new(executions),
            Err(err) => {
                eprintln!("{} {err}", style("Build failed:").red());
                return Err(err.into());
            }
        };

        eprintln!(
            "Build finished: {} executed, {} skipped {}",
            report.executed(),
            report.skipped(),
            as_overhead(s)
        );

        Ok(report)
    }
}

/// Advisory lock preventing two concurrent invocations on one project.
/// Holds the PID for diagnostics; removed on drop.
struct LockFile {
    path: Utf8PathBuf,
}

impl LockFile {
    fn acquire(dir: &Utf8Path) -> Result<Self, TataraError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(".lock");

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(TataraError::Locked(path))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
