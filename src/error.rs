use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors produced by userland task code.
pub use anyhow::Error as TaskError;

/// Top-level error type returned by [`Session`](crate::Session) entry points.
#[derive(Debug, Error)]
pub enum TataraError {
    #[error("Invalid build configuration.\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while executing the build.\n{0}")]
    Build(#[from] BuildError),

    #[error("Error while accessing the build cache.\n{0}")]
    Cache(#[from] CacheError),

    #[error("Another build is already running for this project (lock file: {0})")]
    Locked(Utf8PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration errors, detected eagerly while the dependency graph is
/// constructed, before any task runs. Where feasible all violations found
/// in one pass are batched into [`ConfigError::Many`] instead of failing
/// on the first.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Module '{0}' is registered twice")]
    DuplicateModule(String),

    #[error("Module '{module}' depends on unknown module '{dependency}'")]
    UnknownModule { module: String, dependency: String },

    #[error("Cycle in module dependencies involving module '{0}'")]
    ModuleCycle(String),

    #[error("Task '{task}' is registered twice in module '{module}'")]
    DuplicateTask { module: String, task: String },

    #[error("Task '{task}' is registered for unknown module '{module}'")]
    UnknownTaskModule { module: String, task: String },

    #[error("Product '{product}' in module '{module}' is provided by multiple tasks: {providers}")]
    DuplicateProduct {
        module: String,
        product: String,
        providers: String,
    },

    #[error("Unknown products requested: {}", .0.join(", "))]
    UnknownProducts(Vec<String>),

    #[error("Requested product '{product}' is provided in multiple modules: {modules}")]
    AmbiguousProduct { product: String, modules: String },

    #[error("No task provides product '{product}' in module '{module}' (required by task '{wanted_by}')")]
    NoProvider {
        module: String,
        product: String,
        wanted_by: String,
    },

    #[error("Product '{product}' is already registered in module '{module}'")]
    ProductRegistered { module: String, product: String },

    #[error("Cycle in task dependencies involving task '{0}'")]
    TaskCycle(String),

    #[error("{}", join_lines(.0))]
    Many(Vec<ConfigError>),
}

fn join_lines(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ConfigError::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors raised while jobs execute. The first one captured by the pool
/// aborts the build; the rest are logged and suppressed.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Skip hint '{hint}' of task '{task}':\n{error}")]
    SkipHint {
        task: String,
        hint: String,
        error: anyhow::Error,
    },

    #[error("Task '{0}' panicked: {1}")]
    Panic(String, String),

    #[error("Task '{task}' did not complete product '{product}'")]
    DidNotComplete { task: String, product: String },

    #[error("Product '{product}' in module '{module}' was completed twice")]
    DoubleCompletion { module: String, product: String },

    #[error("Product '{product}' is not registered in module '{module}'")]
    UnknownProduct { module: String, product: String },

    #[error("Task read product '{product}' of module '{module}' without declaring it")]
    UndeclaredRead { module: String, product: String },

    // Cooperative cancellation, distinguished from genuine errors so it is
    // never reported as a second failure.
    #[error("Interrupted")]
    Interrupted,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// True for the benign interrupted outcome of cooperative shutdown.
    pub fn is_interruption(&self) -> bool {
        matches!(self, BuildError::Interrupted)
    }
}

/// Errors reading or writing signature files and cached products. Never
/// retried; an inconsistent incremental-build cache is worse than a slow
/// clean rebuild.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't read or write cached build data.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't serialize cached product properties.\n{0}")]
    Serde(#[from] serde_json::Error),

    #[error("Signature file already exists: {0}")]
    SignatureExists(Utf8PathBuf),

    #[error("Malformed cache entry at {path}: {detail}")]
    Malformed { path: Utf8PathBuf, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_many_lists_all_violations() {
        let err = ConfigError::Many(vec![
            ConfigError::UnknownProducts(vec!["jar".into(), "docs".into()]),
            ConfigError::DuplicateModule("app".into()),
        ]);

        let text = err.to_string();
        assert!(text.contains("jar, docs"));
        assert!(text.contains("Module 'app'"));
    }

    #[test]
    fn test_interruption_is_benign() {
        assert!(BuildError::Interrupted.is_interruption());
        assert!(!BuildError::Panic("t".into(), "boom".into()).is_interruption());
    }
}
