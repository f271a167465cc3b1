//! The execution-prevention (skip) engine.
//!
//! Before a task runs, its job computes a signature over the task's skip
//! hints and the checksums of every upstream product it consumes. When the
//! signature matches the one persisted by a previous run, the task's
//! cached product is reused instead of re-executing the task. Tasks
//! without skip hints (other than goals) are conservatively never skipped.

use std::fs;
use std::io::ErrorKind;

use camino::Utf8PathBuf;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::core::Hash32;
use crate::error::{BuildError, CacheError};
use crate::product::UsedProducts;
use crate::task::ConfiguredTask;

/// Entry used for an upstream product that exposes no checksum.
pub(crate) const NO_PRODUCT: &str = "NO_PRODUCT";

/// An incremental-build signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Signature {
    /// Distinguished value for tasks without incremental-build support;
    /// never matches a persisted signature and is never persisted itself.
    Never,
    Hash(String),
}

/// Computes the signature of one task from its skip hints and the
/// checksums of the products it consumes.
///
/// The upstream reads are ordinary blocking product reads, so computing a
/// signature doubles as the dependency barrier of the owning job. Entries
/// are ordered deterministically: hints in declaration order, then one
/// `module#product:checksum` entry per upstream product sorted by
/// (module, product).
pub(crate) fn compute(
    task: &ConfiguredTask,
    products: &UsedProducts,
) -> Result<Signature, BuildError> {
    if task.skip_hints().is_empty() && !task.is_goal() {
        // Still block on every upstream before reporting "never skip",
        // since the caller relies on this as the dependency barrier.
        for promise in products.promises() {
            promise.get()?;
        }
        return Ok(Signature::Never);
    }

    let mut entries = Vec::new();

    for hint in task.skip_hints() {
        let entry = hint.evaluate().map_err(|error| BuildError::SkipHint {
            task: task.qualified_name(),
            hint: hint.name().to_string(),
            error,
        })?;
        entries.push(entry);
    }

    for promise in products.promises() {
        let outcome = promise.get()?;
        let checksum = outcome.checksum().unwrap_or(NO_PRODUCT).to_string();
        entries.push(format!(
            "{}#{}:{}",
            promise.module(),
            promise.product(),
            checksum
        ));
    }

    let mut hasher = blake3::Hasher::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }

    let hash = Hash32::from(hasher.finalize());
    Ok(Signature::Hash(hash.to_hex()))
}

/// On-disk store of persisted signatures, one file per (module, product),
/// scoped under the tool version so a new tool never trusts old data.
pub(crate) struct Signatures {
    root: Utf8PathBuf,
}

impl Signatures {
    pub(crate) fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, module: &str, product: &str) -> Utf8PathBuf {
        self.root.join(module).join(format!("{product}.sig"))
    }

    /// True iff a previously persisted signature exists and its contents
    /// equal the freshly computed signature, byte for byte.
    pub(crate) fn can_skip(
        &self,
        module: &str,
        product: &str,
        signature: &Signature,
    ) -> Result<bool, CacheError> {
        let Signature::Hash(current) = signature else {
            return Ok(false);
        };

        match fs::read_to_string(self.path(module, product)) {
            Ok(persisted) => Ok(persisted == *current),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists a signature. Signature files are write-once per build
    /// location; an existing file must be cleared first.
    pub(crate) fn commit(
        &self,
        module: &str,
        product: &str,
        signature: &Signature,
    ) -> Result<(), CacheError> {
        let Signature::Hash(current) = signature else {
            return Ok(());
        };

        let path = self.path(module, product);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(CacheError::SignatureExists(path));
            }
            Err(err) => return Err(err.into()),
        };

        std::io::Write::write_all(&mut file, current.as_bytes())?;
        Ok(())
    }

    /// Deletes the persisted signature, so a half-finished run never
    /// leaves a stale "can skip" signal behind.
    pub(crate) fn clear(&self, module: &str, product: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path(module, product)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Hashes every file matching a glob pattern into one hex digest, for use
/// as a skip hint over a source set.
///
/// Files are hashed in parallel and combined in the glob's (alphabetical)
/// order together with their paths, so renames and content changes both
/// flip the digest.
pub fn hash_sources(pattern: &str) -> anyhow::Result<String> {
    let mut files = Vec::new();
    for entry in glob::glob(pattern)? {
        let path = entry?;
        if path.is_file() {
            files.push(path);
        }
    }

    let hashes = files
        .into_par_iter()
        .map(|path| {
            let hash = Hash32::hash_file(&path)?;
            Ok((path, hash))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    let mut hasher = blake3::Hasher::new();
    for (path, hash) in hashes {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(hash.as_bytes());
    }

    Ok(Hash32::from(hasher.finalize()).to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArcStr;
    use crate::product::{Product, ProductOutcome, ProductPromise, UsedProducts};
    use crate::task::TaskSpec;
    use std::sync::Arc;

    fn used(entries: Vec<(&str, &str, Option<&str>)>) -> UsedProducts {
        let mut used = UsedProducts::new(ArcStr::from("app"));
        for (module, product, checksum) in entries {
            let promise = Arc::new(ProductPromise::new(
                ArcStr::from(module),
                ArcStr::from(product),
            ));
            let outcome = match checksum {
                Some(sum) => {
                    ProductOutcome::Product(Arc::new(Product::new().with_checksum(sum)))
                }
                None => ProductOutcome::Empty,
            };
            promise.complete(outcome).unwrap();
            used.insert(promise);
        }
        used
    }

    fn hinted_task() -> crate::task::ConfiguredTask {
        TaskSpec::new("compileJava")
            .provides("compilation")
            .skip_hint("javac", || Ok("17".to_string()))
            .into_configured(ArcStr::from("app"))
    }

    #[test]
    fn test_never_skip_without_hints() {
        let task = TaskSpec::new("compileJava").into_configured(ArcStr::from("app"));
        let signature = compute(&task, &used(vec![])).unwrap();
        assert_eq!(signature, Signature::Never);
    }

    #[test]
    fn test_goal_gets_real_signature() {
        let goal = TaskSpec::goal("assemble").into_configured(ArcStr::from("app"));
        let signature = compute(&goal, &used(vec![("app", "jar", Some("aa"))])).unwrap();
        assert!(matches!(signature, Signature::Hash(_)));
    }

    #[test]
    fn test_signature_order_independent() {
        let task = hinted_task();

        let a = compute(
            &task,
            &used(vec![("app", "source", Some("s1")), ("lib", "jar", Some("j1"))]),
        )
        .unwrap();
        let b = compute(
            &task,
            &used(vec![("lib", "jar", Some("j1")), ("app", "source", Some("s1"))]),
        )
        .unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_changes_with_checksum() {
        let task = hinted_task();

        let a = compute(&task, &used(vec![("app", "source", Some("s1"))])).unwrap();
        let b = compute(&task, &used(vec![("app", "source", Some("s2"))])).unwrap();
        let c = compute(&task, &used(vec![("app", "source", None)])).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_signature_changes_with_hint() {
        let products = vec![("app", "source", Some("s1"))];

        let a = compute(&hinted_task(), &used(products.clone())).unwrap();
        let changed = TaskSpec::new("compileJava")
            .provides("compilation")
            .skip_hint("javac", || Ok("21".to_string()))
            .into_configured(ArcStr::from("app"));
        let b = compute(&changed, &used(products)).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_failing_hint_is_wrapped() {
        let task = TaskSpec::new("compileJava")
            .skip_hint("broken", || anyhow::bail!("no tool found"))
            .into_configured(ArcStr::from("app"));

        let err = compute(&task, &used(vec![])).unwrap_err();
        match err {
            BuildError::SkipHint { task, hint, .. } => {
                assert_eq!(task, "app#compileJava");
                assert_eq!(hint, "broken");
            }
            other => panic!("expected SkipHint, got {other}"),
        }
    }

    #[test]
    fn test_can_skip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Signatures::new(dir.path().to_str().unwrap());
        let signature = Signature::Hash("abc123".to_string());

        assert!(!store.can_skip("app", "compilation", &signature).unwrap());

        store.commit("app", "compilation", &signature).unwrap();
        assert!(store.can_skip("app", "compilation", &signature).unwrap());

        let other = Signature::Hash("def456".to_string());
        assert!(!store.can_skip("app", "compilation", &other).unwrap());
    }

    #[test]
    fn test_commit_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Signatures::new(dir.path().to_str().unwrap());
        let signature = Signature::Hash("abc123".to_string());

        store.commit("app", "compilation", &signature).unwrap();
        let err = store.commit("app", "compilation", &signature).unwrap_err();
        assert!(matches!(err, CacheError::SignatureExists(_)));

        store.clear("app", "compilation").unwrap();
        store.commit("app", "compilation", &signature).unwrap();
    }

    #[test]
    fn test_clear_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = Signatures::new(dir.path().to_str().unwrap());
        store.clear("app", "compilation").unwrap();
    }

    #[test]
    fn test_never_skip_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Signatures::new(dir.path().to_str().unwrap());

        store.commit("app", "compilation", &Signature::Never).unwrap();
        assert!(!store.can_skip("app", "compilation", &Signature::Never).unwrap());
    }
}
