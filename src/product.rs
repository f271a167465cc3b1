//! Products, product promises and per-module product repositories.
//!
//! A product is one named build output. Each product of a build run is
//! represented by a single-assignment [`ProductPromise`]: the providing
//! job completes it exactly once, and any number of downstream jobs block
//! on [`ProductPromise::get`] until then. These blocking reads are the
//! only synchronization mechanism in the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Instant;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::ArcStr;
use crate::error::{BuildError, ConfigError};

/// Descriptor of a file a product left on disk, for display and caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    /// Display name, e.g. "jar".
    pub name: String,
    /// Path of the produced file.
    pub path: Utf8PathBuf,
}

/// An immutable bag of named string-list properties with an optional
/// checksum and an optional output-file descriptor. Used uniformly for
/// persistence and for skip-signature computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    properties: BTreeMap<String, Vec<String>>,
    checksum: Option<String>,
    output: Option<OutputInfo>,
}

impl Product {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties
            .insert(key.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        self.output = Some(OutputInfo {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    /// Reassembles a product from its persisted parts.
    pub(crate) fn from_parts(
        properties: BTreeMap<String, Vec<String>>,
        checksum: Option<String>,
        output: Option<OutputInfo>,
    ) -> Self {
        Self {
            properties,
            checksum,
            output,
        }
    }

    pub fn property(&self, key: &str) -> Option<&[String]> {
        self.properties.get(key).map(Vec::as_slice)
    }

    pub fn properties(&self) -> &BTreeMap<String, Vec<String>> {
        &self.properties
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn output(&self) -> Option<&OutputInfo> {
        self.output.as_ref()
    }
}

/// What a completed promise holds: either a product, or the explicit
/// marker that the task legitimately produced nothing.
#[derive(Debug, Clone)]
pub enum ProductOutcome {
    Product(Arc<Product>),
    Empty,
}

impl ProductOutcome {
    pub fn product(&self) -> Option<&Arc<Product>> {
        match self {
            ProductOutcome::Product(product) => Some(product),
            ProductOutcome::Empty => None,
        }
    }

    pub fn checksum(&self) -> Option<&str> {
        self.product().and_then(|product| product.checksum())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ProductOutcome::Empty)
    }
}

enum State {
    Pending,
    Completed { outcome: ProductOutcome, at: Instant },
    Cancelled,
}

/// A single-assignment future for one product of one module.
///
/// Created pending when the repository is initialized for a build run,
/// completed exactly once by the job owning the providing task, and read
/// by any number of downstream jobs. Cancellation (cooperative shutdown)
/// wakes every parked reader with the benign
/// [`BuildError::Interrupted`] outcome.
pub struct ProductPromise {
    module: ArcStr,
    product: ArcStr,
    started: Instant,
    state: Mutex<State>,
    signal: Condvar,
}

impl ProductPromise {
    pub(crate) fn new(module: ArcStr, product: ArcStr) -> Self {
        Self {
            module,
            product,
            started: Instant::now(),
            state: Mutex::new(State::Pending),
            signal: Condvar::new(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    /// Transitions pending → completed. Completing twice is fatal;
    /// completing after cancellation is a no-op, since in-flight providers
    /// may legitimately finish while the build is shutting down.
    pub(crate) fn complete(&self, outcome: ProductOutcome) -> Result<(), BuildError> {
        let mut state = self.state.lock().unwrap();

        match &*state {
            State::Pending => {
                *state = State::Completed {
                    outcome,
                    at: Instant::now(),
                };
                self.signal.notify_all();
                Ok(())
            }
            State::Cancelled => Ok(()),
            State::Completed { .. } => Err(BuildError::DoubleCompletion {
                module: self.module.to_string(),
                product: self.product.to_string(),
            }),
        }
    }

    /// Blocking read. Suspends the calling thread until the promise is
    /// completed, never timing out on its own; cancellation from the pool
    /// unblocks it with [`BuildError::Interrupted`].
    pub fn get(&self) -> Result<ProductOutcome, BuildError> {
        let mut state = self.state.lock().unwrap();

        loop {
            match &*state {
                State::Completed { outcome, .. } => return Ok(outcome.clone()),
                State::Cancelled => return Err(BuildError::Interrupted),
                State::Pending => state = self.signal.wait(state).unwrap(),
            }
        }
    }

    /// Non-blocking read of an already-completed promise.
    pub fn try_get(&self) -> Option<ProductOutcome> {
        match &*self.state.lock().unwrap() {
            State::Completed { outcome, .. } => Some(outcome.clone()),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), State::Completed { .. })
    }

    /// How long the promise took from creation to completion.
    pub fn completion_overhead(&self) -> Option<std::time::Duration> {
        match &*self.state.lock().unwrap() {
            State::Completed { at, .. } => Some(at.duration_since(self.started)),
            _ => None,
        }
    }

    /// Wakes every parked reader with the interrupted outcome. Promises
    /// already completed keep their value.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, State::Pending) {
            *state = State::Cancelled;
            self.signal.notify_all();
        }
    }
}

impl std::fmt::Debug for ProductPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProductPromise({}#{}, completed: {})",
            self.module,
            self.product,
            self.is_completed()
        )
    }
}

/// Per-module registry of product promises for one build run.
///
/// Every promise is registered with [`create`](ProductRepository::create)
/// before any lookup happens; registering the same product twice is a
/// configuration error.
pub struct ProductRepository {
    module: ArcStr,
    promises: RwLock<HashMap<ArcStr, Arc<ProductPromise>>>,
}

impl ProductRepository {
    pub(crate) fn new(module: ArcStr) -> Self {
        Self {
            module,
            promises: RwLock::new(HashMap::new()),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub(crate) fn create(&self, product: &ArcStr) -> Result<Arc<ProductPromise>, ConfigError> {
        let mut promises = self.promises.write().unwrap();

        if promises.contains_key(product) {
            return Err(ConfigError::ProductRegistered {
                module: self.module.to_string(),
                product: product.to_string(),
            });
        }

        let promise = Arc::new(ProductPromise::new(self.module.clone(), product.clone()));
        promises.insert(product.clone(), promise.clone());
        Ok(promise)
    }

    pub fn lookup(&self, product: &str) -> Option<Arc<ProductPromise>> {
        self.promises.read().unwrap().get(product).cloned()
    }

    pub fn require(&self, product: &str) -> Result<Arc<ProductPromise>, BuildError> {
        self.lookup(product).ok_or_else(|| BuildError::UnknownProduct {
            module: self.module.to_string(),
            product: product.to_string(),
        })
    }

    /// Cancels every still-pending promise, unblocking parked readers.
    pub(crate) fn cancel_all(&self) {
        for promise in self.promises.read().unwrap().values() {
            promise.cancel();
        }
    }
}

/// The view of upstream products one task is allowed to consume, wired
/// from the dependency graph before the job runs. Reads block until the
/// upstream job completes the product.
pub struct UsedProducts {
    module: ArcStr,
    entries: BTreeMap<(ArcStr, ArcStr), Arc<ProductPromise>>,
}

impl UsedProducts {
    pub(crate) fn new(module: ArcStr) -> Self {
        Self {
            module,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, promise: Arc<ProductPromise>) {
        let key = (
            ArcStr::from(promise.module()),
            ArcStr::from(promise.product()),
        );
        self.entries.insert(key, promise);
    }

    /// Reads a product provided within the task's own module.
    pub fn read(&self, product: &str) -> Result<ProductOutcome, BuildError> {
        self.read_from(&self.module, product)
    }

    /// Reads a product imported from a specific dependency module.
    pub fn read_from(&self, module: &str, product: &str) -> Result<ProductOutcome, BuildError> {
        let key = (ArcStr::from(module), ArcStr::from(product));
        match self.entries.get(&key) {
            Some(promise) => promise.get(),
            None => Err(BuildError::UndeclaredRead {
                module: module.to_string(),
                product: product.to_string(),
            }),
        }
    }

    /// Reads an imported-all product from every module providing it, in
    /// deterministic module order.
    pub fn read_all(&self, product: &str) -> Result<Vec<(ArcStr, ProductOutcome)>, BuildError> {
        let mut outcomes = Vec::new();
        for ((module, id), promise) in &self.entries {
            if **id == *product {
                outcomes.push((module.clone(), promise.get()?));
            }
        }
        Ok(outcomes)
    }

    /// All wired upstream promises, sorted by (module, product).
    pub(crate) fn promises(&self) -> impl Iterator<Item = &Arc<ProductPromise>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn promise(module: &str, product: &str) -> ProductPromise {
        ProductPromise::new(ArcStr::from(module), ArcStr::from(product))
    }

    #[test]
    fn test_single_assignment() {
        let promise = promise("app", "compilation");
        promise.complete(ProductOutcome::Empty).unwrap();

        let err = promise.complete(ProductOutcome::Empty).unwrap_err();
        assert!(matches!(err, BuildError::DoubleCompletion { .. }));
    }

    #[test]
    fn test_blocking_read_returns_completed_value() {
        let promise = Arc::new(promise("app", "compilation"));
        let writer = promise.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let product = Product::new().with_checksum("cafebabe");
            writer
                .complete(ProductOutcome::Product(Arc::new(product)))
                .unwrap();
        });

        // Blocks until the writer thread completes the promise.
        let outcome = promise.get().unwrap();
        assert_eq!(outcome.checksum(), Some("cafebabe"));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_unblocks_reader() {
        let promise = Arc::new(promise("app", "compilation"));
        let reader = promise.clone();

        let handle = thread::spawn(move || reader.get());

        thread::sleep(Duration::from_millis(20));
        promise.cancel();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(BuildError::Interrupted)));
    }

    #[test]
    fn test_complete_after_cancel_is_noop() {
        let promise = promise("app", "compilation");
        promise.cancel();
        promise.complete(ProductOutcome::Empty).unwrap();
        assert!(!promise.is_completed());
    }

    #[test]
    fn test_repository_create_once() {
        let repo = ProductRepository::new(ArcStr::from("app"));
        let id = ArcStr::from("compilation");

        repo.create(&id).unwrap();
        let err = repo.create(&id).unwrap_err();
        assert!(matches!(err, ConfigError::ProductRegistered { .. }));
    }

    #[test]
    fn test_repository_require() {
        let repo = ProductRepository::new(ArcStr::from("app"));
        assert!(repo.lookup("compilation").is_none());

        let err = repo.require("compilation").unwrap_err();
        assert!(matches!(err, BuildError::UnknownProduct { .. }));

        repo.create(&ArcStr::from("compilation")).unwrap();
        assert!(repo.require("compilation").is_ok());
    }

    #[test]
    fn test_used_products_undeclared_read() {
        let used = UsedProducts::new(ArcStr::from("app"));
        let err = used.read("compilation").unwrap_err();
        assert!(matches!(err, BuildError::UndeclaredRead { .. }));
    }

    #[test]
    fn test_used_products_read_all_is_sorted() {
        let mut used = UsedProducts::new(ArcStr::from("app"));

        for module in ["lib-b", "lib-a"] {
            let p = Arc::new(promise(module, "jar"));
            p.complete(ProductOutcome::Empty).unwrap();
            used.insert(p);
        }

        let all = used.read_all("jar").unwrap();
        let modules: Vec<_> = all.iter().map(|(m, _)| m.to_string()).collect();
        assert_eq!(modules, vec!["lib-a", "lib-b"]);
    }
}
