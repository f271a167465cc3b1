//! Concurrent job execution.
//!
//! Every resolved task becomes one [`Job`] running on its own worker
//! thread. There is no scheduler deciding run order: a job blocks exactly
//! when it reads an upstream product that is not finished yet, and the
//! completion of a product unblocks the jobs waiting on it. The pool only
//! collects results, captures the first failure and requests cooperative
//! shutdown by cancelling every still-pending promise.

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::ProductCache;
use crate::core::BuildSettings;
use crate::error::BuildError;
use crate::module::{ModuleConfig, ModuleGraph};
use crate::product::{ProductOutcome, ProductPromise, ProductRepository, UsedProducts};
use crate::skip::{self, Signatures};
use crate::task::{ConfiguredTask, TaskContext, TaskOutput};
use crate::utils::{PROGRESS_STYLE, format_active};

/// Lifecycle of a job. Each job runs its task at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Initializing,
    Running,
    Stopped,
}

/// What happened to one job, as recorded in the execution report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The task ran and completed its product.
    Executed,
    /// The persisted signature matched; the cached product was reused.
    Skipped,
    /// The task itself determined its previous output is still valid.
    UpToDate,
    Failed,
    Interrupted,
}

/// Timing record of one job.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub name: String,
    pub outcome: JobOutcome,
    pub start: Instant,
    pub duration: Duration,
}

/// Per-build summary of every job, in the stable resolved order.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    entries: Vec<JobExecution>,
}

impl ExecutionReport {
    pub(crate) fn new(entries: Vec<JobExecution>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[JobExecution] {
        &self.entries
    }

    pub fn executed(&self) -> usize {
        self.count(JobOutcome::Executed)
    }

    pub fn skipped(&self) -> usize {
        self.count(JobOutcome::Skipped) + self.count(JobOutcome::UpToDate)
    }

    fn count(&self, outcome: JobOutcome) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.outcome == outcome)
            .count()
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(
                f,
                "{:<40} {:>12?} {:>6}ms",
                entry.name,
                entry.outcome,
                entry.duration.as_millis()
            )?;
        }
        Ok(())
    }
}

/// A runtime wrapper binding one configured task to its module's product
/// repository and runtime state.
pub(crate) struct Job {
    name: String,
    task: Arc<ConfiguredTask>,
    module: Arc<ModuleConfig>,
    modules: Arc<ModuleGraph>,
    products: UsedProducts,
    promise: Arc<ProductPromise>,
    signatures: Arc<Signatures>,
    cache: Arc<ProductCache>,
    settings: Arc<BuildSettings>,
    status: Mutex<JobStatus>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task: Arc<ConfiguredTask>,
        module: Arc<ModuleConfig>,
        modules: Arc<ModuleGraph>,
        products: UsedProducts,
        promise: Arc<ProductPromise>,
        signatures: Arc<Signatures>,
        cache: Arc<ProductCache>,
        settings: Arc<BuildSettings>,
    ) -> Self {
        Self {
            name: task.qualified_name(),
            task,
            module,
            modules,
            products,
            promise,
            signatures,
            cache,
            settings,
            status: Mutex::new(JobStatus::Initializing),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn promise(&self) -> &Arc<ProductPromise> {
        &self.promise
    }

    pub(crate) fn execute(&self) -> Result<JobOutcome, BuildError> {
        *self.status.lock().unwrap() = JobStatus::Running;
        let result = self.run();
        *self.status.lock().unwrap() = JobStatus::Stopped;
        result
    }

    fn run(&self) -> Result<JobOutcome, BuildError> {
        let module = self.task.module();
        let product = self.task.provides().clone();

        // Computing the signature blocks on every upstream product, which
        // is the dependency barrier of this job.
        let signature = skip::compute(&self.task, &self.products)?;

        if self.settings.use_cache
            && self.signatures.can_skip(module, &product, &signature)?
        {
            let outcome = match self.cache.load(module, &product)? {
                Some(cached) => ProductOutcome::Product(Arc::new(cached)),
                None => ProductOutcome::Empty,
            };
            self.promise.complete(outcome)?;
            tracing::debug!("{} is up to date, reusing cached product", self.name);
            return Ok(JobOutcome::Skipped);
        }

        if self.settings.use_cache {
            self.signatures.clear(module, &product)?;
        }

        let output = match self.task.factory() {
            // Goals have no task body; they only group their upstreams.
            None => TaskOutput::Empty,
            Some(factory) => {
                let span = tracing::span!(Level::INFO, "task", name = %self.name);
                let _enter = span.enter();

                let mut task = factory();
                let ctx = TaskContext {
                    module: &*self.module,
                    modules: &*self.modules,
                    products: &self.products,
                    settings: &*self.settings,
                    span: span.clone(),
                };

                match catch_unwind(AssertUnwindSafe(|| task.run(&ctx))) {
                    Ok(Ok(output)) => output,
                    Ok(Err(err)) => {
                        // A blocking read aborted by shutdown surfaces
                        // through the task as a benign interruption, not
                        // as a fresh task failure.
                        if err
                            .downcast_ref::<BuildError>()
                            .is_some_and(BuildError::is_interruption)
                        {
                            return Err(BuildError::Interrupted);
                        }
                        return Err(BuildError::Task(self.name.clone(), err));
                    }
                    Err(panic) => {
                        let message = if let Some(s) = panic.downcast_ref::<&str>() {
                            (*s).to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            String::from("unknown payload")
                        };
                        return Err(BuildError::Panic(self.name.clone(), message));
                    }
                }
            }
        };

        let (outcome, job_outcome) = match output {
            TaskOutput::Ok(product) => (
                ProductOutcome::Product(Arc::new(product)),
                JobOutcome::Executed,
            ),
            TaskOutput::UpToDate(product) => (
                ProductOutcome::Product(Arc::new(product)),
                JobOutcome::UpToDate,
            ),
            TaskOutput::Empty => (ProductOutcome::Empty, JobOutcome::Executed),
        };

        self.promise.complete(outcome.clone())?;

        if !self.promise.is_completed() {
            // Completion was a no-op because the build is shutting down.
            return Err(BuildError::Interrupted);
        }

        if self.settings.use_cache {
            self.cache.store(module, &product, &outcome)?;
            self.signatures.commit(module, &product, &signature)?;
        }

        Ok(job_outcome)
    }
}

type JobResult = (usize, Result<JobOutcome, BuildError>, Instant, Duration);

/// Runs jobs concurrently, one worker thread per job. The pool itself
/// does not throttle; natural backpressure comes from blocking promise
/// reads.
pub(crate) struct JobPool {
    jobs: Vec<Arc<Job>>,
    repositories: Vec<Arc<ProductRepository>>,
    cancel: Arc<AtomicBool>,
    active: Arc<Mutex<BTreeSet<String>>>,
    handles: Vec<JoinHandle<()>>,
    result_tx: Sender<JobResult>,
    result_rx: Receiver<JobResult>,
}

impl JobPool {
    pub(crate) fn new(repositories: Vec<Arc<ProductRepository>>) -> Self {
        let (result_tx, result_rx) = unbounded();
        Self {
            jobs: Vec::new(),
            repositories,
            cancel: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(BTreeSet::new())),
            handles: Vec::new(),
            result_tx,
            result_rx,
        }
    }

    /// Schedules every job onto its own worker thread.
    pub(crate) fn submit_all(&mut self, jobs: Vec<Job>) {
        for job in jobs {
            let job = Arc::new(job);
            let index = self.handles.len();

            let cancel = self.cancel.clone();
            let active = self.active.clone();
            let sender = self.result_tx.clone();
            let worker = job.clone();

            let handle = std::thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || {
                    let start = Instant::now();

                    // Once shutdown is requested, no new jobs start.
                    if cancel.load(Ordering::SeqCst) {
                        let _ = sender.send((
                            index,
                            Err(BuildError::Interrupted),
                            start,
                            Duration::ZERO,
                        ));
                        return;
                    }

                    active.lock().unwrap().insert(worker.name.clone());
                    let result = worker.execute();
                    active.lock().unwrap().remove(&worker.name);

                    let _ = sender.send((index, result, start, start.elapsed()));
                })
                .expect("failed to spawn job thread");

            self.jobs.push(job);
            self.handles.push(handle);
        }
    }

    /// Waits for all submitted work to finish or be cancelled, then
    /// re-raises the captured first failure, if any.
    pub(crate) fn shutdown(mut self) -> Result<Vec<JobExecution>, BuildError> {
        let total = self.handles.len();
        let mut executions: Vec<Option<JobExecution>> = (0..total).map(|_| None).collect();
        let mut first_failure: Option<BuildError> = None;
        let mut completed = 0;

        let root_span = tracing::span!(Level::INFO, "executing_jobs");
        root_span.pb_set_length(total as u64);
        root_span.pb_set_style(&PROGRESS_STYLE);
        root_span.pb_set_message("Executing jobs...");
        let _enter = root_span.enter();

        // Observational only: a periodic snapshot of running job names.
        let monitor = tick(Duration::from_secs(5));

        while completed < total {
            select! {
                recv(self.result_rx) -> message => {
                    let (index, result, start, duration) =
                        message.expect("job result channel closed");
                    completed += 1;
                    root_span.pb_inc(1);

                    let job = self.jobs[index].clone();
                    let outcome = match result {
                        Ok(outcome) => {
                            if job.promise.is_completed() {
                                outcome
                            } else {
                                // A job reporting success must have
                                // completed its declared product.
                                self.fail(&mut first_failure, BuildError::DidNotComplete {
                                    task: job.name.clone(),
                                    product: job.task.provides().to_string(),
                                });
                                JobOutcome::Failed
                            }
                        }
                        Err(err) if err.is_interruption() => {
                            tracing::debug!("{} was interrupted", job.name);
                            JobOutcome::Interrupted
                        }
                        Err(err) => {
                            self.fail(&mut first_failure, err);
                            JobOutcome::Failed
                        }
                    };

                    executions[index] = Some(JobExecution {
                        name: job.name.clone(),
                        outcome,
                        start,
                        duration,
                    });
                }
                recv(monitor) -> _ => {
                    let active = self.active.lock().unwrap();
                    if !active.is_empty() {
                        tracing::info!("Running: {}", format_active(&active));
                    }
                }
            }
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(executions.into_iter().flatten().collect()),
        }
    }

    /// Captures the first failure and requests cooperative shutdown;
    /// subsequent failures are logged but not re-surfaced.
    fn fail(&self, slot: &mut Option<BuildError>, err: BuildError) {
        if slot.is_none() {
            tracing::error!("{err}");
            *slot = Some(err);
            self.cancel.store(true, Ordering::SeqCst);
            for repository in &self.repositories {
                repository.cancel_all();
            }
        } else {
            tracing::warn!("Suppressed secondary failure: {err}");
        }
    }
}
