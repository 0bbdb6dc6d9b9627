//! Build executor.
//!
//! Walks a [`BuildPlan`] with a bounded pool of blocking workers. The
//! scheduling decisions happen on a single async task; workers only perform
//! cache I/O and child-process invocations. A package's compile steps run
//! unordered among themselves once every direct dependency has linked; its
//! link step runs after all of its compiles. Cache consultation happens
//! before every compile and link, and cancellation drains in-flight work to
//! quiescence without killing compilers mid-run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::cache::key::{self, CacheKey};
use crate::cache::BuildCache;
use crate::core::graph::DependencyGraph;
use crate::core::package::PackageKey;
use crate::hooks::{BuildEvent, HookBus, HookError};
use crate::plan::{BuildPlan, CompileStep, LinkKind, LinkStep, StepId};
use crate::toolchain::diagnostics::Diagnostic;
use crate::toolchain::{CompilerInfo, ToolchainDriver, ToolchainError};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Hook(#[from] HookError),
}

/// Cooperative cancellation: flips a flag; the executor stops starting steps
/// and drains what is already running.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Worker pool size; defaults to hardware concurrency.
    pub parallelism: usize,
    /// Stop scheduling new steps after the first failure anywhere.
    pub fail_fast: bool,
    /// Per-step wall-clock limit for compiler and linker children.
    pub step_timeout: Option<Duration>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            fail_fast: false,
            step_timeout: None,
        }
    }
}

/// One failed step, with provenance.
#[derive(Debug, Clone)]
pub struct FailedStep {
    pub step: StepId,
    pub package: PackageKey,
    pub reason: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// Final accounting, carried by the `PostBuild` event.
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub success: bool,
    pub cancelled: bool,
    pub compiled: usize,
    pub object_cache_hits: usize,
    pub linked: usize,
    pub artifact_cache_hits: usize,
    pub failed_steps: Vec<FailedStep>,
    pub skipped_packages: Vec<PackageKey>,
    pub wall_time: Duration,
}

struct CompileOutcome {
    success: bool,
    cache_hit: bool,
    diagnostics: Vec<Diagnostic>,
    duration: Duration,
    final_key: CacheKey,
}

struct LinkOutcome {
    success: bool,
    cache_hit: bool,
    duration: Duration,
    stderr: String,
}

enum TaskResult {
    Compile {
        plan_index: usize,
        step_id: StepId,
        outcome: Result<CompileOutcome, ToolchainError>,
    },
    Link {
        plan_index: usize,
        step_id: StepId,
        outcome: Result<LinkOutcome, ToolchainError>,
    },
}

/// A step waiting for a worker slot.
enum PendingStep {
    Compile { plan_index: usize, step_index: usize },
    Link { plan_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageState {
    Waiting,
    Building,
    Done,
    Failed,
    Skipped,
}

pub struct Executor {
    driver: Arc<dyn ToolchainDriver>,
    cache: Arc<BuildCache>,
    bus: Arc<HookBus>,
    options: ExecOptions,
}

impl Executor {
    pub fn new(
        driver: Arc<dyn ToolchainDriver>,
        cache: Arc<BuildCache>,
        bus: Arc<HookBus>,
        options: ExecOptions,
    ) -> Self {
        Self {
            driver,
            cache,
            bus,
            options,
        }
    }

    pub async fn run(
        &self,
        plan: &BuildPlan,
        graph: &DependencyGraph,
        compiler: &CompilerInfo,
        cancel: &CancellationToken,
    ) -> Result<BuildSummary, ExecError> {
        let started = Instant::now();
        self.bus.emit(&BuildEvent::PreBuild {
            total_steps: plan.total_steps(),
        })?;

        let mut state = SchedulerState::new(plan, graph, compiler);
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskResult>();

        let mut pending: VecDeque<PendingStep> = VecDeque::new();
        let mut summary = BuildSummary::default();
        let mut in_flight = 0usize;
        let mut stop = false;

        loop {
            // Start steps while worker slots are free. Cancellation and
            // fail-fast are checked per step: nothing new starts after either.
            while !stop && !cancel.is_cancelled() {
                if pending.is_empty() {
                    while let Some(index) = state.ready.pop_front() {
                        state.states[index] = PackageState::Building;
                        for step_index in 0..plan.packages[index].compile_steps.len() {
                            pending.push_back(PendingStep::Compile {
                                plan_index: index,
                                step_index,
                            });
                        }
                    }
                }
                if pending.is_empty() {
                    break;
                }
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let next = pending.pop_front().expect("pending is non-empty");
                match next {
                    PendingStep::Compile {
                        plan_index,
                        step_index,
                    } => {
                        let step = &plan.packages[plan_index].compile_steps[step_index];
                        self.bus.emit(&BuildEvent::PreCompile {
                            step: step.id,
                            package: step.package.clone(),
                            source: step.source.clone(),
                        })?;
                        let task = CompileTask {
                            step: step.clone(),
                            conservative: state.conservative[plan_index].clone(),
                            cache: self.cache.clone(),
                            driver: self.driver.clone(),
                            timeout: self.options.step_timeout,
                        };
                        let tx = tx.clone();
                        let step_id = step.id;
                        tokio::task::spawn_blocking(move || {
                            let outcome = task.run();
                            let _ = tx.send(TaskResult::Compile {
                                plan_index,
                                step_id,
                                outcome,
                            });
                            drop(permit);
                        });
                        in_flight += 1;
                    }
                    PendingStep::Link { plan_index } => {
                        let step = &plan.packages[plan_index].link_step;
                        self.bus.emit(&BuildEvent::PreLink {
                            step: step.id,
                            package: step.package.clone(),
                            output: step.output.clone(),
                        })?;
                        let artifact_key = state.artifact_key(plan, plan_index);
                        state.artifact_keys.insert(plan_index, artifact_key);
                        let task = LinkTask {
                            step: step.clone(),
                            artifact_key,
                            bundle_files: state.bundle_files(plan, plan_index),
                            cache: self.cache.clone(),
                            driver: self.driver.clone(),
                            timeout: self.options.step_timeout,
                        };
                        let tx = tx.clone();
                        let step_id = step.id;
                        tokio::task::spawn_blocking(move || {
                            let outcome = task.run();
                            let _ = tx.send(TaskResult::Link {
                                plan_index,
                                step_id,
                                outcome,
                            });
                            drop(permit);
                        });
                        in_flight += 1;
                    }
                }
            }

            if in_flight == 0 {
                // Nothing running: either we are done, we are draining, or
                // the remaining packages can never become ready.
                break;
            }

            let Some(result) = rx.recv().await else { break };
            in_flight -= 1;

            match result {
                TaskResult::Compile {
                    plan_index,
                    step_id,
                    outcome,
                } => {
                    let package = plan.packages[plan_index].package.clone();
                    match outcome {
                        Ok(done) => {
                            self.bus.emit(&BuildEvent::PostCompile {
                                step: step_id,
                                package: package.clone(),
                                success: done.success,
                                cache_hit: done.cache_hit,
                                diagnostics: done.diagnostics.clone(),
                                duration: done.duration,
                            })?;
                            if done.cache_hit {
                                summary.object_cache_hits += 1;
                            } else if done.success {
                                summary.compiled += 1;
                            }
                            if done.success {
                                state.object_keys[plan_index].push(done.final_key);
                                state.compiles_remaining[plan_index] -= 1;
                                if state.compiles_remaining[plan_index] == 0
                                    && state.states[plan_index] == PackageState::Building
                                {
                                    pending.push_back(PendingStep::Link { plan_index });
                                }
                            } else {
                                summary.failed_steps.push(FailedStep {
                                    step: step_id,
                                    package,
                                    reason: "compilation failed".to_string(),
                                    diagnostics: done.diagnostics,
                                });
                                state.fail_package(plan_index);
                                stop |= self.options.fail_fast;
                            }
                        }
                        Err(ToolchainError::StepTimeout { limit }) => {
                            summary.failed_steps.push(FailedStep {
                                step: step_id,
                                package,
                                reason: format!("StepTimeout after {limit:?}"),
                                diagnostics: Vec::new(),
                            });
                            state.fail_package(plan_index);
                            stop |= self.options.fail_fast;
                        }
                        Err(fatal) => {
                            // Missing toolchain or a signal-killed child:
                            // drain and abort the build.
                            drain(&mut rx, in_flight).await;
                            return Err(fatal.into());
                        }
                    }
                }
                TaskResult::Link {
                    plan_index,
                    step_id,
                    outcome,
                } => {
                    let package = plan.packages[plan_index].package.clone();
                    match outcome {
                        Ok(done) => {
                            self.bus.emit(&BuildEvent::PostLink {
                                step: step_id,
                                package: package.clone(),
                                success: done.success,
                                cache_hit: done.cache_hit,
                                duration: done.duration,
                            })?;
                            if done.success {
                                if done.cache_hit {
                                    summary.artifact_cache_hits += 1;
                                } else {
                                    summary.linked += 1;
                                }
                                state.complete_package(plan_index);
                            } else {
                                summary.failed_steps.push(FailedStep {
                                    step: step_id,
                                    package,
                                    reason: format!("link failed: {}", done.stderr.trim()),
                                    diagnostics: Vec::new(),
                                });
                                state.fail_package(plan_index);
                                stop |= self.options.fail_fast;
                            }
                        }
                        Err(ToolchainError::StepTimeout { limit }) => {
                            summary.failed_steps.push(FailedStep {
                                step: step_id,
                                package,
                                reason: format!("StepTimeout after {limit:?}"),
                                diagnostics: Vec::new(),
                            });
                            state.fail_package(plan_index);
                            stop |= self.options.fail_fast;
                        }
                        Err(fatal) => {
                            drain(&mut rx, in_flight).await;
                            return Err(fatal.into());
                        }
                    }
                }
            }
        }

        drain(&mut rx, in_flight).await;

        summary.cancelled = cancel.is_cancelled();
        for (index, &package_state) in state.states.iter().enumerate() {
            if matches!(
                package_state,
                PackageState::Waiting | PackageState::Skipped | PackageState::Building
            ) {
                summary
                    .skipped_packages
                    .push(plan.packages[index].package.clone());
            }
        }
        summary.success = summary.failed_steps.is_empty()
            && summary.skipped_packages.is_empty()
            && !summary.cancelled;
        summary.wall_time = started.elapsed();

        if let Err(e) = self.cache.update_index() {
            warn!(error = %e, "failed to refresh cache index");
        }

        self.bus.emit(&BuildEvent::PostBuild {
            summary: summary.clone(),
        })?;
        Ok(summary)
    }
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<TaskResult>, mut in_flight: usize) {
    while in_flight > 0 {
        if rx.recv().await.is_none() {
            break;
        }
        in_flight -= 1;
    }
}

/// All mutable bookkeeping owned by the scheduling loop.
struct SchedulerState<'a> {
    plan: &'a BuildPlan,
    graph: &'a DependencyGraph,
    compiler: &'a CompilerInfo,
    index_of: HashMap<PackageKey, usize>,
    states: Vec<PackageState>,
    deps_remaining: Vec<usize>,
    compiles_remaining: Vec<usize>,
    object_keys: Vec<Vec<CacheKey>>,
    artifact_keys: HashMap<usize, CacheKey>,
    /// Conservative header set per package: every reachable public header
    /// plus the package's own, pre-read and sorted by normalized path.
    conservative: Vec<Arc<Vec<(String, Vec<u8>)>>>,
    ready: VecDeque<usize>,
}

impl<'a> SchedulerState<'a> {
    fn new(plan: &'a BuildPlan, graph: &'a DependencyGraph, compiler: &'a CompilerInfo) -> Self {
        let index_of: HashMap<PackageKey, usize> = plan
            .packages
            .iter()
            .enumerate()
            .map(|(i, p)| (p.package.clone(), i))
            .collect();

        let mut deps_remaining = Vec::with_capacity(plan.packages.len());
        let mut ready = VecDeque::new();
        for (i, p) in plan.packages.iter().enumerate() {
            deps_remaining.push(p.direct_dependencies.len());
            if p.direct_dependencies.is_empty() {
                ready.push_back(i);
            }
        }

        let conservative = plan
            .packages
            .iter()
            .map(|p| Arc::new(conservative_headers(graph, &p.package)))
            .collect();

        Self {
            plan,
            graph,
            compiler,
            index_of,
            states: vec![PackageState::Waiting; plan.packages.len()],
            deps_remaining,
            compiles_remaining: plan
                .packages
                .iter()
                .map(|p| p.compile_steps.len())
                .collect(),
            object_keys: vec![Vec::new(); plan.packages.len()],
            artifact_keys: HashMap::new(),
            conservative,
            ready,
        }
    }

    /// Mark a package failed and transitively skip everything that needs it.
    fn fail_package(&mut self, index: usize) {
        self.states[index] = PackageState::Failed;
        self.skip_dependents_of(index);
    }

    fn skip_dependents_of(&mut self, index: usize) {
        let key = &self.plan.packages[index].package;
        let Some(id) = self.graph.lookup(key) else {
            return;
        };
        let mut queue: VecDeque<_> = self.graph.dependents(id).iter().copied().collect();
        let mut seen = HashSet::new();
        while let Some(dep_id) = queue.pop_front() {
            if !seen.insert(dep_id) {
                continue;
            }
            let dep_key = self.graph.package(dep_id).key();
            if let Some(&dep_index) = self.index_of.get(&dep_key) {
                if self.states[dep_index] == PackageState::Waiting {
                    self.states[dep_index] = PackageState::Skipped;
                    self.ready.retain(|&i| i != dep_index);
                }
            }
            queue.extend(self.graph.dependents(dep_id).iter().copied());
        }
    }

    /// Mark a package done and promote dependents whose dependencies have all
    /// linked.
    fn complete_package(&mut self, index: usize) {
        self.states[index] = PackageState::Done;
        let key = &self.plan.packages[index].package;
        let Some(id) = self.graph.lookup(key) else {
            return;
        };
        for &dep_id in self.graph.dependents(id) {
            let dep_key = self.graph.package(dep_id).key();
            if let Some(&dep_index) = self.index_of.get(&dep_key) {
                self.deps_remaining[dep_index] = self.deps_remaining[dep_index].saturating_sub(1);
                if self.deps_remaining[dep_index] == 0
                    && self.states[dep_index] == PackageState::Waiting
                {
                    self.ready.push_back(dep_index);
                }
            }
        }
    }

    /// Artifact key for a package whose compiles are all done: manifest
    /// canonical form, sorted object keys, link flags, linker identity, and
    /// the artifact keys of directly linked library dependencies.
    fn artifact_key(&self, plan: &BuildPlan, index: usize) -> CacheKey {
        let package_build = &plan.packages[index];
        let id = self
            .graph
            .lookup(&package_build.package)
            .expect("planned packages exist in the graph");
        let manifest = self.graph.package(id).manifest();

        let mut dep_keys = Vec::new();
        if package_build.link_step.kind == LinkKind::Executable {
            for dep in &package_build.direct_dependencies {
                if let Some(&dep_index) = self.index_of.get(dep) {
                    if let Some(key) = self.artifact_keys.get(&dep_index) {
                        dep_keys.push(*key);
                    }
                }
            }
        }

        key::artifact_key(
            manifest,
            &self.object_keys[index],
            &package_build.link_step.flags,
            self.compiler,
            &dep_keys,
        )
    }

    /// Files bundled into the artifact cache entry: the linked output plus
    /// the package's public headers under their include-relative paths.
    fn bundle_files(&self, plan: &BuildPlan, index: usize) -> Vec<(PathBuf, PathBuf)> {
        let package_build = &plan.packages[index];
        let id = self
            .graph
            .lookup(&package_build.package)
            .expect("planned packages exist in the graph");
        let package = self.graph.package(id);

        let output = &package_build.link_step.output;
        let mut files = vec![(
            PathBuf::from(output.file_name().expect("link outputs are files")),
            output.clone(),
        )];
        if let Ok(headers) = package.public_headers() {
            let include_root = package.public_include_dir();
            for header in headers {
                if let Ok(rel) = header.strip_prefix(&include_root) {
                    files.push((PathBuf::from("include").join(rel), header.clone()));
                }
            }
        }
        files
    }
}

/// Conservative over-approximation of reachable headers: the package's own
/// public and private headers plus every transitive dependency's public
/// headers, read eagerly and sorted by normalized path.
fn conservative_headers(graph: &DependencyGraph, key: &PackageKey) -> Vec<(String, Vec<u8>)> {
    let Some(id) = graph.lookup(key) else {
        return Vec::new();
    };
    let mut headers = Vec::new();
    let mut push_dir = |dir: PathBuf| {
        if dir.is_dir() {
            collect_header_bytes(&dir, &mut headers);
        }
    };
    let package = graph.package(id);
    push_dir(package.public_include_dir());
    push_dir(package.private_include_dir());
    for dep_id in graph.transitive_dependencies(id) {
        push_dir(graph.package(dep_id).public_include_dir());
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    headers.dedup_by(|a, b| a.0 == b.0);
    headers
}

fn collect_header_bytes(dir: &std::path::Path, out: &mut Vec<(String, Vec<u8>)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_header_bytes(&path, out);
        } else if let Ok(bytes) = std::fs::read(&path) {
            out.push((key::normalize_path(&path), bytes));
        }
    }
}

/// The blocking body of one compile step: key derivation, cache consult,
/// compiler invocation, cache publication.
struct CompileTask {
    step: CompileStep,
    conservative: Arc<Vec<(String, Vec<u8>)>>,
    cache: Arc<BuildCache>,
    driver: Arc<dyn ToolchainDriver>,
    timeout: Option<Duration>,
}

impl CompileTask {
    fn run(self) -> Result<CompileOutcome, ToolchainError> {
        let lookup_headers = self.accurate_or_conservative();
        let lookup_key = key::object_key(&self.step.base_key, &lookup_headers);

        if let Some(bytes) = self.cache.get_object(&lookup_key) {
            if write_object(&self.step.object, &bytes) {
                debug!(source = %self.step.source.display(), "object cache hit");
                return Ok(CompileOutcome {
                    success: true,
                    cache_hit: true,
                    diagnostics: Vec::new(),
                    duration: Duration::ZERO,
                    final_key: lookup_key,
                });
            }
        }

        let result = self.driver.compile(&self.step, self.timeout)?;
        if !result.success {
            return Ok(CompileOutcome {
                success: false,
                cache_hit: false,
                diagnostics: result.diagnostics,
                duration: result.duration,
                final_key: lookup_key,
            });
        }

        // Promote to the accurate key when the compiler told us what the
        // translation unit really includes.
        let final_key = match &result.discovered_headers {
            None => lookup_key,
            Some(discovered) => match read_header_bytes(discovered) {
                Some(accurate) => key::object_key(&self.step.base_key, &accurate),
                None => lookup_key,
            },
        };

        match std::fs::read(&self.step.object) {
            Ok(bytes) => {
                if let Err(e) = self.cache.put_object(&final_key, &bytes) {
                    warn!(error = %e, "object cache write failed, continuing");
                }
            }
            Err(e) => warn!(error = %e, "compiled object unreadable, not cached"),
        }
        if let Some(discovered) = &result.discovered_headers {
            if let Err(e) = self
                .cache
                .put_header_record(&self.step.base_key, discovered)
            {
                warn!(error = %e, "header record write failed, continuing");
            }
        }

        Ok(CompileOutcome {
            success: true,
            cache_hit: false,
            diagnostics: result.diagnostics,
            duration: result.duration,
            final_key,
        })
    }

    /// Accurate header set when a discovery record exists and all recorded
    /// files are readable; the conservative set otherwise.
    fn accurate_or_conservative(&self) -> Vec<(String, Vec<u8>)> {
        if let Some(recorded) = self.cache.get_header_record(&self.step.base_key) {
            if let Some(headers) = read_header_bytes(&recorded) {
                return headers;
            }
        }
        self.conservative.as_ref().clone()
    }
}

fn read_header_bytes(paths: &[PathBuf]) -> Option<Vec<(String, Vec<u8>)>> {
    let mut headers = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(path).ok()?;
        headers.push((key::normalize_path(path), bytes));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));
    headers.dedup_by(|a, b| a.0 == b.0);
    Some(headers)
}

fn write_object(path: &std::path::Path, bytes: &[u8]) -> bool {
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return false;
        }
    }
    std::fs::write(path, bytes).is_ok()
}

/// The blocking body of one link step.
struct LinkTask {
    step: LinkStep,
    artifact_key: CacheKey,
    bundle_files: Vec<(PathBuf, PathBuf)>,
    cache: Arc<BuildCache>,
    driver: Arc<dyn ToolchainDriver>,
    timeout: Option<Duration>,
}

impl LinkTask {
    fn run(self) -> Result<LinkOutcome, ToolchainError> {
        if let Some(bundle) = self.cache.get_artifact(&self.artifact_key) {
            let dest = self
                .step
                .output
                .parent()
                .expect("link outputs have a parent");
            if bundle.unpack_into(dest).is_ok() {
                debug!(output = %self.step.output.display(), "artifact cache hit");
                return Ok(LinkOutcome {
                    success: true,
                    cache_hit: true,
                    duration: Duration::ZERO,
                    stderr: String::new(),
                });
            }
        }

        let result = self.driver.link(&self.step, self.timeout)?;
        if result.success {
            if let Err(e) = self.cache.put_artifact(&self.artifact_key, &self.bundle_files) {
                warn!(error = %e, "artifact cache write failed, continuing");
            }
        }
        Ok(LinkOutcome {
            success: result.success,
            cache_hit: false,
            duration: result.duration,
            stderr: result.stderr,
        })
    }
}
