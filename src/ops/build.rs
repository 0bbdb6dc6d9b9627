//! The build pipeline.
//!
//! Manifest -> resolved graph -> build plan -> cached execution. Each stage
//! feeds the next; planning events are emitted here because the planner
//! itself is a pure function.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::core::graph::DependencyGraph;
use crate::core::manifest::Manifest;
use crate::core::package::{Package, PackageOrigin};
use crate::exec::{BuildSummary, CancellationToken, ExecOptions, Executor};
use crate::hooks::BuildEvent;
use crate::ops::{Context, Error};
use crate::plan::{self, PlanOptions};
use crate::resolver;

/// Caller-facing knobs for one build.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub root_dir: PathBuf,
    /// Worker pool size; `None` means hardware concurrency.
    pub jobs: Option<usize>,
    pub fail_fast: bool,
    pub step_timeout: Option<Duration>,
    pub traits: BTreeMap<String, String>,
}

/// Load and validate the root package at `dir`, logging manifest warnings.
pub fn load_root(dir: &Path) -> Result<Package, Error> {
    let manifest = Manifest::load(dir)?;
    for warning in manifest.warnings() {
        warn!(package = %manifest.name, "{warning}");
    }
    let root = dir
        .canonicalize()
        .unwrap_or_else(|_| dir.to_path_buf());
    Ok(Package::new(manifest, root, PackageOrigin::Local))
}

/// Resolve the dependency graph rooted at `dir`.
pub fn resolve_graph(ctx: &Context, dir: &Path) -> Result<DependencyGraph, Error> {
    let root = load_root(dir)?;
    let graph = resolver::resolve(root, ctx.registry.as_ref(), &ctx.cache, &ctx.bus)?;
    Ok(graph)
}

/// Run the full pipeline. A completed-but-failed build surfaces as
/// [`Error::BuildFailed`]; cancellation as [`Error::Cancelled`].
pub async fn build(
    ctx: &Context,
    request: BuildRequest,
    cancel: &CancellationToken,
) -> Result<BuildSummary, Error> {
    let graph = resolve_graph(ctx, &request.root_dir)?;

    let compiler = ctx.driver.probe()?;
    info!(
        compiler = %compiler.name,
        version = %compiler.version,
        target = %compiler.target,
        "toolchain probed"
    );

    ctx.bus.emit(&BuildEvent::PrePlan {
        package_count: graph.len(),
    })?;
    let options = PlanOptions {
        build_root: request.root_dir.join(".build"),
        traits: request.traits.clone(),
        ..Default::default()
    };
    let plan = plan::plan(&graph, &compiler, &options)?;
    for warning in &plan.warnings {
        warn!("{warning}");
    }
    ctx.bus.emit(&BuildEvent::BuildOrderComputed {
        order: plan.package_order(),
    })?;
    ctx.bus.emit(&BuildEvent::PostPlan {
        compile_steps: plan.compile_step_count(),
        link_steps: plan.link_step_count(),
    })?;

    let exec_options = ExecOptions {
        parallelism: request.jobs.unwrap_or_else(num_cpus::get),
        fail_fast: request.fail_fast,
        step_timeout: request.step_timeout,
    };
    let executor = Executor::new(
        ctx.driver.clone(),
        ctx.cache.clone(),
        ctx.bus.clone(),
        exec_options,
    );
    let summary = executor.run(&plan, &graph, &compiler, cancel).await?;

    if summary.cancelled {
        return Err(Error::Cancelled { summary });
    }
    if !summary.success {
        return Err(Error::BuildFailed { summary });
    }
    Ok(summary)
}
