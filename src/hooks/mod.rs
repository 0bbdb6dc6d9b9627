//! Hook bus.
//!
//! A typed pub-sub for build instrumentation. Subscribers register before
//! the pipeline starts and observe an immutable, linearized event stream;
//! they can never alter the plan. A failing subscriber is logged and ignored
//! unless it was registered `critical`, in which case its failure aborts the
//! build. `Pre`/`Post` pairs are correlated by [`StepId`], not by path.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::core::package::PackageKey;
use crate::core::version::Version;
use crate::exec::BuildSummary;
use crate::plan::StepId;
use crate::toolchain::diagnostics::Diagnostic;

#[derive(Debug, Error)]
#[error("critical hook `{subscriber}` failed at {point}: {message}")]
pub struct HookError {
    pub subscriber: String,
    pub point: &'static str,
    pub message: String,
}

/// The stable taxonomy of instrumentation points.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    // Resolution
    PreResolution {
        root: PackageKey,
    },
    PackageDiscovered {
        name: String,
        constraint: String,
        requested_by: PackageKey,
    },
    VersionSelected {
        name: String,
        version: Version,
    },
    PackageFetched {
        package: PackageKey,
    },
    PostResolution {
        package_count: usize,
    },

    // Planning
    PrePlan {
        package_count: usize,
    },
    BuildOrderComputed {
        order: Vec<PackageKey>,
    },
    PostPlan {
        compile_steps: usize,
        link_steps: usize,
    },

    // Execution
    PreBuild {
        total_steps: usize,
    },
    PreCompile {
        step: StepId,
        package: PackageKey,
        source: PathBuf,
    },
    PostCompile {
        step: StepId,
        package: PackageKey,
        success: bool,
        cache_hit: bool,
        diagnostics: Vec<Diagnostic>,
        duration: Duration,
    },
    PreLink {
        step: StepId,
        package: PackageKey,
        output: PathBuf,
    },
    PostLink {
        step: StepId,
        package: PackageKey,
        success: bool,
        cache_hit: bool,
        duration: Duration,
    },
    PostBuild {
        summary: BuildSummary,
    },
}

impl BuildEvent {
    /// Name of the hook point, for logs and error provenance.
    pub fn point(&self) -> &'static str {
        match self {
            Self::PreResolution { .. } => "PreResolution",
            Self::PackageDiscovered { .. } => "PackageDiscovered",
            Self::VersionSelected { .. } => "VersionSelected",
            Self::PackageFetched { .. } => "PackageFetched",
            Self::PostResolution { .. } => "PostResolution",
            Self::PrePlan { .. } => "PrePlan",
            Self::BuildOrderComputed { .. } => "BuildOrderComputed",
            Self::PostPlan { .. } => "PostPlan",
            Self::PreBuild { .. } => "PreBuild",
            Self::PreCompile { .. } => "PreCompile",
            Self::PostCompile { .. } => "PostCompile",
            Self::PreLink { .. } => "PreLink",
            Self::PostLink { .. } => "PostLink",
            Self::PostBuild { .. } => "PostBuild",
        }
    }
}

type HookFn = dyn Fn(&BuildEvent) -> anyhow::Result<()> + Send + Sync;

struct Subscriber {
    name: String,
    critical: bool,
    hook: Box<HookFn>,
}

/// Registered observers plus the lock that serializes emission.
#[derive(Default)]
pub struct HookBus {
    subscribers: Vec<Subscriber>,
    emit_lock: Mutex<()>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Registration happens before execution begins;
    /// the bus is shared immutably afterwards.
    pub fn subscribe<F>(&mut self, name: &str, critical: bool, hook: F)
    where
        F: Fn(&BuildEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribers.push(Subscriber {
            name: name.to_string(),
            critical,
            hook: Box::new(hook),
        });
    }

    /// Deliver an event to every subscriber, serialized so consumers see a
    /// linearized stream. Non-critical failures are logged and swallowed.
    pub fn emit(&self, event: &BuildEvent) -> Result<(), HookError> {
        let _guard = self
            .emit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for subscriber in &self.subscribers {
            if let Err(e) = (subscriber.hook)(event) {
                if subscriber.critical {
                    return Err(HookError {
                        subscriber: subscriber.name.clone(),
                        point: event.point(),
                        message: e.to_string(),
                    });
                }
                warn!(
                    subscriber = %subscriber.name,
                    point = event.point(),
                    error = %e,
                    "hook failed, continuing"
                );
            }
        }
        Ok(())
    }
}
