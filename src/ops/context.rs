//! Shared pipeline state.
//!
//! Groups the injected capabilities and shared handles used by every
//! operation, so the pipeline functions do not grow sprawling signatures.

use std::sync::Arc;

use crate::cache::BuildCache;
use crate::hooks::HookBus;
use crate::registry::Registry;
use crate::toolchain::ToolchainDriver;

/// Capabilities and shared state for one invocation of the pipeline.
#[derive(Clone)]
pub struct Context {
    pub registry: Arc<dyn Registry>,
    pub driver: Arc<dyn ToolchainDriver>,
    pub cache: Arc<BuildCache>,
    pub bus: Arc<HookBus>,
}

impl Context {
    pub fn new(
        registry: Arc<dyn Registry>,
        driver: Arc<dyn ToolchainDriver>,
        cache: Arc<BuildCache>,
        bus: Arc<HookBus>,
    ) -> Self {
        Self {
            registry,
            driver,
            cache,
            bus,
        }
    }
}
