//! Engine configuration, assembled once at boot via a builder.

use std::time::Duration;

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::state::DEFAULT_MAX_ITERATIONS_PER_EPOCH;

/// Boot-time configuration for an [`crate::engine::ExecutionEngine`].
///
/// Construct with [`EngineConfig::builder`]; there is no global/static
/// configuration, each engine instance carries its own.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether content-type coercion failures raise [`crate::error::EngineError::Transformation`]
    /// (`true`) or degrade to a pass-through with a warning (`false`).
    pub strict_io: bool,
    /// Safety cap on invocations per `(node, epoch)` for nodes that declare
    /// no explicit `max_iteration`.
    pub max_iterations_per_epoch: u32,
    /// Per-subscriber event queue capacity.
    pub event_queue_capacity: usize,
    /// How long `cancel()` waits for in-flight invocations before giving up
    /// on a graceful stop.
    pub cancellation_grace_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_io: true,
            max_iterations_per_epoch: DEFAULT_MAX_ITERATIONS_PER_EPOCH,
            event_queue_capacity: DEFAULT_EVENT_CAPACITY,
            cancellation_grace_period: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Start building a config from defaults (`strict_io = true`).
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set whether edge coercion is strict (default `true`).
    pub fn strict_io(mut self, strict: bool) -> Self {
        self.config.strict_io = strict;
        self
    }

    /// Set the per-epoch iteration safety cap (default 100).
    pub fn max_iterations_per_epoch(mut self, max: u32) -> Self {
        self.config.max_iterations_per_epoch = max;
        self
    }

    /// Set the per-subscriber event queue capacity (default 256).
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Set how long cancellation waits for in-flight work (default 30s).
    pub fn cancellation_grace_period(mut self, period: Duration) -> Self {
        self.config.cancellation_grace_period = period;
        self
    }

    /// Finish building.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_strict() {
        let config = EngineConfig::default();
        assert!(config.strict_io);
        assert_eq!(config.max_iterations_per_epoch, DEFAULT_MAX_ITERATIONS_PER_EPOCH);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = EngineConfig::builder().strict_io(false).max_iterations_per_epoch(5).build();
        assert!(!config.strict_io);
        assert_eq!(config.max_iterations_per_epoch, 5);
    }
}
