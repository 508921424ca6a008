use std::time::Duration;

/// Identifier passed to the directory picker so repeated prompts reopen in
/// the same location.
pub const DEFAULT_PICKER_ID: &str = "MediaCachePicker";

/// Default capacity of the control bus.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Timing and sizing knobs for the capture engine.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Delay between two title samples while the page is still settling.
    pub title_retry_delay: Duration,

    /// Number of re-samples before the current title is accepted as final.
    pub title_max_retries: u32,

    /// Delay between stream creation and the start of its disk migration.
    pub migration_delay: Duration,

    /// How often a pending migration re-checks whether the title is final.
    pub title_poll_interval: Duration,

    /// Identifier used when prompting the user for a directory
    pub picker_id: String,

    /// Capacity of the broadcast control bus
    pub bus_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            title_retry_delay: Duration::from_millis(1500),
            title_max_retries: 4,
            migration_delay: Duration::from_millis(1600),
            title_poll_interval: Duration::from_millis(1750),
            picker_id: DEFAULT_PICKER_ID.to_owned(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

impl CaptureConfig {
    pub fn builder() -> CaptureConfigBuilder {
        CaptureConfigBuilder::new()
    }
}

/// Fluent builder for [`CaptureConfig`].
#[derive(Debug, Clone, Default)]
pub struct CaptureConfigBuilder {
    config: CaptureConfig,
}

impl CaptureConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title_retry_delay(mut self, delay: Duration) -> Self {
        self.config.title_retry_delay = delay;
        self
    }

    pub fn title_max_retries(mut self, retries: u32) -> Self {
        self.config.title_max_retries = retries;
        self
    }

    pub fn migration_delay(mut self, delay: Duration) -> Self {
        self.config.migration_delay = delay;
        self
    }

    pub fn title_poll_interval(mut self, interval: Duration) -> Self {
        self.config.title_poll_interval = interval;
        self
    }

    pub fn picker_id(mut self, id: impl Into<String>) -> Self {
        self.config.picker_id = id.into();
        self
    }

    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.config.bus_capacity = capacity.max(1);
        self
    }

    /// Shrinks every delay to a few milliseconds.
    #[cfg(test)]
    pub(crate) fn immediate(self) -> Self {
        let tick = Duration::from_millis(5);
        self.title_retry_delay(tick)
            .migration_delay(tick)
            .title_poll_interval(tick)
    }

    pub fn build(self) -> CaptureConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.title_retry_delay, Duration::from_millis(1500));
        assert_eq!(config.title_max_retries, 4);
        assert_eq!(config.migration_delay, Duration::from_millis(1600));
        assert_eq!(config.title_poll_interval, Duration::from_millis(1750));
        assert_eq!(config.picker_id, "MediaCachePicker");
    }

    #[test]
    fn test_builder_overrides() {
        let config = CaptureConfig::builder()
            .title_max_retries(1)
            .bus_capacity(0)
            .picker_id("other")
            .build();
        assert_eq!(config.title_max_retries, 1);
        assert_eq!(config.bus_capacity, 1);
        assert_eq!(config.picker_id, "other");
    }

    #[test]
    fn test_immediate_keeps_retry_budget() {
        let config = CaptureConfig::builder().immediate().build();
        assert_eq!(config.migration_delay, Duration::from_millis(5));
        assert_eq!(config.title_max_retries, 4);
    }
}
