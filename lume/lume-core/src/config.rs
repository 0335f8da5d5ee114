//! Context and device configuration.

/// Environment switch for validation: `1`/`true`/`on` forces it on, `0`/`false`/`off`
/// forces it off.
pub const VALIDATION_ENV: &str = "LUME_VALIDATION";

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Reads [`VALIDATION_ENV`]. Unset or unparsable values yield `None`.
pub fn validation_from_env() -> Option<bool> {
    std::env::var(VALIDATION_ENV)
        .ok()
        .and_then(|v| parse_switch(&v))
}

#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Extra bookkeeping checks and debug-level diagnostics.
    pub validation: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            validation: validation_from_env()
                .unwrap_or(cfg!(debug_assertions) || cfg!(feature = "validation")),
        }
    }
}

/// Fixed capacities of a device. Pools never grow past these.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub label: Option<&'static str>,
    pub resource_capacity: usize,
    pub descriptor_capacity: usize,
    pub pipeline_capacity: usize,
    pub queue_capacity: usize,
    /// Entries kept by the pipeline-state cache before it stops caching.
    pub pipeline_cache_capacity: usize,
    /// Command pool items per queue.
    pub command_pool_ring_size: usize,
    /// Pre-allocated command lists per pool item.
    pub command_lists_per_pool: usize,
    /// Per-list scratch arena used for barrier batches.
    pub command_list_scratch_bytes: usize,
    /// Address space reserved by the device's root arena.
    pub arena_reserve_bytes: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            label: None,
            resource_capacity: 4096,
            descriptor_capacity: 4096,
            pipeline_capacity: 512,
            queue_capacity: 8,
            pipeline_cache_capacity: 1024,
            command_pool_ring_size: 4,
            command_lists_per_pool: 8,
            command_list_scratch_bytes: 64 * 1024,
            arena_reserve_bytes: 64 * 1024 * 1024,
        }
    }
}
